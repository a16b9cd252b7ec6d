//! Relational store collaborator.
//!
//! Every trait method is one transaction: it either applies completely or
//! leaves the store untouched. Uniqueness constraints surface as
//! [`StoreError::Conflict`].

mod memory;
mod snapshot;

pub use memory::MemoryStore;
pub use snapshot::{Snapshot, SnapshotError};

use crate::types::{
    App, AppId, Collaborator, Deployment, DeploymentId, DeploymentInfo, MetricDelta, Metrics,
    NewRelease, Platform, PlatformId, PlatformName, Release, ReleaseId,
};
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Outcome of committing a verified release.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitResult {
    pub release: Release,
    /// Rows removed to keep the history within bounds. Their blobs still
    /// need deleting.
    pub pruned: Vec<Release>,
}

/// The slice of the store the metrics aggregator needs.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn find_release_id(
        &self,
        deployment_key: &str,
        label: &str,
    ) -> Result<Option<ReleaseId>, StoreError>;

    /// Adds every delta to its release's counters, creating missing rows and
    /// clamping at zero. Deltas for releases that no longer exist are dropped.
    async fn apply_metric_deltas(&self, deltas: &[MetricDelta]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ReleaseStore: MetricsStore {
    /// Creates the app with one platform per [`PlatformName`] and `owner` as
    /// its owner.
    async fn create_app(&self, name: &str, owner: &str) -> Result<App, StoreError>;

    async fn app(&self, app_id: AppId) -> Result<Option<App>, StoreError>;

    async fn platform(
        &self,
        app_id: AppId,
        name: PlatformName,
    ) -> Result<Option<Platform>, StoreError>;

    async fn collaborator(
        &self,
        app_id: AppId,
        user_id: &str,
    ) -> Result<Option<Collaborator>, StoreError>;

    async fn collaborators(&self, app_id: AppId) -> Result<Vec<Collaborator>, StoreError>;

    async fn upsert_collaborator(&self, collaborator: Collaborator) -> Result<(), StoreError>;

    /// Fails with a conflict when it would leave the app without an owner.
    async fn remove_collaborator(&self, app_id: AppId, user_id: &str) -> Result<(), StoreError>;

    async fn create_deployment(
        &self,
        platform_id: PlatformId,
        name: &str,
        key: &str,
    ) -> Result<Deployment, StoreError>;

    async fn deployments(&self, app_id: AppId) -> Result<Vec<DeploymentInfo>, StoreError>;

    async fn deployment_by_key(&self, key: &str) -> Result<Option<DeploymentInfo>, StoreError>;

    /// Replaces the deployment's key, returning the updated deployment.
    async fn set_deployment_key(
        &self,
        deployment_id: DeploymentId,
        key: &str,
    ) -> Result<DeploymentInfo, StoreError>;

    /// Release history, newest first, verified or not.
    async fn releases(&self, deployment_id: DeploymentId) -> Result<Vec<Release>, StoreError>;

    /// Inserts an unverified release.
    async fn insert_release(&self, release: NewRelease) -> Result<Release, StoreError>;

    /// Marks a staged release verified with its confirmed bundle `size`,
    /// clears the rollout of the previous head and prunes the oldest releases
    /// beyond `max_releases`. A release staged before the current head was
    /// committed is a conflict.
    async fn commit_release(
        &self,
        deployment_id: DeploymentId,
        release_id: ReleaseId,
        size: u64,
        max_releases: usize,
    ) -> Result<CommitResult, StoreError>;

    /// Inserts and commits in a single step.
    async fn insert_verified_release(
        &self,
        release: NewRelease,
        max_releases: usize,
    ) -> Result<CommitResult, StoreError>;

    /// Overwrites the mutable fields of an existing release.
    async fn update_release(&self, release: &Release) -> Result<Release, StoreError>;

    async fn delete_releases(
        &self,
        deployment_id: DeploymentId,
        release_ids: &[ReleaseId],
    ) -> Result<(), StoreError>;

    async fn metrics(
        &self,
        release_ids: &[ReleaseId],
    ) -> Result<HashMap<ReleaseId, Metrics>, StoreError>;
}
