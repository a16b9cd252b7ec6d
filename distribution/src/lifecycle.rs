//! Release lifecycle: stage, verify, promote, roll back, patch and delete.
//!
//! A release is staged unverified with a reserved label and blob key, and only
//! becomes visible to clients once its bundle has been uploaded and verified.
//! Every change to a deployment's visible release set invalidates the response
//! cache for its key.
use crate::app_version::validate_range;
use crate::blob::BlobStore;
use crate::cache::ResponseCache;
use crate::error::{DistributionError, Result};
use crate::metrics_defs::{RELEASE_COMMITTED, RELEASES_PRUNED};
use crate::registry::{authorize, deployment_by_key};
use crate::rollout::is_rollout_incomplete;
use crate::store::{CommitResult, ReleaseStore};
use crate::types::{
    Actor, DeploymentInfo, Metrics, NewRelease, Permission, Release, ReleaseId, ReleaseMethod,
    next_label,
};
use serde::{Deserialize, Serialize};
use shared::counter;
use std::sync::Arc;
use url::Url;

/// What an operator declares when publishing a bundle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct StageRequest {
    pub app_version: String,
    pub package_hash: String,
    /// Bundle size in bytes, checked against the upload when given.
    pub size: Option<u64>,
    pub description: Option<String>,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default)]
    pub is_mandatory: bool,
    pub rollout: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StagedRelease {
    pub release_id: ReleaseId,
    pub label: String,
    pub blob_key: String,
    pub upload_url: Url,
}

/// Fields an operator may change on a verified release. Also used as the
/// overrides of a promotion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ReleasePatch {
    pub is_disabled: Option<bool>,
    pub is_mandatory: Option<bool>,
    pub description: Option<String>,
    pub rollout: Option<u8>,
    pub app_version: Option<String>,
}

impl ReleasePatch {
    fn validate(&self) -> Result<()> {
        if let Some(rollout) = self.rollout {
            validate_rollout(rollout)?;
        }
        if let Some(range) = &self.app_version {
            validate_range(range).map_err(|e| DistributionError::validation(e.to_string()))?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct PromoteRequest {
    /// Release to promote, the source's latest verified release if absent.
    pub label: Option<String>,
    #[serde(flatten)]
    pub overrides: ReleasePatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReleaseMetrics {
    pub label: String,
    #[serde(flatten)]
    pub metrics: Metrics,
}

fn validate_rollout(rollout: u8) -> Result<()> {
    match rollout {
        1..=100 => Ok(()),
        _ => Err(DistributionError::validation(
            "rollout must be between 1 and 100",
        )),
    }
}

fn validate_package_hash(hash: &str) -> Result<()> {
    let valid = !hash.is_empty()
        && hash
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    match valid {
        true => Ok(()),
        false => Err(DistributionError::validation("invalid package hash")),
    }
}

/// A rollout of 100 is no rollout at all.
fn normalize_rollout(rollout: Option<u8>) -> Option<u8> {
    rollout.filter(|r| *r != 100)
}

/// Blob keys are derived from where the release lives, so copies of a bundle
/// under different deployments never collide.
fn blob_key(deployment: &DeploymentInfo, label: &str, package_hash: &str) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        deployment.app_id, deployment.platform, deployment.id, label, package_hash
    )
}

fn head(history: &[Release]) -> Option<&Release> {
    history.iter().find(|r| r.is_verified)
}

fn verified_by_label<'a>(history: &'a [Release], label: &str) -> Result<&'a Release> {
    history
        .iter()
        .find(|r| r.is_verified && r.label == label)
        .ok_or_else(|| DistributionError::not_found(format!("release {label} not found")))
}

/// A head mid-rollout blocks new releases until it is completed or disabled.
fn check_rollout_finished(head: &Release) -> Result<()> {
    if is_rollout_incomplete(head.rollout) && !head.is_disabled {
        return Err(DistributionError::conflict(format!(
            "release {} is still rolling out; complete or disable it first",
            head.label
        )));
    }
    Ok(())
}

pub struct ReleaseManager {
    store: Arc<dyn ReleaseStore>,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<dyn ResponseCache>,
    max_releases: usize,
}

impl ReleaseManager {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        blobs: Arc<dyn BlobStore>,
        cache: Arc<dyn ResponseCache>,
        max_releases: usize,
    ) -> Self {
        ReleaseManager {
            store,
            blobs,
            cache,
            max_releases,
        }
    }

    async fn deployment(
        &self,
        actor: &Actor,
        key: &str,
        required: Permission,
    ) -> Result<DeploymentInfo> {
        let deployment = deployment_by_key(self.store.as_ref(), key).await?;
        authorize(self.store.as_ref(), deployment.app_id, actor, required).await?;
        Ok(deployment)
    }

    /// Release history, newest first.
    pub async fn history(&self, actor: &Actor, key: &str) -> Result<Vec<Release>> {
        let deployment = self.deployment(actor, key, Permission::Viewer).await?;
        Ok(self.store.releases(deployment.id).await?)
    }

    /// Reserves the next label and a blob key for a new bundle and returns
    /// where to upload it. The release stays invisible until verified.
    pub async fn stage_release(
        &self,
        actor: &Actor,
        key: &str,
        request: StageRequest,
    ) -> Result<StagedRelease> {
        validate_range(&request.app_version)
            .map_err(|e| DistributionError::validation(e.to_string()))?;
        validate_package_hash(&request.package_hash)?;
        if let Some(rollout) = request.rollout {
            validate_rollout(rollout)?;
        }

        let deployment = self.deployment(actor, key, Permission::Developer).await?;
        let history = self.store.releases(deployment.id).await?;

        if let Some(head) = head(&history) {
            check_rollout_finished(head)?;
        }
        let same_target = history
            .iter()
            .find(|r| r.is_verified && r.app_version == request.app_version);
        if let Some(previous) = same_target.filter(|r| r.package_hash == request.package_hash) {
            return Err(DistributionError::conflict(format!(
                "the package is identical to release {}",
                previous.label
            )));
        }

        let label = next_label(&history);
        let blob_key = blob_key(&deployment, &label, &request.package_hash);
        let upload_url = self.blobs.presigned_upload_url(&blob_key)?;

        let release = self
            .store
            .insert_release(NewRelease {
                deployment_id: deployment.id,
                label,
                app_version: request.app_version,
                package_hash: request.package_hash,
                size: request.size.unwrap_or_default(),
                blob_key: blob_key.clone(),
                description: request.description,
                is_disabled: request.is_disabled,
                is_mandatory: request.is_mandatory,
                rollout: normalize_rollout(request.rollout),
                release_method: ReleaseMethod::Upload,
                original_label: None,
                original_deployment_name: None,
                created_by: Some(actor.user_id.clone()),
            })
            .await?;

        tracing::info!(
            deployment_id = deployment.id,
            label = %release.label,
            "staged release"
        );

        Ok(StagedRelease {
            release_id: release.id,
            label: release.label,
            blob_key,
            upload_url,
        })
    }

    /// Makes a staged release visible once its bundle is in the blob store.
    pub async fn verify_release(
        &self,
        actor: &Actor,
        key: &str,
        release_id: ReleaseId,
    ) -> Result<Release> {
        let deployment = self.deployment(actor, key, Permission::Developer).await?;
        let history = self.store.releases(deployment.id).await?;
        let staged = history
            .iter()
            .find(|r| r.id == release_id)
            .ok_or_else(|| DistributionError::not_found("release not found"))?;

        let uploaded = self.blobs.head(&staged.blob_key).await?.ok_or_else(|| {
            DistributionError::validation(format!(
                "the bundle for release {} has not been uploaded",
                staged.label
            ))
        })?;
        if staged.size != 0 && staged.size != uploaded {
            return Err(DistributionError::validation(format!(
                "uploaded bundle is {uploaded} bytes, {} were declared",
                staged.size
            )));
        }

        let committed = self
            .store
            .commit_release(deployment.id, release_id, uploaded, self.max_releases)
            .await?;
        self.finish_commit(key, committed).await
    }

    /// Copies a release from `source_key` into `target_key` as a new release.
    pub async fn promote(
        &self,
        actor: &Actor,
        source_key: &str,
        target_key: &str,
        request: PromoteRequest,
    ) -> Result<Release> {
        request.overrides.validate()?;

        let source = self.deployment(actor, source_key, Permission::Developer).await?;
        let target = self.deployment(actor, target_key, Permission::Developer).await?;
        if source.id == target.id {
            return Err(DistributionError::validation(
                "cannot promote a deployment to itself",
            ));
        }
        if source.app_id != target.app_id || source.platform != target.platform {
            return Err(DistributionError::validation(
                "deployments belong to different apps or platforms",
            ));
        }

        let source_history = self.store.releases(source.id).await?;
        let release = match &request.label {
            Some(label) => verified_by_label(&source_history, label)?,
            None => head(&source_history)
                .ok_or_else(|| DistributionError::not_found("no release to promote"))?,
        };

        let overrides = request.overrides;
        let app_version = overrides
            .app_version
            .unwrap_or_else(|| release.app_version.clone());

        let target_history = self.store.releases(target.id).await?;
        if let Some(target_head) = head(&target_history) {
            if target_head.package_hash == release.package_hash
                && target_head.app_version == app_version
            {
                return Err(DistributionError::conflict(format!(
                    "release {} of {} is identical to the current release of {}",
                    release.label, source.name, target.name
                )));
            }
            check_rollout_finished(target_head)?;
        }

        let label = next_label(&target_history);
        let blob_key = blob_key(&target, &label, &release.package_hash);
        // A failed commit below leaves an orphan blob rather than a release
        // without one.
        self.blobs.copy(&release.blob_key, &blob_key).await?;

        let committed = self
            .store
            .insert_verified_release(
                NewRelease {
                    deployment_id: target.id,
                    label,
                    app_version,
                    package_hash: release.package_hash.clone(),
                    size: release.size,
                    blob_key,
                    description: overrides.description.or_else(|| release.description.clone()),
                    is_disabled: overrides.is_disabled.unwrap_or(release.is_disabled),
                    is_mandatory: overrides.is_mandatory.unwrap_or(release.is_mandatory),
                    rollout: normalize_rollout(overrides.rollout.or(release.rollout)),
                    release_method: ReleaseMethod::Promote,
                    original_label: Some(release.label.clone()),
                    original_deployment_name: Some(source.name.clone()),
                    created_by: Some(actor.user_id.clone()),
                },
                self.max_releases,
            )
            .await?;
        self.finish_commit(target_key, committed).await
    }

    /// Re-publishes an earlier release, by default the one before the head.
    pub async fn rollback(
        &self,
        actor: &Actor,
        key: &str,
        target_label: Option<&str>,
    ) -> Result<Release> {
        let deployment = self.deployment(actor, key, Permission::Developer).await?;
        let history = self.store.releases(deployment.id).await?;

        let current = head(&history)
            .ok_or_else(|| DistributionError::not_found("deployment has no releases"))?;
        let destination = match target_label {
            Some(label) => verified_by_label(&history, label)?,
            None => history
                .iter()
                .filter(|r| r.is_verified)
                .nth(1)
                .ok_or_else(|| DistributionError::not_found("no release to roll back to"))?,
        };

        if destination.label == current.label {
            return Err(DistributionError::conflict(
                "cannot roll back to the current release",
            ));
        }
        if destination.package_hash == current.package_hash {
            return Err(DistributionError::conflict(format!(
                "release {} has the same package as the current release {}",
                destination.label, current.label
            )));
        }
        if destination.app_version != current.app_version {
            return Err(DistributionError::conflict(format!(
                "release {} targets app version {}, the current release targets {}",
                destination.label, destination.app_version, current.app_version
            )));
        }

        let label = next_label(&history);
        let blob_key = blob_key(&deployment, &label, &destination.package_hash);
        self.blobs.copy(&destination.blob_key, &blob_key).await?;

        let committed = self
            .store
            .insert_verified_release(
                NewRelease {
                    deployment_id: deployment.id,
                    label,
                    app_version: destination.app_version.clone(),
                    package_hash: destination.package_hash.clone(),
                    size: destination.size,
                    blob_key,
                    description: destination.description.clone(),
                    is_disabled: destination.is_disabled,
                    is_mandatory: destination.is_mandatory,
                    rollout: None,
                    release_method: ReleaseMethod::Rollback,
                    original_label: Some(destination.label.clone()),
                    original_deployment_name: None,
                    created_by: Some(actor.user_id.clone()),
                },
                self.max_releases,
            )
            .await?;
        self.finish_commit(key, committed).await
    }

    /// Patches the head, or the verified release named by `label`. A patch
    /// that changes nothing fails with [`DistributionError::NotModified`].
    pub async fn update_metadata(
        &self,
        actor: &Actor,
        key: &str,
        label: Option<&str>,
        patch: ReleasePatch,
    ) -> Result<Release> {
        patch.validate()?;

        let deployment = self.deployment(actor, key, Permission::Developer).await?;
        let history = self.store.releases(deployment.id).await?;
        let current_head =
            head(&history).ok_or_else(|| DistributionError::not_found("deployment has no releases"))?;
        let release = match label {
            Some(label) => verified_by_label(&history, label)?,
            None => current_head,
        };

        let mut updated = release.clone();
        if let Some(is_disabled) = patch.is_disabled {
            updated.is_disabled = is_disabled;
        }
        if let Some(is_mandatory) = patch.is_mandatory {
            updated.is_mandatory = is_mandatory;
        }
        if let Some(description) = patch.description {
            updated.description = Some(description);
        }
        if let Some(app_version) = patch.app_version {
            updated.app_version = app_version;
        }
        if let Some(rollout) = patch.rollout {
            updated.rollout = normalize_rollout(Some(rollout));
            if updated.rollout != release.rollout {
                check_rollout_change(release, current_head, rollout)?;
            }
        }

        if updated == *release {
            return Err(DistributionError::NotModified);
        }

        let updated = self.store.update_release(&updated).await?;
        self.cache.invalidate(key).await;
        tracing::info!(deployment_id = deployment.id, label = %updated.label, "updated release");
        Ok(updated)
    }

    /// Deletes one release, verified or not. The blob goes first.
    pub async fn delete_release(&self, actor: &Actor, key: &str, label: &str) -> Result<()> {
        let deployment = self.deployment(actor, key, Permission::Developer).await?;
        let history = self.store.releases(deployment.id).await?;
        let release = history
            .iter()
            .find(|r| r.label == label)
            .ok_or_else(|| DistributionError::not_found(format!("release {label} not found")))?;

        self.blobs.delete(&release.blob_key).await?;
        self.store
            .delete_releases(deployment.id, &[release.id])
            .await?;
        self.cache.invalidate(key).await;
        tracing::info!(deployment_id = deployment.id, label, "deleted release");
        Ok(())
    }

    /// Deletes every release of the deployment.
    pub async fn clear_history(&self, actor: &Actor, key: &str) -> Result<()> {
        let deployment = self.deployment(actor, key, Permission::Developer).await?;
        let history = self.store.releases(deployment.id).await?;
        if history.is_empty() {
            return Err(DistributionError::not_found("deployment has no releases"));
        }

        for release in &history {
            self.blobs.delete(&release.blob_key).await?;
        }
        let ids: Vec<ReleaseId> = history.iter().map(|r| r.id).collect();
        self.store.delete_releases(deployment.id, &ids).await?;
        self.cache.invalidate(key).await;
        tracing::info!(deployment_id = deployment.id, releases = ids.len(), "cleared history");
        Ok(())
    }

    /// Counters for every release, newest first. Releases nobody reported on
    /// yet have all-zero counters.
    pub async fn deployment_metrics(&self, actor: &Actor, key: &str) -> Result<Vec<ReleaseMetrics>> {
        let deployment = self.deployment(actor, key, Permission::Viewer).await?;
        let history = self.store.releases(deployment.id).await?;
        let ids: Vec<ReleaseId> = history.iter().map(|r| r.id).collect();
        let mut metrics = self.store.metrics(&ids).await?;

        Ok(history
            .into_iter()
            .map(|release| ReleaseMetrics {
                metrics: metrics.remove(&release.id).unwrap_or_default(),
                label: release.label,
            })
            .collect())
    }

    async fn finish_commit(&self, key: &str, committed: CommitResult) -> Result<Release> {
        let CommitResult { release, pruned } = committed;

        // The rows are gone already; a blob that fails to delete is garbage
        // rather than a reason to fail the release.
        for old in &pruned {
            if let Err(err) = self.blobs.delete(&old.blob_key).await {
                tracing::warn!(blob_key = %old.blob_key, error = %err, "failed to delete pruned blob");
            }
        }
        if !pruned.is_empty() {
            counter!(RELEASES_PRUNED).increment(pruned.len() as u64);
        }

        self.cache.invalidate(key).await;
        counter!(RELEASE_COMMITTED, "method" => method_tag(release.release_method)).increment(1);
        tracing::info!(
            deployment_id = release.deployment_id,
            label = %release.label,
            pruned = pruned.len(),
            "committed release"
        );
        Ok(release)
    }
}

fn method_tag(method: ReleaseMethod) -> &'static str {
    match method {
        ReleaseMethod::Upload => "upload",
        ReleaseMethod::Promote => "promote",
        ReleaseMethod::Rollback => "rollback",
    }
}

/// Rollouts only ever widen, and only the head can be rolling out.
fn check_rollout_change(release: &Release, head: &Release, rollout: u8) -> Result<()> {
    if release.id != head.id && rollout != 100 {
        return Err(DistributionError::conflict(
            "only the latest release can be rolled out gradually",
        ));
    }
    match release.rollout {
        Some(current) if rollout < current => Err(DistributionError::conflict(format!(
            "rollout can only increase, currently at {current}%"
        ))),
        None if rollout != 100 => Err(DistributionError::conflict(
            "release is already available to all clients",
        )),
        _ => Ok(()),
    }
}
