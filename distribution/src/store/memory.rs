use super::{CommitResult, MetricsStore, ReleaseStore, Snapshot, StoreError};
use crate::types::{
    App, AppId, Collaborator, Deployment, DeploymentId, DeploymentInfo, MetricDelta, Metrics,
    NewRelease, Permission, Platform, PlatformId, PlatformName, Release, ReleaseId, now_millis,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Tables {
    next_id: u64,
    apps: BTreeMap<AppId, App>,
    platforms: BTreeMap<PlatformId, Platform>,
    collaborators: Vec<Collaborator>,
    deployments: BTreeMap<DeploymentId, Deployment>,
    releases: BTreeMap<ReleaseId, Release>,
    metrics: BTreeMap<ReleaseId, Metrics>,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn deployment_info(&self, deployment: &Deployment) -> Result<DeploymentInfo, StoreError> {
        let platform = self
            .platforms
            .get(&deployment.platform_id)
            .ok_or_else(|| StoreError::Backend(format!("dangling deployment {}", deployment.id)))?;
        let app = self
            .apps
            .get(&platform.app_id)
            .ok_or_else(|| StoreError::Backend(format!("dangling platform {}", platform.id)))?;

        Ok(DeploymentInfo {
            id: deployment.id,
            name: deployment.name.clone(),
            key: deployment.key.clone(),
            app_id: app.id,
            app_name: app.name.clone(),
            platform: platform.name,
        })
    }

    fn deployment_releases(&self, deployment_id: DeploymentId) -> impl Iterator<Item = &Release> {
        self.releases
            .values()
            .filter(move |r| r.deployment_id == deployment_id)
    }

    fn insert_release(&mut self, new: NewRelease) -> Result<ReleaseId, StoreError> {
        if !self.deployments.contains_key(&new.deployment_id) {
            return Err(StoreError::NotFound("deployment not found".into()));
        }
        if self
            .deployment_releases(new.deployment_id)
            .any(|r| r.label == new.label)
        {
            return Err(StoreError::Conflict(format!(
                "release {} already exists",
                new.label
            )));
        }

        let id = self.allocate_id();
        let now = now_millis();
        self.releases.insert(
            id,
            Release {
                id,
                deployment_id: new.deployment_id,
                label: new.label,
                app_version: new.app_version,
                package_hash: new.package_hash,
                size: new.size,
                blob_key: new.blob_key,
                description: new.description,
                is_disabled: new.is_disabled,
                is_mandatory: new.is_mandatory,
                rollout: new.rollout,
                release_method: new.release_method,
                is_verified: false,
                original_label: new.original_label,
                original_deployment_name: new.original_deployment_name,
                created_by: new.created_by,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    fn commit_release(
        &mut self,
        deployment_id: DeploymentId,
        release_id: ReleaseId,
        size: Option<u64>,
        max_releases: usize,
    ) -> Result<CommitResult, StoreError> {
        match self.releases.get(&release_id) {
            Some(r) if r.deployment_id == deployment_id && !r.is_verified => {}
            Some(r) if r.deployment_id == deployment_id => {
                return Err(StoreError::Conflict(format!(
                    "release {} is already verified",
                    r.label
                )));
            }
            _ => return Err(StoreError::NotFound("release not found".into())),
        }

        // Ids are allocated in insertion order, so the highest verified id is
        // the current head.
        let previous_head = self
            .deployment_releases(deployment_id)
            .filter(|r| r.is_verified)
            .max_by_key(|r| r.id)
            .map(|r| (r.id, r.label.clone()));
        if let Some((head_id, head_label)) = &previous_head
            && *head_id > release_id
        {
            return Err(StoreError::Conflict(format!(
                "release {head_label} was committed after this release was staged"
            )));
        }

        let now = now_millis();
        if let Some(head) = previous_head.and_then(|(id, _)| self.releases.get_mut(&id))
            && head.rollout.is_some()
        {
            head.rollout = None;
            head.updated_at = now;
        }
        if let Some(release) = self.releases.get_mut(&release_id) {
            release.is_verified = true;
            if let Some(size) = size {
                release.size = size;
            }
            release.updated_at = now;
        }

        let mut history: Vec<ReleaseId> =
            self.deployment_releases(deployment_id).map(|r| r.id).collect();
        // Oldest first.
        history.sort_unstable();
        let excess = history.len().saturating_sub(max_releases);

        let mut pruned = Vec::with_capacity(excess);
        for id in history.into_iter().take(excess) {
            if let Some(release) = self.releases.remove(&id) {
                self.metrics.remove(&id);
                pruned.push(release);
            }
        }

        let release = self
            .releases
            .get(&release_id)
            .cloned()
            .ok_or_else(|| StoreError::Backend("committed release was pruned".into()))?;

        Ok(CommitResult { release, pruned })
    }
}

/// [`ReleaseStore`] over in-process tables, optionally persisted to a
/// snapshot after every write.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    snapshot: Option<Snapshot>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: Mutex::new(Tables::default()),
            snapshot: None,
        }
    }

    /// Restores state from `snapshot` if it exists, and persists every
    /// subsequent write to it.
    pub fn with_snapshot(snapshot: Snapshot) -> Result<Self, StoreError> {
        let tables = snapshot.load::<Tables>()?.unwrap_or_default();
        tracing::info!(
            path = %snapshot.path().display(),
            releases = tables.releases.len(),
            "loaded store snapshot"
        );

        Ok(MemoryStore {
            tables: Mutex::new(tables),
            snapshot: Some(snapshot),
        })
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.tables.lock())
    }

    /// Runs `f` against a copy of the tables and installs the copy only if
    /// `f` succeeds and the snapshot (if any) was written.
    ///
    /// Every write copies all tables, and the snapshot is written and synced
    /// while the lock is held, blocking the calling runtime thread. That
    /// bounds this store to small deployments; a relational backend should
    /// implement [`ReleaseStore`] for anything larger.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.tables.lock();
        let mut tables = guard.clone();
        let result = f(&mut tables)?;

        if let Some(snapshot) = &self.snapshot {
            snapshot.store(&tables)?;
        }
        *guard = tables;
        Ok(result)
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn find_release_id(
        &self,
        deployment_key: &str,
        label: &str,
    ) -> Result<Option<ReleaseId>, StoreError> {
        Ok(self.read(|t| {
            let deployment = t.deployments.values().find(|d| d.key == deployment_key)?;
            t.deployment_releases(deployment.id)
                .find(|r| r.label == label)
                .map(|r| r.id)
        }))
    }

    async fn apply_metric_deltas(&self, deltas: &[MetricDelta]) -> Result<(), StoreError> {
        self.write(|t| {
            let now = now_millis();
            for delta in deltas {
                if !t.releases.contains_key(&delta.release_id) {
                    continue;
                }
                let row = t.metrics.entry(delta.release_id).or_insert_with(|| Metrics {
                    created_at: now,
                    ..Default::default()
                });
                for (counter, value) in delta.changes() {
                    row.apply(counter, value);
                }
                row.updated_at = now;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl ReleaseStore for MemoryStore {
    async fn create_app(&self, name: &str, owner: &str) -> Result<App, StoreError> {
        self.write(|t| {
            if t.apps.values().any(|a| a.name == name) {
                return Err(StoreError::Conflict(format!("app {name} already exists")));
            }

            let app = App {
                id: t.allocate_id(),
                name: name.to_string(),
                created_at: now_millis(),
            };
            for platform in PlatformName::ALL {
                let id = t.allocate_id();
                t.platforms.insert(
                    id,
                    Platform {
                        id,
                        app_id: app.id,
                        name: platform,
                    },
                );
            }
            t.collaborators.push(Collaborator {
                app_id: app.id,
                user_id: owner.to_string(),
                permission: Permission::Owner,
            });
            t.apps.insert(app.id, app.clone());
            Ok(app)
        })
    }

    async fn app(&self, app_id: AppId) -> Result<Option<App>, StoreError> {
        Ok(self.read(|t| t.apps.get(&app_id).cloned()))
    }

    async fn platform(
        &self,
        app_id: AppId,
        name: PlatformName,
    ) -> Result<Option<Platform>, StoreError> {
        Ok(self.read(|t| {
            t.platforms
                .values()
                .find(|p| p.app_id == app_id && p.name == name)
                .cloned()
        }))
    }

    async fn collaborator(
        &self,
        app_id: AppId,
        user_id: &str,
    ) -> Result<Option<Collaborator>, StoreError> {
        Ok(self.read(|t| {
            t.collaborators
                .iter()
                .find(|c| c.app_id == app_id && c.user_id == user_id)
                .cloned()
        }))
    }

    async fn collaborators(&self, app_id: AppId) -> Result<Vec<Collaborator>, StoreError> {
        Ok(self.read(|t| {
            t.collaborators
                .iter()
                .filter(|c| c.app_id == app_id)
                .cloned()
                .collect()
        }))
    }

    async fn upsert_collaborator(&self, collaborator: Collaborator) -> Result<(), StoreError> {
        self.write(|t| {
            if !t.apps.contains_key(&collaborator.app_id) {
                return Err(StoreError::NotFound("app not found".into()));
            }
            match t
                .collaborators
                .iter_mut()
                .find(|c| c.app_id == collaborator.app_id && c.user_id == collaborator.user_id)
            {
                Some(existing) => existing.permission = collaborator.permission,
                None => t.collaborators.push(collaborator),
            }
            Ok(())
        })
    }

    async fn remove_collaborator(&self, app_id: AppId, user_id: &str) -> Result<(), StoreError> {
        self.write(|t| {
            let index = t
                .collaborators
                .iter()
                .position(|c| c.app_id == app_id && c.user_id == user_id)
                .ok_or_else(|| StoreError::NotFound("collaborator not found".into()))?;

            let owners = t
                .collaborators
                .iter()
                .filter(|c| c.app_id == app_id && c.permission == Permission::Owner)
                .count();
            if t.collaborators[index].permission == Permission::Owner && owners == 1 {
                return Err(StoreError::Conflict(
                    "cannot remove the last owner of an app".into(),
                ));
            }

            t.collaborators.remove(index);
            Ok(())
        })
    }

    async fn create_deployment(
        &self,
        platform_id: PlatformId,
        name: &str,
        key: &str,
    ) -> Result<Deployment, StoreError> {
        self.write(|t| {
            if !t.platforms.contains_key(&platform_id) {
                return Err(StoreError::NotFound("platform not found".into()));
            }
            if t
                .deployments
                .values()
                .any(|d| d.platform_id == platform_id && d.name == name)
            {
                return Err(StoreError::Conflict(format!(
                    "deployment {name} already exists"
                )));
            }
            if t.deployments.values().any(|d| d.key == key) {
                return Err(StoreError::Conflict("deployment key already in use".into()));
            }

            let deployment = Deployment {
                id: t.allocate_id(),
                platform_id,
                name: name.to_string(),
                key: key.to_string(),
                created_at: now_millis(),
            };
            t.deployments.insert(deployment.id, deployment.clone());
            Ok(deployment)
        })
    }

    async fn deployments(&self, app_id: AppId) -> Result<Vec<DeploymentInfo>, StoreError> {
        self.read(|t| {
            let mut deployments = Vec::new();
            for deployment in t.deployments.values() {
                let info = t.deployment_info(deployment)?;
                if info.app_id == app_id {
                    deployments.push(info);
                }
            }
            Ok(deployments)
        })
    }

    async fn deployment_by_key(&self, key: &str) -> Result<Option<DeploymentInfo>, StoreError> {
        self.read(|t| {
            t.deployments
                .values()
                .find(|d| d.key == key)
                .map(|d| t.deployment_info(d))
                .transpose()
        })
    }

    async fn set_deployment_key(
        &self,
        deployment_id: DeploymentId,
        key: &str,
    ) -> Result<DeploymentInfo, StoreError> {
        self.write(|t| {
            if t
                .deployments
                .values()
                .any(|d| d.key == key && d.id != deployment_id)
            {
                return Err(StoreError::Conflict("deployment key already in use".into()));
            }
            let deployment = t
                .deployments
                .get_mut(&deployment_id)
                .ok_or_else(|| StoreError::NotFound("deployment not found".into()))?;
            deployment.key = key.to_string();

            let deployment = deployment.clone();
            t.deployment_info(&deployment)
        })
    }

    async fn releases(&self, deployment_id: DeploymentId) -> Result<Vec<Release>, StoreError> {
        Ok(self.read(|t| {
            // BTreeMap iteration is ascending by id.
            let mut releases: Vec<Release> = t.deployment_releases(deployment_id).cloned().collect();
            releases.reverse();
            releases
        }))
    }

    async fn insert_release(&self, release: NewRelease) -> Result<Release, StoreError> {
        self.write(|t| {
            let id = t.insert_release(release)?;
            t.releases
                .get(&id)
                .cloned()
                .ok_or_else(|| StoreError::Backend("inserted release vanished".into()))
        })
    }

    async fn commit_release(
        &self,
        deployment_id: DeploymentId,
        release_id: ReleaseId,
        size: u64,
        max_releases: usize,
    ) -> Result<CommitResult, StoreError> {
        self.write(|t| t.commit_release(deployment_id, release_id, Some(size), max_releases))
    }

    async fn insert_verified_release(
        &self,
        release: NewRelease,
        max_releases: usize,
    ) -> Result<CommitResult, StoreError> {
        self.write(|t| {
            let deployment_id = release.deployment_id;
            let id = t.insert_release(release)?;
            t.commit_release(deployment_id, id, None, max_releases)
        })
    }

    async fn update_release(&self, release: &Release) -> Result<Release, StoreError> {
        self.write(|t| {
            let existing = t
                .releases
                .get_mut(&release.id)
                .filter(|r| r.deployment_id == release.deployment_id)
                .ok_or_else(|| StoreError::NotFound("release not found".into()))?;

            existing.is_disabled = release.is_disabled;
            existing.is_mandatory = release.is_mandatory;
            existing.description = release.description.clone();
            existing.rollout = release.rollout;
            existing.app_version = release.app_version.clone();
            existing.updated_at = now_millis();
            Ok(existing.clone())
        })
    }

    async fn delete_releases(
        &self,
        deployment_id: DeploymentId,
        release_ids: &[ReleaseId],
    ) -> Result<(), StoreError> {
        self.write(|t| {
            for id in release_ids {
                if t
                    .releases
                    .get(id)
                    .is_some_and(|r| r.deployment_id == deployment_id)
                {
                    t.releases.remove(id);
                    t.metrics.remove(id);
                }
            }
            Ok(())
        })
    }

    async fn metrics(
        &self,
        release_ids: &[ReleaseId],
    ) -> Result<HashMap<ReleaseId, Metrics>, StoreError> {
        Ok(self.read(|t| {
            release_ids
                .iter()
                .filter_map(|id| t.metrics.get(id).map(|m| (*id, m.clone())))
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetricCounter, ReleaseMethod};

    fn new_release(deployment_id: DeploymentId, label: &str) -> NewRelease {
        NewRelease {
            deployment_id,
            label: label.into(),
            app_version: "1.0.0".into(),
            package_hash: format!("hash-{label}"),
            size: 10,
            blob_key: format!("blob/{label}"),
            description: None,
            is_disabled: false,
            is_mandatory: false,
            rollout: None,
            release_method: ReleaseMethod::Upload,
            original_label: None,
            original_deployment_name: None,
            created_by: Some("alice".into()),
        }
    }

    async fn deployment(store: &MemoryStore) -> DeploymentId {
        let app = store.create_app("app", "alice").await.unwrap();
        let platform = store
            .platform(app.id, PlatformName::Ios)
            .await
            .unwrap()
            .unwrap();
        store
            .create_deployment(platform.id, "Production", "key-prod")
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn uniqueness_constraints() {
        let store = MemoryStore::new();
        let deployment_id = deployment(&store).await;

        assert!(matches!(
            store.create_app("app", "bob").await,
            Err(StoreError::Conflict(_))
        ));

        let info = store.deployment_by_key("key-prod").await.unwrap().unwrap();
        let platform = store
            .platform(info.app_id, PlatformName::Ios)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            store.create_deployment(platform.id, "Production", "other").await,
            Err(StoreError::Conflict(_))
        ));

        store.insert_release(new_release(deployment_id, "v1")).await.unwrap();
        assert!(matches!(
            store.insert_release(new_release(deployment_id, "v1")).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn commit_clears_previous_rollout_and_prunes() {
        let store = MemoryStore::new();
        let deployment_id = deployment(&store).await;

        let mut first = new_release(deployment_id, "v1");
        first.rollout = Some(20);
        store.insert_verified_release(first, 2).await.unwrap();
        store
            .insert_verified_release(new_release(deployment_id, "v2"), 2)
            .await
            .unwrap();

        let staged = store
            .insert_release(new_release(deployment_id, "v3"))
            .await
            .unwrap();
        assert!(!staged.is_verified);

        let result = store.commit_release(deployment_id, staged.id, 10, 2).await.unwrap();
        assert!(result.release.is_verified);
        assert_eq!(result.pruned.len(), 1);
        assert_eq!(result.pruned[0].label, "v1");

        let history = store.releases(deployment_id).await.unwrap();
        let labels: Vec<&str> = history.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["v3", "v2"]);
        assert!(history.iter().all(|r| r.rollout.is_none()));

        assert!(matches!(
            store.commit_release(deployment_id, staged.id, 10, 2).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn commit_behind_the_head_is_a_conflict() {
        let store = MemoryStore::new();
        let deployment_id = deployment(&store).await;

        let mut v1 = new_release(deployment_id, "v1");
        v1.rollout = Some(50);
        let older = store.insert_release(v1).await.unwrap();
        let mut v2 = new_release(deployment_id, "v2");
        v2.rollout = Some(20);
        let newer = store.insert_release(v2).await.unwrap();

        store.commit_release(deployment_id, newer.id, 10, 50).await.unwrap();
        assert!(matches!(
            store.commit_release(deployment_id, older.id, 10, 50).await,
            Err(StoreError::Conflict(_))
        ));

        let history = store.releases(deployment_id).await.unwrap();
        assert_eq!(history[0].label, "v2");
        assert_eq!(history[0].rollout, Some(20));
        assert!(history[0].is_verified);
        assert!(!history[1].is_verified);
    }

    #[tokio::test]
    async fn failed_transaction_leaves_tables_untouched() {
        let store = MemoryStore::new();
        let deployment_id = deployment(&store).await;
        store
            .insert_verified_release(new_release(deployment_id, "v1"), 50)
            .await
            .unwrap();

        // A zero bound prunes the release being committed, which fails the
        // whole transaction after the insert already happened.
        assert!(
            store
                .insert_verified_release(new_release(deployment_id, "v2"), 0)
                .await
                .is_err()
        );
        assert_eq!(store.releases(deployment_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn metric_deltas_upsert_and_clamp() {
        let store = MemoryStore::new();
        let deployment_id = deployment(&store).await;
        let release = store
            .insert_verified_release(new_release(deployment_id, "v1"), 50)
            .await
            .unwrap()
            .release;

        assert_eq!(
            store.find_release_id("key-prod", "v1").await.unwrap(),
            Some(release.id)
        );
        assert_eq!(store.find_release_id("key-prod", "v9").await.unwrap(), None);

        let mut delta = MetricDelta::new(release.id);
        delta.add(MetricCounter::Downloaded, 3);
        delta.add(MetricCounter::Active, -1);
        let orphan = MetricDelta {
            downloaded: 1,
            ..MetricDelta::new(9999)
        };
        store.apply_metric_deltas(&[delta, orphan]).await.unwrap();

        let metrics = store.metrics(&[release.id, 9999]).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[&release.id].downloaded, 3);
        assert_eq!(metrics[&release.id].active, 0);
    }

    #[tokio::test]
    async fn last_owner_cannot_leave() {
        let store = MemoryStore::new();
        let app = store.create_app("app", "alice").await.unwrap();

        assert!(matches!(
            store.remove_collaborator(app.id, "alice").await,
            Err(StoreError::Conflict(_))
        ));

        store
            .upsert_collaborator(Collaborator {
                app_id: app.id,
                user_id: "bob".into(),
                permission: Permission::Owner,
            })
            .await
            .unwrap();
        store.remove_collaborator(app.id, "alice").await.unwrap();
        assert_eq!(store.collaborators(app.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");

        {
            let store = MemoryStore::with_snapshot(Snapshot::new(&path)).unwrap();
            let deployment_id = deployment(&store).await;
            store
                .insert_verified_release(new_release(deployment_id, "v1"), 50)
                .await
                .unwrap();
        }

        let store = MemoryStore::with_snapshot(Snapshot::new(&path)).unwrap();
        let info = store.deployment_by_key("key-prod").await.unwrap().unwrap();
        let history = store.releases(info.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_verified);
    }
}
