//! Apps, deployments and collaborators.
use crate::cache::ResponseCache;
use crate::error::{DistributionError, Result};
use crate::store::ReleaseStore;
use crate::types::{
    Actor, App, AppId, Collaborator, DeploymentInfo, Permission, PlatformName,
};
use serde::Serialize;
use std::sync::Arc;

/// Resolves `actor`'s permission on an app and checks it against `required`.
/// Non-collaborators learn nothing about the app.
pub(crate) async fn authorize(
    store: &dyn ReleaseStore,
    app_id: AppId,
    actor: &Actor,
    required: Permission,
) -> Result<Permission> {
    let collaborator = store
        .collaborator(app_id, &actor.user_id)
        .await?
        .ok_or_else(|| DistributionError::not_found("app not found"))?;

    if !collaborator.permission.allows(required) {
        return Err(DistributionError::Forbidden(format!(
            "this action requires the {required} permission"
        )));
    }
    Ok(collaborator.permission)
}

pub(crate) async fn deployment_by_key(
    store: &dyn ReleaseStore,
    key: &str,
) -> Result<DeploymentInfo> {
    store
        .deployment_by_key(key)
        .await?
        .ok_or_else(|| DistributionError::not_found("deployment not found"))
}

/// A deployment with the label of the release clients currently get.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeploymentSummary {
    #[serde(flatten)]
    pub deployment: DeploymentInfo,
    pub head_label: Option<String>,
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DistributionError::validation(format!("{kind} name is required")));
    }
    Ok(())
}

pub struct Registry {
    store: Arc<dyn ReleaseStore>,
    cache: Arc<dyn ResponseCache>,
}

impl Registry {
    pub fn new(store: Arc<dyn ReleaseStore>, cache: Arc<dyn ResponseCache>) -> Self {
        Registry { store, cache }
    }

    pub async fn create_app(&self, actor: &Actor, name: &str) -> Result<App> {
        validate_name("app", name)?;
        let app = self.store.create_app(name.trim(), &actor.user_id).await?;
        tracing::info!(app_id = app.id, user = %actor.user_id, "created app");
        Ok(app)
    }

    pub async fn app(&self, actor: &Actor, app_id: AppId) -> Result<App> {
        authorize(self.store.as_ref(), app_id, actor, Permission::Viewer).await?;
        self.store
            .app(app_id)
            .await?
            .ok_or_else(|| DistributionError::not_found("app not found"))
    }

    pub async fn create_deployment(
        &self,
        actor: &Actor,
        app_id: AppId,
        platform: PlatformName,
        name: &str,
    ) -> Result<DeploymentInfo> {
        validate_name("deployment", name)?;
        authorize(self.store.as_ref(), app_id, actor, Permission::Admin).await?;

        let platform = self
            .store
            .platform(app_id, platform)
            .await?
            .ok_or_else(|| DistributionError::not_found("platform not found"))?;

        let key = generate_key();
        let deployment = self
            .store
            .create_deployment(platform.id, name.trim(), &key)
            .await?;
        tracing::info!(app_id, deployment_id = deployment.id, "created deployment");

        deployment_by_key(self.store.as_ref(), &deployment.key).await
    }

    /// Issues a new key. Clients still on the old key stop receiving updates.
    pub async fn rotate_deployment_key(&self, actor: &Actor, key: &str) -> Result<DeploymentInfo> {
        let deployment = deployment_by_key(self.store.as_ref(), key).await?;
        authorize(self.store.as_ref(), deployment.app_id, actor, Permission::Admin).await?;

        let rotated = self
            .store
            .set_deployment_key(deployment.id, &generate_key())
            .await?;
        self.cache.invalidate(key).await;
        tracing::info!(deployment_id = deployment.id, "rotated deployment key");
        Ok(rotated)
    }

    pub async fn deployments(
        &self,
        actor: &Actor,
        app_id: AppId,
        platform: Option<PlatformName>,
    ) -> Result<Vec<DeploymentSummary>> {
        authorize(self.store.as_ref(), app_id, actor, Permission::Viewer).await?;

        let mut summaries = Vec::new();
        for deployment in self.store.deployments(app_id).await? {
            if platform.is_some_and(|p| p != deployment.platform) {
                continue;
            }
            let head_label = self
                .store
                .releases(deployment.id)
                .await?
                .into_iter()
                .find(|r| r.is_verified)
                .map(|r| r.label);
            summaries.push(DeploymentSummary {
                deployment,
                head_label,
            });
        }
        Ok(summaries)
    }

    pub async fn collaborators(&self, actor: &Actor, app_id: AppId) -> Result<Vec<Collaborator>> {
        authorize(self.store.as_ref(), app_id, actor, Permission::Viewer).await?;
        Ok(self.store.collaborators(app_id).await?)
    }

    /// Adds a collaborator or changes an existing one's permission.
    pub async fn add_collaborator(
        &self,
        actor: &Actor,
        app_id: AppId,
        user_id: &str,
        permission: Permission,
    ) -> Result<()> {
        validate_name("user", user_id)?;
        authorize(self.store.as_ref(), app_id, actor, Permission::Owner).await?;

        // Demoting the last owner would orphan the app.
        if permission != Permission::Owner {
            let collaborators = self.store.collaborators(app_id).await?;
            let owners: Vec<&str> = collaborators
                .iter()
                .filter(|c| c.permission == Permission::Owner)
                .map(|c| c.user_id.as_str())
                .collect();
            if owners == [user_id] {
                return Err(DistributionError::conflict(
                    "cannot demote the last owner of an app",
                ));
            }
        }

        self.store
            .upsert_collaborator(Collaborator {
                app_id,
                user_id: user_id.to_string(),
                permission,
            })
            .await?;
        Ok(())
    }

    pub async fn remove_collaborator(&self, actor: &Actor, app_id: AppId, user_id: &str) -> Result<()> {
        authorize(self.store.as_ref(), app_id, actor, Permission::Owner).await?;
        Ok(self.store.remove_collaborator(app_id, user_id).await?)
    }
}

fn generate_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
