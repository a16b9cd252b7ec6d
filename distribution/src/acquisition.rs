//! Client-facing read and report paths.
//!
//! Update checks are answered from the response cache when possible and
//! resolved against the release history otherwise. Status reports never touch
//! the store directly; they are queued on the metrics aggregator.
use crate::aggregator::MetricsAggregator;
use crate::app_version;
use crate::blob::BlobStore;
use crate::cache::ResponseCache;
use crate::error::{DistributionError, Result};
use crate::metrics_defs::UPDATE_CHECK;
use crate::registry::deployment_by_key;
use crate::resolver::{UpdateCheckCacheResponse, UpdateCheckRequest, UpdateDecision, resolve};
use crate::store::ReleaseStore;
use crate::types::label_number;
use serde::Deserialize;
use shared::counter;
use std::sync::Arc;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateCheckParams {
    pub deployment_key: String,
    pub app_version: String,
    pub client_unique_id: Option<String>,
    pub label: Option<String>,
    pub package_hash: Option<String>,
    #[serde(default)]
    pub is_companion: bool,
}

impl UpdateCheckParams {
    fn to_request(&self) -> UpdateCheckRequest {
        UpdateCheckRequest {
            app_version: app_version::normalize(&self.app_version),
            label: non_empty(&self.label),
            package_hash: non_empty(&self.package_hash),
            is_companion: self.is_companion,
        }
    }
}

/// Everything in a request that influences the answer, except the client id.
fn query_key(request: &UpdateCheckRequest) -> String {
    format!(
        "{}|{}|{}|{}",
        request.app_version,
        request.label.as_deref().unwrap_or_default(),
        request.package_hash.as_deref().unwrap_or_default(),
        request.is_companion
    )
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

#[derive(Clone, Debug, Deserialize)]
pub struct DownloadReport {
    pub deployment_key: String,
    pub label: String,
    pub client_unique_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum DeployStatus {
    DeploymentSucceeded,
    DeploymentFailed,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeployReport {
    pub deployment_key: String,
    pub app_version: String,
    pub label: Option<String>,
    pub status: Option<DeployStatus>,
    pub client_unique_id: Option<String>,
    pub previous_deployment_key: Option<String>,
    /// The label the client ran before, or its binary version when it ran
    /// the bundle shipped with the binary.
    pub previous_label_or_app_version: Option<String>,
}

pub struct Acquisition {
    store: Arc<dyn ReleaseStore>,
    blobs: Arc<dyn BlobStore>,
    cache: Arc<dyn ResponseCache>,
    aggregator: MetricsAggregator,
}

impl Acquisition {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        blobs: Arc<dyn BlobStore>,
        cache: Arc<dyn ResponseCache>,
        aggregator: MetricsAggregator,
    ) -> Self {
        Acquisition {
            store,
            blobs,
            cache,
            aggregator,
        }
    }

    pub async fn update_check(&self, params: &UpdateCheckParams) -> Result<UpdateDecision> {
        if params.deployment_key.is_empty() {
            return Err(DistributionError::validation("deployment_key is required"));
        }
        if params.app_version.trim().is_empty() {
            return Err(DistributionError::validation("app_version is required"));
        }

        let request = params.to_request();
        let query = query_key(&request);

        let response = match self.cache.get(&params.deployment_key, &query).await {
            Some(response) => response,
            None => {
                let response = Arc::new(self.resolve(&params.deployment_key, &request).await?);
                self.cache
                    .set(&params.deployment_key, &query, response.clone())
                    .await;
                response
            }
        };

        let mut decision = response
            .select(params.client_unique_id.as_deref())
            .clone();
        // Answers are shared across clients, so the version echo is restored
        // to exactly what this client sent.
        if decision.app_version == request.app_version {
            decision.app_version = params.app_version.clone();
        }

        counter!(UPDATE_CHECK, "available" => if decision.is_available { "true" } else { "false" })
            .increment(1);
        Ok(decision)
    }

    async fn resolve(
        &self,
        deployment_key: &str,
        request: &UpdateCheckRequest,
    ) -> Result<UpdateCheckCacheResponse> {
        let deployment = deployment_by_key(self.store.as_ref(), deployment_key).await?;
        let history = self.store.releases(deployment.id).await?;
        Ok(resolve(&history, request, |release| {
            self.blobs.download_url(&release.blob_key)
        }))
    }

    pub fn report_download(&self, report: &DownloadReport) -> Result<()> {
        if report.deployment_key.is_empty() || report.label.is_empty() {
            return Err(DistributionError::validation(
                "deployment_key and label are required",
            ));
        }
        self.aggregator
            .record_download(&report.deployment_key, &report.label);
        Ok(())
    }

    /// Records the outcome of installing an update. A report without a label
    /// is a client running its binary's bundle and counts for nothing.
    pub fn report_deploy(&self, report: &DeployReport) -> Result<()> {
        if report.deployment_key.is_empty() {
            return Err(DistributionError::validation("deployment_key is required"));
        }

        let (label, status) = match (non_empty(&report.label), report.status) {
            (None, _) => return Ok(()),
            (Some(_), None) => {
                return Err(DistributionError::validation(
                    "status is required when label is present",
                ));
            }
            (Some(label), Some(status)) => (label, status),
        };

        match status {
            DeployStatus::DeploymentSucceeded => {
                let previous_key = report
                    .previous_deployment_key
                    .as_deref()
                    .filter(|k| !k.is_empty())
                    .unwrap_or(report.deployment_key.as_str());
                // Binary versions are not releases and have no counters.
                let previous_label = report
                    .previous_label_or_app_version
                    .as_deref()
                    .filter(|previous| label_number(previous).is_some());

                self.aggregator.record_update(
                    &report.deployment_key,
                    &label,
                    previous_label.map(|previous| (previous_key, previous)),
                );
            }
            DeployStatus::DeploymentFailed => {
                self.aggregator
                    .record_failure(&report.deployment_key, &label);
            }
        }
        Ok(())
    }
}
