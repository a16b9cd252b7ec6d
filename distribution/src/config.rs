use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("public_url cannot be used as a base for blob URLs: {0}")]
    InvalidPublicUrl(Url),

    #[error("Blob signing key cannot be empty")]
    EmptySigningKey,

    #[error("retention.max_releases must be at least 1")]
    InvalidRetention,

    #[error("metrics_aggregator.flush_interval_ms must be at least 1")]
    InvalidFlushInterval,

    #[error("metrics_aggregator.max_queue_size must be at least 1")]
    InvalidQueueSize,
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum BlobStoreType {
    Filesystem { base_dir: PathBuf },
    Memory,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct BlobStoreConfig {
    #[serde(flatten)]
    pub r#type: BlobStoreType,
    /// HMAC key for upload URLs.
    pub signing_key: String,
    #[serde(default = "default_upload_url_ttl_secs")]
    pub upload_url_ttl_secs: u64,
}

fn default_upload_url_ttl_secs() -> u64 {
    900
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct RetentionConfig {
    /// Releases kept per deployment; the oldest are pruned beyond this.
    pub max_releases: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig { max_releases: 50 }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct MetricsAggregatorConfig {
    pub flush_interval_ms: u64,
    /// Queue length that triggers a flush before the interval elapses.
    pub max_queue_size: usize,
}

impl Default for MetricsAggregatorConfig {
    fn default() -> Self {
        MetricsAggregatorConfig {
            flush_interval_ms: 5000,
            max_queue_size: 1000,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ResponseCacheConfig {
    /// Number of deployments held.
    pub max_capacity: u64,
    /// Distinct queries held per deployment.
    pub max_queries_per_deployment: u64,
    pub ttl_secs: u64,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        ResponseCacheConfig {
            max_capacity: 10_000,
            max_queries_per_deployment: 1_000,
            ttl_secs: 300,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    /// Client-facing API, management API and blob routes.
    #[serde(default)]
    pub listener: Listener,
    /// Health and readiness probes.
    pub admin_listener: Option<Listener>,
    /// Base URL clients reach this service under. Download and upload URLs
    /// are built from it.
    pub public_url: Url,
    pub blob_store: BlobStoreConfig,
    /// Where the release store persists its state. Without it, state is lost
    /// on restart.
    pub state_snapshot: Option<PathBuf>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub metrics_aggregator: MetricsAggregatorConfig,
    #[serde(default)]
    pub response_cache: ResponseCacheConfig,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    200 * 1024 * 1024
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        if let Some(admin_listener) = &self.admin_listener {
            admin_listener.validate()?;
        }

        if self.public_url.cannot_be_a_base() {
            return Err(ValidationError::InvalidPublicUrl(self.public_url.clone()));
        }
        if self.blob_store.signing_key.is_empty() {
            return Err(ValidationError::EmptySigningKey);
        }
        if self.retention.max_releases == 0 {
            return Err(ValidationError::InvalidRetention);
        }
        if self.metrics_aggregator.flush_interval_ms == 0 {
            return Err(ValidationError::InvalidFlushInterval);
        }
        if self.metrics_aggregator.max_queue_size == 0 {
            return Err(ValidationError::InvalidQueueSize);
        }
        Ok(())
    }
}
