pub mod acquisition;
pub mod aggregator;
pub mod api;
pub mod app_version;
pub mod blob;
pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics_defs;
pub mod registry;
pub mod resolver;
pub mod rollout;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutils;

use acquisition::Acquisition;
use aggregator::MetricsAggregator;
use api::AppState;
use blob::{BlobError, BlobStore, FilesystemBlobStore, MemoryBlobStore, UrlSigner};
use cache::MemoryResponseCache;
use config::{BlobStoreType, Config};
use lifecycle::ReleaseManager;
use registry::Registry;
use shared::admin_service::{AdminProbe, AdminService};
use shared::http::run_http_service;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use store::{MemoryStore, Snapshot, StoreError};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("could not load release store: {0}")]
    Store(#[from] StoreError),

    #[error("could not set up blob store: {0}")]
    Blob(#[from] BlobError),
}

struct Probe {
    aggregator: MetricsAggregator,
    cache: Arc<MemoryResponseCache>,
}

impl AdminProbe for Probe {
    fn is_ready(&self) -> bool {
        true
    }

    fn status(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("pending_metric_events", self.aggregator.pending() as u64),
            ("cached_deployments", self.cache.deployment_count()),
        ]
    }
}

fn blob_store(config: &Config) -> Result<Arc<dyn BlobStore>, BlobError> {
    let signer = UrlSigner::new(
        config.public_url.clone(),
        config.blob_store.signing_key.as_bytes(),
        Duration::from_secs(config.blob_store.upload_url_ttl_secs),
    )?;

    let store: Arc<dyn BlobStore> = match &config.blob_store.r#type {
        BlobStoreType::Filesystem { base_dir } => {
            Arc::new(FilesystemBlobStore::new(base_dir, signer))
        }
        BlobStoreType::Memory => Arc::new(MemoryBlobStore::new(signer)),
    };
    Ok(store)
}

/// Serves the API until `shutdown` resolves, then writes out pending metric
/// events.
pub async fn run<F>(config: Config, shutdown: F) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let memory = Arc::new(match &config.state_snapshot {
        Some(path) => MemoryStore::with_snapshot(Snapshot::new(path))?,
        None => MemoryStore::new(),
    });
    let blobs = blob_store(&config)?;
    let cache = Arc::new(
        MemoryResponseCache::new(
            config.response_cache.max_capacity,
            Duration::from_secs(config.response_cache.ttl_secs),
        )
        .with_query_limit(config.response_cache.max_queries_per_deployment),
    );
    let aggregator = MetricsAggregator::new(
        memory.clone(),
        Duration::from_millis(config.metrics_aggregator.flush_interval_ms),
        config.metrics_aggregator.max_queue_size,
    );

    let state = AppState {
        registry: Arc::new(Registry::new(memory.clone(), cache.clone())),
        releases: Arc::new(ReleaseManager::new(
            memory.clone(),
            blobs.clone(),
            cache.clone(),
            config.retention.max_releases,
        )),
        acquisition: Arc::new(Acquisition::new(
            memory,
            blobs.clone(),
            cache.clone(),
            aggregator.clone(),
        )),
        blobs,
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown.await;
        let _ = stop_tx.send(true);
    });
    let stopped = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let listener = TcpListener::bind(format!(
        "{}:{}",
        config.listener.host, config.listener.port
    ))
    .await?;
    tracing::info!(
        host = %config.listener.host,
        port = config.listener.port,
        "serving api"
    );
    let api_task = async {
        axum::serve(listener, api::router(state, config.max_upload_bytes))
            .with_graceful_shutdown(stopped(stop_rx.clone()))
            .await
            .map_err(ServeError::from)
    };

    let admin_task = async {
        match &config.admin_listener {
            Some(admin) => {
                let probe = Arc::new(Probe {
                    aggregator: aggregator.clone(),
                    cache,
                });
                run_http_service::<_, ServeError, _>(
                    &admin.host,
                    admin.port,
                    AdminService::new(probe),
                    stopped(stop_rx.clone()),
                )
                .await
            }
            None => Ok(()),
        }
    };

    let result = tokio::try_join!(api_task, admin_task);
    aggregator.shutdown().await;
    result.map(|_| ())
}
