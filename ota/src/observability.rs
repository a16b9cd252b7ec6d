use crate::config::{CommonConfig, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
pub enum ObservabilityError {
    #[error("could not set up statsd exporter: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
    #[error("could not install tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Keeps the sentry client alive. Events still in flight are sent when this
/// is dropped.
pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
}

pub fn init(config: &CommonConfig) -> Result<Guard, ObservabilityError> {
    let sentry = init_logging(&config.logging)?;
    if let Some(metrics) = &config.metrics {
        init_metrics(metrics)?;
    }
    Ok(Guard { _sentry: sentry })
}

fn init_logging(
    config: &LoggingConfig,
) -> Result<Option<sentry::ClientInitGuard>, ObservabilityError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let sentry = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .with(sentry.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .try_init()?;

    Ok(sentry)
}

fn init_metrics(config: &MetricsConfig) -> Result<(), ObservabilityError> {
    let recorder =
        StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port).build(Some("ota"))?;
    metrics::set_global_recorder(recorder).map_err(|_| ObservabilityError::RecorderInstalled)?;
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "exporting metrics to statsd"
    );
    Ok(())
}
