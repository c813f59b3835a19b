use crate::config::{CommonConfig, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use shared::metrics_defs::{MetricDef, MetricType};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

const METRICS_PREFIX: &str = "gateway";

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("could not install log subscriber: {0}")]
    Subscriber(#[from] TryInitError),
    #[error("could not build statsd exporter: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
}

/// Keeps the sentry client alive; events are flushed when it is dropped.
pub struct TelemetryGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

pub fn init(config: &CommonConfig) -> Result<TelemetryGuard, TelemetryError> {
    let logging = config.logging.clone().unwrap_or_default();
    let sentry = init_sentry(&logging);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry::integrations::tracing::layer())
        .try_init()?;

    match &config.metrics {
        Some(metrics) => init_metrics(metrics)?,
        None => tracing::info!("no metrics backend configured"),
    }

    Ok(TelemetryGuard { _sentry: sentry })
}

fn init_sentry(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = logging.sentry_dsn.as_deref()?;
    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    ));
    Some(guard)
}

fn init_metrics(config: &MetricsConfig) -> Result<(), TelemetryError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(METRICS_PREFIX))?;
    metrics::set_global_recorder(recorder).map_err(|_| TelemetryError::RecorderInstalled)?;

    for def in multiplexer::metrics_defs::ALL_METRICS {
        describe(def);
    }
    tracing::info!(
        statsd_host = %config.statsd_host,
        statsd_port = config.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}

fn describe(def: &MetricDef) {
    match def.metric_type {
        MetricType::Counter => metrics::describe_counter!(def.name, def.description),
        MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
        MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
    }
}
