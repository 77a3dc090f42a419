//! Logging and metrics bootstrap.

use crate::config::SupervisorConfig;
use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Installs the tracing subscriber and, when enabled, the Prometheus
/// exporter. `RUST_LOG` wins over the configured level.
pub fn init_observability(config: &SupervisorConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_thread_ids(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_names(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_bind
            .parse()
            .with_context(|| {
                format!(
                    "invalid metrics bind address {:?}",
                    config.observability.metrics_bind
                )
            })?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Metrics exporter listening on {}", addr);
    }

    Ok(())
}
