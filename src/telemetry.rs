//! Tracing subscriber and metrics registry setup

use crate::config::{Config, ObservabilityConfig};
use crate::error::{AppError, Result};
use crate::metrics;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Process-wide observability setup: tracing, then metrics when enabled
pub fn init(config: &Config) -> Result<()> {
    init_tracing(&config.observability);

    if config.observability.prometheus_enabled {
        metrics::init_metrics().map_err(|e| AppError::Internal(format!("metrics registration failed: {}", e)))?;
    } else {
        tracing::debug!("Prometheus metrics disabled");
    }

    Ok(())
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false`
/// when a subscriber was already installed, which keeps repeated calls from
/// tests harmless.
pub fn init_tracing(config: &ObservabilityConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("entity_index_sync={},tantivy=warn", config.log_level)));

    let result = if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    match result {
        Ok(()) => {
            tracing::info!(service = %config.service_name, "Tracing initialized");
            true
        }
        Err(_) => false,
    }
}
