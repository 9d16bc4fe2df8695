//! Lightweight facade around `tracing` setup.
//!
//! Mirrors the split the messaging workspace's own telemetry crate uses
//! between "build config from env" and "install the subscriber once" — minus
//! the OTLP exporter wiring, which this service has no use for (see
//! `DESIGN.md`).

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub json_logs: bool,
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Self {
        let log_level =
            std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let json_logs = std::env::var("LOG_FORMAT")
            .map(|v| !matches!(v.to_lowercase().as_str(), "text" | "pretty" | "plain"))
            .unwrap_or(false);
        Self {
            service_name: default_service_name.to_string(),
            json_logs,
            log_level,
        }
    }
}

/// Installs the global `tracing` subscriber. Idempotent: a second call
/// (e.g. from tests run in the same process) is a no-op.
pub fn init_telemetry(cfg: TelemetryConfig) -> anyhow::Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));

    if cfg.json_logs {
        let fmt_layer = tracing_subscriber::fmt::layer().json().flatten_event(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer();
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    }

    INIT.set(()).ok();
    tracing::info!(service = %cfg.service_name, "telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        unsafe {
            std::env::remove_var("LOG_LEVEL");
            std::env::remove_var("LOG_FORMAT");
        }
        let cfg = TelemetryConfig::from_env("chat-gateway");
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.json_logs);
    }

    #[test]
    fn config_respects_env() {
        unsafe {
            std::env::set_var("LOG_LEVEL", "debug");
            std::env::set_var("LOG_FORMAT", "json");
        }
        let cfg = TelemetryConfig::from_env("chat-gateway");
        assert_eq!(cfg.log_level, "debug");
        assert!(cfg.json_logs);
        unsafe {
            std::env::remove_var("LOG_LEVEL");
            std::env::remove_var("LOG_FORMAT");
        }
    }
}
