//! Typed configuration (§4.1, §6.3). Missing required values fail fast with
//! a descriptive message — the caller (`apps/chat-gateway`) turns that into
//! a process exit, following the `EgressConfig`/`GatewayConfig::from_env`
//! shape the rest of the workspace uses.

use anyhow::{Context, Result, bail};
pub use chat_core::RateLimitWindow;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub store_dsn: String,
    pub bus_dsn: String,
    pub identity_verifier_secret: String,
    pub cors_origins: CorsOrigins,
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    pub log_level: String,
    pub rate_limit_window: RateLimitWindow,
    pub request_deadline_secs: u64,
}

#[derive(Debug, Clone)]
pub enum CorsOrigins {
    Any,
    List(Vec<String>),
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let store_dsn = require_env("STORE_DSN")?;
        let identity_verifier_secret = require_env("IDENTITY_VERIFIER_SECRET")?;

        let listen_host = env_or("LISTEN_HOST", "0.0.0.0");
        let listen_port = env_or("LISTEN_PORT", "3020")
            .parse::<u16>()
            .context("LISTEN_PORT must be a valid port number")?;
        let bus_dsn = env_or("BUS_DSN", "redis://localhost:6379");
        let cors_origins = parse_cors(&env_or("CORS_ORIGINS", "*"));
        let rate_limit_max = env_or("RATE_LIMIT_MAX", "100")
            .parse::<u32>()
            .context("RATE_LIMIT_MAX must be a positive integer")?;
        let rate_limit_window_ms = env_or("RATE_LIMIT_WINDOW_MS", "60000")
            .parse::<u64>()
            .context("RATE_LIMIT_WINDOW_MS must be a positive integer")?;
        let log_level = env_or("LOG_LEVEL", "info");
        let rate_limit_window = match env_or("RATE_LIMIT_WINDOW", "rolling24h").as_str() {
            "rolling24h" => RateLimitWindow::Rolling24h,
            "utc_day" => RateLimitWindow::UtcDay,
            other => bail!("RATE_LIMIT_WINDOW must be \"rolling24h\" or \"utc_day\", got {other:?}"),
        };
        let request_deadline_secs = env_or("REQUEST_DEADLINE_SECS", "10")
            .parse::<u64>()
            .context("REQUEST_DEADLINE_SECS must be a positive integer")?;

        Ok(Self {
            listen_host,
            listen_port,
            store_dsn,
            bus_dsn,
            identity_verifier_secret,
            cors_origins,
            rate_limit_max,
            rate_limit_window_ms,
            log_level,
            rate_limit_window,
            request_deadline_secs,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

fn parse_cors(raw: &str) -> CorsOrigins {
    let trimmed = raw.trim();
    if trimmed == "*" || trimmed.is_empty() {
        CorsOrigins::Any
    } else {
        CorsOrigins::List(trimmed.split(',').map(|s| s.trim().to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn missing_required_values_fail_fast() {
        let _guard = env_lock().lock().unwrap();
        unsafe {
            std::env::remove_var("STORE_DSN");
            std::env::remove_var("IDENTITY_VERIFIER_SECRET");
        }
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("STORE_DSN"));
    }

    #[test]
    fn defaults_applied_when_optional_missing() {
        let _guard = env_lock().lock().unwrap();
        unsafe {
            std::env::set_var("STORE_DSN", "postgres://localhost/chat");
            std::env::set_var("IDENTITY_VERIFIER_SECRET", "s3cret");
            std::env::remove_var("LISTEN_PORT");
            std::env::remove_var("CORS_ORIGINS");
        }
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.listen_port, 3020);
        assert!(matches!(cfg.cors_origins, CorsOrigins::Any));
        unsafe {
            std::env::remove_var("STORE_DSN");
            std::env::remove_var("IDENTITY_VERIFIER_SECRET");
        }
    }

    #[test]
    fn cors_list_is_split_and_trimmed() {
        match parse_cors(" https://a.example , https://b.example ") {
            CorsOrigins::List(v) => assert_eq!(v, vec!["https://a.example", "https://b.example"]),
            CorsOrigins::Any => panic!("expected list"),
        }
    }
}
