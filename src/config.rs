//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use std::net::SocketAddr;

/// What to do at boot with tasks whose fire time passed while the process
/// was down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PastTaskPolicy {
    /// Leave the row alone; re-arming recomputes the next instant.
    Skip,
    /// Record a failed execution for the missed tick, then re-arm.
    Fail,
    /// Fire the missed task once, immediately.
    Run,
}

impl PastTaskPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            PastTaskPolicy::Skip => "skip",
            PastTaskPolicy::Fail => "fail",
            PastTaskPolicy::Run => "run",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "skip" => Some(PastTaskPolicy::Skip),
            "fail" => Some(PastTaskPolicy::Fail),
            "run" => Some(PastTaskPolicy::Run),
            _ => None,
        }
    }
}

impl std::fmt::Display for PastTaskPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// tickd configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store connection URI (sqlx SQLite URL).
    pub db_url: String,

    /// Lock coordinator URI.
    pub redis_url: String,

    /// Recovery policy for overdue tasks at boot.
    pub recover_past_tasks: PastTaskPolicy,

    /// Log filter directive (tracing `EnvFilter` syntax).
    pub log_level: String,

    /// Address for the admin API server.
    pub bind_addr: SocketAddr,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let db_url = std::env::var("DB_URL").map_err(|_| ConfigError::MissingKey("DB_URL"))?;
        let redis_url =
            std::env::var("REDIS_URL").map_err(|_| ConfigError::MissingKey("REDIS_URL"))?;

        let recover_past_tasks = match std::env::var("RECOVER_PAST_TASKS") {
            Ok(value) => PastTaskPolicy::parse(&value).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "RECOVER_PAST_TASKS must be one of skip/fail/run (got {value:?})"
                ))
            })?,
            Err(_) => PastTaskPolicy::Fail,
        };

        let log_level = std::env::var("LOG_LEVEL")
            .map(|value| normalize_log_level(&value))
            .unwrap_or_else(|_| "debug".to_string());

        let bind_addr = match std::env::var("BIND_ADDR") {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::Invalid(format!("BIND_ADDR is not a socket address: {value:?}"))
            })?,
            Err(_) => SocketAddr::from(([0, 0, 0, 0], 8000)),
        };

        Ok(Self {
            db_url,
            redis_url,
            recover_past_tasks,
            log_level,
            bind_addr,
        })
    }
}

/// Accept numeric python-style levels alongside tracing level names.
fn normalize_log_level(value: &str) -> String {
    match value.trim() {
        "10" => "trace".to_string(),
        "20" => "debug".to_string(),
        "30" => "info".to_string(),
        "40" => "warn".to_string(),
        "50" => "error".to_string(),
        other => other.to_ascii_lowercase(),
    }
}
