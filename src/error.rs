//! Top-level error types for tickd.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key: {0}")]
    MissingKey(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Cron expression errors.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    BadCron { expr: String, reason: String },
}

impl CronError {
    pub fn bad(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        CronError::BadCron {
            expr: expr.into(),
            reason: reason.into(),
        }
    }
}

/// Lock service errors.
///
/// `Busy` and `LostLease` are expected outcomes on a healthy system and are
/// logged rather than propagated; `Unavailable` means the coordinator itself
/// could not be reached.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock is held by another process")]
    Busy,

    #[error("lock coordinator unavailable: {0}")]
    Unavailable(String),

    #[error("lease expired before release")]
    LostLease,
}
