use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by the scheduler.
///
/// Validation, illegal-state and not-found errors reach the caller untouched. Lock timeouts and
/// conflicts are "soft": the action processor only logs them and waits for the next event or scan.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("no runtime found for task '{0}'")]
    NoRuntimeFound(String),

    #[error("timed out waiting for lock on '{0}'")]
    LockTimeout(String),

    #[error("'{0}' was modified concurrently")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SchedulerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Contention failures that resolve themselves on the next event or scan pass.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout(_) | Self::Conflict(_) | Self::Store(StoreError::Conflict { .. })
        )
    }
}

impl From<StoreError> for SchedulerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict { key, .. } => Self::Conflict(key),
            other => Self::Store(other),
        }
    }
}

impl From<::config::ConfigError> for SchedulerError {
    fn from(error: ::config::ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
