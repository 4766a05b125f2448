//! Controller error types.

use thiserror::Error;

/// Errors raised by the controller's startup and reconcile paths.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A capability the running platform does not provide. Stops the loop.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("invalid credentials: {0}")]
    Credentials(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("backend registration failed: {0}")]
    Registration(String),

    #[error("platform metadata unavailable: {0}")]
    Platform(String),

    #[error("provisioning runner {runner} failed: {reason}")]
    Provision { runner: String, reason: String },

    #[error("backend sync failed: {0}")]
    Sync(String),

    #[error("github api error: {0}")]
    Github(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] fleet_metrics::MetricsError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// Whether the reconcile driver must stop on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControllerError::NotImplemented(_))
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
