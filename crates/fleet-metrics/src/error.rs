//! Metrics error types.

use thiserror::Error;

/// The exposition text could not be tokenized.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {reason}")]
pub struct ExpositionError {
    pub line: usize,
    pub reason: String,
}

impl ExpositionError {
    pub(crate) fn new(line: usize, reason: impl Into<String>) -> Self {
        Self {
            line,
            reason: reason.into(),
        }
    }
}

/// Errors that abort a whole collection cycle.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("malformed exposition text from runner {runner}: {source}")]
    Exposition {
        runner: String,
        #[source]
        source: ExpositionError,
    },

    #[error("scrape task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
