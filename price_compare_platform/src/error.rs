//! Error taxonomy for the search orchestrator.

use std::time::Duration;
use thiserror::Error;

use crate::registry::TaskId;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestratorError {
    /// One source failed. Recovered inside the job runner.
    #[error("source '{source_name}' failed: {message}")]
    Fetch { source_name: String, message: String },

    /// One source exceeded its deadline and was cancelled.
    #[error("source '{source_name}' timed out after {after:?}")]
    FetchTimeout { source_name: String, after: Duration },

    /// Every source failed or every result was filtered out.
    #[error("no products found: {0}")]
    NoResults(String),

    /// Poll against an identifier that never existed or was already consumed.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("requester is not authorized")]
    NotAuthorized,
}

impl OrchestratorError {
    pub fn fetch(source_name: impl Into<String>, message: impl ToString) -> Self {
        Self::Fetch {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }
}
