//! Seams to the outside world: the process executor and the network
//! client that talks to project servers.

use crunch_core::{ProjectId, TaskId};

use crate::types::{DispatchCommand, FetchOutcome, WorkRequest};

/// Errors from a work request.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Project unreachable: {0}")]
    Unreachable(ProjectId),

    #[error("Protocol error from {project}: {message}")]
    Protocol { project: ProjectId, message: String },
}

/// Errors from applying a dispatch command.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Command for task {task} failed: {message}")]
    Failed { task: TaskId, message: String },
}

/// Starts, resumes and preempts task processes.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn apply(&self, command: &DispatchCommand) -> Result<(), ExecError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "executor"
    }
}

/// Sends work requests to project servers.
///
/// Every error is treated as the project being unreachable for backoff
/// purposes; the distinction only shows up in logs.
#[async_trait::async_trait]
pub trait WorkFetcher: Send + Sync {
    async fn request_work(&self, request: &WorkRequest) -> Result<FetchOutcome, FetchError>;
}

/// Fold a fetch result into the outcome the scheduler consumes.
pub fn outcome_of(result: Result<FetchOutcome, FetchError>) -> FetchOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(error = %e, "work request failed");
            FetchOutcome::Unreachable
        }
    }
}
