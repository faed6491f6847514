use thiserror::Error;

use crate::project::ProjectId;
use crate::task::TaskId;

/// Errors raised while loading or validating preferences and host settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid preference {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Errors raised by roster mutations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RosterError {
    #[error("Project not found: {0}")]
    ProjectNotFound(ProjectId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Project already attached: {0}")]
    DuplicateProject(ProjectId),

    #[error("Invalid resource share {share} for project {project}: must be > 0")]
    InvalidResourceShare { project: ProjectId, share: f64 },
}
