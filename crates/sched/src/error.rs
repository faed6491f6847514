use crunch_core::{ConfigError, RosterError};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the scheduler and its harness.
#[derive(Error, Debug)]
pub enum SchedError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Roster(#[from] RosterError),

    #[error("No outstanding work request with id {0}")]
    UnknownRequest(Uuid),

    #[error("Scenario I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid scenario project {project}: {reason}")]
    InvalidScenario { project: String, reason: String },

    #[error("Scenario parse error: {0}")]
    Scenario(#[from] toml::de::Error),

    #[error("Scheduler driver has stopped")]
    DriverStopped,
}
