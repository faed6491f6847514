pub mod config;
pub mod error;
pub mod project;
pub mod task;
pub mod time;

pub use config::{Config, HostConfig, Preferences};
pub use error::*;
pub use project::{Backoff, Project, ProjectId};
pub use task::{Task, TaskId, TaskState};
