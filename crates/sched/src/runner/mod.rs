//! Client scheduler runner: owns the roster and runs scheduling passes.
//!
//! Split into focused submodules:
//! - `core`: ClientScheduler struct, constructor, roster registration and accessors
//! - `events`: inbound events and how each one mutates state
//! - `pass`: one scheduling pass (epoch close, mode, CPU assignment, work fetch)

mod core;
mod events;
mod pass;

pub use self::core::ClientScheduler;
pub use self::events::SchedulerEvent;
