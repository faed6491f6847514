use crunch_core::{ProjectId, TaskId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mode::ModeDecision;

/// Which algorithm the CPU scheduler runs this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerMode {
    /// Debt-minimizing weighted round robin.
    Normal,
    /// Earliest deadline first; fairness is ignored.
    Panic,
}

/// How soon a project (or the host) needs more work. Ordered from least
/// to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Urgency {
    /// Suspended, deferred, or not accepting new work.
    DontNeed,
    Ok,
    Need,
    NeedImmediately,
}

/// A command for the task-execution collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchCommand {
    /// Launch an unstarted task in a slot.
    Start { task: TaskId, slot: usize },
    /// Continue a preempted task in a slot.
    Resume { task: TaskId, slot: usize },
    /// Take a running task off its slot.
    Preempt { task: TaskId, slot: usize },
}

impl DispatchCommand {
    pub fn task(&self) -> TaskId {
        match *self {
            DispatchCommand::Start { task, .. }
            | DispatchCommand::Resume { task, .. }
            | DispatchCommand::Preempt { task, .. } => task,
        }
    }

    pub fn slot(&self) -> usize {
        match *self {
            DispatchCommand::Start { slot, .. }
            | DispatchCommand::Resume { slot, .. }
            | DispatchCommand::Preempt { slot, .. } => slot,
        }
    }
}

/// A work request handed to the network collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Echoed back in the matching [`FetchOutcome`] reply.
    pub request_id: Uuid,
    pub project: ProjectId,
    pub urgency: Urgency,
    /// Wall seconds of work wanted on this host.
    pub target_amount: f64,
}

/// Result of a work request, delivered as a later event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FetchOutcome {
    /// The project answered. It may ask not to be contacted for a while.
    Success { request_delay_secs: Option<f64> },
    /// The project could not be reached.
    Unreachable,
}

/// Everything one scheduling pass decided.
#[derive(Debug, Clone)]
pub struct Decision {
    pub mode: ModeDecision,
    /// Commands in the order they must be applied (preemptions first per slot).
    pub commands: Vec<DispatchCommand>,
    pub overall_urgency: Urgency,
    pub fetch: Option<WorkRequest>,
    /// A debt update ran at the start of this pass.
    pub epoch_closed: bool,
}

impl Decision {
    pub fn is_idle(&self) -> bool {
        self.commands.is_empty() && self.fetch.is_none()
    }
}
