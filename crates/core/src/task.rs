use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::project::ProjectId;
use crate::time::secs_between;

/// Task identifier. Ids are handed out in creation order, so a lower id
/// always means an earlier-created task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scheduler-visible lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Unstarted,
    Running,
    Preempted,
    Suspended,
    Done,
}

impl TaskState {
    /// Whether a task in this state may be given a processor slot.
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Unstarted | TaskState::Running | TaskState::Preempted)
    }
}

/// A locally-held unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project: ProjectId,
    pub name: String,
    pub state: TaskState,
    pub report_deadline: DateTime<Utc>,
    /// Remaining work, in seconds on the reference host.
    pub estimated_remaining_time: f64,
    pub wall_time_used: f64,
    /// Wall time this task is projected to consume before the next accounting point.
    pub expected_payoff: f64,
    /// All progress so far is covered by a checkpoint.
    pub checkpointed: bool,
    /// State to restore when a user suspension is lifted.
    pub suspended_from: Option<TaskState>,
}

impl Task {
    pub fn new(
        id: TaskId,
        project: ProjectId,
        name: impl Into<String>,
        report_deadline: DateTime<Utc>,
        estimated_remaining_time: f64,
    ) -> Self {
        Self {
            id,
            project,
            name: name.into(),
            state: TaskState::Unstarted,
            report_deadline,
            estimated_remaining_time: estimated_remaining_time.max(0.0),
            wall_time_used: 0.0,
            expected_payoff: 0.0,
            checkpointed: true,
            suspended_from: None,
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.state.is_runnable()
    }

    /// Estimated wall seconds left on a host running at `speed_factor`.
    pub fn remaining_wall(&self, speed_factor: f64) -> f64 {
        self.estimated_remaining_time / speed_factor
    }

    /// Seconds until the report deadline (negative once it has passed).
    pub fn time_to_deadline(&self, now: DateTime<Utc>) -> f64 {
        secs_between(now, self.report_deadline)
    }

    /// Charge `wall_secs` of execution. Progress since the last checkpoint is unsaved.
    pub fn record_usage(&mut self, wall_secs: f64, speed_factor: f64) {
        self.wall_time_used += wall_secs;
        self.estimated_remaining_time =
            (self.estimated_remaining_time - wall_secs * speed_factor).max(0.0);
        if wall_secs > 0.0 {
            self.checkpointed = false;
        }
    }

    /// Move into `Suspended`, remembering where to come back to.
    pub fn suspend(&mut self) {
        if self.state.is_runnable() {
            self.suspended_from = Some(self.state);
            self.state = TaskState::Suspended;
        }
    }

    /// Lift a user suspension. A task that was running resumes as preempted,
    /// since it lost its slot when it was suspended.
    pub fn resume(&mut self) {
        if self.state == TaskState::Suspended {
            self.state = match self.suspended_from.take() {
                Some(TaskState::Running) | Some(TaskState::Preempted) => TaskState::Preempted,
                _ if self.wall_time_used > 0.0 => TaskState::Preempted,
                _ => TaskState::Unstarted,
            };
        }
    }
}
