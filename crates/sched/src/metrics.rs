use chrono::{DateTime, Utc};
use crunch_core::ProjectId;
use indexmap::IndexMap;
use serde::Serialize;

use crate::types::{DispatchCommand, SchedulerMode, Urgency};

/// Per-project view exposed in the metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectStatus {
    pub resource_share: f64,
    pub urgency: Urgency,
    pub short_term_debt: f64,
    pub long_term_debt: f64,
    /// Lifetime wall seconds.
    pub total_wall_time: f64,
    pub runnable_tasks: usize,
    pub deferred_until: Option<DateTime<Utc>>,
    pub backoff_failures: u32,
}

/// Scheduler operational metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    /// Scheduling passes run.
    pub passes: u64,
    /// Passes that ran in panic mode.
    pub panic_passes: u64,
    pub epochs_closed: u64,
    pub starts: u64,
    pub resumes: u64,
    pub preemptions: u64,
    pub fetch_requests: u64,
    /// Unreachable replies received.
    pub fetch_failures: u64,
    pub idle_slots: usize,
    pub busy_slots: usize,
    pub current_mode: SchedulerMode,
    pub fetch_suppressed: bool,
    pub overall_urgency: Urgency,
    pub projects: IndexMap<ProjectId, ProjectStatus>,
    pub last_pass: Option<DateTime<Utc>>,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self {
            passes: 0,
            panic_passes: 0,
            epochs_closed: 0,
            starts: 0,
            resumes: 0,
            preemptions: 0,
            fetch_requests: 0,
            fetch_failures: 0,
            idle_slots: 0,
            busy_slots: 0,
            current_mode: SchedulerMode::Normal,
            fetch_suppressed: false,
            overall_urgency: Urgency::DontNeed,
            projects: IndexMap::new(),
            last_pass: None,
        }
    }
}

impl SchedulerMetrics {
    /// Count the commands emitted by one pass.
    pub fn record_commands(&mut self, commands: &[DispatchCommand]) {
        for cmd in commands {
            match cmd {
                DispatchCommand::Start { .. } => self.starts += 1,
                DispatchCommand::Resume { .. } => self.resumes += 1,
                DispatchCommand::Preempt { .. } => self.preemptions += 1,
            }
        }
    }

    /// Each project's fraction of all wall time recorded so far.
    pub fn wall_time_shares(&self) -> IndexMap<ProjectId, f64> {
        let total: f64 = self.projects.values().map(|p| p.total_wall_time).sum();
        self.projects
            .iter()
            .map(|(id, p)| {
                let share = if total > 0.0 { p.total_wall_time / total } else { 0.0 };
                (id.clone(), share)
            })
            .collect()
    }

    /// Each project's configured fraction of the total resource share.
    pub fn resource_share_fractions(&self) -> IndexMap<ProjectId, f64> {
        let total: f64 = self.projects.values().map(|p| p.resource_share).sum();
        self.projects
            .iter()
            .map(|(id, p)| (id.clone(), p.resource_share / total))
            .collect()
    }
}
