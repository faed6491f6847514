//! Per-pass choice between normal and panic scheduling, and whether work
//! fetch is held back because the queue already threatens deadlines.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use crunch_core::{Task, TaskId};
use serde::Serialize;

use crate::types::SchedulerMode;

/// Output of the mode selector for one scheduling pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeDecision {
    pub scheduler_mode: SchedulerMode,
    pub fetch_suppressed: bool,
    /// Some deadline-ordered prefix of the queue cannot finish in time.
    pub overloaded: bool,
    /// Mean of `remaining / time_to_deadline` over queued tasks.
    pub load_fraction: f64,
    /// Tasks inside a failing prefix: the deadline-critical ones.
    pub at_risk: BTreeSet<TaskId>,
}

impl Default for ModeDecision {
    fn default() -> Self {
        Self {
            scheduler_mode: SchedulerMode::Normal,
            fetch_suppressed: false,
            overloaded: false,
            load_fraction: 0.0,
            at_risk: BTreeSet::new(),
        }
    }
}

impl ModeDecision {
    pub fn is_panic(&self) -> bool {
        self.scheduler_mode == SchedulerMode::Panic
    }

    pub fn is_deadline_critical(&self, task: TaskId) -> bool {
        self.at_risk.contains(&task)
    }
}

/// Evaluate the queued tasks against their deadlines.
///
/// Only runnable tasks are considered; callers pass the tasks of
/// non-suspended projects. `speed_factor` converts reference-host remaining
/// time into wall time on this host.
pub fn select_mode<'a>(
    tasks: impl IntoIterator<Item = &'a Task>,
    now: DateTime<Utc>,
    up_frac: f64,
    speed_factor: f64,
) -> ModeDecision {
    let mut queued: Vec<&Task> = tasks.into_iter().filter(|t| t.is_runnable()).collect();
    queued.sort_by(|a, b| {
        a.report_deadline
            .cmp(&b.report_deadline)
            .then(a.id.cmp(&b.id))
    });

    let mut remaining_sum = 0.0;
    let mut load_sum = 0.0;
    let mut last_failing: Option<usize> = None;

    for (i, task) in queued.iter().enumerate() {
        let remaining = task.remaining_wall(speed_factor);
        let time_to_deadline = task.time_to_deadline(now);
        remaining_sum += remaining;

        if remaining_sum > up_frac * time_to_deadline {
            last_failing = Some(i);
        }
        load_sum += task_load(remaining, time_to_deadline);
    }

    let at_risk: BTreeSet<TaskId> = match last_failing {
        Some(end) => queued[..=end].iter().map(|t| t.id).collect(),
        None => BTreeSet::new(),
    };
    let load_fraction = if queued.is_empty() {
        0.0
    } else {
        load_sum / queued.len() as f64
    };
    let overloaded = !at_risk.is_empty();

    ModeDecision {
        scheduler_mode: if overloaded {
            SchedulerMode::Panic
        } else {
            SchedulerMode::Normal
        },
        fetch_suppressed: overloaded || load_fraction > up_frac,
        overloaded,
        load_fraction,
        at_risk,
    }
}

fn task_load(remaining: f64, time_to_deadline: f64) -> f64 {
    if time_to_deadline > 0.0 {
        remaining / time_to_deadline
    } else if remaining > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}
