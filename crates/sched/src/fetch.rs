//! Work-fetch policy: how urgently each project needs more work, and which
//! single project to ask this pass.

use chrono::{DateTime, Utc};
use crunch_core::{Config, ProjectId, Task, TaskState};
use serde::Serialize;
use uuid::Uuid;

use crate::mode::ModeDecision;
use crate::state::SchedulerState;
use crate::types::{Urgency, WorkRequest};

/// Urgency assessment for one project.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectUrgency {
    pub project: ProjectId,
    pub urgency: Urgency,
    /// Fractional resource share over potentially runnable projects.
    pub frs: f64,
    /// Wall seconds of runnable work queued on this host.
    pub queued_wall: f64,
    /// Seconds until the project can no longer keep its share of slots busy.
    pub shortfall_secs: Option<f64>,
}

/// Outcome of one work-fetch evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchPlan {
    pub per_project: Vec<ProjectUrgency>,
    pub overall: Urgency,
    pub request: Option<WorkRequest>,
}

#[derive(Debug, Clone)]
pub struct WorkFetchPolicy {
    slots: usize,
    min_queue_secs: f64,
    speed_factor: f64,
}

impl WorkFetchPolicy {
    pub fn new(slots: usize, min_queue_secs: f64, speed_factor: f64) -> Self {
        Self {
            slots,
            min_queue_secs,
            speed_factor,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.effective_cpus(),
            config.prefs.min_queue_secs(),
            config.host.speed_factor,
        )
    }

    /// Assess every project and, unless fetch is suppressed, pick at most
    /// one request. The caller marks the chosen project in flight.
    pub fn evaluate(
        &self,
        state: &SchedulerState,
        mode: &ModeDecision,
        now: DateTime<Utc>,
    ) -> FetchPlan {
        let share_sum: f64 = state
            .projects
            .values()
            .filter(|p| state.is_potentially_runnable(p))
            .map(|p| p.resource_share)
            .sum();

        let per_project: Vec<ProjectUrgency> = state
            .projects
            .values()
            .map(|project| {
                let mut tasks: Vec<&Task> = state
                    .runnable_tasks()
                    .filter(|t| t.project == project.id)
                    .collect();
                tasks.sort_by(|a, b| {
                    let a_running = a.state == TaskState::Running;
                    let b_running = b.state == TaskState::Running;
                    b_running
                        .cmp(&a_running)
                        .then(a.report_deadline.cmp(&b.report_deadline))
                        .then(a.id.cmp(&b.id))
                });
                let remaining: Vec<f64> = tasks
                    .iter()
                    .map(|t| t.remaining_wall(self.speed_factor))
                    .collect();
                let queued_wall = remaining.iter().sum();

                let frs = if share_sum > 0.0 && state.is_potentially_runnable(project) {
                    project.resource_share / share_sum
                } else {
                    0.0
                };

                let (urgency, shortfall_secs) = if project.suspended
                    || project.no_new_work
                    || project.is_deferred(now)
                {
                    (Urgency::DontNeed, None)
                } else if remaining.is_empty() {
                    (Urgency::NeedImmediately, Some(0.0))
                } else {
                    let shortfall =
                        time_until_shortfall(&remaining, self.slots as f64 * frs);
                    let urgency = if shortfall < self.min_queue_secs * frs {
                        Urgency::Need
                    } else {
                        Urgency::Ok
                    };
                    (urgency, Some(shortfall))
                };

                ProjectUrgency {
                    project: project.id.clone(),
                    urgency,
                    frs,
                    queued_wall,
                    shortfall_secs,
                }
            })
            .collect();

        let mut overall = per_project
            .iter()
            .map(|p| p.urgency)
            .max()
            .unwrap_or(Urgency::DontNeed);
        if state.idle_slots() > 0 {
            overall = Urgency::NeedImmediately;
        }

        let request = if overall >= Urgency::Need && !mode.fetch_suppressed {
            self.choose(state, &per_project)
        } else {
            None
        };

        FetchPlan {
            per_project,
            overall,
            request,
        }
    }

    /// Most urgent eligible project; ties go to higher long-term debt, then
    /// registration order.
    fn choose(&self, state: &SchedulerState, per_project: &[ProjectUrgency]) -> Option<WorkRequest> {
        let mut best: Option<(&ProjectUrgency, f64)> = None;
        for entry in per_project {
            if entry.urgency == Urgency::DontNeed {
                continue;
            }
            let Some(project) = state.projects.get(&entry.project) else {
                continue;
            };
            if project.fetch_in_flight {
                continue;
            }
            let debt = project.long_term_debt;
            let better = match best {
                None => true,
                Some((current, current_debt)) => {
                    entry.urgency > current.urgency
                        || (entry.urgency == current.urgency && debt > current_debt)
                }
            };
            if better {
                best = Some((entry, debt));
            }
        }

        best.map(|(entry, _)| WorkRequest {
            request_id: Uuid::new_v4(),
            project: entry.project.clone(),
            urgency: entry.urgency,
            target_amount: self.target_amount(entry),
        })
    }

    /// Wall seconds needed to refill the project's share of the buffer.
    pub fn target_amount(&self, entry: &ProjectUrgency) -> f64 {
        (self.min_queue_secs * self.slots as f64 * entry.frs - entry.queued_wall).max(1.0)
    }
}

/// Seconds until fewer than `share_cpus` of the given tasks remain.
///
/// Tasks drain in order on `ceil(share_cpus)` lanes whose combined speed is
/// `share_cpus` processors. Returns 0 when the queue is already short.
pub fn time_until_shortfall(remaining: &[f64], share_cpus: f64) -> f64 {
    if share_cpus <= 0.0 || (remaining.len() as f64) < share_cpus {
        return 0.0;
    }
    let lanes = (share_cpus.ceil() as usize).max(1);
    let rate = share_cpus / lanes as f64;

    let mut lane_free = vec![0.0_f64; lanes];
    let mut finishes = Vec::with_capacity(remaining.len());
    for &secs in remaining {
        let Some((lane, free_at)) = lane_free
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
        else {
            break;
        };
        let done = free_at + secs / rate;
        lane_free[lane] = done;
        finishes.push(done);
    }
    finishes.sort_by(f64::total_cmp);

    let n = finishes.len();
    for (k, finish) in finishes.iter().enumerate() {
        let left = n - (k + 1);
        if (left as f64) < share_cpus {
            return *finish;
        }
    }
    finishes.last().copied().unwrap_or(0.0)
}
