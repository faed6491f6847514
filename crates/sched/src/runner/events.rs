use chrono::{DateTime, Utc};
use crunch_core::{Project, ProjectId, RosterError, TaskId, TaskState};
use crunch_core::time::after_secs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::debt::EligibleSets;
use crate::error::SchedError;
use crate::types::{Decision, DispatchCommand, FetchOutcome};

use super::ClientScheduler;

/// Everything that can happen to the scheduler from the outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerEvent {
    /// The scheduling period elapsed. Closes the epoch unconditionally.
    EpochTick,
    AttachProject {
        id: ProjectId,
        name: String,
        resource_share: f64,
    },
    DetachProject(ProjectId),
    TaskAdded {
        project: ProjectId,
        name: String,
        report_deadline: DateTime<Utc>,
        /// Reference-host seconds.
        estimated_remaining_time: f64,
    },
    TaskCompleted(TaskId),
    /// Wall time the executor observed a running task consume.
    UsageReported { task: TaskId, wall_secs: f64 },
    Checkpointed(TaskId),
    SuspendProject(ProjectId),
    ResumeProject(ProjectId),
    SuspendTask(TaskId),
    ResumeTask(TaskId),
    SetNoNewWork { project: ProjectId, no_new_work: bool },
    FetchReply { request_id: Uuid, outcome: FetchOutcome },
}

impl SchedulerEvent {
    /// Whether handling this event is followed by a scheduling pass.
    pub fn triggers_reschedule(&self) -> bool {
        !matches!(
            self,
            SchedulerEvent::UsageReported { .. } | SchedulerEvent::Checkpointed(_)
        )
    }
}

impl ClientScheduler {
    /// Apply one event and, when it calls for one, run a scheduling pass.
    pub fn handle_event(
        &mut self,
        event: SchedulerEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<Decision>, SchedError> {
        let reschedule = event.triggers_reschedule();
        let force_close = matches!(event, SchedulerEvent::EpochTick);
        self.apply_event(event, now)?;
        Ok(reschedule.then(|| self.run_pass(now, force_close)))
    }

    fn apply_event(&mut self, event: SchedulerEvent, now: DateTime<Utc>) -> Result<(), SchedError> {
        match event {
            SchedulerEvent::EpochTick => {}
            SchedulerEvent::AttachProject {
                id,
                name,
                resource_share,
            } => {
                self.add_project(Project::new(id, name, resource_share)?)?;
            }
            SchedulerEvent::DetachProject(id) => self.detach_project(&id, now)?,
            SchedulerEvent::TaskAdded {
                project,
                name,
                report_deadline,
                estimated_remaining_time,
            } => {
                let id = self.add_task(&project, name, report_deadline, estimated_remaining_time)?;
                debug!(project = %project, task = %id, "task added");
            }
            SchedulerEvent::TaskCompleted(id) => {
                let task = self.state.remove_task(id)?;
                debug!(task = %id, wall_secs = task.wall_time_used, "task completed");
                if now > task.report_deadline {
                    warn!(task = %id, project = %task.project, "task completed after its deadline");
                }
            }
            SchedulerEvent::UsageReported { task, wall_secs } => self.record_usage(task, wall_secs)?,
            SchedulerEvent::Checkpointed(id) => {
                self.state.task_mut(id)?.checkpointed = true;
            }
            SchedulerEvent::SuspendProject(id) => self.suspend_project(&id)?,
            SchedulerEvent::ResumeProject(id) => {
                self.state.project_mut(&id)?.suspended = false;
                info!(project = %id, "project resumed");
            }
            SchedulerEvent::SuspendTask(id) => {
                self.state.task_mut(id)?.suspend();
                if let Some(slot) = self.state.vacate(id) {
                    self.pending.push(DispatchCommand::Preempt { task: id, slot });
                }
                info!(task = %id, "task suspended");
            }
            SchedulerEvent::ResumeTask(id) => {
                self.state.task_mut(id)?.resume();
                info!(task = %id, "task resumed");
            }
            SchedulerEvent::SetNoNewWork {
                project,
                no_new_work,
            } => {
                self.state.project_mut(&project)?.no_new_work = no_new_work;
            }
            SchedulerEvent::FetchReply {
                request_id,
                outcome,
            } => self.apply_fetch_reply(request_id, outcome, now)?,
        }
        Ok(())
    }

    /// Charge executor-reported wall time to a task and its project.
    pub fn record_usage(&mut self, task: TaskId, wall_secs: f64) -> Result<(), SchedError> {
        let speed = self.config.host.speed_factor;
        let t = self.state.task_mut(task)?;
        t.record_usage(wall_secs, speed);
        let project = t.project.clone();
        self.state.project_mut(&project)?.record_usage(wall_secs);
        Ok(())
    }

    fn suspend_project(&mut self, id: &ProjectId) -> Result<(), SchedError> {
        self.state.project_mut(id)?.suspended = true;
        let running: Vec<(usize, TaskId)> = self
            .state
            .slots
            .iter()
            .filter_map(|slot| slot.task.map(|t| (slot.index, t)))
            .filter(|(_, t)| self.state.tasks.get(t).is_some_and(|t| &t.project == id))
            .collect();
        for (slot, task) in running {
            self.state.vacate(task);
            if let Some(t) = self.state.tasks.get_mut(&task) {
                t.state = TaskState::Preempted;
            }
            self.pending.push(DispatchCommand::Preempt { task, slot });
        }
        info!(project = %id, "project suspended");
        Ok(())
    }

    fn detach_project(&mut self, id: &ProjectId, now: DateTime<Utc>) -> Result<(), SchedError> {
        self.state.project(id)?;
        // Settle its usage while it is still on the roster.
        if self.epoch.eligible.potentially.contains(id) {
            self.close_epoch(now, true);
        }
        let (project, vacated) = self.state.detach_project(id)?;
        self.epoch.eligible = EligibleSets::snapshot(&self.state);
        for (slot, task) in vacated {
            self.pending.push(DispatchCommand::Preempt { task, slot });
        }
        self.in_flight.retain(|_, p| p != id);
        if let Ok(mut m) = self.metrics.write() {
            m.projects.shift_remove(id);
        }
        info!(project = %id, name = %project.name, "project detached");
        Ok(())
    }

    fn apply_fetch_reply(
        &mut self,
        request_id: Uuid,
        outcome: FetchOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), SchedError> {
        let project_id = self
            .in_flight
            .remove(&request_id)
            .ok_or(SchedError::UnknownRequest(request_id))?;
        let Some(project) = self.state.projects.get_mut(&project_id) else {
            return Err(RosterError::ProjectNotFound(project_id).into());
        };
        project.fetch_in_flight = false;

        match outcome {
            FetchOutcome::Success { request_delay_secs } => {
                project.record_contact();
                if let Some(delay) = request_delay_secs.filter(|d| *d > 0.0) {
                    let ceiling = self.config.prefs.backoff_max_secs;
                    if delay > ceiling {
                        warn!(
                            project = %project_id,
                            requested_secs = delay,
                            ceiling_secs = ceiling,
                            "request delay capped"
                        );
                    }
                    project.next_contact_not_before = Some(after_secs(now, delay.min(ceiling)));
                }
                debug!(project = %project_id, "work request answered");
            }
            FetchOutcome::Unreachable => {
                let prefs = &self.config.prefs;
                let interval =
                    project.defer_after_failure(now, prefs.backoff_min_secs, prefs.backoff_max_secs);
                warn!(
                    project = %project_id,
                    failures = project.backoff.failures,
                    backoff_secs = interval,
                    "project unreachable, backing off"
                );
                if let Ok(mut m) = self.metrics.write() {
                    m.fetch_failures += 1;
                }
            }
        }
        Ok(())
    }
}
