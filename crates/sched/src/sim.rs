//! Discrete-time host simulation.
//!
//! [`HostSimulator`] drives a [`ClientScheduler`] on a simulated clock
//! against an in-process model of each project's server: a work request is
//! answered on the spot with tasks of a fixed size and deadline window, or
//! fails if the project is marked unreachable. Running tasks consume wall
//! time, checkpoint periodically, and complete when their work runs out.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use crunch_core::time::{after_secs, duration_from_secs};
use crunch_core::{Config, Project, ProjectId, TaskId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SchedError;
use crate::metrics::SchedulerMetrics;
use crate::runner::{ClientScheduler, SchedulerEvent};
use crate::types::{Decision, FetchOutcome, WorkRequest};

/// Upper bound on back-to-back work requests served within one step.
const MAX_FETCHES_PER_STEP: usize = 32;

/// Ten years.
const MAX_DEADLINE_HOURS: f64 = 87_600.0;

/// A simulated host and the projects it is attached to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: Config,
    pub projects: Vec<ProjectSpec>,
}

/// One project and the behavior of its simulated server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    pub resource_share: f64,
    /// Size of each task, in reference-host seconds.
    #[serde(default = "default_task_secs")]
    pub task_secs: f64,
    /// Report deadline of each task, relative to when it was handed out.
    #[serde(default = "default_deadline_hours")]
    pub deadline_hours: f64,
    /// Most tasks handed out per work request.
    #[serde(default = "default_max_tasks_per_fetch")]
    pub max_tasks_per_fetch: usize,
    /// Tasks queued before the simulation starts.
    #[serde(default)]
    pub initial_tasks: usize,
    /// Wall seconds between checkpoints of a running task.
    #[serde(default = "default_checkpoint_secs")]
    pub checkpoint_secs: f64,
    /// Every work request fails.
    #[serde(default)]
    pub unreachable: bool,
    /// Minimum delay the server asks for between requests.
    #[serde(default)]
    pub request_delay_secs: Option<f64>,
}

fn default_task_secs() -> f64 { 3_600.0 }
fn default_deadline_hours() -> f64 { 168.0 }
fn default_max_tasks_per_fetch() -> usize { 8 }
fn default_checkpoint_secs() -> f64 { 600.0 }

impl ProjectSpec {
    /// Reject server models the simulator cannot run.
    pub fn validate(&self) -> Result<(), SchedError> {
        let invalid = |reason: String| SchedError::InvalidScenario {
            project: self.url.clone(),
            reason,
        };
        if !(self.task_secs > 0.0 && self.task_secs.is_finite()) {
            return Err(invalid(format!("task_secs must be finite and > 0, got {}", self.task_secs)));
        }
        if !(self.deadline_hours > 0.0 && self.deadline_hours <= MAX_DEADLINE_HOURS) {
            return Err(invalid(format!(
                "deadline_hours must be in (0, {}], got {}",
                MAX_DEADLINE_HOURS, self.deadline_hours
            )));
        }
        if !(self.checkpoint_secs > 0.0 && self.checkpoint_secs.is_finite()) {
            return Err(invalid(format!(
                "checkpoint_secs must be finite and > 0, got {}",
                self.checkpoint_secs
            )));
        }
        if let Some(delay) = self.request_delay_secs {
            if !(delay >= 0.0 && delay.is_finite()) {
                return Err(invalid(format!("request_delay_secs must be finite and >= 0, got {}", delay)));
            }
        }
        Ok(())
    }

    pub fn new(url: impl Into<String>, resource_share: f64) -> Self {
        Self {
            url: url.into(),
            name: None,
            resource_share,
            task_secs: default_task_secs(),
            deadline_hours: default_deadline_hours(),
            max_tasks_per_fetch: default_max_tasks_per_fetch(),
            initial_tasks: 0,
            checkpoint_secs: default_checkpoint_secs(),
            unreachable: false,
            request_delay_secs: None,
        }
    }
}

impl Scenario {
    pub fn from_toml(toml_str: &str) -> Result<Self, SchedError> {
        let scenario: Self = toml::from_str(toml_str)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), SchedError> {
        self.config.validate()?;
        self.projects.iter().try_for_each(ProjectSpec::validate)
    }
}

/// Per-project outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectCounters {
    pub completed: u64,
    pub deadline_misses: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectReport {
    pub project: ProjectId,
    /// Configured fraction of the total resource share.
    pub share_fraction: f64,
    /// Fraction of all wall time this project actually received.
    pub wall_fraction: f64,
    pub total_wall_time: f64,
    #[serde(flatten)]
    pub counters: ProjectCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub elapsed_hours: f64,
    pub projects: Vec<ProjectReport>,
    pub metrics: SchedulerMetrics,
}

impl SimReport {
    pub fn project(&self, id: &str) -> Option<&ProjectReport> {
        self.projects.iter().find(|p| p.project.as_str() == id)
    }

    /// Largest gap between a project's wall-time fraction and its share.
    pub fn max_share_error(&self) -> f64 {
        self.projects
            .iter()
            .map(|p| (p.wall_fraction - p.share_fraction).abs())
            .fold(0.0, f64::max)
    }
}

pub struct HostSimulator {
    scheduler: ClientScheduler,
    specs: IndexMap<ProjectId, ProjectSpec>,
    counters: IndexMap<ProjectId, ProjectCounters>,
    started: DateTime<Utc>,
    now: DateTime<Utc>,
    next_tick: DateTime<Utc>,
    /// Wall seconds each running task has run since its last checkpoint.
    since_checkpoint: HashMap<TaskId, f64>,
    issued: u64,
}

impl HostSimulator {
    /// Build the simulated host and run the first scheduling pass.
    pub fn new(scenario: Scenario) -> Result<Self, SchedError> {
        scenario.validate()?;
        let started = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let period = duration_from_secs(scenario.config.prefs.period_secs());
        let mut scheduler = ClientScheduler::new(scenario.config, started)?;

        let mut specs = IndexMap::new();
        let mut counters = IndexMap::new();
        for spec in scenario.projects {
            let id = ProjectId::new(spec.url.clone());
            let name = spec.name.clone().unwrap_or_else(|| spec.url.clone());
            scheduler.add_project(Project::new(id.clone(), name, spec.resource_share)?)?;
            counters.insert(id.clone(), ProjectCounters::default());
            specs.insert(id, spec);
        }

        let mut sim = Self {
            scheduler,
            specs,
            counters,
            started,
            now: started,
            next_tick: started + period,
            since_checkpoint: HashMap::new(),
            issued: 0,
        };

        let initial: Vec<(ProjectId, usize)> = sim
            .specs
            .iter()
            .map(|(id, spec)| (id.clone(), spec.initial_tasks))
            .collect();
        for (id, count) in initial {
            sim.hand_out(&id, count)?;
        }

        let decision = sim.scheduler.reschedule(sim.now);
        sim.follow_up(decision)?;
        Ok(sim)
    }

    pub fn scheduler(&self) -> &ClientScheduler {
        &self.scheduler
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Advance the clock by `step_secs` of wall time.
    pub fn step(&mut self, step_secs: f64) -> Result<(), SchedError> {
        let running: Vec<TaskId> = self
            .scheduler
            .state()
            .slots
            .iter()
            .filter_map(|s| s.task)
            .collect();

        let mut completed = Vec::new();
        for task in running {
            self.scheduler.handle_event(
                SchedulerEvent::UsageReported { task, wall_secs: step_secs },
                self.now,
            )?;

            let project = &self.scheduler.state().task(task)?.project;
            let interval = self
                .specs
                .get(project)
                .map_or(default_checkpoint_secs(), |s| s.checkpoint_secs);
            let elapsed = self.since_checkpoint.entry(task).or_insert(0.0);
            *elapsed += step_secs;
            if *elapsed >= interval {
                *elapsed = 0.0;
                self.scheduler
                    .handle_event(SchedulerEvent::Checkpointed(task), self.now)?;
            }

            if self.scheduler.state().task(task)?.estimated_remaining_time <= 0.0 {
                completed.push(task);
            }
        }

        self.now = after_secs(self.now, step_secs);

        for task in completed {
            let (project, deadline) = {
                let t = self.scheduler.state().task(task)?;
                (t.project.clone(), t.report_deadline)
            };
            self.since_checkpoint.remove(&task);
            if let Some(c) = self.counters.get_mut(&project) {
                c.completed += 1;
                if self.now > deadline {
                    c.deadline_misses += 1;
                }
            }
            if let Some(decision) = self
                .scheduler
                .handle_event(SchedulerEvent::TaskCompleted(task), self.now)?
            {
                self.follow_up(decision)?;
            }
        }

        while self.now >= self.next_tick {
            let period = duration_from_secs(self.scheduler.config().prefs.period_secs());
            self.next_tick += period;
            if let Some(decision) = self
                .scheduler
                .handle_event(SchedulerEvent::EpochTick, self.now)?
            {
                self.follow_up(decision)?;
            }
        }
        Ok(())
    }

    /// Run for `secs` of simulated time in steps of `step_secs`.
    pub fn run_for(&mut self, secs: f64, step_secs: f64) -> Result<(), SchedError> {
        let end = after_secs(self.now, secs);
        let step = step_secs.max(1.0);
        while self.now < end {
            self.step(step)?;
        }
        info!(
            hours = self.elapsed_hours(),
            epochs = self.scheduler.metrics().epochs_closed,
            "simulation finished"
        );
        Ok(())
    }

    pub fn elapsed_hours(&self) -> f64 {
        (self.now - self.started).num_seconds() as f64 / 3_600.0
    }

    pub fn counters(&self, id: &ProjectId) -> Option<&ProjectCounters> {
        self.counters.get(id)
    }

    pub fn report(&self) -> SimReport {
        let state = self.scheduler.state();
        let share_total: f64 = state.projects.values().map(|p| p.resource_share).sum();
        let wall_total: f64 = state.projects.values().map(|p| p.total_wall_time).sum();

        let projects = state
            .projects
            .values()
            .map(|p| ProjectReport {
                project: p.id.clone(),
                share_fraction: if share_total > 0.0 { p.resource_share / share_total } else { 0.0 },
                wall_fraction: if wall_total > 0.0 { p.total_wall_time / wall_total } else { 0.0 },
                total_wall_time: p.total_wall_time,
                counters: self.counters.get(&p.id).cloned().unwrap_or_default(),
            })
            .collect();

        SimReport {
            elapsed_hours: self.elapsed_hours(),
            projects,
            metrics: self.scheduler.metrics(),
        }
    }

    /// Serve any work request a pass produced, and the ones that follow.
    fn follow_up(&mut self, decision: Decision) -> Result<(), SchedError> {
        let mut next = decision.fetch;
        let mut served = 0;
        while let Some(request) = next.take() {
            if served == MAX_FETCHES_PER_STEP {
                debug!(project = %request.project, "fetch budget for this step used up");
                break;
            }
            served += 1;
            next = self.serve(request)?;
        }
        Ok(())
    }

    /// Answer a work request from the project's simulated server.
    fn serve(&mut self, request: WorkRequest) -> Result<Option<WorkRequest>, SchedError> {
        let Some(spec) = self.specs.get(&request.project).cloned() else {
            return Ok(None);
        };
        if let Some(c) = self.counters.get_mut(&request.project) {
            c.fetches += 1;
        }

        let outcome = if spec.unreachable {
            if let Some(c) = self.counters.get_mut(&request.project) {
                c.fetch_failures += 1;
            }
            FetchOutcome::Unreachable
        } else {
            let speed = self.scheduler.config().host.speed_factor;
            let task_wall = (spec.task_secs / speed).max(1.0);
            let wanted = (request.target_amount / task_wall).ceil() as usize;
            let count = wanted.clamp(1, spec.max_tasks_per_fetch.max(1));
            self.hand_out(&request.project, count)?;
            FetchOutcome::Success {
                request_delay_secs: spec.request_delay_secs,
            }
        };

        let decision = self.scheduler.handle_event(
            SchedulerEvent::FetchReply {
                request_id: request.request_id,
                outcome,
            },
            self.now,
        )?;
        Ok(decision.and_then(|d| d.fetch))
    }

    fn hand_out(&mut self, project: &ProjectId, count: usize) -> Result<(), SchedError> {
        let Some(spec) = self.specs.get(project) else {
            return Ok(());
        };
        let deadline = after_secs(self.now, spec.deadline_hours * 3_600.0);
        let task_secs = spec.task_secs;
        for _ in 0..count {
            self.issued += 1;
            let name = format!("wu_{}", self.issued);
            self.scheduler.add_task(project, name, deadline, task_secs)?;
        }
        Ok(())
    }
}
