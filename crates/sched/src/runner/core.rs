use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use crunch_core::{Config, Project, ProjectId, TaskId};
use tracing::info;
use uuid::Uuid;

use crate::debt::{DebtAccountant, EligibleSets};
use crate::error::SchedError;
use crate::fetch::WorkFetchPolicy;
use crate::metrics::SchedulerMetrics;
use crate::mode::ModeDecision;
use crate::state::SchedulerState;
use crate::types::DispatchCommand;

/// The debt snapshot currently being accumulated.
#[derive(Debug, Clone)]
pub(super) struct Epoch {
    pub(super) started_at: DateTime<Utc>,
    /// Debt sets when the epoch opened. A change in the runnable set closes
    /// it early; the close is still charged over these sets.
    pub(super) eligible: EligibleSets,
}

/// The client-side scheduler. Single owner of [`SchedulerState`]; every
/// mutation goes through an event or a registration call, and every
/// reschedule runs a full pass.
pub struct ClientScheduler {
    pub(super) config: Config,
    pub(super) state: SchedulerState,
    pub(super) accountant: DebtAccountant,
    pub(super) fetch_policy: WorkFetchPolicy,
    pub(super) epoch: Epoch,
    /// Mode chosen by the most recent pass.
    pub(super) last_mode: ModeDecision,
    /// Commands produced by event handling, flushed by the next pass.
    pub(super) pending: Vec<DispatchCommand>,
    /// Outstanding work requests by id.
    pub(super) in_flight: HashMap<Uuid, ProjectId>,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
}

impl ClientScheduler {
    /// Create a scheduler for a validated config. `now` opens the first epoch.
    pub fn new(config: Config, now: DateTime<Utc>) -> Result<Self, SchedError> {
        config.validate()?;
        let slots = config.effective_cpus();
        info!(
            slots,
            period_minutes = config.prefs.cpu_scheduling_period_minutes,
            "client scheduler created"
        );
        Ok(Self {
            accountant: DebtAccountant::from_config(&config),
            fetch_policy: WorkFetchPolicy::from_config(&config),
            state: SchedulerState::new(slots),
            config,
            epoch: Epoch {
                started_at: now,
                eligible: EligibleSets::default(),
            },
            last_mode: ModeDecision::default(),
            pending: Vec::new(),
            in_flight: HashMap::new(),
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
        })
    }

    /// Attach a project. Takes effect at the next pass.
    pub fn add_project(&mut self, project: Project) -> Result<(), SchedError> {
        info!(
            project = %project.id,
            share = project.resource_share,
            "project attached"
        );
        self.state.add_project(project)?;
        Ok(())
    }

    /// Queue a new task for `project`. Takes effect at the next pass.
    pub fn add_task(
        &mut self,
        project: &ProjectId,
        name: impl Into<String>,
        report_deadline: DateTime<Utc>,
        estimated_remaining_time: f64,
    ) -> Result<TaskId, SchedError> {
        let id = self
            .state
            .add_task(project, name, report_deadline, estimated_remaining_time)?;
        Ok(id)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Mode chosen by the most recent pass.
    pub fn mode(&self) -> &ModeDecision {
        &self.last_mode
    }

    pub fn slot_count(&self) -> usize {
        self.state.slots.len()
    }

    /// Number of work requests awaiting a reply.
    pub fn requests_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        match self.metrics.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Get an Arc to the metrics (for external reads without cloning).
    pub fn metrics_handle(&self) -> Arc<RwLock<SchedulerMetrics>> {
        Arc::clone(&self.metrics)
    }
}
