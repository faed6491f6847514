//! Short- and long-term debt accounting.
//!
//! Debt measures how far a project's actual wall time has drifted from its
//! resource-share entitlement. Both kinds are updated from the same
//! per-period usage, over different project sets:
//!
//! - short-term debt over *runnable* projects, floored at 0 and capped at one
//!   epoch's total wall time; drives the CPU scheduler.
//! - long-term debt over *potentially runnable* projects, centred on a mean
//!   of 0; drives work fetch.

use crunch_core::{Config, Project, ProjectId};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::state::SchedulerState;

/// Raw per-project debt change for one period, before normalization.
///
/// Each entry is `(resource_share, work_done)`; the result at the same index
/// is `total * share / Σshare - work_done`.
pub fn entitlement_deltas(entries: &[(f64, f64)]) -> Vec<f64> {
    let total: f64 = entries.iter().map(|(_, work)| work).sum();
    let share_sum: f64 = entries.iter().map(|(share, _)| share).sum();
    if share_sum <= 0.0 {
        return vec![0.0; entries.len()];
    }
    entries
        .iter()
        .map(|(share, work)| total * (share / share_sum) - work)
        .collect()
}

/// Summary of one debt update, for logging and metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DebtUpdate {
    /// Wall seconds charged to runnable projects this period.
    pub total_work: f64,
    pub runnable: usize,
    pub potentially_runnable: usize,
}

/// Project sets an epoch is accounted over, captured when it opens.
///
/// An epoch can close because one of these sets changed, so the close must
/// charge usage against the sets that were in force while it ran, not the
/// ones the triggering event left behind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EligibleSets {
    /// Runnable projects: the short-term debt set.
    pub runnable: Vec<ProjectId>,
    /// Potentially runnable projects: the long-term debt set.
    pub potentially: Vec<ProjectId>,
}

impl EligibleSets {
    pub fn snapshot(state: &SchedulerState) -> Self {
        Self {
            runnable: state.runnable_project_ids(),
            potentially: state.potentially_runnable_ids(),
        }
    }
}

/// Applies the per-epoch debt update to a [`SchedulerState`].
#[derive(Debug, Clone)]
pub struct DebtAccountant {
    /// Ceiling for short-term debt: one epoch's wall time across all slots.
    max_short_term: f64,
    /// Optional half-life for short-term debt decay, in seconds.
    half_life_secs: Option<f64>,
}

impl DebtAccountant {
    pub fn new(max_short_term: f64, half_life_secs: Option<f64>) -> Self {
        Self {
            max_short_term,
            half_life_secs,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.epoch_wall_secs(),
            config
                .prefs
                .short_term_debt_half_life_hours
                .map(|h| h * 3_600.0),
        )
    }

    /// Close an epoch of `elapsed_secs` that ran with the sets in `eligible`:
    /// update both debts from `work_done_this_period`, then reset the period
    /// counters. Ids no longer on the roster are skipped.
    pub fn close_epoch(
        &self,
        state: &mut SchedulerState,
        elapsed_secs: f64,
        eligible: &EligibleSets,
    ) -> DebtUpdate {
        let runnable = &eligible.runnable;
        let potentially = &eligible.potentially;
        let total_work = runnable
            .iter()
            .filter_map(|id| state.projects.get(id))
            .map(|p| p.work_done_this_period)
            .sum();

        self.update_short_term(&mut state.projects, runnable, elapsed_secs);
        update_long_term(&mut state.projects, potentially);

        for project in state.projects.values_mut() {
            project.work_done_this_period = 0.0;
        }
        for task in state.tasks.values_mut() {
            task.expected_payoff = 0.0;
        }

        DebtUpdate {
            total_work,
            runnable: runnable.len(),
            potentially_runnable: potentially.len(),
        }
    }

    fn update_short_term(
        &self,
        projects: &mut IndexMap<ProjectId, Project>,
        runnable: &[ProjectId],
        elapsed_secs: f64,
    ) {
        apply_deltas(projects, runnable, |p| &mut p.short_term_debt);

        let floor = runnable
            .iter()
            .filter_map(|id| projects.get(id))
            .map(|p| p.short_term_debt)
            .fold(f64::INFINITY, f64::min);
        let decay = self.decay_factor(elapsed_secs);

        for project in projects.values_mut() {
            if runnable.contains(&project.id) {
                let normalized = (project.short_term_debt - floor).min(self.max_short_term);
                project.short_term_debt = normalized * decay;
            } else {
                project.short_term_debt = 0.0;
            }
            debug!(
                project = %project.id,
                debt = project.short_term_debt,
                "short-term debt updated"
            );
        }
    }

    fn decay_factor(&self, elapsed_secs: f64) -> f64 {
        match self.half_life_secs {
            Some(half_life) if elapsed_secs > 0.0 => 0.5f64.powf(elapsed_secs / half_life),
            _ => 1.0,
        }
    }
}

fn update_long_term(projects: &mut IndexMap<ProjectId, Project>, potentially: &[ProjectId]) {
    if potentially.is_empty() {
        return;
    }
    apply_deltas(projects, potentially, |p| &mut p.long_term_debt);

    let mean = potentially
        .iter()
        .filter_map(|id| projects.get(id))
        .map(|p| p.long_term_debt)
        .sum::<f64>()
        / potentially.len() as f64;
    for id in potentially {
        if let Some(project) = projects.get_mut(id) {
            project.long_term_debt -= mean;
        }
    }
}

/// Add each project's entitlement delta into the debt field chosen by `field`.
fn apply_deltas(
    projects: &mut IndexMap<ProjectId, Project>,
    ids: &[ProjectId],
    field: impl Fn(&mut Project) -> &mut f64,
) {
    let entries: Vec<(f64, f64)> = ids
        .iter()
        .filter_map(|id| projects.get(id))
        .map(|p| (p.resource_share, p.work_done_this_period))
        .collect();
    let members: Vec<ProjectId> = ids
        .iter()
        .filter(|id| projects.contains_key(*id))
        .cloned()
        .collect();
    for (id, delta) in members.iter().zip(entitlement_deltas(&entries)) {
        if let Some(project) = projects.get_mut(id) {
            *field(project) += delta;
        }
    }
}
