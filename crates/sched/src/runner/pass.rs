use chrono::{DateTime, Utc};
use crunch_core::time::secs_between;
use tracing::{debug, info};

use crate::cpu;
use crate::debt::EligibleSets;
use crate::fetch::FetchPlan;
use crate::metrics::ProjectStatus;
use crate::mode::{select_mode, ModeDecision};
use crate::types::{Decision, DispatchCommand};

use super::core::Epoch;
use super::ClientScheduler;

impl ClientScheduler {
    /// Run a scheduling pass at `now`.
    ///
    /// The epoch is closed first if the period has elapsed or the set of
    /// runnable projects has changed since it opened.
    pub fn reschedule(&mut self, now: DateTime<Utc>) -> Decision {
        self.run_pass(now, false)
    }

    pub(super) fn run_pass(&mut self, now: DateTime<Utc>, force_close: bool) -> Decision {
        let epoch_closed = self.maybe_close_epoch(now, force_close);

        let prefs = &self.config.prefs;
        let mode = select_mode(
            self.state.runnable_tasks(),
            now,
            prefs.up_frac,
            self.config.host.speed_factor,
        );
        if mode.scheduler_mode != self.last_mode.scheduler_mode {
            info!(
                from = ?self.last_mode.scheduler_mode,
                to = ?mode.scheduler_mode,
                at_risk = mode.at_risk.len(),
                "scheduler mode changed"
            );
        }

        let mut commands: Vec<DispatchCommand> = self.pending.drain(..).collect();
        let payoff = self.config.prefs.period_secs();
        commands.extend(cpu::schedule(&mut self.state, &mode, payoff));

        let plan = self.fetch_policy.evaluate(&self.state, &mode, now);
        if let Some(request) = &plan.request {
            if let Some(project) = self.state.projects.get_mut(&request.project) {
                project.fetch_in_flight = true;
            }
            self.in_flight.insert(request.request_id, request.project.clone());
            info!(
                project = %request.project,
                urgency = ?request.urgency,
                target_secs = request.target_amount,
                "requesting work"
            );
        }

        self.update_metrics(now, &mode, &commands, &plan);
        debug!(
            commands = commands.len(),
            idle_slots = self.state.idle_slots(),
            "scheduling pass done"
        );

        self.last_mode = mode.clone();
        Decision {
            mode,
            commands,
            overall_urgency: plan.overall,
            fetch: plan.request,
            epoch_closed,
        }
    }

    fn maybe_close_epoch(&mut self, now: DateTime<Utc>, force: bool) -> bool {
        let elapsed = secs_between(self.epoch.started_at, now).max(0.0);
        let period_over = elapsed >= self.config.prefs.period_secs();
        let set_changed = self.state.runnable_project_ids() != self.epoch.eligible.runnable;
        if !(force || period_over || set_changed) {
            return false;
        }
        self.close_epoch(now, !(force || period_over));
        true
    }

    /// Charge the running epoch over the sets it opened with and open the
    /// next one on the current roster.
    pub(super) fn close_epoch(&mut self, now: DateTime<Utc>, early: bool) {
        let elapsed = secs_between(self.epoch.started_at, now).max(0.0);
        let update = self
            .accountant
            .close_epoch(&mut self.state, elapsed, &self.epoch.eligible);
        info!(
            elapsed_secs = elapsed,
            total_work = update.total_work,
            runnable = update.runnable,
            potentially_runnable = update.potentially_runnable,
            early,
            "epoch closed"
        );
        self.epoch = Epoch {
            started_at: now,
            eligible: EligibleSets::snapshot(&self.state),
        };
        if let Ok(mut m) = self.metrics.write() {
            m.epochs_closed += 1;
        }
    }

    fn update_metrics(
        &self,
        now: DateTime<Utc>,
        mode: &ModeDecision,
        commands: &[DispatchCommand],
        plan: &FetchPlan,
    ) {
        let Ok(mut m) = self.metrics.write() else {
            return;
        };
        m.passes += 1;
        if mode.is_panic() {
            m.panic_passes += 1;
        }
        m.record_commands(commands);
        if plan.request.is_some() {
            m.fetch_requests += 1;
        }
        m.idle_slots = self.state.idle_slots();
        m.busy_slots = self.state.busy_slots();
        m.current_mode = mode.scheduler_mode;
        m.fetch_suppressed = mode.fetch_suppressed;
        m.overall_urgency = plan.overall;
        m.last_pass = Some(now);

        for entry in &plan.per_project {
            let Some(project) = self.state.projects.get(&entry.project) else {
                continue;
            };
            m.projects.insert(
                entry.project.clone(),
                ProjectStatus {
                    resource_share: project.resource_share,
                    urgency: entry.urgency,
                    short_term_debt: project.short_term_debt,
                    long_term_debt: project.long_term_debt,
                    total_wall_time: project.total_wall_time,
                    runnable_tasks: self.state.runnable_task_count(&project.id),
                    deferred_until: project.next_contact_not_before.filter(|t| *t > now),
                    backoff_failures: project.backoff.failures,
                },
            );
        }
    }
}
