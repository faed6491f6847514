//! Slot assignment: which runnable task runs on which processor slot.
//!
//! Selection and placement are separate steps. Selection picks up to
//! `slots` tasks (debt-weighted round robin in normal mode, earliest deadline
//! first in panic mode). Placement then maps the chosen set onto slots
//! without double-booking, and without throwing away unsaved progress for
//! anything that is not deadline-critical.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};

use crunch_core::{TaskId, TaskState};
use tracing::debug;

use crate::mode::ModeDecision;
use crate::state::SchedulerState;
use crate::types::{DispatchCommand, SchedulerMode};

/// Run one scheduling pass over `state` and return the commands that take
/// the slot table from its old assignment to the new one.
///
/// `payoff` is the wall time each chosen task is expected to consume before
/// the next accounting point; it is subtracted from a project's anticipated
/// debt every time one of its tasks is chosen.
pub fn schedule(
    state: &mut SchedulerState,
    mode: &ModeDecision,
    payoff: f64,
) -> Vec<DispatchCommand> {
    let mut preempts = release_ineligible(state);

    let selected = match mode.scheduler_mode {
        SchedulerMode::Normal => select_normal(state, payoff),
        SchedulerMode::Panic => select_panic(state),
    };

    let (more_preempts, launches) = place(state, &selected, mode);
    preempts.extend(more_preempts);

    for slot in &state.slots {
        if let Some(task) = slot.task.and_then(|id| state.tasks.get_mut(&id)) {
            task.expected_payoff = payoff;
        }
    }

    preempts.extend(launches);
    preempts
}

/// Empty any slot whose occupant can no longer run (suspended, finished, or
/// its project suspended). Missing tasks are dropped without a command.
fn release_ineligible(state: &mut SchedulerState) -> Vec<DispatchCommand> {
    let mut commands = Vec::new();
    for index in 0..state.slots.len() {
        let Some(task_id) = state.slots[index].task else {
            continue;
        };
        let Some(task) = state.tasks.get(&task_id) else {
            state.slots[index].task = None;
            continue;
        };
        let project_suspended = state
            .projects
            .get(&task.project)
            .map_or(true, |p| p.suspended);
        if task.is_runnable() && !project_suspended {
            continue;
        }
        state.slots[index].task = None;
        if task.state != TaskState::Done {
            commands.push(DispatchCommand::Preempt { task: task_id, slot: index });
        }
        if let Some(task) = state.tasks.get_mut(&task_id) {
            if task.state == TaskState::Running {
                task.state = TaskState::Preempted;
            }
        }
    }
    commands
}

/// Heap entry for the anticipated-debt argmax.
#[derive(Debug)]
struct Candidate {
    debt: f64,
    /// Earliest-created runnable task the project still has queued.
    earliest: TaskId,
    project: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.debt
            .total_cmp(&other.debt)
            .then_with(|| other.earliest.cmp(&self.earliest))
            .then_with(|| other.project.cmp(&self.project))
    }
}

fn state_rank(state: TaskState) -> u8 {
    match state {
        TaskState::Running => 0,
        TaskState::Preempted => 1,
        _ => 2,
    }
}

fn select_normal(state: &SchedulerState, payoff: f64) -> Vec<TaskId> {
    let slots = state.slots.len();
    let mut queues: Vec<VecDeque<TaskId>> = Vec::new();
    let mut heap = BinaryHeap::new();

    for project in state.projects.values() {
        if project.suspended {
            continue;
        }
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.project == project.id && t.is_runnable())
            .collect();
        if tasks.is_empty() {
            continue;
        }
        tasks.sort_by_key(|t| (state_rank(t.state), t.id));
        let queue: VecDeque<TaskId> = tasks.iter().map(|t| t.id).collect();
        let earliest = queue.iter().copied().min().unwrap_or(TaskId(u64::MAX));
        heap.push(Candidate {
            debt: project.short_term_debt,
            earliest,
            project: queues.len(),
        });
        queues.push(queue);
    }

    let mut selected = Vec::with_capacity(slots);
    while selected.len() < slots {
        let Some(mut top) = heap.pop() else {
            break;
        };
        let queue = &mut queues[top.project];
        let Some(task) = queue.pop_front() else {
            continue;
        };
        selected.push(task);
        if let Some(earliest) = queue.iter().copied().min() {
            top.debt -= payoff;
            top.earliest = earliest;
            heap.push(top);
        }
    }
    selected
}

fn select_panic(state: &SchedulerState) -> Vec<TaskId> {
    let mut tasks: Vec<_> = state.runnable_tasks().collect();
    tasks.sort_by(|a, b| {
        a.report_deadline
            .cmp(&b.report_deadline)
            .then(a.id.cmp(&b.id))
    });
    tasks
        .into_iter()
        .take(state.slots.len())
        .map(|t| t.id)
        .collect()
}

/// Map the selected set onto slots. Returns `(preempts, launches)`.
fn place(
    state: &mut SchedulerState,
    selected: &[TaskId],
    mode: &ModeDecision,
) -> (Vec<DispatchCommand>, Vec<DispatchCommand>) {
    let chosen: HashSet<TaskId> = selected.iter().copied().collect();

    let mut empty = Vec::new();
    let mut checkpointed = Vec::new();
    let mut unsaved = Vec::new();
    for slot in &state.slots {
        match slot.task {
            None => empty.push(slot.index),
            Some(id) if chosen.contains(&id) => {}
            Some(id) => {
                let task = state.tasks.get(&id);
                if task.is_some_and(|t| t.checkpointed) {
                    checkpointed.push(slot.index);
                } else {
                    let used = task.map_or(0.0, |t| t.wall_time_used);
                    unsaved.push((slot.index, used));
                }
            }
        }
    }
    // Least progress first: the cheapest work to lose.
    unsaved.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let mut empty = empty.into_iter();
    let mut checkpointed = checkpointed.into_iter();
    let mut unsaved = unsaved.into_iter().map(|(index, _)| index);

    let mut preempts = Vec::new();
    let mut launches = Vec::new();

    for &task_id in selected {
        if state.slot_of(task_id).is_some() {
            continue;
        }
        let critical = mode.is_deadline_critical(task_id);
        let slot = empty
            .next()
            .or_else(|| checkpointed.next())
            .or_else(|| if critical { unsaved.next() } else { None });
        let Some(slot) = slot else {
            debug!(task = %task_id, "no slot without losing unsaved work; skipped");
            continue;
        };

        if let Some(displaced) = state.slots[slot].task {
            state.vacate(displaced);
            if let Some(t) = state.tasks.get_mut(&displaced) {
                t.state = TaskState::Preempted;
            }
            debug!(task = %displaced, slot, "preempting");
            preempts.push(DispatchCommand::Preempt { task: displaced, slot });
        }

        let was_unstarted = state
            .tasks
            .get(&task_id)
            .is_some_and(|t| t.state == TaskState::Unstarted);
        state.occupy(slot, task_id);
        debug!(task = %task_id, slot, "placing");
        launches.push(if was_unstarted {
            DispatchCommand::Start { task: task_id, slot }
        } else {
            DispatchCommand::Resume { task: task_id, slot }
        });
    }

    (preempts, launches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use crunch_core::{Project, ProjectId};
    use std::collections::BTreeSet;

    const PAYOFF: f64 = 3_600.0;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn state(slots: usize, projects: &[(&str, f64)]) -> SchedulerState {
        let mut state = SchedulerState::new(slots);
        for (id, debt) in projects {
            let mut p = Project::new(*id, *id, 100.0).unwrap();
            p.short_term_debt = *debt;
            state.add_project(p).unwrap();
        }
        state
    }

    fn add(state: &mut SchedulerState, project: &str, deadline_hours: i64) -> TaskId {
        state
            .add_task(
                &ProjectId::from(project),
                "wu",
                now() + Duration::hours(deadline_hours),
                36_000.0,
            )
            .unwrap()
    }

    fn assert_no_double_assignment(state: &SchedulerState) {
        let mut seen = HashSet::new();
        for slot in &state.slots {
            if let Some(t) = slot.task {
                assert!(seen.insert(t), "task {t} in two slots");
            }
        }
        let running = state
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .count();
        assert_eq!(running, state.busy_slots());
    }

    #[test]
    fn highest_debt_project_runs_first() {
        let mut s = state(1, &[("A", 100.0), ("B", 900.0)]);
        add(&mut s, "A", 48);
        let b = add(&mut s, "B", 48);
        let cmds = schedule(&mut s, &ModeDecision::default(), PAYOFF);
        assert_eq!(cmds, vec![DispatchCommand::Start { task: b, slot: 0 }]);
        assert_eq!(s.tasks[&b].expected_payoff, PAYOFF);
    }

    #[test]
    fn anticipated_debt_spreads_slots_across_projects() {
        // A drops 5000 -> 1400 after its first pick, still above B's 1000.
        let mut s = state(3, &[("A", 5_000.0), ("B", 1_000.0)]);
        let a1 = add(&mut s, "A", 48);
        let a2 = add(&mut s, "A", 48);
        let a3 = add(&mut s, "A", 48);
        let b1 = add(&mut s, "B", 48);
        schedule(&mut s, &ModeDecision::default(), PAYOFF);

        let running: BTreeSet<TaskId> = s.slots.iter().filter_map(|sl| sl.task).collect();
        assert_eq!(running, BTreeSet::from([a1, a2, b1]));
        assert_eq!(s.tasks[&a3].state, TaskState::Unstarted);
        assert_no_double_assignment(&s);
    }

    #[test]
    fn equal_debt_ties_go_to_earliest_task() {
        let mut s = state(1, &[("A", 0.0), ("B", 0.0)]);
        let b = s
            .add_task(&"B".into(), "b", now() + Duration::hours(1), 10.0)
            .unwrap();
        add(&mut s, "A", 1);
        schedule(&mut s, &ModeDecision::default(), PAYOFF);
        assert_eq!(s.slots[0].task, Some(b));
    }

    #[test]
    fn running_task_preferred_within_project() {
        let mut s = state(1, &[("A", 0.0)]);
        let first = add(&mut s, "A", 48);
        let second = add(&mut s, "A", 48);
        s.occupy(0, second);
        let cmds = schedule(&mut s, &ModeDecision::default(), PAYOFF);
        assert!(cmds.is_empty());
        assert_eq!(s.slots[0].task, Some(second));
        assert_eq!(s.tasks[&first].state, TaskState::Unstarted);
    }

    #[test]
    fn checkpointed_task_is_preempted_for_higher_debt() {
        let mut s = state(1, &[("A", 0.0), ("B", 3_600.0)]);
        let a = add(&mut s, "A", 48);
        let b = add(&mut s, "B", 48);
        s.occupy(0, a);
        s.tasks[&a].checkpointed = true;

        let cmds = schedule(&mut s, &ModeDecision::default(), PAYOFF);
        assert_eq!(
            cmds,
            vec![
                DispatchCommand::Preempt { task: a, slot: 0 },
                DispatchCommand::Start { task: b, slot: 0 },
            ]
        );
        assert_eq!(s.tasks[&a].state, TaskState::Preempted);
        assert_no_double_assignment(&s);
    }

    #[test]
    fn unsaved_task_keeps_running_against_non_critical_replacement() {
        let mut s = state(1, &[("A", 0.0), ("B", 3_600.0)]);
        let a = add(&mut s, "A", 48);
        add(&mut s, "B", 48);
        s.occupy(0, a);
        s.tasks[&a].record_usage(120.0, 1.0);

        let cmds = schedule(&mut s, &ModeDecision::default(), PAYOFF);
        assert!(cmds.is_empty());
        assert_eq!(s.slots[0].task, Some(a));
        assert_eq!(s.tasks[&a].state, TaskState::Running);
    }

    #[test]
    fn preempted_task_resumes() {
        let mut s = state(1, &[("A", 0.0)]);
        let a = add(&mut s, "A", 48);
        s.tasks[&a].state = TaskState::Preempted;
        let cmds = schedule(&mut s, &ModeDecision::default(), PAYOFF);
        assert_eq!(cmds, vec![DispatchCommand::Resume { task: a, slot: 0 }]);
    }

    #[test]
    fn panic_mode_runs_earliest_deadline_first() {
        // B has far more debt, but A's deadline is sooner.
        let mut s = state(1, &[("A", 0.0), ("B", 10_000.0)]);
        let a = add(&mut s, "A", 2);
        add(&mut s, "B", 48);
        let mode = ModeDecision {
            scheduler_mode: SchedulerMode::Panic,
            ..ModeDecision::default()
        };
        schedule(&mut s, &mode, PAYOFF);
        assert_eq!(s.slots[0].task, Some(a));
    }

    #[test]
    fn deadline_critical_task_may_evict_unsaved_work() {
        let mut s = state(1, &[("A", 0.0), ("B", 0.0)]);
        let a = add(&mut s, "A", 48);
        let b = add(&mut s, "B", 1);
        s.occupy(0, a);
        s.tasks[&a].record_usage(600.0, 1.0);

        let mode = ModeDecision {
            scheduler_mode: SchedulerMode::Panic,
            overloaded: true,
            fetch_suppressed: true,
            at_risk: BTreeSet::from([b]),
            ..ModeDecision::default()
        };
        let cmds = schedule(&mut s, &mode, PAYOFF);
        assert_eq!(
            cmds,
            vec![
                DispatchCommand::Preempt { task: a, slot: 0 },
                DispatchCommand::Start { task: b, slot: 0 },
            ]
        );
    }

    #[test]
    fn critical_task_evicts_least_progress_first() {
        let mut s = state(2, &[("A", 0.0), ("B", 0.0)]);
        let a1 = add(&mut s, "A", 48);
        let a2 = add(&mut s, "A", 48);
        let b1 = add(&mut s, "B", 1);
        let b2 = add(&mut s, "B", 2);
        s.occupy(0, a1);
        s.occupy(1, a2);
        s.tasks[&a1].record_usage(900.0, 1.0);
        s.tasks[&a2].record_usage(30.0, 1.0);

        // Panic selects b1 and b2; only b1 is critical, so only one eviction.
        let mode = ModeDecision {
            scheduler_mode: SchedulerMode::Panic,
            overloaded: true,
            at_risk: BTreeSet::from([b1]),
            ..ModeDecision::default()
        };
        schedule(&mut s, &mode, PAYOFF);
        assert_eq!(s.slots[0].task, Some(a1));
        assert_eq!(s.slots[1].task, Some(b1));
        assert_eq!(s.tasks[&b2].state, TaskState::Unstarted);
        assert_no_double_assignment(&s);
    }

    #[test]
    fn nothing_runnable_leaves_slots_idle() {
        let mut s = state(2, &[("A", 0.0)]);
        let cmds = schedule(&mut s, &ModeDecision::default(), PAYOFF);
        assert!(cmds.is_empty());
        assert_eq!(s.idle_slots(), 2);
    }

    #[test]
    fn suspended_project_is_released_from_its_slot() {
        let mut s = state(1, &[("A", 0.0)]);
        let a = add(&mut s, "A", 48);
        s.occupy(0, a);
        s.project_mut(&"A".into()).unwrap().suspended = true;

        let cmds = schedule(&mut s, &ModeDecision::default(), PAYOFF);
        assert_eq!(cmds, vec![DispatchCommand::Preempt { task: a, slot: 0 }]);
        assert_eq!(s.idle_slots(), 1);
    }

    #[test]
    fn second_pass_without_changes_is_a_no_op() {
        let mut s = state(2, &[("A", 200.0), ("B", 100.0)]);
        add(&mut s, "A", 48);
        add(&mut s, "B", 48);
        add(&mut s, "B", 48);
        let first = schedule(&mut s, &ModeDecision::default(), PAYOFF);
        assert_eq!(first.len(), 2);
        let second = schedule(&mut s, &ModeDecision::default(), PAYOFF);
        assert!(second.is_empty());
        assert_no_double_assignment(&s);
    }
}
