use chrono::{DateTime, Utc};
use crunch_core::{Project, ProjectId, RosterError, Task, TaskId, TaskState};
use indexmap::IndexMap;
use serde::Serialize;

/// One unit of concurrent execution capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub index: usize,
    pub task: Option<TaskId>,
}

/// The project/task roster and slot table.
///
/// Owned by a single controller; every scheduling pass reads and mutates it
/// in place. Maps keep registration/creation order so iteration is
/// deterministic.
#[derive(Debug, Default, Clone)]
pub struct SchedulerState {
    pub projects: IndexMap<ProjectId, Project>,
    pub tasks: IndexMap<TaskId, Task>,
    pub slots: Vec<Slot>,
    next_task_id: u64,
}

impl SchedulerState {
    pub fn new(slot_count: usize) -> Self {
        Self {
            projects: IndexMap::new(),
            tasks: IndexMap::new(),
            slots: (0..slot_count).map(|index| Slot { index, task: None }).collect(),
            next_task_id: 1,
        }
    }

    // ── Roster ──────────────────────────────────────────────────

    pub fn add_project(&mut self, project: Project) -> Result<(), RosterError> {
        if self.projects.contains_key(&project.id) {
            return Err(RosterError::DuplicateProject(project.id));
        }
        self.projects.insert(project.id.clone(), project);
        Ok(())
    }

    /// Remove a project and all of its tasks. Returns the slots its running
    /// tasks were vacated from.
    pub fn detach_project(
        &mut self,
        id: &ProjectId,
    ) -> Result<(Project, Vec<(usize, TaskId)>), RosterError> {
        let project = self
            .projects
            .shift_remove(id)
            .ok_or_else(|| RosterError::ProjectNotFound(id.clone()))?;

        let mut vacated = Vec::new();
        for slot in &mut self.slots {
            if let Some(task_id) = slot.task {
                if self.tasks.get(&task_id).is_some_and(|t| &t.project == id) {
                    vacated.push((slot.index, task_id));
                    slot.task = None;
                }
            }
        }
        self.tasks.retain(|_, t| &t.project != id);
        Ok((project, vacated))
    }

    pub fn add_task(
        &mut self,
        project: &ProjectId,
        name: impl Into<String>,
        report_deadline: DateTime<Utc>,
        estimated_remaining_time: f64,
    ) -> Result<TaskId, RosterError> {
        if !self.projects.contains_key(project) {
            return Err(RosterError::ProjectNotFound(project.clone()));
        }
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;
        let task = Task::new(id, project.clone(), name, report_deadline, estimated_remaining_time);
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// Drop a finished or aborted task from the roster.
    pub fn remove_task(&mut self, id: TaskId) -> Result<Task, RosterError> {
        self.vacate(id);
        self.tasks.shift_remove(&id).ok_or(RosterError::TaskNotFound(id))
    }

    pub fn project(&self, id: &ProjectId) -> Result<&Project, RosterError> {
        self.projects
            .get(id)
            .ok_or_else(|| RosterError::ProjectNotFound(id.clone()))
    }

    pub fn project_mut(&mut self, id: &ProjectId) -> Result<&mut Project, RosterError> {
        self.projects
            .get_mut(id)
            .ok_or_else(|| RosterError::ProjectNotFound(id.clone()))
    }

    pub fn task(&self, id: TaskId) -> Result<&Task, RosterError> {
        self.tasks.get(&id).ok_or(RosterError::TaskNotFound(id))
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, RosterError> {
        self.tasks.get_mut(&id).ok_or(RosterError::TaskNotFound(id))
    }

    // ── Eligibility ─────────────────────────────────────────────

    /// Tasks that may be given a slot: runnable state, owning project not suspended.
    pub fn runnable_tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.tasks.values().filter(move |t| {
            t.is_runnable() && self.projects.get(&t.project).is_some_and(|p| !p.suspended)
        })
    }

    pub fn runnable_task_count(&self, project: &ProjectId) -> usize {
        self.runnable_tasks().filter(|t| &t.project == project).count()
    }

    /// Not suspended and holding at least one runnable task.
    pub fn is_runnable(&self, project: &Project) -> bool {
        !project.suspended && self.runnable_task_count(&project.id) > 0
    }

    /// Could use a processor now or after its next work request.
    pub fn is_potentially_runnable(&self, project: &Project) -> bool {
        !project.suspended && (!project.no_new_work || self.runnable_task_count(&project.id) > 0)
    }

    /// Ids of runnable projects, in registration order.
    pub fn runnable_project_ids(&self) -> Vec<ProjectId> {
        self.projects
            .values()
            .filter(|p| self.is_runnable(p))
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn potentially_runnable_ids(&self) -> Vec<ProjectId> {
        self.projects
            .values()
            .filter(|p| self.is_potentially_runnable(p))
            .map(|p| p.id.clone())
            .collect()
    }

    // ── Slots ───────────────────────────────────────────────────

    pub fn slot_of(&self, task: TaskId) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.task == Some(task))
            .map(|s| s.index)
    }

    pub fn idle_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.task.is_none()).count()
    }

    pub fn busy_slots(&self) -> usize {
        self.slots.len() - self.idle_slots()
    }

    /// Put a task into a slot and mark it running.
    pub(crate) fn occupy(&mut self, slot: usize, task: TaskId) {
        self.slots[slot].task = Some(task);
        if let Some(t) = self.tasks.get_mut(&task) {
            t.state = TaskState::Running;
        }
    }

    /// Take a task off whatever slot holds it. Returns the slot index.
    pub(crate) fn vacate(&mut self, task: TaskId) -> Option<usize> {
        let slot = self.slot_of(task)?;
        self.slots[slot].task = None;
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn deadline() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn state_with_projects() -> SchedulerState {
        let mut state = SchedulerState::new(2);
        state.add_project(Project::new("http://a", "A", 100.0).unwrap()).unwrap();
        state.add_project(Project::new("http://b", "B", 100.0).unwrap()).unwrap();
        state
    }

    #[test]
    fn task_ids_follow_creation_order() {
        let mut state = state_with_projects();
        let a = state.add_task(&"http://a".into(), "a1", deadline(), 10.0).unwrap();
        let b = state.add_task(&"http://b".into(), "b1", deadline(), 10.0).unwrap();
        assert!(a < b);
    }

    #[test]
    fn duplicate_project_rejected() {
        let mut state = state_with_projects();
        let err = state
            .add_project(Project::new("http://a", "A again", 5.0).unwrap())
            .unwrap_err();
        assert_eq!(err, RosterError::DuplicateProject("http://a".into()));
    }

    #[test]
    fn add_task_for_unknown_project_fails() {
        let mut state = state_with_projects();
        let err = state.add_task(&"http://zzz".into(), "x", deadline(), 1.0).unwrap_err();
        assert!(matches!(err, RosterError::ProjectNotFound(_)));
    }

    #[test]
    fn suspended_project_tasks_are_not_runnable() {
        let mut state = state_with_projects();
        state.add_task(&"http://a".into(), "a1", deadline(), 10.0).unwrap();
        assert_eq!(state.runnable_tasks().count(), 1);
        state.project_mut(&"http://a".into()).unwrap().suspended = true;
        assert_eq!(state.runnable_tasks().count(), 0);
        assert!(state.runnable_project_ids().is_empty());
    }

    #[test]
    fn potentially_runnable_respects_no_new_work() {
        let mut state = state_with_projects();
        let b: ProjectId = "http://b".into();
        state.project_mut(&b).unwrap().no_new_work = true;
        assert_eq!(state.potentially_runnable_ids(), vec![ProjectId::from("http://a")]);

        state.add_task(&b, "b1", deadline(), 10.0).unwrap();
        assert_eq!(state.potentially_runnable_ids().len(), 2);
    }

    #[test]
    fn detach_vacates_slots_and_drops_tasks() {
        let mut state = state_with_projects();
        let a: ProjectId = "http://a".into();
        let t1 = state.add_task(&a, "a1", deadline(), 10.0).unwrap();
        let t2 = state.add_task(&"http://b".into(), "b1", deadline(), 10.0).unwrap();
        state.occupy(0, t1);
        state.occupy(1, t2);

        let (project, vacated) = state.detach_project(&a).unwrap();
        assert_eq!(project.name, "A");
        assert_eq!(vacated, vec![(0, t1)]);
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.idle_slots(), 1);
        assert_eq!(state.slot_of(t2), Some(1));
    }

    #[test]
    fn occupy_and_vacate() {
        let mut state = state_with_projects();
        let t = state.add_task(&"http://a".into(), "a1", deadline(), 10.0).unwrap();
        state.occupy(1, t);
        assert_eq!(state.task(t).unwrap().state, TaskState::Running);
        assert_eq!(state.busy_slots(), 1);
        assert_eq!(state.vacate(t), Some(1));
        assert_eq!(state.idle_slots(), 2);
    }
}
