use crate::task::types::TaskId;
use std::collections::{HashMap, HashSet};

/// Dependency edges between registered tasks (task → the tasks it depends on).
///
/// Dependencies may name tasks that are not registered yet; such forward
/// references are kept as edges to unknown nodes and are what allows a cycle
/// to be closed, and therefore caught, by a later registration.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: HashMap<TaskId, Vec<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.edges.contains_key(&task_id)
    }

    pub fn dependencies(&self, task_id: TaskId) -> &[TaskId] {
        self.edges.get(&task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Registered tasks that list `task_id` as a dependency
    pub fn dependents(&self, task_id: TaskId) -> Vec<TaskId> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.contains(&task_id))
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn insert(&mut self, task_id: TaskId, dependencies: Vec<TaskId>) {
        self.edges.insert(task_id, dependencies);
    }

    /// Dependencies of `task_id` that are not registered
    pub fn missing_dependencies(&self, task_id: TaskId) -> Vec<TaskId> {
        self.dependencies(task_id)
            .iter()
            .copied()
            .filter(|dep| !self.contains(*dep))
            .collect()
    }

    /// The cycle that adding `candidate` with `dependencies` would close, if any.
    ///
    /// The returned path starts and ends at `candidate`.
    pub fn find_cycle(&self, candidate: TaskId, dependencies: &[TaskId]) -> Option<Vec<TaskId>> {
        let mut visited = HashSet::new();
        let mut path = vec![candidate];
        for &dep in dependencies {
            if self.reaches(dep, candidate, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    fn reaches(
        &self,
        from: TaskId,
        target: TaskId,
        visited: &mut HashSet<TaskId>,
        path: &mut Vec<TaskId>,
    ) -> bool {
        path.push(from);
        if from == target {
            return true;
        }
        if visited.insert(from) {
            for &dep in self.dependencies(from) {
                if self.reaches(dep, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// `roots` plus every transitive dependency that `needs_run` selects,
    /// dependencies first. A dependency that does not need to run is not
    /// descended into.
    pub fn execution_order<F>(&self, roots: &[TaskId], needs_run: F) -> Vec<TaskId>
    where
        F: Fn(TaskId) -> bool,
    {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        for &root in roots {
            self.visit(root, true, &needs_run, &mut seen, &mut order);
        }
        order
    }

    fn visit<F>(
        &self,
        task_id: TaskId,
        is_root: bool,
        needs_run: &F,
        seen: &mut HashSet<TaskId>,
        order: &mut Vec<TaskId>,
    ) where
        F: Fn(TaskId) -> bool,
    {
        if !self.contains(task_id) || (!is_root && !needs_run(task_id)) {
            return;
        }
        if !seen.insert(task_id) {
            return;
        }
        for &dep in self.dependencies(task_id) {
            self.visit(dep, false, needs_run, seen, order);
        }
        order.push(task_id);
    }
}
