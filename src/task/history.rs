use crate::task::types::{Execution, ExecutionId, TaskId};
use std::collections::VecDeque;

/// Bounded, in-memory execution log. Oldest records are evicted first.
#[derive(Debug, Clone)]
pub struct ExecutionHistory {
    limit: usize,
    records: VecDeque<Execution>,
}

impl ExecutionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            records: VecDeque::new(),
        }
    }

    pub fn push(&mut self, execution: Execution) {
        self.records.push_back(execution);
        while self.records.len() > self.limit {
            self.records.pop_front();
        }
    }

    /// Apply `update` to the record with `execution_id`, returning the updated copy
    pub fn update<F>(&mut self, execution_id: ExecutionId, update: F) -> Option<Execution>
    where
        F: FnOnce(&mut Execution),
    {
        let record = self
            .records
            .iter_mut()
            .rev()
            .find(|record| record.execution_id == execution_id)?;
        update(record);
        Some(record.clone())
    }

    /// Most recent executions of `task_id`, newest first
    pub fn for_task(&self, task_id: TaskId, limit: usize) -> Vec<Execution> {
        self.records
            .iter()
            .rev()
            .filter(|record| record.task_id == task_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Most recent executions across all tasks, newest first
    pub fn recent(&self, limit: usize) -> Vec<Execution> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::types::ExecutionStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn execution(task_id: TaskId, attempt: u32) -> Execution {
        Execution {
            execution_id: Uuid::new_v4(),
            task_id,
            task_name: "fetch".to_string(),
            run: 1,
            attempt_number: attempt,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            outcome: None,
        }
    }

    #[test]
    fn test_bounded_and_newest_first() {
        let task = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut history = ExecutionHistory::new(3);

        for attempt in 1..=3 {
            history.push(execution(task, attempt));
        }
        history.push(execution(other, 1));

        assert_eq!(history.len(), 3);
        let attempts: Vec<u32> = history
            .for_task(task, 10)
            .iter()
            .map(|e| e.attempt_number)
            .collect();
        assert_eq!(attempts, vec![3, 2]);
        assert_eq!(history.recent(1)[0].task_id, other);
    }

    #[test]
    fn test_update_in_place() {
        let mut history = ExecutionHistory::new(10);
        let record = execution(Uuid::new_v4(), 1);
        let id = record.execution_id;
        history.push(record);

        let updated = history
            .update(id, |e| e.status = ExecutionStatus::Completed)
            .unwrap();
        assert_eq!(updated.status, ExecutionStatus::Completed);
        assert!(history.update(Uuid::new_v4(), |_| {}).is_none());
    }
}
