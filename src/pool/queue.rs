use crate::pool::types::{Priority, QueueDepths};
use std::collections::VecDeque;

/// Strict priority queue with FIFO ordering inside each band.
///
/// `pop` always drains the highest non-empty band first: CRITICAL before
/// HIGH before NORMAL before LOW. Lower bands are only served while every
/// higher band is empty, so a steady stream of urgent work starves the
/// lower bands indefinitely.
#[derive(Debug, Clone)]
pub struct PriorityQueue<T> {
    bands: [VecDeque<T>; 4],
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            bands: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
        }
    }

    pub fn push(&mut self, priority: Priority, item: T) {
        self.bands[priority.index()].push_back(item);
    }

    pub fn pop(&mut self) -> Option<(Priority, T)> {
        Priority::DESCENDING.iter().find_map(|&priority| {
            self.bands[priority.index()]
                .pop_front()
                .map(|item| (priority, item))
        })
    }

    /// Removes the first item in `priority`'s band matching `predicate`
    pub fn remove_where<F>(&mut self, priority: Priority, predicate: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        let band = &mut self.bands[priority.index()];
        let position = band.iter().position(predicate)?;
        band.remove(position)
    }

    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len());
        for priority in Priority::DESCENDING {
            drained.extend(self.bands[priority.index()].drain(..));
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(VecDeque::is_empty)
    }

    pub fn depth(&self, priority: Priority) -> usize {
        self.bands[priority.index()].len()
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            critical: self.depth(Priority::Critical),
            high: self.depth(Priority::High),
            normal: self.depth(Priority::Normal),
            low: self.depth(Priority::Low),
        }
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_priority_then_fifo() {
        let mut queue = PriorityQueue::new();
        queue.push(Priority::Low, "low-1");
        queue.push(Priority::High, "high-1");
        queue.push(Priority::Low, "low-2");
        queue.push(Priority::Critical, "critical-1");
        queue.push(Priority::High, "high-2");

        let order: Vec<_> = std::iter::from_fn(|| queue.pop().map(|(_, item)| item)).collect();
        assert_eq!(
            order,
            vec!["critical-1", "high-1", "high-2", "low-1", "low-2"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_where_keeps_order() {
        let mut queue = PriorityQueue::new();
        for i in 0..4 {
            queue.push(Priority::Normal, i);
        }

        assert_eq!(queue.remove_where(Priority::Normal, |&i| i == 2), Some(2));
        assert_eq!(queue.remove_where(Priority::High, |&i| i == 1), None);
        assert_eq!(queue.depth(Priority::Normal), 3);

        let rest: Vec<_> = queue.drain();
        assert_eq!(rest, vec![0, 1, 3]);
    }

    #[test]
    fn test_depths() {
        let mut queue = PriorityQueue::new();
        queue.push(Priority::Critical, ());
        queue.push(Priority::Low, ());
        queue.push(Priority::Low, ());

        let depths = queue.depths();
        assert_eq!(depths.critical, 1);
        assert_eq!(depths.low, 2);
        assert_eq!(depths.total(), 3);
        assert_eq!(queue.len(), 3);
    }
}
