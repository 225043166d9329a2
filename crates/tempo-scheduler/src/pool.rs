//! Bounded FIFO worker pool.
//!
//! Owned by the scheduler loop, so it needs no locking: the loop enqueues
//! due jobs, takes whatever fits under the concurrency cap, and calls
//! `complete()` as runs finish. Excess work waits in submission order.

use std::collections::VecDeque;

/// Queue plus slot accounting for running jobs.
#[derive(Debug)]
pub struct WorkerPool<T> {
    queue: VecDeque<T>,
    active: usize,
    max_concurrent: usize,
    peak_active: usize,
    total_processed: u64,
}

impl<T> WorkerPool<T> {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            active: 0,
            max_concurrent: max_concurrent.max(1),
            peak_active: 0,
            total_processed: 0,
        }
    }

    pub fn enqueue(&mut self, job: T) {
        self.queue.push_back(job);
    }

    /// Take the oldest queued job if a slot is free. The slot stays taken
    /// until `complete()`.
    pub fn next(&mut self) -> Option<T> {
        if self.active >= self.max_concurrent {
            return None;
        }
        let job = self.queue.pop_front()?;
        self.active += 1;
        self.peak_active = self.peak_active.max(self.active);
        Some(job)
    }

    /// Free a slot.
    pub fn complete(&mut self) {
        self.active = self.active.saturating_sub(1);
        self.total_processed += 1;
    }

    pub fn is_idle(&self) -> bool {
        self.active == 0 && self.queue.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.queue.len(),
            active: self.active,
            max_concurrent: self.max_concurrent,
            peak_active: self.peak_active,
            total_processed: self.total_processed,
        }
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub peak_active: usize,
    pub total_processed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut pool = WorkerPool::new(10);
        pool.enqueue("a");
        pool.enqueue("b");
        pool.enqueue("c");
        assert_eq!(pool.next(), Some("a"));
        assert_eq!(pool.next(), Some("b"));
        assert_eq!(pool.next(), Some("c"));
        assert_eq!(pool.next(), None);
    }

    #[test]
    fn test_concurrency_limits() {
        let mut pool = WorkerPool::new(2);
        for id in ["d1", "d2", "d3"] {
            pool.enqueue(id);
        }

        assert!(pool.next().is_some()); // d1
        assert!(pool.next().is_some()); // d2
        // At capacity
        assert!(pool.next().is_none());
        assert_eq!(pool.stats().queued, 1);

        // Complete one, now d3 can start
        pool.complete();
        assert_eq!(pool.next(), Some("d3"));
        assert_eq!(pool.stats().peak_active, 2);
    }

    #[test]
    fn test_fifty_jobs_cap_five() {
        let mut pool = WorkerPool::new(5);
        for i in 0..50 {
            pool.enqueue(i);
        }
        let mut started = Vec::new();
        while let Some(j) = pool.next() {
            started.push(j);
        }
        assert_eq!(started, vec![0, 1, 2, 3, 4]);

        let mut order = started.clone();
        while !pool.is_idle() {
            pool.complete();
            while let Some(j) = pool.next() {
                order.push(j);
            }
            assert!(pool.stats().active <= 5);
        }
        assert_eq!(order, (0..50).collect::<Vec<_>>());
        assert_eq!(pool.stats().peak_active, 5);
    }

    #[test]
    fn test_zero_cap_is_clamped() {
        let mut pool = WorkerPool::new(0);
        pool.enqueue(1);
        assert_eq!(pool.next(), Some(1));
    }
}
