//! Scheduler handing parallel groups to a bounded pool of worker threads.

use crate::types::GroupIndex;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// Task for a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Execute the group at this index.
    Execute(GroupIndex),
    /// No more groups will be handed out.
    Done,
}

/// Status of a group in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Waiting for a worker.
    Pending,
    Executing,
    /// Finished with a result for every transaction.
    Executed,
    /// Finished without a usable result (fault or mid-flight cancellation).
    Faulted,
    /// Never started because execution was cancelled.
    Skipped,
}

/// Hands out groups in group order until the queue is empty or cancelled.
pub struct Scheduler {
    statuses: Vec<RwLock<GroupStatus>>,
    ready_queue: Mutex<VecDeque<GroupIndex>>,
    finished_count: AtomicUsize,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler with every group ready to execute.
    pub fn new(num_groups: usize, cancel: CancellationToken) -> Self {
        Self {
            statuses: (0..num_groups)
                .map(|_| RwLock::new(GroupStatus::Pending))
                .collect(),
            ready_queue: Mutex::new((0..num_groups).collect()),
            finished_count: AtomicUsize::new(0),
            cancel,
        }
    }

    /// Gets the next task for a worker thread.
    pub fn next_task(&self) -> Task {
        if self.cancel.is_cancelled() {
            self.skip_pending();
            return Task::Done;
        }

        let mut queue = self.ready_queue.lock();
        match queue.pop_front() {
            Some(group_idx) => {
                *self.statuses[group_idx].write() = GroupStatus::Executing;
                Task::Execute(group_idx)
            }
            None => Task::Done,
        }
    }

    /// Marks a group as finished.
    pub fn finish_execution(&self, group_idx: GroupIndex, faulted: bool) {
        *self.statuses[group_idx].write() = if faulted {
            GroupStatus::Faulted
        } else {
            GroupStatus::Executed
        };
        self.finished_count.fetch_add(1, Ordering::AcqRel);
    }

    fn skip_pending(&self) {
        let mut queue = self.ready_queue.lock();
        for group_idx in queue.drain(..) {
            *self.statuses[group_idx].write() = GroupStatus::Skipped;
        }
    }

    /// Gets the current status of a group.
    pub fn get_status(&self, group_idx: GroupIndex) -> GroupStatus {
        *self.statuses[group_idx].read()
    }

    /// Number of groups that finished, successfully or not.
    pub fn finished_count(&self) -> usize {
        self.finished_count.load(Ordering::Acquire)
    }

    /// Gets statistics about execution progress.
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        for status in &self.statuses {
            match *status.read() {
                GroupStatus::Pending => stats.pending += 1,
                GroupStatus::Executing => stats.executing += 1,
                GroupStatus::Executed => stats.executed += 1,
                GroupStatus::Faulted => stats.faulted += 1,
                GroupStatus::Skipped => stats.skipped += 1,
            }
        }
        stats
    }
}

/// Statistics about scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub pending: usize,
    pub executing: usize,
    pub executed: usize,
    pub faulted: usize,
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_hands_out_groups_in_order() {
        let scheduler = Scheduler::new(3, CancellationToken::new());

        assert_eq!(scheduler.next_task(), Task::Execute(0));
        assert_eq!(scheduler.next_task(), Task::Execute(1));
        scheduler.finish_execution(0, false);
        scheduler.finish_execution(1, true);
        assert_eq!(scheduler.next_task(), Task::Execute(2));
        assert_eq!(scheduler.next_task(), Task::Done);

        assert_eq!(scheduler.get_status(1), GroupStatus::Faulted);
        assert_eq!(scheduler.finished_count(), 2);
        assert_eq!(
            scheduler.stats(),
            SchedulerStats {
                executing: 1,
                executed: 1,
                faulted: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_cancellation_skips_pending_groups() {
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(3, cancel.clone());

        assert_eq!(scheduler.next_task(), Task::Execute(0));
        cancel.cancel();
        assert_eq!(scheduler.next_task(), Task::Done);

        assert_eq!(scheduler.get_status(0), GroupStatus::Executing);
        assert_eq!(scheduler.get_status(1), GroupStatus::Skipped);
        assert_eq!(scheduler.stats().skipped, 2);
    }
}
