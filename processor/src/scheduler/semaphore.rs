use std::collections::{BTreeMap, VecDeque};

use doeff_core::{Exception, TaskId};

// SEMAPHORES
// ================================================================================================

/// A keyed, cooperative counting semaphore.
///
/// Mutual exclusion between tasks is expressed through these, never through OS locks, so the
/// scheduler can observe contention and keep FIFO fairness.
#[derive(Debug)]
pub(crate) struct Semaphore {
    pub permits: u32,
    pub available: u32,
    pub waiters: VecDeque<TaskId>,
}

/// What happened on an acquire attempt.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum AcquireOutcome {
    Granted,
    MustWait,
}

#[derive(Debug, Default)]
pub(crate) struct SemaphoreTable {
    entries: BTreeMap<String, Semaphore>,
}

impl SemaphoreTable {
    /// Creates a semaphore. Creating an existing key is a no-op.
    pub fn create(&mut self, key: &str, permits: u32) {
        self.entries.entry(key.to_string()).or_insert(Semaphore {
            permits,
            available: permits,
            waiters: VecDeque::new(),
        });
    }

    /// Takes a permit, or enqueues the task at the back of the FIFO queue.
    pub fn acquire(&mut self, key: &str, task: TaskId) -> Result<AcquireOutcome, Exception> {
        let semaphore = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Exception::key_error(&format!("semaphore {key:?}")))?;
        if semaphore.available > 0 {
            semaphore.available -= 1;
            Ok(AcquireOutcome::Granted)
        } else {
            semaphore.waiters.push_back(task);
            Ok(AcquireOutcome::MustWait)
        }
    }

    /// Returns a permit. The oldest waiter (if any) receives it directly; the scheduler is
    /// responsible for waking the returned task.
    pub fn release(&mut self, key: &str) -> Result<Option<TaskId>, Exception> {
        let semaphore = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Exception::key_error(&format!("semaphore {key:?}")))?;
        if let Some(waiter) = semaphore.waiters.pop_front() {
            return Ok(Some(waiter));
        }
        semaphore.available += 1;
        Ok(None)
    }

    /// Hands the permit to the next waiter after the intended one turned out to be gone
    /// (cancelled or otherwise no longer waiting).
    pub fn pass_over(&mut self, key: &str) -> Option<TaskId> {
        let semaphore = self.entries.get_mut(key)?;
        if let Some(waiter) = semaphore.waiters.pop_front() {
            return Some(waiter);
        }
        semaphore.available += 1;
        None
    }

    /// Drops a task from a semaphore's wait queue (used when the task is cancelled).
    pub fn remove_waiter(&mut self, key: &str, task: TaskId) {
        if let Some(semaphore) = self.entries.get_mut(key) {
            semaphore.waiters.retain(|waiter| *waiter != task);
        }
    }
}

// TESTS
// ================================================================================================
