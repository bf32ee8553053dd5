/*
 * Counting Semaphores
 *
 * This module provides the counting semaphore threads block on. Semaphores
 * live in a process-wide registry keyed by id; the public Semaphore type
 * is a copyable handle, so stale handles miss the registry instead of
 * dangling.
 *
 * **Blocking:**
 * A wait on a zero-valued semaphore enqueues the calling thread in the
 * semaphore's FIFO waiter queue and suspends it through the scheduler.
 *
 * **Waking:**
 * A signal with waiters present pops the head waiter and hands it back to
 * the scheduler's ready queue. The count is left untouched — the ticket
 * passes directly to the woken thread, which resumes from its wait
 * without decrementing. This keeps wake order strictly FIFO and closes
 * the lost-wakeup window between a signal and a late waiter.
 *
 * Invariant: value > 0 implies the waiter queue is empty.
 *
 * The registry lock and the scheduler lock are never held together;
 * every operation updates the registry first, releases it, and only then
 * talks to the scheduler.
 */

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::thread::ThreadId;

/// Process-wide semaphore registry.
static SEMAPHORES: Mutex<BTreeMap<SemId, SemState>> = Mutex::new(BTreeMap::new());

/// Next id to assign; ids are never reused.
static NEXT_SEM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct SemId(u64);

/// Registry entry: the count plus the FIFO queue of blocked threads.
struct SemState {
    value: u32,
    waiters: VecDeque<ThreadId>,
}

/// Error returned by [`Semaphore::destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreError {
    /// Threads are blocked on the semaphore; it was left untouched.
    Busy,
    /// The handle does not name a live semaphore (already destroyed).
    Stale,
}

impl fmt::Display for SemaphoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemaphoreError::Busy => write!(f, "threads are still waiting on the semaphore"),
            SemaphoreError::Stale => write!(f, "the semaphore no longer exists"),
        }
    }
}

impl std::error::Error for SemaphoreError {}

/// Counting semaphore handle.
///
/// Copyable and id-based; every operation looks the id up in the registry,
/// so operations on a destroyed handle degrade to logged no-ops instead of
/// touching freed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore(SemId);

impl Semaphore {
    /// Create a semaphore with the given initial count.
    ///
    /// Returns `None` for a negative initial value. A positive initial
    /// value is equivalent to signalling a zero-initialized semaphore
    /// that many times.
    pub fn new(initial: i32) -> Option<Semaphore> {
        if initial < 0 {
            return None;
        }
        let id = SemId(NEXT_SEM_ID.fetch_add(1, Ordering::Relaxed));
        SEMAPHORES.lock().insert(
            id,
            SemState {
                value: initial as u32,
                waiters: VecDeque::new(),
            },
        );
        log::debug!("semaphore {} created with value {initial}", id.0);
        Some(Semaphore(id))
    }

    /// Wait: take one ticket, blocking while the count is zero.
    ///
    /// On resumption after blocking the count is NOT decremented — the
    /// signal that woke this thread already spent its ticket on it.
    ///
    /// Called outside the runtime with a zero count, the wait could never
    /// be satisfied; it is refused and logged instead of blocking the
    /// host forever.
    pub fn wait(&self) {
        let current = super::current();
        let must_block = {
            let mut table = SEMAPHORES.lock();
            let Some(sem) = table.get_mut(&self.0) else {
                log::warn!("wait on destroyed semaphore {}", self.0.0);
                return;
            };
            if sem.value > 0 {
                sem.value -= 1;
                false
            } else {
                match current {
                    Some(cur) => {
                        sem.waiters.push_back(cur);
                        true
                    }
                    None => {
                        log::warn!(
                            "wait on zero-valued semaphore {} outside the runtime; ignoring",
                            self.0.0
                        );
                        false
                    }
                }
            }
        };

        if must_block {
            super::block_and_reschedule();
        }
    }

    /// Signal: hand a ticket to the head waiter, or bank it in the count
    /// when nobody is waiting. The calling thread keeps running either
    /// way.
    pub fn signal(&self) {
        let woken = {
            let mut table = SEMAPHORES.lock();
            let Some(sem) = table.get_mut(&self.0) else {
                log::warn!("signal on destroyed semaphore {}", self.0.0);
                return;
            };
            match sem.waiters.pop_front() {
                // Ticket passes straight to the woken thread; the count
                // stays put.
                Some(id) => Some(id),
                None => {
                    sem.value += 1;
                    None
                }
            }
        };

        if let Some(id) = woken {
            super::make_ready(id);
        }
    }

    /// Destroy the semaphore.
    ///
    /// Refused with [`SemaphoreError::Busy`] while any thread is waiting;
    /// the semaphore and its waiters are left untouched in that case.
    pub fn destroy(self) -> Result<(), SemaphoreError> {
        let mut table = SEMAPHORES.lock();
        let Some(sem) = table.get(&self.0) else {
            return Err(SemaphoreError::Stale);
        };
        if !sem.waiters.is_empty() {
            return Err(SemaphoreError::Busy);
        }
        table.remove(&self.0);
        log::debug!("semaphore {} destroyed", self.0.0);
        Ok(())
    }

    /// Current count, or `None` for a destroyed semaphore.
    pub fn value(&self) -> Option<u32> {
        SEMAPHORES.lock().get(&self.0).map(|sem| sem.value)
    }

    /// Number of threads blocked on the semaphore (0 if destroyed).
    pub fn waiter_count(&self) -> usize {
        SEMAPHORES
            .lock()
            .get(&self.0)
            .map(|sem| sem.waiters.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Non-blocking paths work without a runtime, so these run as plain
    // unit tests; the blocking paths are exercised end-to-end in
    // tests/semaphore.rs.

    #[test]
    fn negative_initial_value_is_rejected() {
        assert_eq!(Semaphore::new(-1), None);
        assert_eq!(Semaphore::new(i32::MIN), None);
    }

    #[test]
    fn wait_decrements_while_positive() {
        let sem = Semaphore::new(2).unwrap();
        sem.wait();
        sem.wait();
        assert_eq!(sem.value(), Some(0));
        sem.destroy().unwrap();
    }

    #[test]
    fn signal_with_no_waiters_increments() {
        let sem = Semaphore::new(0).unwrap();
        sem.signal();
        sem.signal();
        sem.signal();
        assert_eq!(sem.value(), Some(3));
        sem.destroy().unwrap();
    }

    #[test]
    fn balanced_waits_and_signals_restore_the_count() {
        // value = initial + signals - waits while nobody ends up blocked.
        let sem = Semaphore::new(2).unwrap();
        sem.wait();
        sem.signal();
        sem.signal();
        sem.wait();
        sem.wait();
        assert_eq!(sem.value(), Some(1));
        sem.destroy().unwrap();
    }

    #[test]
    fn destroy_then_use_degrades_gracefully() {
        let sem = Semaphore::new(1).unwrap();
        sem.destroy().unwrap();
        assert_eq!(sem.destroy(), Err(SemaphoreError::Stale));
        assert_eq!(sem.value(), None);
        assert_eq!(sem.waiter_count(), 0);
        // Logged no-ops, not crashes.
        sem.wait();
        sem.signal();
    }

    #[test]
    fn handles_are_distinct() {
        let a = Semaphore::new(0).unwrap();
        let b = Semaphore::new(5).unwrap();
        assert_ne!(a, b);
        a.signal();
        assert_eq!(a.value(), Some(1));
        assert_eq!(b.value(), Some(5));
        a.destroy().unwrap();
        b.destroy().unwrap();
    }
}
