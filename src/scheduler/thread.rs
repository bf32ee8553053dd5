/*
 * Thread Objects and the Join Subsystem
 *
 * This module defines the Thread structure plus the operations a running
 * thread applies to itself and its family: exit, join on a single child,
 * and join on the whole child set.
 *
 * Family bookkeeping invariants:
 * - c is in p.children exactly while c is live and c.parent == p
 * - a thread sits outside the ready queue while its blocker set is
 *   non-empty; each blocker is a child it is joining
 * - exit scrubs every edge that points at the exiting thread before the
 *   reaper frees it, so no stale id is ever dereferenced
 */

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use super::context::{self, ThreadContext};

/// Boxed entry routine for a thread; captures stand in for the classic
/// `entry(arg)` argument slot.
pub(crate) type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// Thread identifier.
///
/// Ids increase monotonically and are never reused within a process, so a
/// handle to an exited thread misses the registry instead of aliasing a
/// newer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// Thread state.
///
/// `Finished` covers the window between the entry routine ending and the
/// reaper freeing the thread's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Finished,
}

/// Error returned by [`join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// The handle is not a live child of the calling thread — either it
    /// never was, or the child already exited and was unlinked.
    NotAChild,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::NotAChild => write!(f, "not a live child of the calling thread"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Thread structure.
///
/// Each thread exclusively owns its stack buffer; every other reference to
/// a thread (parent link, child set, blocker set, ready queue, semaphore
/// waiter queue) is a non-owning [`ThreadId`]. The scheduler owns the
/// Thread itself from creation until the reaper removes it.
///
/// The saved context is boxed so its address stays stable while the
/// registry reorganizes around it; raw pointers to it are live during
/// every switch.
pub(crate) struct Thread {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    pub stack: Box<[u8]>,
    pub context: Box<ThreadContext>,
    pub entry: Option<EntryFn>,
    pub parent: Option<ThreadId>,
    pub children: BTreeSet<ThreadId>,
    pub blockers: BTreeSet<ThreadId>,
}

impl Thread {
    /// Allocate a thread with a fresh stack, its context aimed at the
    /// start trampoline, and its family links initialized.
    pub fn new(id: ThreadId, name: String, entry: EntryFn, parent: Option<ThreadId>) -> Self {
        let mut stack = vec![0u8; super::THREAD_STACK_SIZE].into_boxed_slice();
        let context = Box::new(ThreadContext::with_entry(&mut stack, thread_trampoline));
        Self {
            id,
            name,
            state: ThreadState::Ready,
            stack,
            context,
            entry: Some(entry),
            parent,
            children: BTreeSet::new(),
            blockers: BTreeSet::new(),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("stack_size", &self.stack.len())
            .field("parent", &self.parent)
            .field("children", &self.children.len())
            .field("blockers", &self.blockers.len())
            .finish()
    }
}

/// Start trampoline every thread context is aimed at.
///
/// Runs on the thread's own stack. It takes the entry closure out of the
/// registry, runs it with panic containment (a panic must not unwind
/// across the context-switch boundary below the trampoline frame), and
/// routes the thread's end through [`exit`].
pub(crate) unsafe extern "C" fn thread_trampoline() -> ! {
    let entry = super::with_runtime(|rt| {
        let cur = rt.current.expect("trampoline entered with no current thread");
        rt.threads
            .get_mut(&cur)
            .expect("current thread missing from registry")
            .entry
            .take()
    })
    .flatten();

    match entry {
        Some(entry) => {
            if catch_unwind(AssertUnwindSafe(entry)).is_err() {
                log::error!("thread panicked; treating the panic as thread exit");
            }
        }
        None => log::error!("thread started without an entry routine"),
    }

    exit()
}

/// Terminate the calling thread.
///
/// Unlinks the thread from its parent (waking the parent if this thread
/// was its last blocker), detaches all children, and transfers control to
/// the reaper context, which frees the stack this call is running on.
/// Entry closures may call this as their last statement or simply return;
/// both reach the same terminal path.
///
/// # Panics
/// Panics if called when no thread is running (outside [`super::run`]).
pub fn exit() -> ! {
    let reaper = super::with_runtime(|rt| {
        let cur = rt.current.expect("exit() called with no running thread");
        rt.finish_thread(cur);
        &*rt.reaper_context as *const ThreadContext
    })
    .expect("exit() called outside the runtime");

    // One-way: the reaper frees this stack, so it must not be touched
    // again past this point.
    unsafe { context::load_context(reaper) }
}

/// Join with one child thread.
///
/// Returns `Err(JoinError::NotAChild)` without blocking when `child` is
/// not a live child of the caller — including the case where the child
/// already exited. Otherwise the caller blocks until the child exits.
pub fn join(child: ThreadId) -> Result<(), JoinError> {
    let armed = super::with_runtime(|rt| {
        let Some(cur) = rt.current else {
            return false;
        };
        let is_child = rt
            .threads
            .get(&cur)
            .map(|t| t.children.contains(&child))
            .unwrap_or(false);
        if !is_child {
            return false;
        }
        rt.threads
            .get_mut(&cur)
            .expect("current thread missing from registry")
            .blockers
            .insert(child);
        true
    })
    .unwrap_or(false);

    if !armed {
        return Err(JoinError::NotAChild);
    }

    // The child's exit drains the blocker entry and requeues us.
    super::block_and_reschedule();
    Ok(())
}

/// Join with every child alive at the time of the call.
///
/// Returns immediately when there are none. The blocker set is a snapshot:
/// threads that become children afterwards are not awaited.
pub fn join_all() {
    let armed = super::with_runtime(|rt| {
        let Some(cur) = rt.current else {
            return false;
        };
        let children: Vec<ThreadId> = rt
            .threads
            .get(&cur)
            .map(|t| t.children.iter().copied().collect())
            .unwrap_or_default();
        if children.is_empty() {
            return false;
        }
        let thread = rt
            .threads
            .get_mut(&cur)
            .expect("current thread missing from registry");
        thread.blockers.extend(children);
        true
    })
    .unwrap_or(false);

    if armed {
        super::block_and_reschedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_displays_with_prefix() {
        assert_eq!(ThreadId(3).to_string(), "thread-3");
    }

    #[test]
    fn join_error_display() {
        assert_eq!(
            JoinError::NotAChild.to_string(),
            "not a live child of the calling thread"
        );
    }

    #[test]
    fn new_thread_starts_ready_and_unlinked() {
        let t = Thread::new(ThreadId(7), "thread-7".into(), Box::new(|| {}), None);
        assert_eq!(t.state, ThreadState::Ready);
        assert!(t.entry.is_some());
        assert!(t.children.is_empty());
        assert!(t.blockers.is_empty());
        assert_eq!(t.stack.len(), crate::scheduler::THREAD_STACK_SIZE);
    }

    #[test]
    fn join_outside_the_runtime_reports_not_a_child() {
        // No runtime bootstrapped in this unit binary's thread: the call
        // must not block.
        assert_eq!(join(ThreadId(999_999)), Err(JoinError::NotAChild));
    }
}
