/*
 * Cooperative Scheduler
 *
 * This module implements the non-preemptive scheduler at the heart of the
 * library. Threads run until they explicitly give up the CPU; there is no
 * timer, no signal, no preemption of any kind.
 *
 * COOPERATIVE SCHEDULING EXPLAINED:
 * ================================
 *
 * A single flow of control moves between user-created thread contexts.
 * Control transfers happen only inside library calls:
 *
 * - yield_now()            -> back of the ready queue, next thread runs
 * - join() / join_all()    -> block until the awaited children exit
 * - Semaphore::wait()      -> block while the count is zero
 * - entry return / exit()  -> one-way transfer into the reaper context
 * - run()                  -> the initial host-to-thread dispatch
 *
 * Everything is strict FIFO: yielding threads, woken joiners and woken
 * semaphore waiters all go to the tail of one ready queue.
 *
 * RUNTIME SINGLETON:
 * =================
 *
 * All scheduler state lives in one Runtime object behind a global spin
 * lock, installed by run() and torn down when the ready queue drains.
 * Every operation follows the same shape: take the lock, update queues
 * and thread states, compute raw pointers to the source and target
 * contexts, RELEASE the lock, then perform the actual context switch.
 * Holding the lock across a switch would deadlock the next operation the
 * resumed thread performs.
 *
 * THREAD LIFECYCLE:
 * ================
 *
 * Ready -> Running -> (Ready | Blocked | Finished)
 *
 * - Ready: sitting in the ready queue
 * - Running: the current thread (at most one)
 * - Blocked: joining children or waiting on a semaphore; not queued
 * - Finished: entry routine done; the reaper frees it next
 *
 * The union of these partitions every live thread; a thread is in the
 * ready queue at most once and never while blocked.
 */

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

pub mod context;
pub mod reaper;
pub mod semaphore;
pub mod thread;

pub use semaphore::{Semaphore, SemaphoreError};
pub use thread::{JoinError, ThreadId, ThreadState, exit, join, join_all};

use context::ThreadContext;
use thread::{EntryFn, Thread};

/// Per-thread stack size. Sized at construction, never reallocated, freed
/// only by the reaper after the thread's entry routine has returned.
pub const THREAD_STACK_SIZE: usize = 64 * 1024;

/// Stack size of the dedicated reaper context.
pub const REAPER_STACK_SIZE: usize = 16 * 1024;

/// Global runtime instance. `None` whenever no run() is in progress.
static RUNTIME: Mutex<Option<Runtime>> = Mutex::new(None);

/// Bootstrap guard: run() while this is set is a no-op. Re-armed once the
/// runtime has fully drained, so a process can host sequential runs.
static RUNTIME_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Scheduler state shared by every operation.
///
/// Contexts are boxed so raw pointers handed to the switch routines stay
/// valid while the registry reorganizes; the runtime exclusively owns each
/// Thread (and its stack) from creation until the reaper removes it.
pub(crate) struct Runtime {
    /// All live threads, keyed by id.
    pub threads: BTreeMap<ThreadId, Thread>,
    /// FIFO queue of threads ready to run; each id appears at most once.
    pub ready_queue: VecDeque<ThreadId>,
    /// The running thread, if any.
    pub current: Option<ThreadId>,
    /// Saved context of the run() caller, restored when the queue drains.
    pub host_context: Box<ThreadContext>,
    /// Context of the reaper trampoline; every thread's end lands here.
    pub reaper_context: Box<ThreadContext>,
    /// Backing stack for the reaper context, alive for the whole run.
    pub reaper_stack: Box<[u8]>,
    /// Next id to assign; ids are never reused.
    pub next_thread_id: u64,
    /// Cumulative context switches, for diagnostics.
    pub context_switches: u64,
}

impl Runtime {
    /// Create a thread: allocate its stack, aim its context at the start
    /// trampoline, link it to the creating thread, and queue it. The
    /// creator keeps running.
    fn create_thread(&mut self, entry: EntryFn) -> ThreadId {
        let id = ThreadId(self.next_thread_id);
        self.next_thread_id += 1;

        let parent = self.current;
        let thread = Thread::new(id, format!("{id}"), entry, parent);
        if let Some(p) = parent {
            if let Some(parent_thread) = self.threads.get_mut(&p) {
                parent_thread.children.insert(id);
            }
        }

        log::debug!("created {} (parent {:?})", thread.name, parent);
        self.threads.insert(id, thread);
        self.ready_queue.push_back(id);
        id
    }

    /// Pop the head of the ready queue, make it current, and return the
    /// (save, resume) context pointers for the switch out of `prev`.
    ///
    /// The caller has already decided `prev`'s fate (requeued it for a
    /// yield, marked it blocked, or neither) and checked that the ready
    /// queue is non-empty.
    fn prepare_switch_from(
        &mut self,
        prev: ThreadId,
    ) -> (*mut ThreadContext, *const ThreadContext) {
        let next = self
            .ready_queue
            .pop_front()
            .expect("ready queue checked non-empty");
        self.current = Some(next);
        self.context_switches += 1;

        self.threads
            .get_mut(&next)
            .expect("queued thread missing from registry")
            .state = ThreadState::Running;

        let next_ptr: *const ThreadContext = &*self
            .threads
            .get(&next)
            .expect("queued thread missing from registry")
            .context;
        let prev_ptr: *mut ThreadContext = &mut *self
            .threads
            .get_mut(&prev)
            .expect("previous thread missing from registry")
            .context;
        (prev_ptr, next_ptr)
    }

    /// Exit-time bookkeeping for `id`, run before control moves to the
    /// reaper:
    ///
    /// 1. remove it from its parent's child set
    /// 2. if it was one of the parent's blockers, drop that entry and
    ///    requeue the parent once the blocker set drains
    /// 3. detach all children (they run to completion unowned and are
    ///    reaped normally; nobody can join them afterwards)
    pub(crate) fn finish_thread(&mut self, id: ThreadId) {
        let (parent, children) = {
            let thread = self
                .threads
                .get_mut(&id)
                .expect("finishing thread missing from registry");
            thread.state = ThreadState::Finished;
            (thread.parent.take(), std::mem::take(&mut thread.children))
        };

        if let Some(p) = parent {
            if let Some(parent_thread) = self.threads.get_mut(&p) {
                parent_thread.children.remove(&id);
                if parent_thread.blockers.remove(&id) && parent_thread.blockers.is_empty() {
                    parent_thread.state = ThreadState::Ready;
                    self.ready_queue.push_back(p);
                }
            }
        }

        for child in children {
            if let Some(child_thread) = self.threads.get_mut(&child) {
                child_thread.parent = None;
            }
        }

        log::debug!("{id} finished");
    }
}

/// Run a closure against the runtime, if one is installed.
pub(crate) fn with_runtime<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Runtime) -> R,
{
    RUNTIME.lock().as_mut().map(f)
}

/// Bootstrap the runtime, run `entry` as the first thread, and return
/// once no runnable thread remains.
///
/// A call while a runtime is already active is a no-op (logged at warn).
/// After a full drain the guard re-arms, so sequential runs in one
/// process each get a fresh runtime.
///
/// Threads that are still blocked when the queue drains are torn down
/// with the runtime; nothing can ever wake them.
pub fn run<F>(entry: F)
where
    F: FnOnce() + Send + 'static,
{
    if RUNTIME_ACTIVE
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        log::warn!("run() called while the runtime is already active; ignoring");
        return;
    }

    log::info!("initializing cooperative scheduler");

    let mut reaper_stack = vec![0u8; REAPER_STACK_SIZE].into_boxed_slice();
    let reaper_context = Box::new(ThreadContext::with_entry(
        &mut reaper_stack,
        reaper::reaper_main,
    ));
    let runtime = Runtime {
        threads: BTreeMap::new(),
        ready_queue: VecDeque::new(),
        current: None,
        host_context: Box::new(ThreadContext::default()),
        reaper_context,
        reaper_stack,
        next_thread_id: 1,
        context_switches: 0,
    };
    log::debug!(
        "reaper context ready ({} byte stack)",
        runtime.reaper_stack.len()
    );
    *RUNTIME.lock() = Some(runtime);

    let first = spawn(entry);
    log::debug!("dispatching bootstrap thread {first}");

    let (host_ptr, first_ptr) = with_runtime(|rt| {
        let host_ptr: *mut ThreadContext = &mut *rt.host_context;
        let next = rt
            .ready_queue
            .pop_front()
            .expect("bootstrap thread queued by spawn");
        rt.current = Some(next);
        rt.context_switches += 1;
        rt.threads
            .get_mut(&next)
            .expect("bootstrap thread missing from registry")
            .state = ThreadState::Running;
        let first_ptr: *const ThreadContext = &*rt
            .threads
            .get(&next)
            .expect("bootstrap thread missing from registry")
            .context;
        (host_ptr, first_ptr)
    })
    .expect("runtime installed above");

    // Control returns here only when the reaper (or a blocked thread with
    // nothing left to run) restores the host context.
    unsafe { context::switch_context(host_ptr, first_ptr) };

    if let Some(rt) = RUNTIME.lock().take() {
        if rt.threads.is_empty() {
            log::info!("runtime drained after {} context switches", rt.context_switches);
        } else {
            log::warn!(
                "runtime drained with {} thread(s) permanently blocked; tearing them down",
                rt.threads.len()
            );
        }
    }
    RUNTIME_ACTIVE.store(false, Ordering::SeqCst);
}

/// Create a thread running `entry` and queue it behind every thread
/// already ready. The caller is not suspended.
///
/// Returns an id usable with [`join`].
///
/// # Panics
/// Panics when called outside [`run`] — thread creation needs a live
/// runtime to own the new thread.
pub fn spawn<F>(entry: F) -> ThreadId
where
    F: FnOnce() + Send + 'static,
{
    with_runtime(|rt| rt.create_thread(Box::new(entry)))
        .expect("spawn() requires an active runtime (call run() first)")
}

/// Voluntarily give up the CPU.
///
/// The calling thread goes to the tail of the ready queue and the head
/// runs next. With an empty ready queue this is a no-op — the caller is
/// the only runnable thread and simply keeps going. Outside the runtime
/// it is also a no-op.
pub fn yield_now() {
    let switch = with_runtime(|rt| {
        let cur = rt.current?;
        if rt.ready_queue.is_empty() {
            return None;
        }
        rt.threads
            .get_mut(&cur)
            .expect("current thread missing from registry")
            .state = ThreadState::Ready;
        rt.ready_queue.push_back(cur);
        Some(rt.prepare_switch_from(cur))
    })
    .flatten();

    if let Some((prev, next)) = switch {
        unsafe { context::switch_context(prev, next) };
    }
}

/// Suspend the current thread without requeueing it and dispatch the next
/// ready thread. Used by join and semaphore wait after they have recorded
/// what the thread is waiting for.
///
/// With nothing left to run, the blocked thread can never be woken (only
/// other threads signal or exit), so the host context is restored and the
/// runtime drains — the blocked thread is torn down with it.
pub(crate) fn block_and_reschedule() {
    enum Transfer {
        Switch(*mut ThreadContext, *const ThreadContext),
        Drain(*const ThreadContext),
    }

    let transfer = with_runtime(|rt| {
        let cur = rt
            .current
            .expect("block_and_reschedule with no running thread");
        rt.threads
            .get_mut(&cur)
            .expect("current thread missing from registry")
            .state = ThreadState::Blocked;
        if rt.ready_queue.is_empty() {
            rt.current = None;
            Transfer::Drain(&*rt.host_context as *const ThreadContext)
        } else {
            let (prev, next) = rt.prepare_switch_from(cur);
            Transfer::Switch(prev, next)
        }
    });

    match transfer {
        Some(Transfer::Switch(prev, next)) => unsafe { context::switch_context(prev, next) },
        Some(Transfer::Drain(host)) => unsafe { context::load_context(host) },
        None => log::warn!("blocking operation invoked outside the runtime"),
    }
}

/// Move a blocked thread to the tail of the ready queue.
///
/// No-op for ids that are not currently blocked (already woken, never
/// existed, or torn down with an earlier runtime).
pub(crate) fn make_ready(id: ThreadId) {
    let woken = with_runtime(|rt| match rt.threads.get_mut(&id) {
        Some(t) if t.state == ThreadState::Blocked => {
            t.state = ThreadState::Ready;
            rt.ready_queue.push_back(id);
            true
        }
        _ => false,
    })
    .unwrap_or(false);

    if !woken {
        log::debug!("wake-up for {id} ignored (not blocked here)");
    }
}

/// Id of the running thread, or `None` outside the runtime.
pub fn current() -> Option<ThreadId> {
    with_runtime(|rt| rt.current).flatten()
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Threads the runtime currently owns (any state).
    pub live_threads: usize,
    /// Length of the ready queue.
    pub ready_threads: usize,
    /// The running thread, if any.
    pub current: Option<ThreadId>,
    /// Context switches performed since bootstrap.
    pub context_switches: u64,
}

/// Snapshot the scheduler counters. All zeros outside the runtime.
pub fn stats() -> SchedulerStats {
    with_runtime(|rt| SchedulerStats {
        live_threads: rt.threads.len(),
        ready_threads: rt.ready_queue.len(),
        current: rt.current,
        context_switches: rt.context_switches,
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The library test binary never bootstraps a runtime, so these check
    // the outside-the-runtime guards.

    #[test]
    fn stats_are_zero_without_a_runtime() {
        assert_eq!(stats(), SchedulerStats::default());
    }

    #[test]
    fn current_is_none_without_a_runtime() {
        assert_eq!(current(), None);
    }

    #[test]
    fn yield_outside_the_runtime_is_a_no_op() {
        yield_now();
    }
}
