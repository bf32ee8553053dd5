/*
 * Reaper Trampoline
 *
 * A thread cannot free the stack it is running on. Every thread's end —
 * natural return from its entry closure or an explicit exit() — therefore
 * performs a one-way transfer into this dedicated context, which runs on
 * its own stack owned by the runtime.
 *
 * The reaper loop:
 *   1. free the finished thread's storage (stack included)
 *   2. ready queue empty -> clear `current`, restore the host context;
 *      run() returns
 *   3. otherwise pop the head, make it current, and swap into it —
 *      saving the reaper's own position so the next finished thread
 *      re-enters the loop right here
 *
 * Exit-time bookkeeping (unlinking from the parent, waking a joiner,
 * detaching children) has already happened on the finished thread's own
 * stack before control arrives here, so by the time storage is freed no
 * reference to the thread remains anywhere.
 */

use super::context::{self, ThreadContext};
use super::thread::ThreadState;

/// Entry routine of the reaper context. Never returns; the runtime ends
/// by restoring the host context instead.
pub(crate) unsafe extern "C" fn reaper_main() -> ! {
    loop {
        enum Next {
            Run(*mut ThreadContext, *const ThreadContext),
            Host(*const ThreadContext),
        }

        let next = super::with_runtime(|rt| {
            let dead = rt
                .current
                .expect("reaper entered without a finished thread");
            let thread = rt
                .threads
                .remove(&dead)
                .expect("finished thread missing from registry");
            debug_assert_eq!(thread.state, ThreadState::Finished);
            log::debug!("reaped {} ({} byte stack freed)", thread.name, thread.stack.len());
            drop(thread);

            match rt.ready_queue.pop_front() {
                Some(id) => {
                    rt.current = Some(id);
                    rt.context_switches += 1;
                    rt.threads
                        .get_mut(&id)
                        .expect("queued thread missing from registry")
                        .state = ThreadState::Running;
                    let reaper_ptr: *mut ThreadContext = &mut *rt.reaper_context;
                    let next_ptr: *const ThreadContext = &*rt
                        .threads
                        .get(&id)
                        .expect("queued thread missing from registry")
                        .context;
                    Next::Run(reaper_ptr, next_ptr)
                }
                None => {
                    rt.current = None;
                    Next::Host(&*rt.host_context as *const ThreadContext)
                }
            }
        })
        .expect("reaper running without a runtime");

        match next {
            // Swap rather than load: the reaper's saved position is what
            // the next finished thread transfers back into.
            Next::Run(reaper, thread) => unsafe { context::switch_context(reaper, thread) },
            Next::Host(host) => unsafe { context::load_context(host) },
        }
    }
}
