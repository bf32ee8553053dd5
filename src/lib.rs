/*
 * weft - Cooperative User-Space Threads
 *
 * This crate implements a non-preemptive thread runtime on top of a raw
 * save/restore/swap context primitive. The host program hands run() an
 * entry closure; threads then run to completion and transfer control only
 * at explicit library calls.
 *
 * Why this is interesting:
 * - Scheduler design without a kernel: one FIFO ready queue, one current
 *   thread, a host context to fall back to
 * - Resource lifetimes across stack switches: a thread cannot free the
 *   stack it runs on, so every thread's end routes through a dedicated
 *   reaper context
 * - Join/wait synchronization built from nothing but queues and id sets:
 *   parent/child links, blocker sets, counting semaphores with FIFO
 *   hand-off
 *
 * Quick tour:
 *
 * ```
 * use std::sync::{Arc, Mutex};
 *
 * let log = Arc::new(Mutex::new(Vec::new()));
 * let sink = log.clone();
 * weft::run(move || {
 *     let sink2 = sink.clone();
 *     let child = weft::spawn(move || {
 *         sink2.lock().unwrap().push("child");
 *     });
 *     weft::join(child).unwrap();
 *     sink.lock().unwrap().push("parent");
 * });
 * assert_eq!(*log.lock().unwrap(), ["child", "parent"]);
 * ```
 *
 * Scheduling is strictly cooperative: no preemption, no time slicing, no
 * cross-core parallelism. Everything runs on whichever host thread called
 * run().
 */

mod scheduler;

pub use scheduler::{
    JoinError, SchedulerStats, Semaphore, SemaphoreError, THREAD_STACK_SIZE, ThreadId,
    ThreadState, current, exit, join, join_all, run, spawn, stats, yield_now,
};
