/*
 * Semaphore Integration Tests
 *
 * Blocking semaphore behavior driven through the real runtime: mutual
 * exclusion under forced interleaving, producer/consumer hand-off, FIFO
 * wake order, and destroy-with-waiters refusal.
 *
 * Same conventions as tests/lifecycle.rs: #[serial] because the runtime
 * is process-wide, and all assertions happen host-side after run()
 * returns.
 */

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use serial_test::serial;

use weft::{Semaphore, SemaphoreError};

#[test]
#[serial]
fn mutual_exclusion_under_forced_interleaving() {
    const ROUNDS: i32 = 1000;
    let lock = Semaphore::new(1).unwrap();
    let counter = Arc::new(Mutex::new(0i32));

    let outer = counter.clone();
    weft::run(move || {
        for _ in 0..2 {
            let shared = outer.clone();
            weft::spawn(move || {
                for _ in 0..ROUNDS {
                    lock.wait();
                    // Deliberately racy read-yield-write: only the
                    // semaphore keeps the two workers from losing
                    // updates.
                    let seen = *shared.lock().unwrap();
                    weft::yield_now();
                    *shared.lock().unwrap() = seen + 1;
                    lock.signal();
                }
            });
        }
        weft::join_all();
    });

    assert_eq!(*counter.lock().unwrap(), 2 * ROUNDS);
    assert_eq!(lock.value(), Some(1));
    lock.destroy().unwrap();
}

#[test]
#[serial]
fn producer_consumer_with_a_semaphore_pair() {
    let full = Semaphore::new(0).unwrap();
    let empty = Semaphore::new(1).unwrap();
    let slot = Arc::new(AtomicI32::new(0));
    let consumed = Arc::new(Mutex::new(Vec::new()));

    let producer_slot = slot.clone();
    let consumer_slot = slot.clone();
    let sink = consumed.clone();
    weft::run(move || {
        weft::spawn(move || {
            for i in 1..=5 {
                empty.wait();
                producer_slot.store(i, Ordering::SeqCst);
                full.signal();
            }
        });
        weft::spawn(move || {
            for _ in 0..5 {
                full.wait();
                sink.lock().unwrap().push(consumer_slot.load(Ordering::SeqCst));
                empty.signal();
            }
        });
        weft::join_all();
    });

    assert_eq!(*consumed.lock().unwrap(), [1, 2, 3, 4, 5]);
    assert_eq!(full.value(), Some(0));
    assert_eq!(empty.value(), Some(1));
    full.destroy().unwrap();
    empty.destroy().unwrap();
}

#[test]
#[serial]
fn waiters_are_woken_in_arrival_order() {
    let gate = Semaphore::new(0).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let outer = order.clone();
    weft::run(move || {
        for tag in ["first", "second", "third"] {
            let sink = outer.clone();
            weft::spawn(move || {
                gate.wait();
                sink.lock().unwrap().push(tag);
            });
        }
        // One yield lets every waiter run up to its wait() and block.
        weft::yield_now();
        for _ in 0..3 {
            gate.signal();
        }
        weft::join_all();
    });

    assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
    gate.destroy().unwrap();
}

#[test]
#[serial]
fn a_woken_waiter_consumes_the_signal_not_the_count() {
    let gate = Semaphore::new(0).unwrap();
    let observed = Arc::new(Mutex::new(None));

    let outer = observed.clone();
    weft::run(move || {
        weft::spawn(move || {
            gate.wait();
        });
        weft::yield_now();
        gate.signal();
        // The ticket went straight to the waiter: count still zero.
        *outer.lock().unwrap() = Some(gate.value());
        weft::join_all();
    });

    assert_eq!(*observed.lock().unwrap(), Some(Some(0)));
    assert_eq!(gate.waiter_count(), 0);
    gate.destroy().unwrap();
}

#[test]
#[serial]
fn destroy_with_waiters_is_refused() {
    let gate = Semaphore::new(0).unwrap();
    let verdict = Arc::new(Mutex::new(None));
    let waiters_seen = Arc::new(Mutex::new(None));

    let outer_verdict = verdict.clone();
    let outer_waiters = waiters_seen.clone();
    weft::run(move || {
        weft::spawn(move || {
            gate.wait();
        });
        weft::yield_now();
        *outer_waiters.lock().unwrap() = Some(gate.waiter_count());
        *outer_verdict.lock().unwrap() = Some(gate.destroy());
        // Release the waiter so the runtime drains cleanly.
        gate.signal();
        weft::join_all();
    });

    assert_eq!(*waiters_seen.lock().unwrap(), Some(1));
    assert_eq!(*verdict.lock().unwrap(), Some(Err(SemaphoreError::Busy)));
    // The refused destroy left the semaphore fully operational.
    assert_eq!(gate.value(), Some(0));
    gate.destroy().unwrap();
}

#[test]
#[serial]
fn a_blocked_waiter_is_not_in_the_ready_queue() {
    let gate = Semaphore::new(0).unwrap();
    let snapshot = Arc::new(Mutex::new(None));

    let outer = snapshot.clone();
    weft::run(move || {
        weft::spawn(move || {
            gate.wait();
        });
        weft::yield_now();
        // Two live threads, but the waiter sits in the semaphore queue,
        // not the ready queue, and we are the only runnable thread.
        *outer.lock().unwrap() = Some((weft::stats(), gate.waiter_count()));
        gate.signal();
        weft::join_all();
    });

    let (stats, waiters) = snapshot.lock().unwrap().take().unwrap();
    assert_eq!(stats.live_threads, 2);
    assert_eq!(stats.ready_threads, 0);
    assert_eq!(waiters, 1);
    gate.destroy().unwrap();
}

#[test]
#[serial]
fn signalling_an_idle_semaphore_banks_tickets_for_later_waits() {
    let gate = Semaphore::new(0).unwrap();
    let reached = Arc::new(Mutex::new(Vec::new()));

    let outer = reached.clone();
    weft::run(move || {
        gate.signal();
        gate.signal();
        let sink = outer.clone();
        weft::spawn(move || {
            // Both tickets are banked: neither wait blocks.
            gate.wait();
            gate.wait();
            sink.lock().unwrap().push("through");
        });
        weft::join_all();
    });

    assert_eq!(*reached.lock().unwrap(), ["through"]);
    assert_eq!(gate.value(), Some(0));
    gate.destroy().unwrap();
}
