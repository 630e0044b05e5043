//! Waits on a [`duet_kernel::CondVar`] with a `Mutex` and with a
//! `RecursiveMutex`.
use core::sync::atomic::{AtomicBool, Ordering};
use duet_kernel::{CondVar, KernelTraits, Mutex, RecursiveMutex, Thread, ThreadStatus};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread2: Thread<Traits>,
    thread3: Thread<Traits>,
    stacks: [TestStack; 3],
    m: Mutex<Traits>,
    rm: RecursiveMutex<Traits>,
    cv: CondVar<Traits>,
    /// Protected by `m`
    ready: AtomicBool,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread2: Thread::new(),
            thread3: Thread::new(),
            stacks: [TestStack::new(), TestStack::new(), TestStack::new()],
            m: Mutex::new(),
            rm: RecursiveMutex::new(),
            cv: CondVar::new(),
            ready: AtomicBool::new(false),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    // Signaling without waiters is a no-op
    app.cv.signal().unwrap();
    app.cv.broadcast().unwrap();

    app.thread1
        .prepare(waiter_body::<Traits, D>, 1, &app.stacks[0], 10)
        .unwrap();
    app.thread1.start().unwrap();
    app.seq.expect_and_replace(2, 3);

    app.thread2
        .prepare(waiter_body::<Traits, D>, 3, &app.stacks[1], 10)
        .unwrap();
    app.thread2.start().unwrap();
    app.seq.expect_and_replace(4, 5);

    // The mutex is released while waiting
    assert_eq!(app.m.is_locked(), Ok(false));

    // A spurious wakeup. `thread1` goes back to waiting.
    app.thread1.cancel_wait().unwrap();
    app.seq.expect_and_replace(5, 6);

    let guard = app.m.lock().unwrap();
    app.ready.store(true, Ordering::Relaxed);

    // Wake up both. They can't proceed until we release the mutex.
    app.cv.broadcast().unwrap();
    assert_eq!(app.thread1.status(), Ok(ThreadStatus::WaitingOnMutex));
    assert_eq!(app.thread2.status(), Ok(ThreadStatus::WaitingOnMutex));
    app.seq.expect_and_replace(6, 7);

    drop(guard);
    app.seq.expect_and_replace(9, 10);

    // `wait_recursive` releases all nesting levels and restores them
    app.thread3
        .prepare(recursive_waiter_body::<Traits, D>, 0, &app.stacks[2], 10)
        .unwrap();
    app.thread3.start().unwrap();
    app.seq.expect_and_replace(11, 12);
    assert_eq!(app.rm.is_locked(), Ok(false));

    app.cv.signal().unwrap();
    app.seq.expect_and_replace(13, 14);
    assert_eq!(app.rm.is_locked(), Ok(false));

    D::success();
    0
}

fn waiter_body<Traits: KernelTraits, D: Driver<App<Traits>>>(i: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(i, i + 1);

    let mut guard = app.m.lock().unwrap();
    while !app.ready.load(Ordering::Relaxed) {
        log::trace!("waiting");
        guard = app.cv.wait(guard).unwrap();
        assert_eq!(app.m.is_locked(), Ok(true));
    }

    // `thread1` re-entered the queue after the spurious wakeup, so `thread2`
    // is released first
    let n = app.seq.get();
    app.seq.expect_and_replace(n, n + 1);
    assert!(n == 7 || n == 8);
    assert_eq!(n == 7, i == 3);
    drop(guard);
    0
}

fn recursive_waiter_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(10, 11);

    let g1 = app.rm.lock().unwrap();
    let g2 = app.rm.lock().unwrap();
    let g2 = app.cv.wait_recursive(g2).unwrap();
    app.seq.expect_and_replace(12, 13);

    drop(g2);
    assert_eq!(app.rm.is_locked(), Ok(true));
    drop(g1);
    0
}
