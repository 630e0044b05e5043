//! Validates error codes returned by mutex manipulation methods. Also,
//! checks miscellaneous properties of [`duet_kernel::Mutex`].
use assert_matches::assert_matches;
use duet_kernel::{
    KernelTraits, LockMutexError, Mutex, System, Thread, ThreadStatus, TryLockMutexError,
};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread2: Thread<Traits>,
    stacks: [TestStack; 2],
    m: [Mutex<Traits>; 2],
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread2: Thread::new(),
            stacks: [TestStack::new(), TestStack::new()],
            m: [Mutex::new(), Mutex::new()],
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    let [m1, m2] = &app.m;
    let me = System::<Traits>::current_thread().unwrap();

    app.seq.expect_and_replace(0, 1);

    assert_eq!(m1.is_locked(), Ok(false));
    assert_matches!(m1.owner(), Ok(None));

    let g1 = m1.lock().unwrap();
    assert!(core::ptr::eq(g1.mutex(), m1));
    assert_eq!(m1.is_locked(), Ok(true));
    assert_matches!(m1.owner(), Ok(Some(owner)) if core::ptr::eq(owner, me));

    assert_matches!(m1.lock(), Err(LockMutexError::WouldDeadlock));
    assert_matches!(m1.try_lock(), Err(TryLockMutexError::WouldDeadlock));

    // Mutexes can be unlocked in any order
    let g2 = m2.try_lock().unwrap();
    drop(g1);
    assert_eq!(m1.is_locked(), Ok(false));
    assert_eq!(m2.is_locked(), Ok(true));
    drop(g2);
    assert_eq!(m2.is_locked(), Ok(false));

    let g1 = m1.lock().unwrap();

    app.thread1
        .prepare(thread1_body::<Traits, D>, 0, &app.stacks[0], 10)
        .unwrap();
    app.thread1.start().unwrap();

    // `thread1` is blocked on `m1`
    app.seq.expect_and_replace(2, 3);
    assert_eq!(app.thread1.status(), Ok(ThreadStatus::WaitingOnMutex));

    // A canceled lock operation returns `Interrupted`
    app.thread2
        .prepare(thread2_body::<Traits, D>, 0, &app.stacks[1], 5)
        .unwrap();
    app.thread2.start().unwrap();
    app.seq.expect_and_replace(4, 5);
    app.thread2.cancel_wait().unwrap();
    app.seq.expect_and_replace(6, 7);

    // The inherited priority is reevaluated when a waiter leaves
    assert_eq!(me.effective_priority(), Ok(10));

    // Hand `m1` over to `thread1`
    drop(g1);
    app.seq.expect_and_replace(9, 10);

    assert_eq!(m1.is_locked(), Ok(false));
    assert_eq!(app.thread1.status(), Ok(ThreadStatus::Finished));

    D::success();
    0
}

fn thread1_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    let [m1, _] = &app.m;
    app.seq.expect_and_replace(1, 2);

    assert_matches!(m1.try_lock(), Err(TryLockMutexError::Timeout));

    let g1 = m1.lock().unwrap();
    app.seq.expect_and_replace(7, 8);
    assert_matches!(m1.owner(), Ok(Some(owner)) if core::ptr::eq(owner, &app.thread1));

    drop(g1);
    app.seq.expect_and_replace(8, 9);
    0
}

fn thread2_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    let [m1, _] = &app.m;
    app.seq.expect_and_replace(3, 4);

    assert_matches!(m1.lock(), Err(LockMutexError::Interrupted));
    app.seq.expect_and_replace(5, 6);
    0
}
