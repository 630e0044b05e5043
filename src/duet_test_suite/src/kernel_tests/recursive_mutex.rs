//! Locks a [`duet_kernel::RecursiveMutex`] repeatedly and checks that it's
//! released with the last guard.
use assert_matches::assert_matches;
use duet_kernel::{KernelTraits, RecursiveMutex, Thread, ThreadStatus, TryLockMutexError};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread1_stack: TestStack,
    m: RecursiveMutex<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread1_stack: TestStack::new(),
            m: RecursiveMutex::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    let g1 = app.m.lock().unwrap();
    let g2 = app.m.lock().unwrap();
    let g3 = app.m.try_lock().unwrap();
    assert!(core::ptr::eq(g3.mutex(), &app.m));
    assert_eq!(app.m.is_locked(), Ok(true));

    drop(g3);
    drop(g2);
    assert_eq!(app.m.is_locked(), Ok(true));

    app.thread1
        .prepare(thread1_body::<Traits, D>, 0, &app.thread1_stack, 10)
        .unwrap();
    app.thread1.start().unwrap();

    app.seq.expect_and_replace(2, 3);
    assert_eq!(app.thread1.status(), Ok(ThreadStatus::WaitingOnMutex));

    // The last guard releases the mutex
    drop(g1);
    app.seq.expect_and_replace(4, 5);
    assert_eq!(app.m.is_locked(), Ok(false));

    D::success();
    0
}

fn thread1_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(1, 2);

    assert_matches!(app.m.try_lock(), Err(TryLockMutexError::Timeout));

    let g1 = app.m.lock().unwrap();
    app.seq.expect_and_replace(3, 4);

    let g2 = app.m.lock().unwrap();
    drop(g1);
    assert_eq!(app.m.is_locked(), Ok(true));
    drop(g2);
    assert_eq!(app.m.is_locked(), Ok(false));
    0
}
