//! Checks that the mutexes held by an exiting thread are handed over to their
//! next waiters.
use assert_matches::assert_matches;
use duet_kernel::{BlockResult, KernelTraits, Mutex, Thread, WaitQueue};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread2: Thread<Traits>,
    stacks: [TestStack; 2],
    m: Mutex<Traits>,
    m_unused: Mutex<Traits>,
    wait_queue: WaitQueue<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread2: Thread::new(),
            stacks: [TestStack::new(), TestStack::new()],
            m: Mutex::new(),
            m_unused: Mutex::new(),
            wait_queue: WaitQueue::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    app.thread1
        .prepare(thread1_body::<Traits, D>, 0, &app.stacks[0], 10)
        .unwrap();
    app.thread1.start().unwrap();
    app.seq.expect_and_replace(2, 3);
    assert_eq!(app.m.is_locked(), Ok(true));
    assert_eq!(app.m_unused.is_locked(), Ok(true));

    app.thread2
        .prepare(thread2_body::<Traits, D>, 0, &app.stacks[1], 20)
        .unwrap();
    app.thread2.start().unwrap();
    app.seq.expect_and_replace(4, 5);

    // Let `thread1` exit while holding the mutexes
    assert_eq!(app.wait_queue.unblock_one_by_value(0), Ok(true));
    app.seq.expect_and_replace(7, 8);

    assert_eq!(app.thread1.join(), Ok(7));
    assert_eq!(app.m.is_locked(), Ok(false));
    assert_eq!(app.m_unused.is_locked(), Ok(false));

    D::success();
    0
}

fn thread1_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(1, 2);

    core::mem::forget(app.m.lock().unwrap());
    core::mem::forget(app.m_unused.lock().unwrap());
    assert_matches!(app.wait_queue.block(0), Ok(BlockResult::Value));

    app.seq.expect_and_replace(5, 6);
    7
}

fn thread2_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(3, 4);

    let guard = app.m.lock().unwrap();
    app.seq.expect_and_replace(6, 7);
    assert_matches!(app.m.owner(), Ok(Some(owner)) if core::ptr::eq(owner, &app.thread2));
    drop(guard);
    0
}
