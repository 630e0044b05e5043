//! Pauses and restarts threads in various states.
use assert_matches::assert_matches;
use duet_kernel::{
    BlockResult, KernelTraits, PauseThreadError, StartThreadError, Thread, ThreadStatus, WaitQueue,
};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread1_stack: TestStack,
    never_prepared: Thread<Traits>,
    wait_queue: WaitQueue<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread1_stack: TestStack::new(),
            never_prepared: Thread::new(),
            wait_queue: WaitQueue::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    assert_eq!(
        app.never_prepared.pause(),
        Err(PauseThreadError::BadObjectState)
    );
    assert_eq!(
        app.never_prepared.start(),
        Err(StartThreadError::BadObjectState)
    );

    app.thread1
        .prepare(thread1_body::<Traits, D>, 0, &app.thread1_stack, 10)
        .unwrap();

    // Pausing a paused thread is a no-op
    app.thread1.pause().unwrap();
    app.thread1.start().unwrap();

    // `thread1` paused itself
    app.seq.expect_and_replace(2, 3);
    assert_eq!(app.thread1.status(), Ok(ThreadStatus::Running));

    app.thread1.start().unwrap();

    // `thread1` is waiting now. Starting it again is a no-op.
    app.thread1.start().unwrap();
    app.seq.expect_and_replace(4, 5);
    assert_eq!(app.thread1.status(), Ok(ThreadStatus::Waiting));

    // A paused thread stays out of the ready queue after its wait completes
    app.thread1.pause().unwrap();
    app.thread1.cancel_wait().unwrap();
    assert_eq!(app.thread1.status(), Ok(ThreadStatus::Running));
    app.seq.expect_and_replace(5, 6);

    app.thread1.start().unwrap();
    app.seq.expect_and_replace(7, 8);

    assert_eq!(app.thread1.status(), Ok(ThreadStatus::Finished));
    assert_eq!(app.thread1.pause(), Err(PauseThreadError::BadObjectState));
    assert_eq!(app.thread1.start(), Err(StartThreadError::BadObjectState));

    D::success();
    0
}

fn thread1_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(1, 2);

    app.thread1.pause().unwrap();
    app.seq.expect_and_replace(3, 4);

    assert_matches!(app.wait_queue.block(0), Ok(BlockResult::Canceled));
    app.seq.expect_and_replace(6, 7);
    0
}
