//! Cancels blocked operations with `WaitQueue::cancel` and
//! `Thread::cancel_wait`.
use duet_kernel::{BlockResult, CancelWaitError, KernelTraits, Thread, WaitQueue};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread1_stack: TestStack,
    wait_queue: WaitQueue<Traits>,
    other_queue: WaitQueue<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread1_stack: TestStack::new(),
            wait_queue: WaitQueue::new(),
            other_queue: WaitQueue::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    app.thread1
        .prepare(thread1_body::<Traits, D>, 0, &app.thread1_stack, 10)
        .unwrap();

    // Not waiting
    assert_eq!(
        app.wait_queue.cancel(&app.thread1),
        Err(CancelWaitError::BadObjectState)
    );
    assert_eq!(
        app.thread1.cancel_wait(),
        Err(CancelWaitError::BadObjectState)
    );

    app.thread1.start().unwrap();
    app.seq.expect_and_replace(2, 3);

    // Waiting, but in another queue
    assert_eq!(
        app.other_queue.cancel(&app.thread1),
        Err(CancelWaitError::BadObjectState)
    );

    app.wait_queue.cancel(&app.thread1).unwrap();
    app.seq.expect_and_replace(4, 5);

    app.thread1.cancel_wait().unwrap();
    app.seq.expect_and_replace(6, 7);

    assert_eq!(
        app.wait_queue.cancel(&app.thread1),
        Err(CancelWaitError::BadObjectState)
    );
    assert_eq!(app.wait_queue.is_empty(), Ok(true));

    D::success();
    0
}

fn thread1_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(1, 2);

    let result = app.wait_queue.block(0xffff_ffff).unwrap();
    assert_eq!(result, BlockResult::Canceled);
    assert_eq!(result.to_raw(), 0);
    app.seq.expect_and_replace(3, 4);

    assert_eq!(app.wait_queue.block(1), Ok(BlockResult::Canceled));
    app.seq.expect_and_replace(5, 6);
    0
}
