//! Asserts that a `WaitQueue` releases threads in the order of priority, and
//! threads of the same priority in a FIFO order.
use duet_kernel::{BlockResult, KernelTraits, Thread, WaitQueue};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

/// `(priority, position in the wake-up order)`
///
/// The last thread is raised to priority `5` while waiting.
const THREADS: [(usize, usize); 4] = [(20, 2), (10, 1), (20, 3), (15, 0)];

pub struct App<Traits: KernelTraits> {
    threads: [Thread<Traits>; 4],
    stacks: [TestStack; 4],
    wait_queue: WaitQueue<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            threads: [Thread::new(), Thread::new(), Thread::new(), Thread::new()],
            stacks: [
                TestStack::new(),
                TestStack::new(),
                TestStack::new(),
                TestStack::new(),
            ],
            wait_queue: WaitQueue::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();

    // Each thread blocks as soon as it starts
    for ((thread, stack), &(priority, order)) in
        app.threads.iter().zip(&app.stacks).zip(&THREADS)
    {
        thread
            .prepare(thread_body::<Traits, D>, order, stack, priority)
            .unwrap();
        thread.start().unwrap();
    }

    app.threads[3].set_priority(5).unwrap();

    // Wake up the threads one by one. Each one runs before `unblock_*`
    // returns.
    for i in 0..THREADS.len() {
        assert_eq!(app.wait_queue.unblock_one_by_mask(0), Ok(false));
        assert_eq!(app.wait_queue.unblock_one_by_value(0), Ok(true));
        assert_eq!(app.seq.get(), i + 1);
    }

    assert_eq!(app.wait_queue.is_empty(), Ok(true));

    D::success();
    0
}

fn thread_body<Traits: KernelTraits, D: Driver<App<Traits>>>(order: usize) -> i32 {
    let app = D::app();
    assert_eq!(app.wait_queue.block(0), Ok(BlockResult::Value));

    log::trace!("woken up, order = {order}");
    app.seq.expect_and_replace(order, order + 1);
    0
}
