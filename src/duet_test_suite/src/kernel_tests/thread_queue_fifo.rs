//! Asserts that threads in the same ready queue are processed in a FIFO order.
use duet_kernel::{KernelTraits, Thread};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

const PRIORITY: usize = 10;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    workers: [Thread<Traits>; 3],
    stacks: [TestStack; 4],
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            workers: [Thread::new(), Thread::new(), Thread::new()],
            stacks: [
                TestStack::new(),
                TestStack::new(),
                TestStack::new(),
                TestStack::new(),
            ],
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.thread1
        .prepare(thread1_body::<Traits, D>, 0, &app.stacks[0], PRIORITY)
        .unwrap();
    app.thread1.start().unwrap();
    0
}

fn thread1_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    log::trace!("Good morning, Angel!");
    for (i, (worker, stack)) in app.workers.iter().zip(&app.stacks[1..]).enumerate() {
        worker
            .prepare(worker_body::<Traits, D>, i + 2, stack, PRIORITY)
            .unwrap();
        worker.start().unwrap();
    }

    app.seq.expect_and_replace(1, 2);
    0
}

fn worker_body<Traits: KernelTraits, D: Driver<App<Traits>>>(i: usize) -> i32 {
    D::app().seq.expect_and_replace(i, i + 1);
    log::trace!("*Rabbit noise {i}*");
    if i == 4 {
        D::success();
    }
    0
}
