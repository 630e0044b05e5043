//! Checks that `System::yield_now` passes the processor to the next thread
//! of the same priority.
use duet_kernel::{KernelTraits, System, Thread};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread2: Thread<Traits>,
    stacks: [TestStack; 2],
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread2: Thread::new(),
            stacks: [TestStack::new(), TestStack::new()],
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    app.thread1
        .prepare(thread_body::<Traits, D>, 1, &app.stacks[0], 40)
        .unwrap();
    app.thread2
        .prepare(thread_body::<Traits, D>, 2, &app.stacks[1], 40)
        .unwrap();
    app.thread1.start().unwrap();
    app.thread2.start().unwrap();

    app.thread2.join().unwrap();
    app.seq.expect_and_replace(5, 6);

    D::success();
    0
}

fn thread_body<Traits: KernelTraits, D: Driver<App<Traits>>>(i: usize) -> i32 {
    let app = D::app();

    app.seq.expect_and_replace(i, i + 1);
    System::<Traits>::yield_now().unwrap();
    app.seq.expect_and_replace(i + 2, i + 3);
    0
}
