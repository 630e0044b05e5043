//! Checks that starting a higher-priority thread preempts the caller and
//! starting a lower-priority one doesn't.
use duet_kernel::{KernelTraits, Thread, ThreadStatus};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    low: Thread<Traits>,
    low_stack: TestStack,
    high: Thread<Traits>,
    high_stack: TestStack,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            low: Thread::new(),
            low_stack: TestStack::new(),
            high: Thread::new(),
            high_stack: TestStack::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    app.low
        .prepare(low_body::<Traits, D>, 0, &app.low_stack, 40)
        .unwrap();
    assert_eq!(app.low.status(), Ok(ThreadStatus::Running));
    app.low.start().unwrap();

    // `low` doesn't run yet
    app.seq.expect_and_replace(1, 2);

    app.high
        .prepare(high_body::<Traits, D>, 42, &app.high_stack, 10)
        .unwrap();
    app.high.start().unwrap();

    // `high` has finished
    app.seq.expect_and_replace(3, 4);
    assert_eq!(app.high.status(), Ok(ThreadStatus::Finished));

    // Let `low` run
    assert_eq!(app.low.join(), Ok(7));
    app.seq.expect_and_replace(5, 6);

    D::success();
    0
}

fn high_body<Traits: KernelTraits, D: Driver<App<Traits>>>(param: usize) -> i32 {
    assert_eq!(param, 42);
    D::app().seq.expect_and_replace(2, 3);
    0
}

fn low_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    D::app().seq.expect_and_replace(4, 5);
    7
}
