//! Sleeps for various durations and cancels a sleeping thread.
use duet_kernel::{ticks_from_usec, KernelTraits, SleepError, System, Thread, ThreadStatus};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

const LONG_SLEEP: u32 = 1_000_000;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread1_stack: TestStack,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread1_stack: TestStack::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    let t0 = System::<Traits>::tick_count();
    System::<Traits>::sleep_ticks(0).unwrap();
    assert_eq!(System::<Traits>::tick_count(), t0);

    System::<Traits>::sleep_ticks(100).unwrap();
    let t1 = System::<Traits>::tick_count();
    log::debug!("slept from {t0} to {t1}");
    // Nothing else is running, so the thread becomes ready exactly at the
    // deadline
    assert_eq!(t1, t0 + 100);

    System::<Traits>::sleep(1000).unwrap();
    let t2 = System::<Traits>::tick_count();
    assert_eq!(t2, t1 + u64::from(ticks_from_usec(1000)));

    app.thread1
        .prepare(thread1_body::<Traits, D>, 0, &app.thread1_stack, 10)
        .unwrap();
    app.thread1.start().unwrap();
    app.seq.expect_and_replace(2, 3);
    assert_eq!(app.thread1.status(), Ok(ThreadStatus::Waiting));

    app.thread1.cancel_wait().unwrap();
    app.seq.expect_and_replace(4, 5);

    // The canceled sleep doesn't hold back the next one
    let t3 = System::<Traits>::tick_count();
    System::<Traits>::sleep_ticks(10).unwrap();
    let t4 = System::<Traits>::tick_count();
    assert_eq!(t4, t3 + 10);

    D::success();
    0
}

fn thread1_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(1, 2);

    assert_eq!(
        System::<Traits>::sleep_ticks(LONG_SLEEP),
        Err(SleepError::Interrupted)
    );
    app.seq.expect_and_replace(3, 4);
    0
}
