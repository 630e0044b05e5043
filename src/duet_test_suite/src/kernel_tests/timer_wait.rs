//! Waits for a periodic timer with `System::timer_wait`.
use core::pin::Pin;
use duet_kernel::{ticks_from_hz, KernelTraits, SleepError, System, Thread, TickTask};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

const PERIOD: u32 = 100;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread1_stack: TestStack,
    timer: TickTask<Traits>,
    other_timer: TickTask<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread1_stack: TestStack::new(),
            timer: TickTask::new(),
            other_timer: TickTask::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    let timer = Pin::static_ref(&app.timer);
    app.seq.expect_and_replace(0, 1);

    let start = System::<Traits>::tick_count();
    System::<Traits>::timer_start_ticks(timer, PERIOD).unwrap();

    // `thread1` waits for the same timer
    app.thread1
        .prepare(thread1_body::<Traits, D>, 0, &app.thread1_stack, 10)
        .unwrap();
    app.thread1.start().unwrap();
    app.seq.expect_and_replace(2, 3);

    // Every waiter is released by each period
    for i in 1..=3 {
        System::<Traits>::timer_wait(timer).unwrap();
        let now = System::<Traits>::tick_count();
        log::trace!("period #{i} at {now}");
        assert!(now >= start + u64::from(PERIOD) * i);
        assert!(now < start + u64::from(PERIOD) * (i + 1));
    }
    app.seq.expect_and_replace(4, 5);

    // A canceled wait returns `Interrupted`
    app.thread1.cancel_wait().unwrap();
    app.seq.expect_and_replace(6, 7);

    // Restart the timer with a frequency. Another timer firing more often
    // doesn't wake the waiters of this one.
    let other_timer = Pin::static_ref(&app.other_timer);
    let start = System::<Traits>::tick_count();
    System::<Traits>::timer_start(timer, 60).unwrap();
    System::<Traits>::timer_start_ticks(other_timer, 1000).unwrap();
    System::<Traits>::timer_wait(timer).unwrap();
    assert_eq!(
        System::<Traits>::tick_count(),
        start + u64::from(ticks_from_hz(60))
    );

    other_timer.stop().unwrap();
    timer.stop().unwrap();
    assert_eq!(timer.is_pending(), Ok(false));

    D::success();
    0
}

fn thread1_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    let timer = Pin::static_ref(&app.timer);
    app.seq.expect_and_replace(1, 2);

    for _ in 0..3 {
        System::<Traits>::timer_wait(timer).unwrap();
    }
    app.seq.expect_and_replace(3, 4);

    assert_eq!(
        System::<Traits>::timer_wait(timer),
        Err(SleepError::Interrupted)
    );
    app.seq.expect_and_replace(5, 6);
    0
}
