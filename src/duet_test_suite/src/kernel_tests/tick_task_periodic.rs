//! Runs a periodic tick task whose first callback is delayed and checks that
//! the later callbacks still fire on schedule.
use core::{
    pin::Pin,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
use duet_kernel::{BlockResult, KernelTraits, System, TickTask, WaitQueue};

use super::Driver;

const DELAY: u32 = 10;
const PERIOD: u32 = 50;
const COUNT: usize = 4;
/// How late the first callback runs
const LATENESS: u32 = 30;

pub struct App<Traits: KernelTraits> {
    task: TickTask<Traits>,
    start: AtomicU64,
    count: AtomicUsize,
    done: WaitQueue<Traits>,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            task: TickTask::new(),
            start: AtomicU64::new(0),
            count: AtomicUsize::new(0),
            done: WaitQueue::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    let task = Pin::static_ref(&app.task);

    assert_eq!(task.is_pending(), Ok(false));

    app.start.store(System::<Traits>::tick_count(), Ordering::Relaxed);
    task.start(callback::<Traits, D>, 42, DELAY, PERIOD).unwrap();
    assert_eq!(task.is_pending(), Ok(true));

    // Keep the processor busy past the first deadline. The first callback
    // runs as soon as the timer interrupt can be taken.
    D::advance_time(DELAY + LATENESS);
    assert_eq!(app.count.load(Ordering::Relaxed), 1);

    // The callback wakes us up after the last period
    assert_eq!(app.done.block(0), Ok(BlockResult::Value));

    assert_eq!(app.count.load(Ordering::Relaxed), COUNT);
    assert_eq!(task.is_pending(), Ok(false));

    D::success();
    0
}

fn callback<Traits: KernelTraits, D: Driver<App<Traits>>>(param: usize) {
    let app = D::app();
    assert_eq!(param, 42);

    let i = app.count.fetch_add(1, Ordering::Relaxed);
    let now = System::<Traits>::tick_count();
    let scheduled = app.start.load(Ordering::Relaxed)
        + u64::from(DELAY)
        + u64::from(PERIOD) * i as u64;
    log::trace!("callback #{i} at {now} (scheduled: {scheduled})");

    if i == 0 {
        assert_eq!(now, scheduled + u64::from(LATENESS));
    } else {
        // Firing late doesn't shift the later periods
        assert_eq!(now, scheduled);
    }

    // The next period is already scheduled
    let task = Pin::static_ref(&app.task);
    assert_eq!(task.is_pending(), Ok(true));

    if i + 1 == COUNT {
        task.stop().unwrap();
        assert_eq!(app.done.unblock_one_by_value(0), Ok(true));
    }
}
