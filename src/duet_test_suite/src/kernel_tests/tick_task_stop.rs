//! Stops and restarts one-shot tick tasks.
use core::{
    pin::Pin,
    sync::atomic::{AtomicUsize, Ordering},
};
use duet_kernel::{KernelTraits, System, TickTask};

use super::Driver;

pub struct App<Traits: KernelTraits> {
    task: TickTask<Traits>,
    count: AtomicUsize,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            task: TickTask::new(),
            count: AtomicUsize::new(0),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    let task = Pin::static_ref(&app.task);

    // Stopping a stopped task is a no-op
    task.stop().unwrap();

    // A stopped task doesn't fire
    task.start(callback::<Traits, D>, 0, 100, 0).unwrap();
    assert_eq!(task.is_pending(), Ok(true));
    task.stop().unwrap();
    task.stop().unwrap();
    assert_eq!(task.is_pending(), Ok(false));
    System::<Traits>::sleep_ticks(200).unwrap();
    assert_eq!(app.count.load(Ordering::Relaxed), 0);

    // A one-shot task fires once and then stops by itself
    task.start(callback::<Traits, D>, 0, 10, 0).unwrap();
    System::<Traits>::sleep_ticks(20).unwrap();
    assert_eq!(app.count.load(Ordering::Relaxed), 1);
    assert_eq!(task.is_pending(), Ok(false));

    // Starting a pending task reschedules it
    task.start(callback::<Traits, D>, 0, 10, 0).unwrap();
    task.start(callback::<Traits, D>, 0, 30, 0).unwrap();
    System::<Traits>::sleep_ticks(15).unwrap();
    assert_eq!(app.count.load(Ordering::Relaxed), 1);
    assert_eq!(task.is_pending(), Ok(true));
    System::<Traits>::sleep_ticks(20).unwrap();
    assert_eq!(app.count.load(Ordering::Relaxed), 2);

    // A task due at the same tick as a sleep fires before the sleeper resumes
    task.start(callback::<Traits, D>, 0, 10, 0).unwrap();
    System::<Traits>::sleep_ticks(10).unwrap();
    assert_eq!(app.count.load(Ordering::Relaxed), 3);

    D::success();
    0
}

fn callback<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) {
    let n = D::app().count.fetch_add(1, Ordering::Relaxed);
    log::trace!("callback #{n} at {}", System::<Traits>::tick_count());
}
