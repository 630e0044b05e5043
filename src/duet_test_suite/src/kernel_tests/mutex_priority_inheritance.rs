//! Checks that the owner of a mutex inherits the priority of the threads
//! waiting for it, also through a chain of mutexes.
use duet_kernel::{KernelTraits, Mutex, System, Thread, MAIN_THREAD_PRIORITY};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    high: Thread<Traits>,
    mid: Thread<Traits>,
    chained: Thread<Traits>,
    stacks: [TestStack; 3],
    m1: Mutex<Traits>,
    m2: Mutex<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            high: Thread::new(),
            mid: Thread::new(),
            chained: Thread::new(),
            stacks: [TestStack::new(), TestStack::new(), TestStack::new()],
            m1: Mutex::new(),
            m2: Mutex::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    let me = System::<Traits>::current_thread().unwrap();
    app.seq.expect_and_replace(0, 1);

    let g1 = app.m1.lock().unwrap();

    // `chained` (priority 40) takes `m2` and then blocks on `m1`
    app.chained
        .prepare(chained_body::<Traits, D>, 0, &app.stacks[2], 40)
        .unwrap();
    app.chained.start().unwrap();
    app.seq.expect_and_replace(1, 2);
    me.set_priority(50).unwrap();

    // `chained` ran and is blocked on `m1`. `m1`'s waiters don't outrank us.
    app.seq.expect_and_replace(3, 4);
    assert_eq!(me.effective_priority(), Ok(40));
    me.set_priority(MAIN_THREAD_PRIORITY).unwrap();
    assert_eq!(me.effective_priority(), Ok(MAIN_THREAD_PRIORITY));

    // `high` blocks on `m2`, which is held by `chained`, which is blocked on
    // `m1`, which is held by us
    app.high
        .prepare(high_body::<Traits, D>, 0, &app.stacks[0], 5)
        .unwrap();
    app.high.start().unwrap();
    app.seq.expect_and_replace(5, 6);

    assert_eq!(app.chained.effective_priority(), Ok(5));
    assert_eq!(me.effective_priority(), Ok(5));
    assert_eq!(me.priority(), Ok(MAIN_THREAD_PRIORITY));

    // Priority changes propagate along the chain
    app.high.set_priority(3).unwrap();
    assert_eq!(me.effective_priority(), Ok(3));
    app.high.set_priority(5).unwrap();
    assert_eq!(me.effective_priority(), Ok(5));

    // `mid` doesn't preempt us because of the inherited priority
    app.mid
        .prepare(mid_body::<Traits, D>, 0, &app.stacks[1], 10)
        .unwrap();
    app.mid.start().unwrap();
    app.seq.expect_and_replace(6, 7);

    // Releasing `m1` restores our priority, letting `chained`, `high`,
    // and `mid` run in this order. `chained` drops back to its base
    // priority after releasing `m2`.
    drop(g1);
    app.seq.expect_and_replace(10, 11);
    assert_eq!(me.effective_priority(), Ok(MAIN_THREAD_PRIORITY));

    app.chained.join().unwrap();
    app.seq.expect_and_replace(12, 13);

    D::success();
    0
}

fn chained_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(2, 3);

    let g2 = app.m2.lock().unwrap();
    let g1 = app.m1.lock().unwrap();
    app.seq.expect_and_replace(7, 8);

    // We inherit `high`'s priority while holding `m2`
    let me = System::<Traits>::current_thread().unwrap();
    assert_eq!(me.effective_priority(), Ok(5));

    drop(g1);
    drop(g2);

    // `high`, `mid`, and the main thread have run
    app.seq.expect_and_replace(11, 12);
    assert_eq!(me.effective_priority(), Ok(40));
    0
}

fn high_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(4, 5);

    let g2 = app.m2.lock().unwrap();
    app.seq.expect_and_replace(8, 9);
    drop(g2);
    0
}

fn mid_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    D::app().seq.expect_and_replace(9, 10);
    0
}
