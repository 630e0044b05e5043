//! Checks `Thread::join` and the reuse of a finished thread.
use duet_kernel::{JoinThreadError, KernelTraits, PrepareThreadError, System, Thread};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    worker: Thread<Traits>,
    worker_stack: TestStack,
    never_prepared: Thread<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            worker: Thread::new(),
            worker_stack: TestStack::new(),
            never_prepared: Thread::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();

    assert_eq!(
        app.never_prepared.join(),
        Err(JoinThreadError::BadObjectState)
    );
    assert_eq!(app.never_prepared.is_valid(), Ok(false));

    let me = System::<Traits>::current_thread().unwrap();
    assert_eq!(me.join(), Err(JoinThreadError::WouldDeadlock));

    // The worker has a lower priority, so it runs only while we are waiting
    app.worker
        .prepare(worker_body::<Traits, D>, 1, &app.worker_stack, 50)
        .unwrap();
    app.worker.start().unwrap();
    app.seq.expect_and_replace(0, 1);

    assert_eq!(app.worker.join(), Ok(101));
    app.seq.expect_and_replace(2, 3);

    // Joining a finished thread returns the exit code again
    assert_eq!(app.worker.join(), Ok(101));
    assert_eq!(app.worker.is_valid(), Ok(true));

    // A finished thread can be prepared again, but not an active one
    app.worker
        .prepare(worker_body::<Traits, D>, 3, &app.worker_stack, 50)
        .unwrap();
    assert_eq!(
        app.worker
            .prepare(worker_body::<Traits, D>, 3, &app.worker_stack, 50),
        Err(PrepareThreadError::BadObjectState)
    );
    app.worker.start().unwrap();

    assert_eq!(app.worker.join(), Ok(103));
    app.seq.expect_and_replace(4, 5);

    D::success();
    0
}

fn worker_body<Traits: KernelTraits, D: Driver<App<Traits>>>(i: usize) -> i32 {
    D::app().seq.expect_and_replace(i, i + 1);
    100 + i as i32
}
