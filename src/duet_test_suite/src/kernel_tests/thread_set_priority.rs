//! Changes thread priorities and checks the resulting preemption.
use duet_kernel::{
    GetThreadPriorityError, KernelTraits, SetThreadPriorityError, System, Thread,
    MAIN_THREAD_PRIORITY,
};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread1_stack: TestStack,
    never_prepared: Thread<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread1_stack: TestStack::new(),
            never_prepared: Thread::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    assert_eq!(
        app.never_prepared.set_priority(1),
        Err(SetThreadPriorityError::BadObjectState)
    );
    assert_eq!(
        app.never_prepared.priority(),
        Err(GetThreadPriorityError::BadObjectState)
    );

    app.thread1
        .prepare(thread1_body::<Traits, D>, 0, &app.thread1_stack, 40)
        .unwrap();
    app.thread1.start().unwrap();
    assert_eq!(app.thread1.priority(), Ok(40));

    assert_eq!(
        app.thread1.set_priority(64),
        Err(SetThreadPriorityError::BadParam)
    );

    // Raising the priority of a ready thread preempts the caller
    app.thread1.set_priority(10).unwrap();

    // `thread1` lowered its own priority below ours
    app.seq.expect_and_replace(2, 3);
    assert_eq!(app.thread1.priority(), Ok(50));
    assert_eq!(app.thread1.effective_priority(), Ok(50));

    // Lowering our own priority below a ready thread yields the processor
    let me = System::<Traits>::current_thread().unwrap();
    me.set_priority(60).unwrap();
    app.seq.expect_and_replace(4, 5);

    me.set_priority(MAIN_THREAD_PRIORITY).unwrap();
    assert_eq!(me.priority(), Ok(MAIN_THREAD_PRIORITY));

    D::success();
    0
}

fn thread1_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(1, 2);
    assert_eq!(app.thread1.priority(), Ok(10));

    app.thread1.set_priority(50).unwrap();
    app.seq.expect_and_replace(3, 4);
    0
}
