//! Wakes threads blocked on a `WaitQueue` by value and by mask.
use assert_matches::assert_matches;
use core::num::NonZeroU32;
use duet_kernel::{BlockResult, KernelTraits, Thread, WaitQueue};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread2: Thread<Traits>,
    stacks: [TestStack; 2],
    wait_queue: WaitQueue<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread2: Thread::new(),
            stacks: [TestStack::new(), TestStack::new()],
            wait_queue: WaitQueue::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    assert_eq!(app.wait_queue.is_empty(), Ok(true));
    assert_eq!(app.wait_queue.unblock_one_by_value(5), Ok(false));

    app.thread1
        .prepare(thread1_body::<Traits, D>, 0, &app.stacks[0], 10)
        .unwrap();
    app.thread1.start().unwrap();
    app.seq.expect_and_replace(2, 3);

    app.thread2
        .prepare(thread2_body::<Traits, D>, 0, &app.stacks[1], 10)
        .unwrap();
    app.thread2.start().unwrap();
    app.seq.expect_and_replace(4, 5);

    assert_eq!(app.wait_queue.is_empty(), Ok(false));

    // Neither token equals `0b0100`. `thread2`'s token (`0b0110`) shares a
    // bit with it, but a value unblock needs an exact match.
    assert_eq!(app.wait_queue.unblock_one_by_value(0b0100), Ok(false));
    assert_eq!(app.wait_queue.unblock_all_by_value(0b0100), Ok(0));
    assert_eq!(app.seq.get(), 5);

    assert_eq!(app.wait_queue.unblock_one_by_value(5), Ok(true));
    app.seq.expect_and_replace(6, 7);

    // Doesn't intersect `0b0110`
    assert_eq!(app.wait_queue.unblock_all_by_mask(0b1001), Ok(0));

    assert_eq!(app.wait_queue.unblock_all_by_mask(0b1100), Ok(1));
    app.seq.expect_and_replace(8, 9);

    assert_eq!(app.wait_queue.is_empty(), Ok(true));
    assert_eq!(app.wait_queue.unblock_one_by_mask(u32::MAX), Ok(false));
    assert_eq!(app.wait_queue.unblock_all_by_value(5), Ok(0));

    D::success();
    0
}

fn thread1_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(1, 2);

    let result = app.wait_queue.block(5);
    assert_eq!(result, Ok(BlockResult::Value));
    assert_eq!(result.unwrap().to_raw(), 1);

    app.seq.expect_and_replace(5, 6);
    0
}

fn thread2_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(3, 4);

    let result = app.wait_queue.block(0b0110);
    assert_matches!(result, Ok(BlockResult::Mask(bits)) if bits == NonZeroU32::new(0b0100).unwrap());
    assert_eq!(result.unwrap().to_raw(), 0b0100);

    app.seq.expect_and_replace(7, 8);
    0
}
