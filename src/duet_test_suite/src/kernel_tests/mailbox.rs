//! Sends and receives messages through a [`duet_kernel::Mailbox`].
use arrayvec::ArrayVec;
use duet_kernel::{
    KernelTraits, Mailbox, RecvMailboxError, SendMailboxError, Thread, TryRecvMailboxError,
};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

const CAPACITY: usize = 3;

pub struct App<Traits: KernelTraits> {
    receiver: Thread<Traits>,
    receiver_stack: TestStack,
    mailbox: Mailbox<Traits, CAPACITY>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            receiver: Thread::new(),
            receiver_stack: TestStack::new(),
            mailbox: Mailbox::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    assert_eq!(app.mailbox.try_recv(), Err(TryRecvMailboxError::Timeout));

    for i in 1..=CAPACITY as u32 {
        app.mailbox.try_send(i).unwrap();
    }
    assert_eq!(
        app.mailbox.try_send(42),
        Err(SendMailboxError::QueueOverflow)
    );

    // Messages are received in the order they were sent
    let received: ArrayVec<u32, CAPACITY> = (0..CAPACITY)
        .map(|_| app.mailbox.try_recv().unwrap())
        .collect();
    assert_eq!(received.as_slice(), &[1, 2, 3]);
    assert_eq!(app.mailbox.try_recv(), Err(TryRecvMailboxError::Timeout));

    app.mailbox.try_send(4).unwrap();

    // The receiver takes the pending message and then blocks
    app.receiver
        .prepare(receiver_body::<Traits, D>, 0, &app.receiver_stack, 10)
        .unwrap();
    app.receiver.start().unwrap();
    app.seq.expect_and_replace(2, 3);

    // Each message wakes up the receiver
    app.mailbox.try_send(5).unwrap();
    app.seq.expect_and_replace(4, 5);

    app.receiver.cancel_wait().unwrap();
    app.seq.expect_and_replace(6, 7);

    D::success();
    0
}

fn receiver_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(1, 2);

    assert_eq!(app.mailbox.recv(), Ok(4));
    assert_eq!(app.mailbox.recv(), Ok(5));
    app.seq.expect_and_replace(3, 4);

    assert_eq!(app.mailbox.recv(), Err(RecvMailboxError::Interrupted));
    app.seq.expect_and_replace(5, 6);
    0
}
