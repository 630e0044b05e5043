//! Checks the return codes of disallowed system calls made in an interrupt
//! context.
use assert_matches::assert_matches;
use core::pin::Pin;
use duet_kernel::{
    BlockError, ExitThreadError, IrqBank, IrqWaitError, JoinThreadError, KernelTraits,
    LockMutexError, Mailbox, Mutex, RecvMailboxError, SleepError, System, Thread, TickTask,
    TryLockMutexError, WaitQueue, YieldError,
};

use super::Driver;
use crate::utils::SeqTracker;

pub struct App<Traits: KernelTraits> {
    m: Mutex<Traits>,
    mailbox: Mailbox<Traits, 1>,
    wait_queue: WaitQueue<Traits>,
    never_prepared: Thread<Traits>,
    timer: TickTask<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            m: Mutex::new(),
            mailbox: Mailbox::new(),
            wait_queue: WaitQueue::new(),
            never_prepared: Thread::new(),
            timer: TickTask::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    System::<Traits>::irq_set(0, Some(isr::<Traits, D>)).unwrap();
    System::<Traits>::irq_enable(1).unwrap();
    D::pend_irq(IrqBank::Primary, 1);

    app.seq.expect_and_replace(2, 3);

    // The message sent by the handler
    assert_eq!(app.mailbox.try_recv(), Ok(42));

    D::success();
    0
}

fn isr<Traits: KernelTraits, D: Driver<App<Traits>>>() {
    let app = D::app();
    app.seq.expect_and_replace(1, 2);

    assert_matches!(app.m.lock(), Err(LockMutexError::BadContext));
    assert_matches!(app.m.try_lock(), Err(TryLockMutexError::BadContext));
    assert_eq!(app.wait_queue.block(0), Err(BlockError::BadContext));
    assert_eq!(app.mailbox.recv(), Err(RecvMailboxError::BadContext));
    assert_eq!(
        System::<Traits>::irq_wait(false, 1),
        Err(IrqWaitError::BadContext)
    );
    assert_eq!(System::<Traits>::sleep_ticks(1), Err(SleepError::BadContext));
    assert_eq!(app.never_prepared.join(), Err(JoinThreadError::BadContext));

    assert_eq!(
        System::<Traits>::timer_wait(Pin::static_ref(&app.timer)),
        Err(SleepError::BadContext)
    );

    // These would act on the interrupted thread
    assert_eq!(System::<Traits>::yield_now(), Err(YieldError::BadContext));
    // Safety: Fails without discarding anything
    assert_matches!(
        unsafe { System::<Traits>::exit_thread(7) },
        Err(ExitThreadError::BadContext)
    );

    // Non-blocking operations are allowed
    assert_eq!(app.wait_queue.unblock_one_by_value(0), Ok(false));
    app.mailbox.try_send(42).unwrap();
    assert_eq!(app.m.is_locked(), Ok(false));
}
