//! Waits for interrupts with `System::irq_wait` and checks the handlers,
//! masking, and the latching of lines nobody is waiting for.
use core::pin::Pin;
use duet_kernel::{
    IrqBank, IrqConfigError, IrqWaitError, KernelTraits, System, Thread, TickTask, NUM_IRQ_LINES,
};

use super::{Driver, TestStack};
use crate::utils::SeqTracker;

const LINE_WAITED: u32 = 1 << 3;
const LINE_LATCHED: u32 = 1 << 4;
const LINE_MASKED: u32 = 1 << 5;
const LINE_EXTENDED: u32 = 1 << 0;

pub struct App<Traits: KernelTraits> {
    thread1: Thread<Traits>,
    thread1_stack: TestStack,
    task: TickTask<Traits>,
    seq: SeqTracker,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            thread1: Thread::new(),
            thread1_stack: TestStack::new(),
            task: TickTask::new(),
            seq: SeqTracker::new(),
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(0, 1);

    assert_eq!(
        System::<Traits>::irq_set(NUM_IRQ_LINES, None),
        Err(IrqConfigError::BadParam)
    );
    assert_eq!(
        System::<Traits>::irq_wait(false, 0),
        Err(IrqWaitError::BadParam)
    );

    System::<Traits>::irq_set(3, Some(isr_waited::<Traits, D>)).unwrap();
    System::<Traits>::irq_set(5, Some(isr_masked::<Traits, D>)).unwrap();
    System::<Traits>::irq_enable(LINE_WAITED | LINE_LATCHED).unwrap();
    System::<Traits>::irq_enable2(LINE_EXTENDED).unwrap();

    app.thread1
        .prepare(thread1_body::<Traits, D>, 0, &app.thread1_stack, 10)
        .unwrap();
    app.thread1.start().unwrap();
    app.seq.expect_and_replace(2, 3);

    D::pend_irq(IrqBank::Primary, LINE_WAITED);
    app.seq.expect_and_replace(5, 6);

    D::pend_irq(IrqBank::Extended, LINE_EXTENDED);
    app.seq.expect_and_replace(7, 8);

    // Nobody is waiting for this line, so it's latched until the next wait
    D::pend_irq(IrqBank::Primary, LINE_LATCHED);
    assert_eq!(
        System::<Traits>::irq_wait(false, LINE_WAITED | LINE_LATCHED),
        Ok(LINE_LATCHED)
    );

    // `next_irq` discards the latched state
    D::pend_irq(IrqBank::Primary, LINE_LATCHED);
    let task = Pin::static_ref(&app.task);
    task.start(pend_latched_line::<Traits, D>, 0, 10, 0).unwrap();
    let start = System::<Traits>::tick_count();
    assert_eq!(
        System::<Traits>::irq_wait(true, LINE_LATCHED),
        Ok(LINE_LATCHED)
    );
    assert!(System::<Traits>::tick_count() >= start + 10);
    assert_eq!(task.is_pending(), Ok(false));

    // A masked line stays pending until it's unmasked
    D::pend_irq(IrqBank::Primary, LINE_MASKED);
    assert_eq!(app.seq.get(), 8);
    System::<Traits>::irq_enable(LINE_MASKED).unwrap();
    app.seq.expect_and_replace(9, 10);

    System::<Traits>::irq_disable(LINE_MASKED).unwrap();
    D::pend_irq(IrqBank::Primary, LINE_MASKED);
    System::<Traits>::irq_set(5, None).unwrap();
    System::<Traits>::irq_enable(LINE_MASKED).unwrap();
    assert_eq!(app.seq.get(), 10);

    D::success();
    0
}

fn thread1_body<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) -> i32 {
    let app = D::app();
    app.seq.expect_and_replace(1, 2);

    assert_eq!(System::<Traits>::irq_wait(false, LINE_WAITED), Ok(LINE_WAITED));
    app.seq.expect_and_replace(4, 5);

    assert_eq!(
        System::<Traits>::irq_wait2(false, LINE_EXTENDED),
        Ok(LINE_EXTENDED)
    );
    app.seq.expect_and_replace(6, 7);
    0
}

fn isr_waited<Traits: KernelTraits, D: Driver<App<Traits>>>() {
    log::trace!("isr_waited");
    D::app().seq.expect_and_replace(3, 4);
}

fn isr_masked<Traits: KernelTraits, D: Driver<App<Traits>>>() {
    log::trace!("isr_masked");
    D::app().seq.expect_and_replace(8, 9);
}

fn pend_latched_line<Traits: KernelTraits, D: Driver<App<Traits>>>(_: usize) {
    D::pend_irq(IrqBank::Primary, LINE_LATCHED);
}
