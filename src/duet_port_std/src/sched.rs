//! Simulates a processor shared by host threads.
//!
//! Exactly one host thread, the *owner*, is allowed to run at a time. The
//! owner passes the processor to another host thread by
//! [`Processor::hand_over`], and the receiver resumes from
//! [`Processor::wait_for_baton`].
use duet_kernel::IrqMask;
use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
    time::Duration,
};

/// The number of simulated interrupt banks.
pub(crate) const NUM_IRQ_BANKS: usize = 2;

/// The state of the simulated hardware.
#[derive(Debug)]
pub(crate) struct SchedState {
    /// The host thread currently holding the processor.
    pub(crate) owner: Option<ThreadId>,
    /// The tick counter. Only advances while the processor is idle.
    pub(crate) tick: u64,
    /// When the timer interrupt should fire.
    pub(crate) deadline: Option<u64>,
    pub(crate) pending: [IrqMask; NUM_IRQ_BANKS],
    pub(crate) enabled: [IrqMask; NUM_IRQ_BANKS],
}

/// Interrupt sources acknowledged by [`SchedState::take_fired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fired {
    pub(crate) timer: bool,
    pub(crate) lines: [IrqMask; NUM_IRQ_BANKS],
}

impl Fired {
    pub(crate) fn is_empty(&self) -> bool {
        !self.timer && self.lines.iter().all(|&bits| bits == 0)
    }
}

impl SchedState {
    pub(crate) const fn new() -> Self {
        Self {
            owner: None,
            tick: 0,
            deadline: None,
            pending: [0; NUM_IRQ_BANKS],
            enabled: [0; NUM_IRQ_BANKS],
        }
    }

    /// Return `true` if an interrupt can be taken now.
    pub(crate) fn has_pending_interrupt(&self) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= self.tick)
            || self
                .pending
                .iter()
                .zip(&self.enabled)
                .any(|(&pending, &enabled)| pending & enabled != 0)
    }

    /// Acknowledge every interrupt that can be taken now. Masked lines stay
    /// pending.
    pub(crate) fn take_fired(&mut self) -> Fired {
        let timer = self.deadline.is_some_and(|deadline| deadline <= self.tick);
        if timer {
            self.deadline = None;
        }

        let mut lines = [0; NUM_IRQ_BANKS];
        for ((fired, pending), &enabled) in lines
            .iter_mut()
            .zip(&mut self.pending)
            .zip(&self.enabled)
        {
            *fired = *pending & enabled;
            *pending &= !enabled;
        }

        Fired { timer, lines }
    }
}

/// The simulated processor.
#[derive(Debug)]
pub(crate) struct Processor {
    state: Mutex<SchedState>,
    /// Signaled when `SchedState::owner` changes or an interrupt is pended
    /// from outside.
    baton: Condvar,
}

impl Processor {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(SchedState::new()),
            baton: Condvar::new(),
        }
    }

    /// Lock the hardware state. A panicking host thread doesn't prevent
    /// others from reporting it, so poisoning is ignored.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pass the processor to the host thread `to`.
    pub(crate) fn hand_over(&self, sched: &mut SchedState, to: ThreadId) {
        log::trace!("handing over the processor to {to:?}");
        sched.owner = Some(to);
        self.baton.notify_all();
    }

    /// Wake up the owner if it's waiting for an interrupt.
    pub(crate) fn notify(&self) {
        self.baton.notify_all();
    }

    /// Block the current host thread until it receives the processor.
    pub(crate) fn wait_for_baton(&self) {
        let me = thread::current().id();
        let mut sched = self.lock();
        while sched.owner != Some(me) {
            sched = self
                .baton
                .wait(sched)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Return `true` if the current host thread holds the processor.
    pub(crate) fn is_owner(&self) -> bool {
        self.lock().owner == Some(thread::current().id())
    }

    /// Wait for a notification for up to `timeout`. Returns `true` if timed
    /// out.
    pub(crate) fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, SchedState>,
        timeout: Duration,
    ) -> (MutexGuard<'a, SchedState>, bool) {
        let (guard, result) = self
            .baton
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[quickcheck]
    fn take_fired_respects_mask(pending: (u32, u32), enabled: (u32, u32)) -> bool {
        let mut sched = SchedState::new();
        sched.pending = [pending.0, pending.1];
        sched.enabled = [enabled.0, enabled.1];

        let fired = sched.take_fired();

        fired.lines == [pending.0 & enabled.0, pending.1 & enabled.1]
            && sched.pending == [pending.0 & !enabled.0, pending.1 & !enabled.1]
            && !fired.timer
            && !sched.has_pending_interrupt()
    }

    #[test]
    fn timer_fires_at_deadline() {
        let mut sched = SchedState::new();
        sched.deadline = Some(10);
        assert!(!sched.has_pending_interrupt());
        assert!(sched.take_fired().is_empty());
        assert_eq!(sched.deadline, Some(10));

        sched.tick = 10;
        assert!(sched.has_pending_interrupt());
        let fired = sched.take_fired();
        assert!(fired.timer);
        assert_eq!(sched.deadline, None);
        assert!(sched.take_fired().is_empty());
    }

    #[test]
    fn baton_passing() {
        let processor: &'static Processor = Box::leak(Box::new(Processor::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let main_id = thread::current().id();

        let counter2 = Arc::clone(&counter);
        let jh = thread::spawn(move || {
            processor.wait_for_baton();
            assert_eq!(counter2.fetch_add(1, Ordering::Relaxed), 0);
            let mut sched = processor.lock();
            processor.hand_over(&mut sched, main_id);
        });

        {
            let mut sched = processor.lock();
            processor.hand_over(&mut sched, jh.thread().id());
        }
        assert!(!processor.is_owner());

        processor.wait_for_baton();
        assert!(processor.is_owner());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        jh.join().unwrap();
    }
}
