//! Tick tasks, sleep, and periodic timers
//!
//! A [`TickTask`] calls a function when the tick counter reaches its target
//! tick. Pending tasks are kept in a list sorted by target tick, and the
//! port is asked to call `PortToKernel::timer_tick` when the first one is
//! due.
use core::{fmt, marker::PhantomPinned, ops, pin::Pin, ptr::NonNull};

use crate::{
    error::{SleepError, TickTaskError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    state, thread,
    thread::Thread,
    utils::{
        intrusive_list::{self, ListAccessor},
        Init,
    },
    wait::{self, WaitPayload, WaitResult},
    KernelTraits, PortThreading, System,
};

/// The frequency of the system bus clock, in hertz.
pub const SYSTEM_CLOCK: u32 = 33_513_982;

/// The frequency of the tick counter, in hertz.
pub const TICK_FREQ: u32 = SYSTEM_CLOCK / 64;

/// Convert a duration in microseconds into ticks, rounding down.
pub const fn ticks_from_usec(usec: u32) -> u32 {
    ((usec as u64 * TICK_FREQ as u64) / 1_000_000) as u32
}

/// Convert a frequency in hertz into a period in ticks, rounding to the
/// nearest tick.
///
/// # Panics
///
/// Panics if `hz` is zero.
pub const fn ticks_from_hz(hz: u32) -> u32 {
    (TICK_FREQ + hz / 2) / hz
}

/// The callback function of a [`TickTask`].
pub type TickTaskFn = fn(usize);

/// A reference to a [`TickTask`].
struct TickTaskRef<Traits: PortThreading>(NonNull<TickTask<Traits>>);

// Safety: `TickTask` is only accessed with CPU Lock active
unsafe impl<Traits: PortThreading> Send for TickTaskRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for TickTaskRef<Traits> {}

impl<Traits: PortThreading> Clone for TickTaskRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for TickTaskRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for TickTaskRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TickTaskRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> PartialEq for TickTaskRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for TickTaskRef<Traits> {}

use self::unsafe_static::UnsafeStatic;
mod unsafe_static {
    use super::*;

    pub(super) struct UnsafeStatic {
        _nonexhaustive: (),
    }

    impl UnsafeStatic {
        /// Construct an `UnsafeStatic`.
        ///
        /// # Safety
        ///
        /// All pointees to be accessed through the constructed `UnsafeStatic`
        /// must be valid.
        #[inline]
        pub(super) const unsafe fn new() -> &'static Self {
            &Self { _nonexhaustive: () }
        }
    }

    impl<Traits: PortThreading> ops::Index<TickTaskRef<Traits>> for UnsafeStatic {
        type Output = TickTask<Traits>;

        #[inline]
        fn index(&self, index: TickTaskRef<Traits>) -> &Self::Output {
            // Safety: See `task_list_accessor`.
            unsafe { &*index.0.as_ptr() }
        }
    }
}

/// Get a `ListAccessor` used to access the list of pending tick tasks.
macro_rules! task_list_accessor {
    ($key:expr) => {
        ListAccessor::new(
            &Traits::state().tick.tasks,
            // Safety: All elements are extant because a `TickTask` panics
            //     when it's dropped while still in the list.
            unsafe { UnsafeStatic::new() },
            |task: &TickTask<_>| &task.link,
            $key,
        )
    };
}

/// The kernel-global tick state.
pub(crate) struct TickState<Traits: PortThreading> {
    /// Pending tick tasks sorted by target tick. Tasks with equal target
    /// ticks are kept in the order they were started.
    tasks: CpuLockCell<Traits, intrusive_list::ListHead<TickTaskRef<Traits>>>,

    /// Set while `handle_tick` is running. Suppresses the reprogramming of
    /// the tick deadline by callbacks.
    tick_in_progress: CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> Init for TickState<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        tasks: Init::INIT,
        tick_in_progress: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TickState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TickState")
            .field("tasks", &self.tasks)
            .field("tick_in_progress", &self.tick_in_progress)
            .finish()
    }
}

/// A function call scheduled at a target tick, optionally repeated with a
/// fixed period.
///
/// A started task must stay at the same address until it's stopped or
/// expires, hence the `Pin`. Use [`Pin::static_ref`] for a `static` task.
///
/// # Panics
///
/// Dropping a task that is still pending panics.
pub struct TickTask<Traits: PortThreading> {
    target: CpuLockCell<Traits, u64>,

    /// The period in ticks, or `0` for a one-shot task.
    period: CpuLockCell<Traits, u32>,

    callback: CpuLockCell<Traits, Option<(TickTaskFn, usize)>>,

    link: CpuLockCell<Traits, Option<intrusive_list::Link<TickTaskRef<Traits>>>>,

    _pin: PhantomPinned,
}

impl<Traits: PortThreading> Init for TickTask<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        target: Init::INIT,
        period: Init::INIT,
        callback: Init::INIT,
        link: Init::INIT,
        _pin: PhantomPinned,
    };
}

impl<Traits: PortThreading> TickTask<Traits> {
    /// Construct a stopped `TickTask`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: PortThreading> Default for TickTask<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: PortThreading> Drop for TickTask<Traits> {
    #[inline]
    fn drop(&mut self) {
        if self.link.get_mut().is_some() {
            panic!("tick task is still linked");
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TickTask<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TickTask")
            .field("self", &(self as *const _))
            .field("target", &self.target)
            .field("period", &self.period)
            .field(
                "callback",
                &self.callback.debug_fmt_with(|x, f| {
                    fmt::Debug::fmt(&x.map(|(func, param)| (func as *const (), param)), f)
                }),
            )
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> TickTask<Traits> {
    /// Schedule `func(param)` to be called `delay` ticks from now, and then
    /// every `period` ticks if `period` is not zero. A pending task is
    /// rescheduled.
    ///
    /// The callback runs in an interrupt context with CPU Lock inactive.
    pub fn start(
        self: Pin<&Self>,
        func: TickTaskFn,
        param: usize,
        delay: u32,
        period: u32,
    ) -> Result<(), TickTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        start_task(lock.borrow_mut(), self, func, param, delay, period);
        Ok(())
    }

    /// Cancel the task. Does nothing if it's not pending.
    pub fn stop(self: Pin<&Self>) -> Result<(), TickTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        stop_task(lock.borrow_mut(), self);
        Ok(())
    }

    /// Return `true` if the task is pending.
    pub fn is_pending(&self) -> Result<bool, TickTaskError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.link.read(&*lock).is_some())
    }
}

/// Implements [`TickTask::start`].
fn start_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: Pin<&TickTask<Traits>>,
    func: TickTaskFn,
    param: usize,
    delay: u32,
    period: u32,
) {
    remove_task(lock.borrow_mut(), &task);

    task.callback.replace(&mut *lock, Some((func, param)));
    task.period.replace(&mut *lock, period);
    task.target
        .replace(&mut *lock, Traits::tick_count() + delay as u64);

    insert_task(lock.borrow_mut(), &task);

    if !Traits::state().tick.tick_in_progress.get(&*lock) {
        program_deadline(lock);
    }
}

/// Implements [`TickTask::stop`].
fn stop_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: Pin<&TickTask<Traits>>,
) {
    if remove_task(lock.borrow_mut(), &task) && !Traits::state().tick.tick_in_progress.get(&*lock)
    {
        program_deadline(lock);
    }
}

/// Insert `task` into the pending list according to its target tick.
fn insert_task<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &TickTask<Traits>,
) {
    let target = task.target.get(&*lock);
    let mut accessor = task_list_accessor!(lock);

    // Walk back from the tail so that tasks with the same target tick fire
    // in the order they were started
    let mut insert_at = None;
    let mut cursor = accessor.back();
    while let Some(next_cursor) = cursor {
        if accessor[next_cursor].target.get(&**accessor.cell_key()) > target {
            insert_at = Some(next_cursor);
            cursor = accessor.prev(next_cursor).unwrap_or(None);
        } else {
            break;
        }
    }

    if accessor
        .insert(TickTaskRef(NonNull::from(task)), insert_at)
        .is_err()
    {
        unreachable!();
    }
}

/// Remove `task` from the pending list. Returns `true` if it was pending.
fn remove_task<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &TickTask<Traits>,
) -> bool {
    let mut accessor = task_list_accessor!(lock);
    let task_ref = TickTaskRef(NonNull::from(task));
    if accessor.is_linked(task_ref) {
        if accessor.remove(task_ref).is_err() {
            unreachable!();
        }
        true
    } else {
        false
    }
}

/// Ask the port to call `timer_tick` when the first pending task is due.
fn program_deadline<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let deadline = {
        let accessor = task_list_accessor!(lock.borrow_mut());
        accessor
            .front_data()
            .map(|task| task.target.get(&**accessor.cell_key()))
    };

    // Safety: CPU Lock active
    unsafe { Traits::set_tick_deadline(deadline) };
}

/// Implements `PortToKernel::timer_tick`.
///
/// Precondition: CPU Lock inactive, an interrupt context
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = klock::lock_cpu::<Traits>().unwrap();

    let tick = &Traits::state().tick;
    tick.tick_in_progress.replace(&mut *lock, true);

    // Process expired tasks
    loop {
        let now = Traits::tick_count();

        let expired = {
            let mut accessor = task_list_accessor!(lock.borrow_mut());
            match accessor.front() {
                Some(task_ref) if accessor[task_ref].target.get(&**accessor.cell_key()) <= now => {
                    accessor.pop_front();
                    Some(task_ref)
                }
                _ => None,
            }
        };
        let Some(task_ref) = expired else { break };

        // Safety: `task_ref` was in the list, so it's valid. It stays valid
        // until the callback is called because nothing else can run.
        let task = unsafe { &*task_ref.0.as_ptr() };

        let callback = task.callback.get(&*lock);
        let period = task.period.get(&*lock);

        // Rearm a periodic task before calling the callback. The next target
        // is based on the previous one, not the current tick, so the period
        // doesn't drift.
        if period != 0 {
            *task.target.write(&mut *lock) += period as u64;
            insert_task(lock.borrow_mut(), task);
        }

        // (Note: A one-shot `task` is considered invalid at this point
        // because it's not in the list anymore)

        log::trace!("tick {now}: running {task_ref:?}");

        if let Some((func, param)) = callback {
            drop(lock);
            func(param);
            lock = klock::lock_cpu::<Traits>().unwrap();
        }
    }

    tick.tick_in_progress.replace(&mut *lock, false);

    // Schedule the next tick
    program_deadline(lock.borrow_mut());

    // Callback functions might have woken up some threads. Check for dispatch
    // and release CPU Lock.
    thread::unlock_cpu_and_check_preemption(lock);
}

/// RAII guard that automatically stops a `TickTask` when dropped.
struct TickTaskGuard<'a, 'b, Traits: KernelTraits> {
    task: Pin<&'a TickTask<Traits>>,
    lock: CpuLockTokenRefMut<'b, Traits>,
}

impl<Traits: KernelTraits> Drop for TickTaskGuard<'_, '_, Traits> {
    #[inline]
    fn drop(&mut self) {
        stop_task(self.lock.borrow_mut(), self.task);
    }
}

/// The callback of the tick task used by `sleep_ticks`. `param` is the
/// sleeping thread.
fn sleep_timeout_handler<Traits: KernelTraits>(param: usize) {
    // Safety: `param` was created from a `&'static Thread` by `sleep_ticks`
    let thread = unsafe { &*(param as *const Thread<Traits>) };

    // The precondition of the callback includes CPU Lock being inactive
    let mut lock = klock::lock_cpu::<Traits>().unwrap();

    // The thread may have been woken up by `cancel_wait` in the meantime, in
    // which case this fails
    let _ = wait::interrupt_thread(lock.borrow_mut(), thread, WaitResult::Value);

    thread::unlock_cpu_and_check_preemption(lock);
}

/// The callback of the tick tasks started by `timer_start_ticks`. `param` is
/// the address of the task.
fn timer_handler<Traits: KernelTraits>(param: usize) {
    // The precondition of the callback includes CPU Lock being inactive
    let mut lock = klock::lock_cpu::<Traits>().unwrap();

    // Wake the waiters of this timer only. The queue is shared by all timers.
    Traits::state()
        .timer_waiters
        .wake_up_matching(lock.borrow_mut(), false, |payload| match *payload {
            WaitPayload::Timer(addr) if addr == param => Some(WaitResult::Value),
            _ => None,
        });

    thread::unlock_cpu_and_check_preemption(lock);
}

/// These associate functions implement the time-related portion of
/// [`System`].
impl<Traits: KernelTraits> System<Traits> {
    /// Get the current value of the tick counter.
    pub fn tick_count() -> u64 {
        Traits::tick_count()
    }

    /// Block the calling thread for `ticks` ticks. Returns immediately if
    /// `ticks` is zero.
    ///
    /// Returns `Interrupted` if the sleep is canceled by
    /// [`Thread::cancel_wait`].
    pub fn sleep_ticks(ticks: u32) -> Result<(), SleepError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if ticks == 0 {
            return Ok(());
        }

        let thread = Traits::state().running_thread().unwrap();

        let task = TickTask::<Traits>::new();
        pin_utils::pin_mut!(task);

        // Use `TickTaskGuard` to automatically stop the task when leaving the
        // current lexical scope.
        let mut guard = TickTaskGuard {
            task: task.as_ref(),
            lock: lock.borrow_mut(),
        };

        start_task(
            guard.lock.borrow_mut(),
            guard.task,
            sleep_timeout_handler::<Traits>,
            thread as *const Thread<Traits> as usize,
            ticks,
            0,
        );

        match wait::wait_no_queue(guard.lock.borrow_mut(), WaitPayload::Sleep) {
            WaitResult::Value => Ok(()),
            WaitResult::Canceled => Err(SleepError::Interrupted),
            result => unreachable!("{result:?}"),
        }
    }

    /// Block the calling thread for `usec` microseconds.
    pub fn sleep(usec: u32) -> Result<(), SleepError> {
        Self::sleep_ticks(ticks_from_usec(usec))
    }

    /// Start `task` as a periodic timer firing every `period` ticks. Use
    /// [`timer_wait`](Self::timer_wait) to wait for it.
    pub fn timer_start_ticks(
        task: Pin<&'static TickTask<Traits>>,
        period: u32,
    ) -> Result<(), TickTaskError> {
        let addr = &*task as *const TickTask<Traits> as usize;
        task.start(timer_handler::<Traits>, addr, period, period)
    }

    /// Start `task` as a periodic timer firing at `hz` hertz.
    pub fn timer_start(task: Pin<&'static TickTask<Traits>>, hz: u32) -> Result<(), TickTaskError> {
        Self::timer_start_ticks(task, ticks_from_hz(hz))
    }

    /// Block the calling thread until the next period of a timer started by
    /// [`timer_start_ticks`](Self::timer_start_ticks).
    pub fn timer_wait(task: Pin<&'static TickTask<Traits>>) -> Result<(), SleepError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let addr = &*task as *const TickTask<Traits> as usize;
        match Traits::state()
            .timer_waiters
            .wait(lock.borrow_mut(), WaitPayload::Timer(addr))
        {
            WaitResult::Value => Ok(()),
            WaitResult::Canceled => Err(SleepError::Interrupted),
            result => unreachable!("{result:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_freq() {
        assert_eq!(TICK_FREQ, 523_655);
    }

    #[test]
    fn usec_conversion() {
        assert_eq!(ticks_from_usec(0), 0);
        assert_eq!(ticks_from_usec(1), 0);
        assert_eq!(ticks_from_usec(1_000_000), TICK_FREQ);
        assert_eq!(ticks_from_usec(1_000), 523);
        // No intermediate overflow
        assert_eq!(ticks_from_usec(u32::MAX), 2_249_068_453);
    }

    #[test]
    fn hz_conversion() {
        assert_eq!(ticks_from_hz(1), TICK_FREQ);
        assert_eq!(ticks_from_hz(60), 8728);
        assert_eq!(ticks_from_hz(1000), 524);
        assert_eq!(ticks_from_hz(TICK_FREQ), 1);
    }
}
