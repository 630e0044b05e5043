//! Threads
use core::{
    cell::UnsafeCell,
    convert::Infallible,
    fmt, ptr,
    sync::atomic::{AtomicPtr, Ordering},
};
use num_traits::ToPrimitive;

use crate::{
    error::{
        BadParamError, CancelWaitError, ExitThreadError, GetCurrentThreadError,
        GetThreadPriorityError, JoinThreadError, PauseThreadError, PrepareThreadError,
        QueryThreadError, SetThreadPriorityError, StartThreadError, YieldError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex, state,
    utils::{intrusive_list::StaticLink, Init},
    wait::{self, WaitPayload, WaitQueue, WaitResult},
    KernelTraits, PortThreading, System, NUM_PRIORITY_LEVELS, STACK_ALIGN,
};

#[doc(hidden)]
pub(crate) mod readyqueue;

/// The entry point of a thread. The return value becomes the thread's exit
/// code.
pub type ThreadEntry = fn(usize) -> i32;

/// The parameters of a thread passed to
/// [`PortThreading::initialize_thread_state`].
#[derive(Debug, Clone, Copy)]
pub struct ThreadAttr {
    /// The entry point of the thread.
    pub entry_point: ThreadEntry,

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The stack region. The port may ignore an empty region if it provides
    /// the stack by other means.
    pub stack: *mut [u8],
}

/// A statically allocated stack region for a thread.
///
/// Both ends of the region are aligned to [`STACK_ALIGN`], so `LEN` must be a
/// multiple of it. Other lengths are rejected at compile time.
#[repr(C, align(8))]
pub struct ThreadStack<const LEN: usize>(UnsafeCell<[u8; LEN]>);

// Safety: Safe code can't access the contents
unsafe impl<const LEN: usize> Sync for ThreadStack<LEN> {}

impl<const LEN: usize> ThreadStack<LEN> {
    const LEN_IS_ALIGNED: () = assert!(
        LEN % STACK_ALIGN == 0,
        "the stack length must be a multiple of `STACK_ALIGN`"
    );

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::LEN_IS_ALIGNED;
        Self(UnsafeCell::new([0; LEN]))
    }

    pub fn as_ptr(&self) -> *mut [u8] {
        ptr::slice_from_raw_parts_mut(self.0.get().cast(), LEN)
    }
}

impl<const LEN: usize> Default for ThreadStack<LEN> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const LEN: usize> fmt::Debug for ThreadStack<LEN> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ThreadStack").field(&self.as_ptr()).finish()
    }
}

/// Thread state machine
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSt {
    /// The thread has never been prepared.
    Uninitialized,

    Ready,

    Running,

    Waiting,

    /// The thread has exited with the contained exit code.
    Finished(i32),
}

impl Init for ThreadSt {
    const INIT: Self = Self::Uninitialized;
}

/// The state of a thread as reported by [`Thread::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Uninitialized,
    Finished,
    /// The thread is running or ready to run.
    Running,
    Waiting,
    /// The thread is waiting to lock a [`Mutex`](crate::Mutex).
    WaitingOnMutex,
}

/// A thread. Threads are usually placed in `static`s and are addressed by
/// reference.
pub struct Thread<Traits: PortThreading> {
    /// Port-specific state. Only the port may read or write this.
    pub port_thread_state: Traits::PortThreadState,

    #[doc(hidden)]
    pub(crate) st: CpuLockCell<Traits, ThreadSt>,

    /// If set, the thread is kept out of the ready queue.
    pub(crate) paused: CpuLockCell<Traits, bool>,

    /// The priority set by [`Thread::prepare`] or [`Thread::set_priority`].
    pub(crate) base_priority: CpuLockCell<Traits, u8>,

    /// The base priority raised by priority inheritance. The thread is
    /// scheduled according to this value.
    pub(crate) effective_priority: CpuLockCell<Traits, u8>,

    /// Links the thread into a tier of the ready queue.
    pub(crate) ready_queue_link: CpuLockCell<Traits, Option<StaticLink<Self>>>,

    pub(crate) wait: wait::ThreadWait<Traits>,

    /// Threads waiting in [`Thread::join`].
    joiners: WaitQueue<Traits>,

    /// The last mutex locked by the thread. The remaining ones are reached
    /// through [`mutex::Mutex::prev_mutex_held`].
    pub(crate) last_mutex_held: CpuLockCell<Traits, Option<&'static mutex::Mutex<Traits>>>,

    local_storage: AtomicPtr<()>,
}

impl<Traits: PortThreading> Init for Thread<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_thread_state: Traits::PORT_THREAD_STATE_INIT,
        st: Init::INIT,
        paused: Init::INIT,
        base_priority: Init::INIT,
        effective_priority: Init::INIT,
        ready_queue_link: Init::INIT,
        wait: Init::INIT,
        joiners: Init::INIT,
        last_mutex_held: Init::INIT,
        local_storage: Init::INIT,
    };
}

impl<Traits: PortThreading> Thread<Traits> {
    /// Construct an uninitialized thread.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: PortThreading> Default for Thread<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for Thread<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("self", &(self as *const _))
            .field("port_thread_state", &self.port_thread_state)
            .field("st", &self.st)
            .field("paused", &self.paused)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("wait", &self.wait)
            .field("joiners", &self.joiners)
            .field(
                "last_mutex_held",
                // Print the address only. The mutex refers back to this thread.
                &self
                    .last_mutex_held
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .finish()
    }
}

/// Convert a priority supplied by the caller into the stored form.
fn priority_from_usize(priority: usize) -> Result<u8, BadParamError> {
    priority
        .to_u8()
        .filter(|&p| (p as usize) < NUM_PRIORITY_LEVELS)
        .ok_or(BadParamError::BadParam)
}

impl<Traits: KernelTraits> Thread<Traits> {
    /// Initialize the thread with a new entry point, stack, and priority. The
    /// thread is left paused; call [`start`] to make it runnable.
    ///
    /// The thread must be uninitialized or finished.
    ///
    /// [`start`]: Self::start
    pub fn prepare<const LEN: usize>(
        &'static self,
        entry_point: ThreadEntry,
        entry_param: usize,
        stack: &'static ThreadStack<LEN>,
        priority: usize,
    ) -> Result<(), PrepareThreadError> {
        // Safety: `ThreadStack` is only accessed by the thread that owns it
        unsafe { self.prepare_raw(entry_point, entry_param, stack.as_ptr(), priority) }
    }

    /// [`prepare`](Self::prepare) with a raw stack region.
    ///
    /// # Safety
    ///
    /// `stack` must be valid for reads and writes for as long as the thread
    /// runs, and must not be used for anything else during that period.
    pub unsafe fn prepare_raw(
        &'static self,
        entry_point: ThreadEntry,
        entry_param: usize,
        stack: *mut [u8],
        priority: usize,
    ) -> Result<(), PrepareThreadError> {
        let priority = priority_from_usize(priority)?;

        // The initial stack pointer is the top of the region
        let stack_top = stack.cast::<u8>() as usize + stack.len();
        if stack_top % STACK_ALIGN != 0 {
            return Err(PrepareThreadError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;

        match *self.st.read(&*lock) {
            ThreadSt::Uninitialized | ThreadSt::Finished(_) => {}
            _ => return Err(PrepareThreadError::BadObjectState),
        }

        let attr = ThreadAttr {
            entry_point,
            entry_param,
            stack,
        };

        // Safety: CPU Lock active, the thread is not active
        unsafe { init_thread(lock.borrow_mut(), self, &attr, priority) };

        Ok(())
    }

    /// Clear the paused flag, making the thread runnable unless it's waiting.
    /// Does nothing if the thread isn't paused.
    pub fn start(&'static self) -> Result<(), StartThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        match *self.st.read(&*lock) {
            ThreadSt::Uninitialized | ThreadSt::Finished(_) => {
                return Err(StartThreadError::BadObjectState)
            }
            _ => {}
        }

        if !self.paused.replace(&mut *lock, false) {
            return Ok(());
        }

        if *self.st.read(&*lock) == ThreadSt::Ready {
            Traits::state()
                .ready_queue
                .push_back_thread(lock.borrow_mut(), self);
        }

        unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Set the paused flag. A paused thread doesn't run until [`start`] is
    /// called. A waiting thread keeps waiting, and isn't made runnable when
    /// the wait completes.
    ///
    /// If the thread is the calling one, this method returns after another
    /// thread starts it again. If it's the thread interrupted by the calling
    /// interrupt handler, the switch happens when the handler returns.
    ///
    /// [`start`]: Self::start
    pub fn pause(&'static self) -> Result<(), PauseThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        match *self.st.read(&*lock) {
            ThreadSt::Uninitialized | ThreadSt::Finished(_) => {
                return Err(PauseThreadError::BadObjectState)
            }
            _ => {}
        }

        if self.paused.replace(&mut *lock, true) {
            return Ok(());
        }

        match *self.st.read(&*lock) {
            ThreadSt::Ready => {
                Traits::state()
                    .ready_queue
                    .remove_thread(lock.borrow_mut(), self);
            }
            ThreadSt::Running => {
                self.st.replace(&mut *lock, ThreadSt::Ready);

                if Traits::is_interrupt_context() {
                    // Dispatch at interrupt return
                    drop(lock);
                    // Safety: CPU Lock inactive
                    unsafe { Traits::yield_cpu() };
                } else {
                    wait_until_running(lock.borrow_mut());
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Set the base priority of the thread.
    ///
    /// The effective priority is reevaluated, and the change is propagated
    /// to the owners of the mutexes the thread is waiting for.
    pub fn set_priority(&'static self, priority: usize) -> Result<(), SetThreadPriorityError> {
        let priority = priority_from_usize(priority)?;
        let mut lock = klock::lock_cpu::<Traits>()?;

        match *self.st.read(&*lock) {
            ThreadSt::Uninitialized | ThreadSt::Finished(_) => {
                return Err(SetThreadPriorityError::BadObjectState)
            }
            _ => {}
        }

        self.base_priority.replace(&mut *lock, priority);
        mutex::update_effective_priority(lock.borrow_mut(), self);

        unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Get the base priority of the thread.
    pub fn priority(&self) -> Result<usize, GetThreadPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;

        match *self.st.read(&*lock) {
            ThreadSt::Uninitialized | ThreadSt::Finished(_) => {
                Err(GetThreadPriorityError::BadObjectState)
            }
            _ => Ok(self.base_priority.get(&*lock) as usize),
        }
    }

    /// Get the effective priority of the thread.
    pub fn effective_priority(&self) -> Result<usize, GetThreadPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;

        match *self.st.read(&*lock) {
            ThreadSt::Uninitialized | ThreadSt::Finished(_) => {
                Err(GetThreadPriorityError::BadObjectState)
            }
            _ => Ok(self.effective_priority.get(&*lock) as usize),
        }
    }

    /// Get the current state of the thread.
    pub fn status(&'static self) -> Result<ThreadStatus, QueryThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        Ok(match *self.st.read(&*lock) {
            ThreadSt::Uninitialized => ThreadStatus::Uninitialized,
            ThreadSt::Finished(_) => ThreadStatus::Finished,
            ThreadSt::Ready | ThreadSt::Running => ThreadStatus::Running,
            ThreadSt::Waiting => {
                let on_mutex = wait::with_current_wait_payload(lock.borrow_mut(), self, |p| {
                    matches!(p, Some(WaitPayload::Mutex(_)))
                });
                if on_mutex {
                    ThreadStatus::WaitingOnMutex
                } else {
                    ThreadStatus::Waiting
                }
            }
        })
    }

    /// Return `true` if the thread has been prepared at least once.
    pub fn is_valid(&'static self) -> Result<bool, QueryThreadError> {
        Ok(self.status()? != ThreadStatus::Uninitialized)
    }

    /// Wait until the thread finishes and return its exit code.
    pub fn join(&'static self) -> Result<i32, JoinThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        match *self.st.read(&*lock) {
            ThreadSt::Uninitialized => return Err(JoinThreadError::BadObjectState),
            ThreadSt::Finished(rc) => return Ok(rc),
            _ => {}
        }

        if Traits::state()
            .running_thread()
            .is_some_and(|running| ptr::eq(running, self))
        {
            return Err(JoinThreadError::WouldDeadlock);
        }

        match self.joiners.wait(lock.borrow_mut(), WaitPayload::Join) {
            WaitResult::Exited(rc) => Ok(rc),
            WaitResult::Canceled => Err(JoinThreadError::Interrupted),
            result => unreachable!("{result:?}"),
        }
    }

    /// Interrupt any ongoing wait operation of the thread. The interrupted
    /// operation returns `Interrupted` (or [`BlockResult::Canceled`]).
    ///
    /// Returns `BadObjectState` if the thread is not waiting.
    ///
    /// [`BlockResult::Canceled`]: crate::BlockResult::Canceled
    pub fn cancel_wait(&'static self) -> Result<(), CancelWaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        wait::interrupt_thread(lock.borrow_mut(), self, WaitResult::Canceled)?;

        // The thread is now awake, check dispatch
        unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Attach an arbitrary pointer to the thread. This is meant for the
    /// per-thread state of a language runtime.
    pub fn attach_local_storage(&self, ptr: *mut ()) {
        self.local_storage.store(ptr, Ordering::Relaxed);
    }

    /// Get the pointer set by [`attach_local_storage`]. Null by default.
    ///
    /// [`attach_local_storage`]: Self::attach_local_storage
    pub fn local_storage(&self) -> *mut () {
        self.local_storage.load(Ordering::Relaxed)
    }
}

/// These associate functions implement the thread-related portion of
/// [`System`].
impl<Traits: KernelTraits> System<Traits> {
    /// Get the currently running thread.
    pub fn current_thread() -> Result<&'static Thread<Traits>, GetCurrentThreadError> {
        state::expect_thread_context::<Traits>()?;
        Traits::state()
            .running_thread()
            .ok_or(GetCurrentThreadError::BadContext)
    }

    /// Move the calling thread to the back of its priority tier, letting
    /// another ready thread of the same priority run.
    pub fn yield_now() -> Result<(), YieldError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let running_thread = Traits::state().running_thread().unwrap();
        let priority = running_thread.effective_priority.get(&*lock) as usize;

        if Traits::state()
            .ready_queue
            .has_ready_thread_in_priority_range(lock.borrow_mut(), ..priority + 1)
        {
            running_thread.st.replace(&mut *lock, ThreadSt::Ready);
            Traits::state()
                .ready_queue
                .push_back_thread(lock.borrow_mut(), running_thread);
        }

        unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Terminate the calling thread with the exit code `rc`.
    ///
    /// Mutexes held by the thread are handed over to their next waiters, and
    /// the threads waiting in [`Thread::join`] are released.
    ///
    /// # Safety
    ///
    /// The stack of the calling thread is discarded without running any
    /// destructors of the objects on it.
    pub unsafe fn exit_thread(rc: i32) -> Result<Infallible, ExitThreadError> {
        // Safety: Upheld by the caller
        unsafe { exit_current_thread::<Traits>(rc) }
    }
}

/// Implements `System::exit_thread`.
pub(crate) unsafe fn exit_current_thread<Traits: KernelTraits>(
    rc: i32,
) -> Result<Infallible, ExitThreadError> {
    // An interrupt handler would finish the thread it interrupted
    state::expect_waitable_context::<Traits>()?;

    // If CPU Lock is inactive, activate it.
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    let running_thread = Traits::state().running_thread().unwrap();

    // Hand over the mutexes, waking up their next waiters (if any)
    mutex::abandon_held_mutexes(lock.borrow_mut(), running_thread);
    debug_assert!(running_thread.last_mutex_held.read(&*lock).is_none());

    // Transition the current thread to Finished
    assert_eq!(*running_thread.st.read(&*lock), ThreadSt::Running);
    running_thread.st.replace(&mut *lock, ThreadSt::Finished(rc));

    let num_joiners = running_thread
        .joiners
        .wake_up_all(lock.borrow_mut(), WaitResult::Exited(rc));
    log::trace!("thread {running_thread:p} exited with {rc}, {num_joiners} joiner(s)");

    // Erase `running_thread`
    Traits::state().running_thread.store(None, Ordering::Relaxed);

    core::mem::forget(lock);

    // Safety: (1) The caller acknowledges that the stack will be discarded.
    // (2) CPU Lock active
    unsafe {
        Traits::exit_and_dispatch(running_thread);
    }
}

/// Initialize a thread that is not active.
///
/// # Safety
///
/// The thread must be in the `Uninitialized` or `Finished` state.
unsafe fn init_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static Thread<Traits>,
    attr: &ThreadAttr,
    priority: u8,
) {
    debug_assert!(thread.ready_queue_link.read(&*lock).is_none());
    debug_assert!(thread.last_mutex_held.read(&*lock).is_none());

    thread.base_priority.replace(&mut *lock, priority);
    thread.effective_priority.replace(&mut *lock, priority);
    thread.paused.replace(&mut *lock, true);
    thread.local_storage.store(ptr::null_mut(), Ordering::Relaxed);

    // Safety: CPU Lock active, the thread is not active
    unsafe { Traits::initialize_thread_state(thread, attr) };

    thread.st.replace(&mut *lock, ThreadSt::Ready);
}

/// Prepare and start the built-in main thread. Called by `boot`.
///
/// # Safety
///
/// CPU Lock active. Must be called only once.
pub(crate) unsafe fn init_main_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    attr: &ThreadAttr,
) {
    let thread = Traits::state().main_thread();
    let priority = crate::MAIN_THREAD_PRIORITY as u8;

    // Safety: The main thread is uninitialized
    unsafe { init_thread(lock.borrow_mut(), thread, attr, priority) };

    thread.paused.replace(&mut *lock, false);
    Traits::state()
        .ready_queue
        .push_back_thread(lock.borrow_mut(), thread);
}

/// Transition the thread into the Ready state. A paused thread is not
/// inserted to the ready queue.
///
/// This function doesn't do any proper cleanup for a previous state.
pub(crate) fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static Thread<Traits>,
) {
    thread.st.replace(&mut *lock, ThreadSt::Ready);

    if !thread.paused.get(&*lock) {
        Traits::state()
            .ready_queue
            .push_back_thread(lock.borrow_mut(), thread);
    }
}

/// Relinquish CPU Lock. After that, if there's a higher-priority thread than
/// `running_thread`, call `Port::yield_cpu`.
///
/// System services that transition a thread into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let prev_thread_priority = running_thread_priority(lock.borrow_mut());

    let has_preempting_thread = Traits::state()
        .ready_queue
        .has_ready_thread_in_priority_range(lock.borrow_mut(), ..prev_thread_priority);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_thread {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Get the effective priority of `running_thread` if it can continue
/// running, or `usize::MAX` otherwise.
fn running_thread_priority<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
    match Traits::state().running_thread() {
        Some(thread) if *thread.st.read(&*lock) == ThreadSt::Running => {
            thread.effective_priority.get(&*lock) as usize
        }
        _ => usize::MAX,
    }
}

/// Implements `PortToKernel::choose_running_thread`.
pub(crate) fn choose_next_running_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let prev_running_thread = Traits::state().running_thread();
    let prev_thread_priority = running_thread_priority(lock.borrow_mut());

    // `usize::MAX` means there's no running thread or it has stopped
    // running. In that case `pop_front_thread` returns `SwitchTo(_)` so that
    // `running_thread` is updated even if nothing is ready.
    let decision = Traits::state()
        .ready_queue
        .pop_front_thread(lock.borrow_mut(), prev_thread_priority);

    let next_running_thread = match decision {
        readyqueue::ScheduleDecision::SwitchTo(thread) => thread,
        readyqueue::ScheduleDecision::Keep => {
            debug_assert_ne!(prev_thread_priority, usize::MAX);
            return;
        }
    };

    if let Some(thread) = next_running_thread {
        thread.st.replace(&mut *lock, ThreadSt::Running);

        if ptr_from_option_ref(prev_running_thread) == thread {
            return;
        }
    }

    // `prev_running_thread` now loses the control of the processor
    if let Some(running_thread) = prev_running_thread {
        match *running_thread.st.read(&*lock) {
            ThreadSt::Running => {
                // Preempted. It keeps its place at the front of its tier.
                running_thread.st.replace(&mut *lock, ThreadSt::Ready);
                Traits::state()
                    .ready_queue
                    .push_front_thread(lock.borrow_mut(), running_thread);
            }
            ThreadSt::Waiting | ThreadSt::Ready | ThreadSt::Finished(_) => {}
            ThreadSt::Uninitialized => unreachable!(),
        }
    }

    log::trace!(
        "dispatch: {:p} -> {:p}",
        ptr_from_option_ref(prev_running_thread),
        ptr_from_option_ref(next_running_thread),
    );

    Traits::state()
        .running_thread
        .store(next_running_thread, Ordering::Relaxed);
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        ptr::null()
    }
}

/// Transition the currently running thread into the Waiting state. Returns
/// when woken up.
///
/// The current context must be waitable (This function doesn't check
/// that). The caller should use `expect_waitable_context` to do that.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert_eq!(state::expect_waitable_context::<Traits>(), Ok(()));

    // Transition the current thread to Waiting
    let running_thread = Traits::state().running_thread().unwrap();
    assert_eq!(*running_thread.st.read(&*lock), ThreadSt::Running);
    running_thread.st.replace(&mut *lock, ThreadSt::Waiting);

    wait_until_running(lock.borrow_mut());
}

/// Yield the processor until the calling thread is chosen to run again.
fn wait_until_running<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) {
    let running_thread = Traits::state().running_thread().unwrap();

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from this
        //             function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        match *running_thread.st.read(&*lock) {
            ThreadSt::Running => break,
            // Woken up while paused, or paused and not started yet
            ThreadSt::Waiting | ThreadSt::Ready => {}
            st => unreachable!("{st:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_range() {
        assert_eq!(priority_from_usize(0), Ok(0));
        assert_eq!(priority_from_usize(63), Ok(63));
        assert_eq!(priority_from_usize(64), Err(BadParamError::BadParam));
        assert_eq!(priority_from_usize(usize::MAX), Err(BadParamError::BadParam));
    }

    #[test]
    fn stack_is_aligned() {
        static STACK: ThreadStack<104> = ThreadStack::new();
        let ptr = STACK.as_ptr();
        assert_eq!(ptr.cast::<u8>() as usize % STACK_ALIGN, 0);
        assert_eq!(ptr.len(), 104);

        // The top is where the initial stack pointer goes
        let top = ptr.cast::<u8>() as usize + ptr.len();
        assert_eq!(top % STACK_ALIGN, 0);
    }
}
