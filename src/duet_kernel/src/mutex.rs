//! Mutexes with priority inheritance
use core::{fmt, marker::PhantomData, ptr};

use crate::{
    error::{
        BadContextError, LockMutexError, LockMutexPrecheckError, QueryMutexError,
        TryLockMutexError, UnlockMutexError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state,
    thread::{self, Thread, ThreadSt},
    utils::Init,
    wait::{self, WaitPayload, WaitQueue, WaitResult},
    KernelTraits, PortThreading,
};

/// A mutex with the priority inheritance protocol. While a thread holds the
/// mutex, its effective priority is raised to the effective priority of the
/// best thread waiting for the mutex.
///
/// Mutexes may be unlocked in any order.
pub struct Mutex<Traits: PortThreading> {
    wait_queue: WaitQueue<Traits>,

    /// The next element in the singly-linked list headed by
    /// `Thread::last_mutex_held`, containing all mutexes currently held by the
    /// thread.
    pub(crate) prev_mutex_held: CpuLockCell<Traits, Option<&'static Self>>,

    /// The thread that currently owns the mutex lock.
    pub(crate) owning_thread: CpuLockCell<Traits, Option<&'static Thread<Traits>>>,
}

impl<Traits: PortThreading> Init for Mutex<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        wait_queue: Init::INIT,
        prev_mutex_held: Init::INIT,
        owning_thread: Init::INIT,
    };
}

impl<Traits: PortThreading> Mutex<Traits> {
    /// Construct an unlocked `Mutex`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: PortThreading> Default for Mutex<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field("wait_queue", &self.wait_queue)
            .field(
                "prev_mutex_held",
                // prevent O((# of held mutexes)²)-order debug printing
                &self
                    .prev_mutex_held
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field(
                "owning_thread",
                // break infinite recursion (Thread → Mutex → Thread → ...)
                &self
                    .owning_thread
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .finish()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Acquire the mutex, blocking the calling thread until it is able to do
    /// so.
    pub fn lock(&'static self) -> Result<MutexGuard<Traits>, LockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        lock_mutex(self, lock)?;

        Ok(MutexGuard {
            mutex: self,
            _no_send_sync: PhantomData,
        })
    }

    /// Attempt to acquire the mutex without blocking. Returns `Timeout` if
    /// it's held by another thread.
    pub fn try_lock(&'static self) -> Result<MutexGuard<Traits>, TryLockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        try_lock_mutex(self, lock)?;

        Ok(MutexGuard {
            mutex: self,
            _no_send_sync: PhantomData,
        })
    }

    /// Return `true` if the mutex is held by any thread.
    pub fn is_locked(&self) -> Result<bool, QueryMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.owning_thread.get(&*lock).is_some())
    }

    /// Get the thread that currently holds the mutex.
    pub fn owner(&self) -> Result<Option<&'static Thread<Traits>>, QueryMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.owning_thread.get(&*lock))
    }

    /// Release the mutex held by the calling thread.
    pub(crate) fn unlock_raw(&'static self) -> Result<(), UnlockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        unlock_mutex(self, lock)
    }
}

/// An RAII implementation of a "scoped lock" of a [`Mutex`]. When this
/// structure is dropped, the lock will be released.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<Traits: KernelTraits> {
    mutex: &'static Mutex<Traits>,
    _no_send_sync: PhantomData<*mut ()>,
}

impl<Traits: KernelTraits> MutexGuard<Traits> {
    /// Get the mutex this guard is holding.
    pub fn mutex(&self) -> &'static Mutex<Traits> {
        self.mutex
    }

    /// Construct a guard for a mutex held by the calling thread.
    pub(crate) fn from_raw(mutex: &'static Mutex<Traits>) -> Self {
        Self {
            mutex,
            _no_send_sync: PhantomData,
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for MutexGuard<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MutexGuard")
            .field(&(self.mutex as *const _))
            .finish()
    }
}

impl<Traits: KernelTraits> Drop for MutexGuard<Traits> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.unlock_raw().unwrap();
    }
}

/// Check the error conditions covered by [`LockMutexPrecheckError`].
///
///  - `WouldDeadlock`: The current thread already owns the mutex.
///
/// Returns the currently running thread for convenience of the caller.
#[inline]
fn precheck_and_get_running_thread<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex: &'static Mutex<Traits>,
) -> Result<&'static Thread<Traits>, LockMutexPrecheckError> {
    let thread = Traits::state()
        .running_thread()
        .ok_or(LockMutexPrecheckError::BadContext)?;

    if ptr_from_option_ref(mutex.owning_thread.get(&*lock)) == thread {
        return Err(LockMutexPrecheckError::WouldDeadlock);
    }

    Ok(thread)
}

/// Reevaluate the thread's effective priority and return the result.
/// (This method doesn't update [`Thread::effective_priority`]).
///
/// The effective priority is the base priority raised to the effective
/// priority of the first waiter of each held mutex.
pub(crate) fn evaluate_thread_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static Thread<Traits>,
) -> u8 {
    let mut effective_priority = thread.base_priority.get(&*lock);
    let mut maybe_mutex = thread.last_mutex_held.get(&*lock);

    while let Some(mutex) = maybe_mutex {
        if let Some(waiter) = mutex.wait_queue.first_waiting_thread(lock.borrow_mut()) {
            effective_priority = effective_priority.min(waiter.effective_priority.get(&*lock));
        }

        maybe_mutex = mutex.prev_mutex_held.get(&*lock);
    }

    effective_priority
}

/// Reevaluate the thread's effective priority and apply the result. If it
/// changed, reposition the thread in the ready queue or in its wait queue
/// and, if the thread is waiting for a mutex, repeat the process for the
/// mutex's owner.
///
/// This method may change the priority of a Ready thread, but doesn't yield
/// the processor. Call `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn update_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mut thread: &'static Thread<Traits>,
) {
    loop {
        let old_priority = thread.effective_priority.get(&*lock);
        let new_priority = evaluate_thread_effective_priority(lock.borrow_mut(), thread);

        if old_priority == new_priority {
            return;
        }

        thread
            .effective_priority
            .replace(&mut *lock, new_priority);

        match *thread.st.read(&*lock) {
            ThreadSt::Ready => {
                if !thread.paused.get(&*lock) {
                    Traits::state().ready_queue.reorder_thread(
                        lock.borrow_mut(),
                        thread,
                        old_priority as usize,
                    );
                }
                return;
            }
            ThreadSt::Waiting => {
                wait::reorder_wait_of_thread(lock.borrow_mut(), thread);

                let blocking_mutex =
                    wait::with_current_wait_payload(lock.borrow_mut(), thread, |payload| {
                        match payload {
                            Some(WaitPayload::Mutex(mutex)) => Some(*mutex),
                            _ => None,
                        }
                    });

                // Propagate the change along the chain of owners
                match blocking_mutex.and_then(|mutex| mutex.owning_thread.get(&*lock)) {
                    Some(owner) => thread = owner,
                    None => return,
                }
            }
            _ => return,
        }
    }
}

/// Reevaluate the effective priority of the owner of `mutex` after a change
/// in its wait queue.
pub(crate) fn update_owner_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex: &'static Mutex<Traits>,
) {
    if let Some(owner) = mutex.owning_thread.get(&*lock) {
        update_effective_priority(lock.borrow_mut(), owner);
    }
}

/// Check if the current state of a mutex satisfies the wait
/// condition.
///
/// If it satisfies the wait condition, this function updates it and
/// returns `true`. Otherwise, it returns `false`, indicating the calling thread
/// should be blocked.
#[inline]
fn poll_core<Traits: KernelTraits>(
    mutex: &'static Mutex<Traits>,
    running_thread: &'static Thread<Traits>,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    if mutex.owning_thread.get(&*lock).is_some() {
        false
    } else {
        lock_core(mutex, running_thread, lock);
        true
    }
}

/// Give the ownership of the mutex to `thread`.
#[inline]
fn lock_core<Traits: KernelTraits>(
    mutex: &'static Mutex<Traits>,
    thread: &'static Thread<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert!(matches!(
        thread.st.read(&*lock),
        ThreadSt::Running | ThreadSt::Ready
    ));

    mutex.owning_thread.replace(&mut *lock, Some(thread));

    // Push `mutex` to the list of the mutexes held by the thread.
    let prev_mutex_held = thread.last_mutex_held.replace(&mut *lock, Some(mutex));
    mutex.prev_mutex_held.replace(&mut *lock, prev_mutex_held);

    // Inherit the priority of the remaining waiters
    update_effective_priority(lock, thread);
}

#[inline]
fn lock_mutex<Traits: KernelTraits>(
    mutex: &'static Mutex<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), LockMutexError> {
    let running_thread = precheck_and_get_running_thread(lock.borrow_mut(), mutex)?;

    if !poll_core(mutex, running_thread, lock.borrow_mut()) {
        // The current state does not satisfy the wait condition. In this case,
        // start waiting. The wake-upper is responsible for transferring the
        // ownership before waking us up.
        match mutex
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Mutex(mutex))
        {
            WaitResult::Value => {}
            WaitResult::Canceled => return Err(LockMutexError::Interrupted),
            result => unreachable!("{result:?}"),
        }
    }

    debug_assert_eq!(
        ptr_from_option_ref(mutex.owning_thread.get(&*lock)),
        running_thread as *const _
    );

    Ok(())
}

#[inline]
fn try_lock_mutex<Traits: KernelTraits>(
    mutex: &'static Mutex<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), TryLockMutexError> {
    let running_thread = precheck_and_get_running_thread(lock.borrow_mut(), mutex)?;

    if !poll_core(mutex, running_thread, lock.borrow_mut()) {
        return Err(TryLockMutexError::Timeout);
    }

    Ok(())
}

/// Acquire the mutex on behalf of the calling thread, retrying if the wait
/// is canceled. Used to reacquire a mutex released by a condition variable.
pub(crate) fn relock_mutex<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex: &'static Mutex<Traits>,
) {
    let running_thread = Traits::state().running_thread().unwrap();

    while !poll_core(mutex, running_thread, lock.borrow_mut()) {
        match mutex
            .wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Mutex(mutex))
        {
            WaitResult::Value => break,
            WaitResult::Canceled => {}
            result => unreachable!("{result:?}"),
        }
    }
}

#[inline]
fn unlock_mutex<Traits: KernelTraits>(
    mutex: &'static Mutex<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), UnlockMutexError> {
    release_mutex(lock.borrow_mut(), mutex)?;

    thread::unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Release the mutex held by the calling thread, handing it to the next
/// waiter, and lower the calling thread's effective priority.
///
/// This method may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn release_mutex<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex: &'static Mutex<Traits>,
) -> Result<(), UnlockMutexError> {
    let thread = Traits::state()
        .running_thread()
        .ok_or(BadContextError::BadContext)?;

    if ptr_from_option_ref(mutex.owning_thread.get(&*lock)) != thread {
        // The current thread does not currently own the mutex.
        return Err(UnlockMutexError::NotOwner);
    }

    // Remove `mutex` from the list of the mutexes held by the thread. It can
    // be anywhere in the list.
    let mut link = &thread.last_mutex_held;
    loop {
        match link.get(&*lock) {
            Some(held) if ptr::eq(held, mutex) => {
                let prev_mutex_held = held.prev_mutex_held.replace(&mut *lock, None);
                link.replace(&mut *lock, prev_mutex_held);
                break;
            }
            Some(held) => link = &held.prev_mutex_held,
            None => unreachable!("owned mutex is not in the held list"),
        }
    }

    // Wake up the next waiter
    unlock_mutex_unchecked(mutex, lock.borrow_mut());

    // Lower the thread's effective priority. This may cause preemption.
    update_effective_priority(lock, thread);

    Ok(())
}

/// Release all mutexes held by the thread, handing each of them to its next
/// waiter.
///
/// This method doesn't restore the thread's effective priority.
///
/// This method may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
pub(crate) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static Thread<Traits>,
) {
    let mut maybe_mutex = thread.last_mutex_held.replace(&mut *lock, None);
    while let Some(mutex) = maybe_mutex {
        maybe_mutex = mutex.prev_mutex_held.replace(&mut *lock, None);
        unlock_mutex_unchecked(mutex, lock.borrow_mut());
    }
}

/// Give the mutex to its next waiter, or mark it as unowned if there's none.
///
/// This method doesn't restore the previous owner's effective priority.
///
/// This method may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
fn unlock_mutex_unchecked<Traits: KernelTraits>(
    mutex: &'static Mutex<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    // Check if there's any other threads waiting on the mutex
    if let Some(next_thread) = mutex.wait_queue.first_waiting_thread(lock.borrow_mut()) {
        // Wake up the next waiter
        assert!(mutex
            .wait_queue
            .wake_up_one(lock.borrow_mut(), WaitResult::Value));

        // Give the ownership of the mutex to `next_thread`
        lock_core(mutex, next_thread, lock.borrow_mut());
    } else {
        // There's no one waiting
        mutex.owning_thread.replace(&mut *lock, None);
    }
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        ptr::null()
    }
}
