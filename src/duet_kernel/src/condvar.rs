//! Condition variables
use core::fmt;

use crate::{
    error::{UnblockError, WaitCondVarError},
    klock, mutex,
    mutex::MutexGuard,
    recursive_mutex::RecursiveMutexGuard,
    state, thread,
    utils::Init,
    wait::{WaitPayload, WaitQueue, WaitResult},
    KernelTraits, PortThreading,
};

/// A condition variable used with [`Mutex`](crate::Mutex) or
/// [`RecursiveMutex`](crate::RecursiveMutex).
///
/// A canceled wait is reported as a spurious wakeup; the mutex is always
/// reacquired before a wait operation returns.
pub struct CondVar<Traits: PortThreading> {
    wait_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading> Init for CondVar<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        wait_queue: Init::INIT,
    };
}

impl<Traits: PortThreading> CondVar<Traits> {
    /// Construct a `CondVar`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: PortThreading> Default for CondVar<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for CondVar<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CondVar")
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> CondVar<Traits> {
    /// Atomically release the mutex and block the calling thread until
    /// [`signal`] or [`broadcast`] is called. The mutex is reacquired before
    /// returning.
    ///
    /// [`signal`]: Self::signal
    /// [`broadcast`]: Self::broadcast
    pub fn wait(
        &'static self,
        guard: MutexGuard<Traits>,
    ) -> Result<MutexGuard<Traits>, WaitCondVarError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let mutex = guard.mutex();

        // The guard doesn't release the mutex; we do it here with CPU Lock
        // held so that no signal is missed
        core::mem::forget(guard);
        mutex::release_mutex(lock.borrow_mut(), mutex).unwrap();

        self.wait_and_relock(lock.borrow_mut(), mutex);
        drop(lock);

        Ok(MutexGuard::from_raw(mutex))
    }

    /// [`wait`](Self::wait) for a [`RecursiveMutex`](crate::RecursiveMutex).
    /// The mutex is released entirely regardless of the nesting count, which
    /// is restored after reacquiring.
    pub fn wait_recursive(
        &'static self,
        guard: RecursiveMutexGuard<Traits>,
    ) -> Result<RecursiveMutexGuard<Traits>, WaitCondVarError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let recursive_mutex = guard.mutex();
        core::mem::forget(guard);

        let count = recursive_mutex.count.replace(0);
        mutex::release_mutex(lock.borrow_mut(), &recursive_mutex.mutex).unwrap();

        self.wait_and_relock(lock.borrow_mut(), &recursive_mutex.mutex);

        recursive_mutex.count.set(count);
        drop(lock);

        Ok(RecursiveMutexGuard::from_raw(recursive_mutex))
    }

    fn wait_and_relock(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
        mutex: &'static mutex::Mutex<Traits>,
    ) {
        match self.wait_queue.wait(lock.borrow_mut(), WaitPayload::Token(0)) {
            WaitResult::Value | WaitResult::Canceled => {}
            result => unreachable!("{result:?}"),
        }

        mutex::relock_mutex(lock, mutex);
    }

    /// Wake up one thread waiting on the condition variable.
    pub fn signal(&'static self) -> Result<(), UnblockError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.wait_queue.wake_up_one(lock.borrow_mut(), WaitResult::Value);
        thread::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wake up all threads waiting on the condition variable.
    pub fn broadcast(&'static self) -> Result<(), UnblockError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.wait_queue.wake_up_all(lock.borrow_mut(), WaitResult::Value);
        thread::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}
