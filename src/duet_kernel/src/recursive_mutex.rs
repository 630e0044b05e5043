//! Recursive mutexes
use core::{cell::Cell, fmt, marker::PhantomData};

use crate::{
    error::{LockMutexError, QueryMutexError, TryLockMutexError},
    mutex::Mutex,
    utils::Init,
    KernelTraits, PortThreading,
};

/// A [`Mutex`] that can be locked again by the thread holding it. The
/// mutex is released when the last guard is dropped.
pub struct RecursiveMutex<Traits: PortThreading> {
    pub(crate) mutex: Mutex<Traits>,

    /// The number of additional locks. Only accessed by the owning thread.
    pub(crate) count: Cell<usize>,
}

// Safety: `count` is only accessed by the thread holding `mutex`
unsafe impl<Traits: PortThreading> Sync for RecursiveMutex<Traits> where Mutex<Traits>: Sync {}

impl<Traits: PortThreading> Init for RecursiveMutex<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        mutex: Init::INIT,
        count: Cell::new(0),
    };
}

impl<Traits: PortThreading> RecursiveMutex<Traits> {
    /// Construct an unlocked `RecursiveMutex`.
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: PortThreading> Default for RecursiveMutex<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for RecursiveMutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RecursiveMutex")
            .field("mutex", &self.mutex)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> RecursiveMutex<Traits> {
    /// Acquire the mutex, blocking the calling thread until it is able to do
    /// so. Succeeds immediately if the calling thread already holds it.
    ///
    /// # Panics
    ///
    /// This method will panic if the nesting count would overflow.
    pub fn lock(&'static self) -> Result<RecursiveMutexGuard<Traits>, LockMutexError> {
        match self.mutex.lock() {
            Ok(guard) => core::mem::forget(guard),
            Err(LockMutexError::WouldDeadlock) => self.increment(),
            Err(e) => return Err(e),
        }

        Ok(RecursiveMutexGuard {
            mutex: self,
            _no_send_sync: PhantomData,
        })
    }

    /// Attempt to acquire the mutex without blocking.
    ///
    /// # Panics
    ///
    /// This method will panic if the nesting count would overflow.
    pub fn try_lock(&'static self) -> Result<RecursiveMutexGuard<Traits>, TryLockMutexError> {
        match self.mutex.try_lock() {
            Ok(guard) => core::mem::forget(guard),
            Err(TryLockMutexError::WouldDeadlock) => self.increment(),
            Err(e) => return Err(e),
        }

        Ok(RecursiveMutexGuard {
            mutex: self,
            _no_send_sync: PhantomData,
        })
    }

    /// Return `true` if the mutex is held by any thread.
    pub fn is_locked(&self) -> Result<bool, QueryMutexError> {
        self.mutex.is_locked()
    }

    fn increment(&self) {
        self.count
            .set(self.count.get().checked_add(1).expect("nesting count overflow"));
    }
}

/// An RAII implementation of a "scoped lock" of a [`RecursiveMutex`]. When
/// the last guard of the owning thread is dropped, the lock will be released.
#[must_use = "if unused the RecursiveMutex will immediately unlock"]
pub struct RecursiveMutexGuard<Traits: KernelTraits> {
    pub(crate) mutex: &'static RecursiveMutex<Traits>,
    _no_send_sync: PhantomData<*mut ()>,
}

impl<Traits: KernelTraits> RecursiveMutexGuard<Traits> {
    /// Get the mutex this guard is holding.
    pub fn mutex(&self) -> &'static RecursiveMutex<Traits> {
        self.mutex
    }

    pub(crate) fn from_raw(mutex: &'static RecursiveMutex<Traits>) -> Self {
        Self {
            mutex,
            _no_send_sync: PhantomData,
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for RecursiveMutexGuard<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("RecursiveMutexGuard")
            .field(&(self.mutex as *const _))
            .finish()
    }
}

impl<Traits: KernelTraits> Drop for RecursiveMutexGuard<Traits> {
    #[inline]
    fn drop(&mut self) {
        let count = &self.mutex.count;
        if count.get() == 0 {
            self.mutex.mutex.unlock_raw().unwrap();
        } else {
            count.set(count.get() - 1);
        }
    }
}
