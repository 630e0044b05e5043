//! CPU Lock, the only lock guarding the kernel state
//!
//! Every piece of mutable kernel state is a [`CpuLockCell`]. A cell can only be
//! accessed through the singleton token held by a [`CpuLockGuard`], so holding
//! the guard (i.e., having kernel-managed interrupts masked) is both necessary
//! and sufficient for touching the scheduler state.
use core::{fmt, ops};
use tokenlock::{SingletonTokenId, UnsyncSingletonToken, UnsyncSingletonTokenRefMut, UnsyncTokenLock};

use crate::{
    error::BadContextError,
    utils::{intrusive_list::CellLike, Init},
    PortThreading,
};

/// Distinguishes the tokens of different kernel instances.
pub(crate) struct CpuLockTag<Traits>(Traits);

type CpuLockToken<Traits> = UnsyncSingletonToken<CpuLockTag<Traits>>;

/// A borrowed CPU Lock token. Equivalent to `&'a mut CpuLockGuard` without
/// the indirection.
///
/// Unlike `&mut`, this is not reborrowed implicitly. Use
/// [`borrow_mut`](UnsyncSingletonTokenRefMut::borrow_mut) to lend it to a
/// callee and keep using it afterwards.
pub(crate) type CpuLockTokenRefMut<'a, Traits> = UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

/// A cell readable and writable only while CPU Lock is active.
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(
    UnsyncTokenLock<T, SingletonTokenId<CpuLockTag<Traits>>>,
);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(SingletonTokenId::new(), x))
    }

    /// Access the contents through an exclusive borrow, which needs no token.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}

impl<Traits: PortThreading, T: Clone> CpuLockCell<Traits, T> {
    /// Get a [`fmt::Debug`] proxy that takes a snapshot of the contents and
    /// formats it with `f`. CPU Lock is released before `f` is called, so `f`
    /// may format other cells.
    ///
    /// Prints `< locked >` if CPU Lock is already active, which is the case
    /// when a kernel service logs its own state.
    pub(crate) fn debug_fmt_with<'a, F>(&'a self, f: F) -> impl fmt::Debug + 'a
    where
        F: 'a + Fn(T, &mut fmt::Formatter) -> fmt::Result,
    {
        struct Snapshot<'a, Traits, T, F> {
            cell: &'a CpuLockCell<Traits, T>,
            f: F,
        }

        impl<Traits, T, F> fmt::Debug for Snapshot<'_, Traits, T, F>
        where
            Traits: PortThreading,
            T: Clone,
            F: Fn(T, &mut fmt::Formatter) -> fmt::Result,
        {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let Ok(lock) = lock_cpu::<Traits>() else {
                    return f.write_str("CpuLockCell(< locked >)");
                };
                let snapshot = self.cell.0.read(&*lock).clone();
                drop(lock);

                f.write_str("CpuLockCell(")?;
                (self.f)(snapshot, f)?;
                f.write_str(")")
            }
        }

        Snapshot { cell: self, f }
    }
}

impl<Traits: PortThreading, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match lock_cpu::<Traits>() {
            Ok(lock) => f
                .debug_tuple("CpuLockCell")
                .field(self.0.read(&*lock))
                .finish(),
            Err(_) => f.write_str("CpuLockCell(< locked >)"),
        }
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, SingletonTokenId<CpuLockTag<Traits>>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Lets intrusive lists store their links in `CpuLockCell`s.
impl<'a, Element: Clone, Traits: PortThreading> CellLike<CpuLockTokenRefMut<'a, Traits>>
    for CpuLockCell<Traits, Element>
{
    type Target = Element;

    fn get(&self, key: &CpuLockTokenRefMut<'a, Traits>) -> Element {
        self.0.read(&**key).clone()
    }

    fn set(&self, key: &mut CpuLockTokenRefMut<'a, Traits>, value: Element) {
        self.0.replace(&mut **key, value);
    }

    fn modify<R>(
        &self,
        key: &mut CpuLockTokenRefMut<'a, Traits>,
        f: impl FnOnce(&mut Element) -> R,
    ) -> R {
        f(self.0.write(&mut **key))
    }
}

/// Activate CPU Lock and get a guard that deactivates it on drop.
///
/// Fails with `BadContext` if CPU Lock is already active. Kernel services
/// propagate this error, so calling one from inside another (e.g., from a
/// debug formatter running under the lock) is reported instead of
/// deadlocking.
pub(crate) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    // Safety: Only the kernel controls CPU Lock through this
    if unsafe { Traits::try_enter_cpu_lock() } {
        // Safety: CPU Lock was inactive, so no guard exists
        Ok(unsafe { assume_cpu_lock() })
    } else {
        Err(BadContextError::BadContext)
    }
}

/// Get a guard for a CPU Lock state entered by someone else, e.g., the port
/// calling into [`PortToKernel`](crate::PortToKernel).
///
/// # Safety
///
/// CPU Lock must be active, and no other `CpuLockGuard` may exist.
pub(crate) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        // Safety: The token is unique because the guard is, which is upheld
        //         by the caller
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// An active CPU Lock state. Dereferences to the token that unlocks
/// [`CpuLockCell`]s.
pub(crate) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is active and owned by this guard
        unsafe { Traits::leave_cpu_lock() };
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;

    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_mut_without_token() {
        let mut cell = CpuLockCell::<(), [u8; 2]>::INIT;
        assert_eq!(*cell.get_mut(), [0, 0]);
        cell.get_mut()[1] = 42;
        assert_eq!(*cell.get_mut(), [0, 42]);
    }
}
