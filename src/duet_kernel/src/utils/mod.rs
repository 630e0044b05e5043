//! Utility
//!
//! **This module is exempt from the API stability guarantee.** It's exposed
//! only because it's needed by macros.
pub(crate) mod intrusive_list;
mod prio_bitmap;
pub(crate) use self::prio_bitmap::*;

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl Init for bool {
    const INIT: Self = false;
}

impl Init for u8 {
    const INIT: Self = 0;
}

impl Init for u64 {
    const INIT: Self = 0;
}

impl Init for u32 {
    const INIT: Self = 0;
}

impl Init for usize {
    const INIT: Self = 0;
}

impl<T: Init, const LEN: usize> Init for [T; LEN] {
    const INIT: Self = [const { T::INIT }; LEN];
}

impl<T> Init for core::sync::atomic::AtomicPtr<T> {
    const INIT: Self = core::sync::atomic::AtomicPtr::new(core::ptr::null_mut());
}

/// Wraps a closure to implement `Debug`.
pub(crate) struct DebugFn<F>(pub F);

impl<F: Fn(&mut core::fmt::Formatter) -> core::fmt::Result> core::fmt::Debug for DebugFn<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        (self.0)(f)
    }
}
