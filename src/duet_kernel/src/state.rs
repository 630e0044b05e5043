use crate::{error::BadContextError, KernelTraits};

/// If the current context is not a thread context, return `Err(BadContext)`.
pub(crate) fn expect_thread_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_thread_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable, return `Err(BadContext)`.
///
/// Only a thread context outside an interrupt handler can wait.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_thread_context() || Traits::is_interrupt_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}
