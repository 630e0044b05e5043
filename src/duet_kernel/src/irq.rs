//! Interrupt lines, handlers, and interrupt waits
use core::{fmt, num::NonZeroU32};

use crate::{
    error::{IrqConfigError, IrqWaitError},
    klock::{self, CpuLockCell},
    state, thread,
    utils::Init,
    wait::{WaitPayload, WaitQueue, WaitResult},
    KernelTraits, PortThreading, System,
};

/// A set of interrupt lines of one bank. Bit `i` represents line `i`.
pub type IrqMask = u32;

/// The number of interrupt lines in a bank.
pub const NUM_IRQ_LINES: usize = 32;

/// An interrupt handler. Called in an interrupt context with CPU Lock
/// inactive.
pub type IrqHandler = fn();

/// Identifies a bank of interrupt lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrqBank {
    Primary,
    #[cfg(feature = "extended_irq")]
    Extended,
}

#[cfg(not(feature = "extended_irq"))]
pub(crate) const NUM_IRQ_BANKS: usize = 1;
#[cfg(feature = "extended_irq")]
pub(crate) const NUM_IRQ_BANKS: usize = 2;

impl IrqBank {
    fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            #[cfg(feature = "extended_irq")]
            Self::Extended => 1,
        }
    }
}

/// The per-bank interrupt state.
pub(crate) struct IrqBankState<Traits: PortThreading> {
    /// Threads waiting in `irq_wait`. The token of each wait is the mask
    /// being waited for.
    waiters: WaitQueue<Traits>,

    /// Lines that fired while nobody was waiting for them.
    pending: CpuLockCell<Traits, IrqMask>,

    handlers: [CpuLockCell<Traits, Option<IrqHandler>>; NUM_IRQ_LINES],
}

impl<Traits: PortThreading> Init for IrqBankState<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        waiters: Init::INIT,
        pending: Init::INIT,
        handlers: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for IrqBankState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IrqBankState")
            .field("waiters", &self.waiters)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

fn bank_state<Traits: KernelTraits>(bank: IrqBank) -> &'static IrqBankState<Traits> {
    &Traits::state().irq_banks[bank.index()]
}

/// These associate functions implement the interrupt-related portion of
/// [`System`].
impl<Traits: KernelTraits> System<Traits> {
    /// Wait for any of the interrupt lines in `mask` to fire and return the
    /// lines that fired.
    ///
    /// If `next_irq` is `false` and some of the lines have fired since the
    /// last wait, those are consumed and returned without blocking.
    /// Otherwise the lines' latched state is discarded first.
    pub fn irq_wait(next_irq: bool, mask: IrqMask) -> Result<IrqMask, IrqWaitError> {
        irq_wait::<Traits>(IrqBank::Primary, next_irq, mask)
    }

    /// [`irq_wait`](Self::irq_wait) for the extended bank.
    #[cfg(feature = "extended_irq")]
    pub fn irq_wait2(next_irq: bool, mask: IrqMask) -> Result<IrqMask, IrqWaitError> {
        irq_wait::<Traits>(IrqBank::Extended, next_irq, mask)
    }

    /// Register (or, if `None`, unregister) the handler of an interrupt line.
    pub fn irq_set(line: usize, handler: Option<IrqHandler>) -> Result<(), IrqConfigError> {
        irq_set::<Traits>(IrqBank::Primary, line, handler)
    }

    /// [`irq_set`](Self::irq_set) for the extended bank.
    #[cfg(feature = "extended_irq")]
    pub fn irq_set2(line: usize, handler: Option<IrqHandler>) -> Result<(), IrqConfigError> {
        irq_set::<Traits>(IrqBank::Extended, line, handler)
    }

    /// Unmask the interrupt lines in `mask`.
    pub fn irq_enable(mask: IrqMask) -> Result<(), IrqConfigError> {
        let _lock = klock::lock_cpu::<Traits>()?;
        // Safety: CPU Lock active
        unsafe { Traits::enable_irq_lines(IrqBank::Primary, mask) };
        Ok(())
    }

    /// Mask the interrupt lines in `mask`.
    pub fn irq_disable(mask: IrqMask) -> Result<(), IrqConfigError> {
        let _lock = klock::lock_cpu::<Traits>()?;
        // Safety: CPU Lock active
        unsafe { Traits::disable_irq_lines(IrqBank::Primary, mask) };
        Ok(())
    }

    /// [`irq_enable`](Self::irq_enable) for the extended bank.
    #[cfg(feature = "extended_irq")]
    pub fn irq_enable2(mask: IrqMask) -> Result<(), IrqConfigError> {
        let _lock = klock::lock_cpu::<Traits>()?;
        // Safety: CPU Lock active
        unsafe { Traits::enable_irq_lines(IrqBank::Extended, mask) };
        Ok(())
    }

    /// [`irq_disable`](Self::irq_disable) for the extended bank.
    #[cfg(feature = "extended_irq")]
    pub fn irq_disable2(mask: IrqMask) -> Result<(), IrqConfigError> {
        let _lock = klock::lock_cpu::<Traits>()?;
        // Safety: CPU Lock active
        unsafe { Traits::disable_irq_lines(IrqBank::Extended, mask) };
        Ok(())
    }
}

fn irq_wait<Traits: KernelTraits>(
    bank: IrqBank,
    next_irq: bool,
    mask: IrqMask,
) -> Result<IrqMask, IrqWaitError> {
    if mask == 0 {
        return Err(IrqWaitError::BadParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    let bank_state = bank_state::<Traits>(bank);

    let pending = bank_state.pending.write(&mut *lock);
    let latched = *pending & mask;
    *pending &= !mask;
    if latched != 0 && !next_irq {
        return Ok(latched);
    }

    match bank_state
        .waiters
        .wait(lock.borrow_mut(), WaitPayload::Token(mask))
    {
        WaitResult::Mask(fired) => Ok(fired.get()),
        WaitResult::Canceled => Err(IrqWaitError::Interrupted),
        result => unreachable!("{result:?}"),
    }
}

fn irq_set<Traits: KernelTraits>(
    bank: IrqBank,
    line: usize,
    handler: Option<IrqHandler>,
) -> Result<(), IrqConfigError> {
    let mut lock = klock::lock_cpu::<Traits>()?;

    let cell = bank_state::<Traits>(bank)
        .handlers
        .get(line)
        .ok_or(IrqConfigError::BadParam)?;
    cell.replace(&mut *lock, handler);

    Ok(())
}

/// Implements `PortToKernel::handle_irq`.
///
/// Precondition: CPU Lock inactive, an interrupt context
pub(crate) fn handle_irq<Traits: KernelTraits>(bank: IrqBank, fired: IrqMask) {
    let bank_state = bank_state::<Traits>(bank);

    // Call the handlers of the fired lines
    let mut remaining = fired;
    while remaining != 0 {
        let line = remaining.trailing_zeros() as usize;
        remaining &= remaining - 1;

        // The precondition includes CPU Lock being inactive, so this `unwrap`
        // should succeed
        let lock = klock::lock_cpu::<Traits>().unwrap();
        let handler = bank_state.handlers[line].get(&*lock);
        drop(lock);

        if let Some(handler) = handler {
            handler();
        }
    }

    let mut lock = klock::lock_cpu::<Traits>().unwrap();

    // Wake up every waiter whose mask intersects `fired`. The lines nobody
    // was waiting for are latched for the next `irq_wait`.
    let mut consumed = 0;
    let num_woken = bank_state
        .waiters
        .wake_up_matching(lock.borrow_mut(), false, |payload| match *payload {
            WaitPayload::Token(mask) => NonZeroU32::new(mask & fired).map(|bits| {
                consumed |= bits.get();
                WaitResult::Mask(bits)
            }),
            _ => None,
        });

    *bank_state.pending.write(&mut *lock) |= fired & !consumed;

    log::trace!("irq {bank:?} {fired:#010x}: woke {num_woken} thread(s)");

    thread::unlock_cpu_and_check_preemption(lock);
}
