//! A priority-preemptive thread scheduler with blocking synchronization
//! primitives, meant to run one instance per processor.
//!
//! The kernel is instantiated by defining a *kernel trait type*, implementing
//! the port traits ([`PortThreading`], [`PortInterrupts`], [`PortTimer`]) on
//! it (normally done by a port crate's macro), and binding the kernel state
//! to it with [`build!`]. All kernel services are then reached through
//! [`System<Traits>`](System) and the kernel objects (`Thread<Traits>`,
//! `Mutex<Traits>`, and so on), which are usually placed in `static`s.
//!
//! # Contexts
//!
//! Code runs either in a *thread context* or in an *interrupt context*.
//! Blocking services can only be used in a thread context outside interrupt
//! handlers; calling them elsewhere fails with `BadContext`. Non-blocking
//! services, such as [`WaitQueue::unblock_one_by_value`] and
//! [`Mailbox::try_send`], can be used anywhere.
//!
//! # CPU Lock
//!
//! All kernel state is guarded by *CPU Lock*, a state in which the port
//! masks every kernel-managed interrupt. Kernel services acquire it
//! internally and fail with `BadContext` if it's already active.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::cast_lossless)]
use atomic_ref::AtomicRef;
use core::{fmt, marker::PhantomData, ptr, sync::atomic::Ordering};

pub mod utils;

mod condvar;
mod error;
mod irq;
mod klock;
mod mailbox;
mod mutex;
mod recursive_mutex;
mod state;
mod thread;
mod tick;
mod wait;

pub use self::{
    condvar::CondVar,
    error::*,
    irq::{IrqBank, IrqHandler, IrqMask, NUM_IRQ_LINES},
    mailbox::Mailbox,
    mutex::{Mutex, MutexGuard},
    recursive_mutex::{RecursiveMutex, RecursiveMutexGuard},
    thread::{Thread, ThreadAttr, ThreadEntry, ThreadStack, ThreadStatus},
    tick::{ticks_from_hz, ticks_from_usec, TickTask, TickTaskFn, SYSTEM_CLOCK, TICK_FREQ},
    wait::{BlockResult, WaitQueue},
};

use self::utils::Init;

/// The number of thread priority levels. `0` is the highest priority.
pub const NUM_PRIORITY_LEVELS: usize = 64;

/// The priority of the built-in main thread.
pub const MAIN_THREAD_PRIORITY: usize = 0x1c;

/// The alignment requirement of a thread's stack top.
pub const STACK_ALIGN: usize = 8;

/// Wraps a kernel trait type to provide the kernel services as associated
/// functions.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits> fmt::Debug for System<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("System")
    }
}

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: Sized + 'static {
    type PortThreadState: Send + Sync + Init + fmt::Debug + 'static;

    /// The initial value of [`Thread::port_thread_state`] for all threads.
    #[allow(clippy::declare_interior_mutable_const)]
    const PORT_THREAD_STATE_INIT: Self::PortThreadState;

    /// Transfer the control to the thread chosen by
    /// [`PortToKernel::choose_running_thread`], discarding the current
    /// (startup) context.
    ///
    /// Precondition: CPU Lock active, boot phase
    unsafe fn dispatch_first_thread() -> !;

    /// Yield the processor.
    ///
    /// In a thread context, the port calls
    /// [`PortToKernel::choose_running_thread`] and switches to the chosen
    /// thread before returning. In an interrupt context, the switch is
    /// deferred until the outermost interrupt handler returns.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Destroy the state of the previously running thread (`thread`) and
    /// proceed to the dispatcher.
    ///
    /// Precondition: CPU Lock active
    unsafe fn exit_and_dispatch(thread: &'static Thread<Self>) -> !;

    /// Disable all kernel-managed interrupts (this state is called *CPU Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Activate CPU Lock. Return `true` iff CPU Lock was inactive before the
    /// call.
    unsafe fn try_enter_cpu_lock() -> bool {
        if Self::is_cpu_lock_active() {
            false
        } else {
            // Safety: CPU Lock inactive
            unsafe { Self::enter_cpu_lock() };
            true
        }
    }

    /// Prepare the thread for activation. More specifically, set the current
    /// program counter to [`ThreadAttr::entry_point`] and the current stack
    /// pointer to the top of [`ThreadAttr::stack`], ensuring the thread will
    /// start execution from `entry_point` next time it receives the control.
    /// Returning from `entry_point` must behave like
    /// [`System::exit_thread`].
    ///
    /// Precondition: CPU Lock active, the thread is not running
    unsafe fn initialize_thread_state(thread: &'static Thread<Self>, attr: &ThreadAttr);

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a thread
    /// context, i.e., the code is running on behalf of a kernel thread
    /// (possibly inside an interrupt handler that interrupted it).
    fn is_thread_context() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// context.
    fn is_interrupt_context() -> bool;
}

/// Implemented by a port. This trait contains items related to controlling
/// interrupt lines.
#[allow(clippy::missing_safety_doc)]
pub trait PortInterrupts {
    /// Unmask the specified interrupt lines.
    ///
    /// Precondition: CPU Lock active
    unsafe fn enable_irq_lines(bank: IrqBank, mask: IrqMask);

    /// Mask the specified interrupt lines.
    ///
    /// Precondition: CPU Lock active
    unsafe fn disable_irq_lines(bank: IrqBank, mask: IrqMask);
}

/// Implemented by a port. This trait contains items related to the tick
/// counter.
#[allow(clippy::missing_safety_doc)]
pub trait PortTimer {
    /// Read the tick counter, which counts up at [`TICK_FREQ`] hertz.
    fn tick_count() -> u64;

    /// Arrange [`PortToKernel::timer_tick`] to be called when the tick count
    /// reaches `deadline`, or as soon as possible if it already has. `None`
    /// cancels the previous request.
    ///
    /// Precondition: CPU Lock active
    unsafe fn set_tick_deadline(deadline: Option<u64>);
}

/// Represents a particular group of traits that a port should implement.
pub trait Port: PortThreading + PortInterrupts + PortTimer {}

impl<T: PortThreading + PortInterrupts + PortTimer> Port for T {}

/// Associates a kernel trait type with kernel-private data. Use [`build!`]
/// to implement.
///
/// # Safety
///
/// This is only intended to be implemented by `build!`.
pub unsafe trait KernelStatic: Port {
    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;
}

/// The traits implemented by a kernel trait type that can be used with the
/// kernel.
pub trait KernelTraits: Port + KernelStatic {}

impl<T: Port + KernelStatic> KernelTraits for T {}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel {
    /// Initialize runtime structures, start the main thread with the given
    /// entry point, and transfer the control to it.
    ///
    /// Should be called for exactly once by the port.
    ///
    /// Precondition: CPU Lock active, boot phase
    unsafe fn boot(main: ThreadEntry, param: usize) -> !;

    /// Determine the next thread to run and store it in the running thread
    /// pointer ([`State::running_thread`]).
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_thread();

    /// Called by a port's timer driver when the deadline set by
    /// [`PortTimer::set_tick_deadline`] is reached.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context
    unsafe fn timer_tick();

    /// Called by a port's interrupt handler when the lines in `fired` of the
    /// specified bank have fired.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context
    unsafe fn handle_irq(bank: IrqBank, fired: IrqMask);
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot(main: ThreadEntry, param: usize) -> ! {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        let attr = ThreadAttr {
            entry_point: main,
            entry_param: param,
            stack: ptr::slice_from_raw_parts_mut(ptr::null_mut(), 0),
        };

        // Safety: We are booting, so this is the only call
        unsafe { thread::init_main_thread(lock.borrow_mut(), &attr) };

        log::debug!("boot: starting the main thread");

        // Choose the first thread to run
        thread::choose_next_running_thread(lock.borrow_mut());

        // Post-condition of `dispatch_first_thread`: CPU Lock active
        core::mem::forget(lock);

        // Safety: CPU Lock active, boot phase
        unsafe { Traits::dispatch_first_thread() };
    }

    #[inline]
    unsafe fn choose_running_thread() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        thread::choose_next_running_thread(lock.borrow_mut());

        // Post-condition: CPU Lock active
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        tick::handle_tick::<Traits>();
    }

    unsafe fn handle_irq(bank: IrqBank, fired: IrqMask) {
        irq::handle_irq::<Traits>(bank, fired);
    }
}

/// Global kernel state.
pub struct State<Traits: PortThreading> {
    /// The currently running thread.
    running_thread: AtomicRef<'static, Thread<Traits>>,

    /// The ready queue.
    ready_queue: thread::readyqueue::ReadyQueue<Traits>,

    /// The built-in thread started by [`PortToKernel::boot`].
    main_thread: Thread<Traits>,

    irq_banks: [irq::IrqBankState<Traits>; irq::NUM_IRQ_BANKS],

    tick: tick::TickState<Traits>,

    /// Threads waiting in [`System::timer_wait`].
    timer_waiters: WaitQueue<Traits>,
}

impl<Traits: PortThreading> Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        running_thread: AtomicRef::new(None),
        ready_queue: Init::INIT,
        main_thread: Init::INIT,
        irq_banks: Init::INIT,
        tick: Init::INIT,
        timer_waiters: Init::INIT,
    };
}

impl<Traits: PortThreading> State<Traits> {
    /// Construct the initial state. Used by [`build!`].
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Get the currently running thread.
    #[inline]
    pub fn running_thread(&self) -> Option<&'static Thread<Traits>> {
        self.running_thread.load(Ordering::Relaxed)
    }

    /// Get the built-in main thread.
    #[inline]
    pub fn main_thread(&'static self) -> &'static Thread<Traits> {
        &self.main_thread
    }
}

impl<Traits: PortThreading> Default for State<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field(
                "running_thread",
                &self.running_thread().map(|x| x as *const _),
            )
            .field("ready_queue", &self.ready_queue)
            .field("main_thread", &self.main_thread)
            .field("irq_banks", &self.irq_banks)
            .field("tick", &self.tick)
            .field("timer_waiters", &self.timer_waiters)
            .finish()
    }
}

/// Instantiate the kernel for a kernel trait type, which must implement
/// [`Port`].
///
/// ```rust,ignore
/// struct SystemTraits;
/// // (implement the port traits, usually by a port crate's macro)
/// duet_kernel::build!(SystemTraits);
/// ```
#[macro_export]
macro_rules! build {
    ($Traits:ty) => {
        const _: () = {
            static KERNEL_STATE: $crate::State<$Traits> = $crate::State::new();

            // Safety: We are `build!`, so it's okay to `impl` this
            unsafe impl $crate::KernelStatic for $Traits {
                #[inline(always)]
                fn state() -> &'static $crate::State<Self> {
                    &KERNEL_STATE
                }
            }
        };
    };
}
