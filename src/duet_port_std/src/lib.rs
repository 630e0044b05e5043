//! Simulation environment for running duet on a hosted environment.
//!
//! Every kernel thread is backed by a host thread, but only the host thread
//! holding the simulated processor runs at any moment, so the kernel sees a
//! single processor. Interrupt handlers run on the host thread that holds the
//! processor when they are taken, like they would on the interrupted
//! thread's stack on real hardware.
//!
//! Interrupts are taken when CPU Lock is released, when a thread starts, and
//! while the processor is idle. The tick counter is virtual: it only advances
//! while no thread is runnable, jumping straight to the next tick deadline.
//!
//! ```rust,ignore
//! duet_port_std::use_port!(unsafe struct SystemTraits);
//! duet_kernel::build!(SystemTraits);
//!
//! fn main() {
//!     port_std_impl::PORT_STATE.port_boot::<SystemTraits>(main_thread, 0);
//! }
//! ```
#![deny(unsafe_op_in_unsafe_fn)]
use duet_kernel::{
    utils::Init, IrqBank, IrqMask, KernelTraits, PortThreading, PortToKernel, System, Thread,
    ThreadAttr, ThreadEntry,
};
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::Cell,
    convert::Infallible,
    panic::{self, AssertUnwindSafe},
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

mod sched;

use self::sched::{Fired, Processor, NUM_IRQ_BANKS};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate duet_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;

/// How long the processor may stay idle with no interrupt source before the
/// system is considered deadlocked.
pub const DEADLOCK_TIMEOUT: Duration = Duration::from_secs(5);

const BANKS: [IrqBank; NUM_IRQ_BANKS] = [IrqBank::Primary, IrqBank::Extended];

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortThreadState = ThreadState> + PortToKernel
{
    fn port_state() -> &'static State;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `Port*`.
#[doc(hidden)]
pub struct State {
    processor: Processor,
    cpu_lock: AtomicBool,
    in_interrupt: AtomicBool,
    /// Set by `yield_cpu` in an interrupt context. The dispatcher runs when
    /// the interrupt handlers return.
    dispatch_pending: AtomicBool,
    /// Set when the result has been reported. The processor stops at the
    /// next idle point.
    shut_down: AtomicBool,
    result_send: SpinMutex<Option<mpsc::Sender<thread::Result<()>>>>,
}

/// The port-specific state of a kernel thread.
#[derive(Debug)]
pub struct ThreadState {
    /// The thread's state in the thread state machine.
    ///
    /// Only accessed by the host thread holding the processor, so
    /// `SpinMutex` is sufficient.
    tsm: SpinMutex<Tsm>,
}

impl Init for ThreadState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl ThreadState {
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

/// Thread state machine
///
/// These don't exactly align with the thread states defined in the kernel.
#[derive(Debug, Clone)]
enum Tsm {
    /// The thread's context state is not initialized. The kernel has to call
    /// `initialize_thread_state` first before choosing this thread.
    Uninit,
    /// The thread's context state is initialized but hasn't started running.
    Dormant(ThreadEntry, usize),
    /// The thread is backed by the contained host thread.
    Running(thread::Thread),
}

/// The role of a host thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The backing thread for a kernel thread.
    Thread,
    /// The backing thread of a kernel thread that exited. It stays alive
    /// until it passes the processor to another host thread.
    Exited,
}

thread_local! {
    /// The current host thread's role. It's automatically assigned after the
    /// creation of a host thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };

    /// The address of the kernel thread backed by the current host thread.
    static CURRENT_THREAD: Cell<usize> = const { Cell::new(0) };
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            processor: Processor::new(),
            cpu_lock: AtomicBool::new(true),
            in_interrupt: AtomicBool::new(false),
            dispatch_pending: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            result_send: SpinMutex::new(None),
        }
    }

    /// Boot the kernel with `main` as the main thread's entry point.
    ///
    /// Returns when [`shutdown`] is called. A panic in any thread is
    /// propagated to the caller.
    pub fn port_boot<Traits: PortInstance>(&'static self, main: ThreadEntry, param: usize) {
        let (result_send, result_recv) = mpsc::channel();
        *self.result_send.lock() = Some(result_send);

        // Create the host thread where the boot phase of the kernel runs
        let boot_thread = self.spawn_host(ThreadRole::Boot, move || {
            // Safety: We are a port, so it's okay to call this
            unsafe { <Traits as PortToKernel>::boot(main, param) };
        });
        log::trace!("startup thread = {:?}", boot_thread.id());

        {
            let mut sched = self.processor.lock();
            self.processor.hand_over(&mut sched, boot_thread.id());
        }

        // Wait until the system shuts down. `result_send` is kept in `self`,
        // so this only fails if something is terribly wrong.
        let result = result_recv
            .recv()
            .unwrap_or_else(|_| Err(Box::new("the result channel was closed")));

        // Propagate any panic that occured in a host thread
        if let Err(e) = result {
            panic::resume_unwind(e);
        }
    }

    /// Spawn a host thread that starts running `f` when it receives the
    /// processor.
    fn spawn_host(
        &'static self,
        role: ThreadRole,
        f: impl FnOnce() + Send + 'static,
    ) -> thread::Thread {
        let join_handle = thread::Builder::new()
            .name(format!("duet-{role:?}").to_lowercase())
            .spawn(move || {
                THREAD_ROLE.with(|r| r.set(role));

                // Block the spawned thread until scheduled to run
                self.processor.wait_for_baton();

                let result = panic::catch_unwind(AssertUnwindSafe(f));

                // `f` doesn't return unless it panics. Send the panic payload
                // to the owner of the system. Leave other threads hanging
                // because there's no way to terminate them safely.
                if let Err(e) = result {
                    log::debug!("{:?} panicked", thread::current().id());
                    self.report(Err(e));
                }

                park_forever();
            })
            .unwrap_or_else(|e| panic!("failed to spawn a host thread: {e}"));

        join_handle.thread().clone()
    }

    fn report(&self, result: Result<(), Box<dyn Any + Send>>) {
        self.shut_down.store(true, Ordering::Relaxed);
        if let Some(result_send) = &*self.result_send.lock() {
            // Ignore if the receiver has already hung up
            let _ = result_send.send(result);
        }
    }

    pub unsafe fn dispatch_first_thread<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_thread");
        assert_eq!(expect_worker_thread(), ThreadRole::Boot);
        assert!(self.is_cpu_lock_active());

        self.cpu_lock.store(false, Ordering::Relaxed);

        // The boot thread has nothing to return to
        self.dispatch::<Traits>(None);
        park_forever();
    }

    /// Choose the next thread and pass the processor to it. Returns when `me`
    /// is chosen again. If `me` is `None`, passes the processor away for
    /// good and never returns.
    ///
    /// Precondition: CPU Lock inactive, not in an interrupt context
    fn dispatch<Traits: PortInstance>(&'static self, me: Option<&'static Thread<Traits>>) {
        loop {
            self.cpu_lock.store(true, Ordering::Relaxed);
            // Safety: CPU Lock active
            unsafe { <Traits as PortToKernel>::choose_running_thread() };
            let next = Traits::state().running_thread();
            self.cpu_lock.store(false, Ordering::Relaxed);

            let Some(next) = next else {
                // Nothing to run
                self.idle::<Traits>();
                continue;
            };

            if me.is_some_and(|me| ptr::eq(me, next)) {
                return;
            }

            let host = self.host_of::<Traits>(next);
            log::trace!("dispatching thread {next:p} on {:?}", host.id());

            {
                let mut sched = self.processor.lock();
                self.processor.hand_over(&mut sched, host.id());
            }

            if me.is_none() {
                park_forever();
            }

            self.processor.wait_for_baton();
            return;
        }
    }

    /// Get the host thread backing `thread`, spawning one if it hasn't
    /// started running yet.
    fn host_of<Traits: PortInstance>(&'static self, thread: &'static Thread<Traits>) -> thread::Thread {
        let mut tsm = thread.port_thread_state.tsm.lock();

        match &*tsm {
            Tsm::Running(host) => host.clone(),
            &Tsm::Dormant(entry_point, entry_param) => {
                let thread_addr = thread as *const Thread<Traits> as usize;
                let host = self.spawn_host(ThreadRole::Thread, move || {
                    CURRENT_THREAD.with(|c| c.set(thread_addr));
                    log::debug!("thread {thread_addr:#x} is now running");

                    // We might have received the processor with interrupts
                    // pending
                    self.take_interrupts::<Traits>();

                    let rc = entry_point(entry_param);

                    // Safety: Nothing on the host thread's stack is unsafe to
                    // `forget`
                    let result: Result<Infallible, _> =
                        unsafe { System::<Traits>::exit_thread(rc) };
                    match result {
                        Ok(x) => match x {},
                        Err(e) => panic!("failed to exit the thread: {e:?}"),
                    }
                });

                log::trace!("spawned {:?} for the thread {thread:p}", host.id());

                *tsm = Tsm::Running(host.clone());
                host
            }
            Tsm::Uninit => unreachable!("thread {thread:p} was chosen without being initialized"),
        }
    }

    /// Wait for an interrupt and handle it. Advances the tick counter to the
    /// next deadline if no interrupt is pending.
    fn idle<Traits: PortInstance>(&'static self) {
        if self.shut_down.load(Ordering::Relaxed) {
            log::trace!("idle: the system has shut down");
            park_forever();
        }

        {
            let mut sched = self.processor.lock();
            loop {
                if sched.has_pending_interrupt() {
                    break;
                }

                if let Some(deadline) = sched.deadline {
                    log::trace!("idle: advancing the tick count to {deadline}");
                    sched.tick = sched.tick.max(deadline);
                    break;
                }

                log::trace!("idle: waiting for an interrupt");
                let (new_sched, timed_out) =
                    self.processor.wait_timeout(sched, DEADLOCK_TIMEOUT);
                sched = new_sched;

                if timed_out && !sched.has_pending_interrupt() && sched.deadline.is_none() {
                    drop(sched);
                    self.report(Err(Box::new("the system deadlocked")));
                    park_forever();
                }
            }
        }

        self.run_interrupt_handlers::<Traits>();

        // We are about to choose a thread anyway
        self.dispatch_pending.store(false, Ordering::Relaxed);
    }

    /// Take every interrupt that can be taken now.
    ///
    /// Precondition: CPU Lock inactive, not in an interrupt context
    fn run_interrupt_handlers<Traits: PortInstance>(&'static self) {
        loop {
            let fired: Fired = self.processor.lock().take_fired();
            if fired.is_empty() {
                break;
            }

            log::trace!("taking interrupts {fired:?}");
            self.in_interrupt.store(true, Ordering::Relaxed);

            if fired.timer {
                // Safety: CPU Lock inactive, an interrupt context
                unsafe { <Traits as PortToKernel>::timer_tick() };
            }

            for (&bank, &bits) in BANKS.iter().zip(&fired.lines) {
                if bits != 0 {
                    // Safety: CPU Lock inactive, an interrupt context
                    unsafe { <Traits as PortToKernel>::handle_irq(bank, bits) };
                }
            }

            self.in_interrupt.store(false, Ordering::Relaxed);
        }
    }

    /// Take pending interrupts if possible, and then run the dispatcher if
    /// the interrupt handlers requested it.
    fn take_interrupts<Traits: PortInstance>(&'static self) {
        if self.is_cpu_lock_active() || self.is_interrupt_context() {
            return;
        }

        self.run_interrupt_handlers::<Traits>();

        if self.is_thread_context() && self.dispatch_pending.swap(false, Ordering::Relaxed) {
            self.dispatch::<Traits>(Some(current_thread::<Traits>()));
        }
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        expect_worker_thread();
        assert!(!self.is_cpu_lock_active());

        if self.is_interrupt_context() || !self.is_thread_context() {
            self.dispatch_pending.store(true, Ordering::Relaxed);
            return;
        }

        self.dispatch::<Traits>(Some(current_thread::<Traits>()));
        self.take_interrupts::<Traits>();
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        thread: &'static Thread<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch({thread:p})");
        assert_eq!(expect_worker_thread(), ThreadRole::Thread);
        assert!(self.is_cpu_lock_active());

        // Dissociate this host thread from the kernel thread. The kernel
        // thread gets a new host thread if it's restarted.
        *thread.port_thread_state.tsm.lock() = Tsm::Uninit;
        THREAD_ROLE.with(|r| r.set(ThreadRole::Exited));
        CURRENT_THREAD.with(|c| c.set(0));

        self.cpu_lock.store(false, Ordering::Relaxed);
        self.dispatch::<Traits>(None);
        park_forever();
    }

    pub unsafe fn enter_cpu_lock(&self) {
        log::trace!("enter_cpu_lock");
        expect_worker_thread();
        assert!(!self.cpu_lock.swap(true, Ordering::Relaxed));
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&'static self) {
        log::trace!("leave_cpu_lock");
        expect_worker_thread();
        assert!(self.cpu_lock.swap(false, Ordering::Relaxed));

        self.take_interrupts::<Traits>();
    }

    pub unsafe fn initialize_thread_state<Traits: PortInstance>(
        &self,
        thread: &'static Thread<Traits>,
        attr: &ThreadAttr,
    ) {
        log::trace!("initialize_thread_state({thread:p})");
        expect_worker_thread();
        assert!(self.is_cpu_lock_active());

        // Host threads bring their own stacks, so `attr.stack` is unused
        let mut tsm = thread.port_thread_state.tsm.lock();
        match &*tsm {
            Tsm::Uninit | Tsm::Dormant(..) => {
                *tsm = Tsm::Dormant(attr.entry_point, attr.entry_param);
            }
            Tsm::Running(_) => unreachable!("thread {thread:p} is still running"),
        }
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock.load(Ordering::Relaxed)
    }

    pub fn is_thread_context(&self) -> bool {
        THREAD_ROLE.with(|role| role.get() == ThreadRole::Thread)
    }

    pub fn is_interrupt_context(&self) -> bool {
        self.in_interrupt.load(Ordering::Relaxed)
    }

    pub unsafe fn enable_irq_lines(&self, bank: IrqBank, mask: IrqMask) {
        log::trace!("enable_irq_lines({bank:?}, {mask:#010x})");
        self.processor.lock().enabled[bank_index(bank)] |= mask;
    }

    pub unsafe fn disable_irq_lines(&self, bank: IrqBank, mask: IrqMask) {
        log::trace!("disable_irq_lines({bank:?}, {mask:#010x})");
        self.processor.lock().enabled[bank_index(bank)] &= !mask;
    }

    pub fn tick_count(&self) -> u64 {
        self.processor.lock().tick
    }

    pub unsafe fn set_tick_deadline(&self, deadline: Option<u64>) {
        log::trace!("set_tick_deadline({deadline:?})");
        self.processor.lock().deadline = deadline;
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

fn bank_index(bank: IrqBank) -> usize {
    match bank {
        IrqBank::Primary => 0,
        IrqBank::Extended => 1,
    }
}

/// Get the kernel thread backed by the current host thread.
fn current_thread<Traits: PortInstance>() -> &'static Thread<Traits> {
    let addr = CURRENT_THREAD.with(|c| c.get());
    assert_ne!(addr, 0, "the current host thread doesn't back a kernel thread");
    // Safety: `addr` was set by `host_of` from a `&'static Thread<Traits>`
    unsafe { &*(addr as *const Thread<Traits>) }
}

/// Assert that the current thread is a host thread managed by the port.
fn expect_worker_thread() -> ThreadRole {
    let role = THREAD_ROLE.with(|r| r.get());
    assert_ne!(role, ThreadRole::Unknown);
    role
}

fn park_forever() -> ! {
    loop {
        thread::park();
    }
}

/// Initiate shutdown. [`State::port_boot`] returns after this.
///
/// Host threads are left blocked and are cleaned up when the process exits.
pub fn shutdown<Traits: PortInstance>() {
    log::debug!("shutdown requested");
    Traits::port_state().report(Ok(()));
}

/// Raise the specified interrupt lines.
///
/// Called from a kernel thread, the interrupts are taken before this function
/// returns unless CPU Lock is active or the lines are masked. Called from an
/// external thread, they are taken at the next opportunity.
pub fn pend_irq<Traits: PortInstance>(bank: IrqBank, mask: IrqMask) {
    log::trace!("pend_irq({bank:?}, {mask:#010x})");
    let state = Traits::port_state();

    state.processor.lock().pending[bank_index(bank)] |= mask;
    state.processor.notify();

    if THREAD_ROLE.with(|r| r.get()) != ThreadRole::Unknown && state.processor.is_owner() {
        state.take_interrupts::<Traits>();
    }
}

/// Advance the tick counter by `ticks` as if the processor had been busy
/// for that long. Timer deadlines passed in the meantime are not honored
/// until the advance is complete, so a tick task due in the skipped range
/// fires late.
///
/// The overdue timer interrupt is taken the same way as one raised by
/// [`pend_irq`].
pub fn advance_tick<Traits: PortInstance>(ticks: u64) {
    let state = Traits::port_state();
    {
        let mut sched = state.processor.lock();
        sched.tick += ticks;
        log::trace!("advance_tick({ticks}): now {}", sched.tick);
    }
    state.processor.notify();

    if THREAD_ROLE.with(|r| r.get()) != ThreadRole::Unknown && state.processor.is_owner() {
        state.take_interrupts::<Traits>();
    }
}

#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::duet_kernel::{
                IrqBank, IrqMask, PortInterrupts, PortThreading, PortTimer, Thread, ThreadAttr,
            };
            use $crate::{PortInstance, State, ThreadState};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelTraits`
            unsafe impl PortThreading for $SystemTraits {
                type PortThreadState = ThreadState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_THREAD_STATE_INIT: Self::PortThreadState = ThreadState::new();

                unsafe fn dispatch_first_thread() -> ! {
                    unsafe { PORT_STATE.dispatch_first_thread::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(thread: &'static Thread<Self>) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(thread) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                unsafe fn initialize_thread_state(thread: &'static Thread<Self>, attr: &ThreadAttr) {
                    unsafe { PORT_STATE.initialize_thread_state::<Self>(thread, attr) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_thread_context() -> bool {
                    PORT_STATE.is_thread_context()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }
            }

            impl PortInterrupts for $SystemTraits {
                unsafe fn enable_irq_lines(bank: IrqBank, mask: IrqMask) {
                    unsafe { PORT_STATE.enable_irq_lines(bank, mask) }
                }

                unsafe fn disable_irq_lines(bank: IrqBank, mask: IrqMask) {
                    unsafe { PORT_STATE.disable_irq_lines(bank, mask) }
                }
            }

            impl PortTimer for $SystemTraits {
                fn tick_count() -> u64 {
                    PORT_STATE.tick_count()
                }

                unsafe fn set_tick_deadline(deadline: Option<u64>) {
                    unsafe { PORT_STATE.set_tick_deadline(deadline) }
                }
            }
        }
    };
}
