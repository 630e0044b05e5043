//! Kernel test cases
use duet_kernel::{IrqBank, IrqMask, KernelTraits, ThreadStack};

/// Instantiation parameters of a test case.
///
/// This trait has two purposes: (1) It serves as an interface to a test driver.
/// It provides methods to notify the test driver of test success or failure.
/// (2) It provides runtime access to the `App` structure.
pub trait Driver<App> {
    type Traits: KernelTraits;

    /// Get a reference to `App` of the current test case.
    fn app() -> &'static App;

    /// Signal to the test runner that a test has succeeded.
    fn success();

    /// Signal to the test runner that a test has failed.
    fn fail();

    /// Raise the specified interrupt lines. The interrupts are taken as soon
    /// as they are unmasked and CPU Lock is inactive.
    fn pend_irq(bank: IrqBank, mask: IrqMask);

    /// Advance the tick counter by `ticks` without taking the timer
    /// interrupt in the meantime, so that tick tasks due in that range fire
    /// late.
    fn advance_time(ticks: u32);
}

/// The stack type used by the threads created by the test cases.
pub(crate) type TestStack = ThreadStack<4096>;

pub mod basic;
pub mod condvar;
pub mod interrupt_disallowed_services;
pub mod irq_wait;
pub mod mailbox;
pub mod mutex_exit_release;
pub mod mutex_misc;
pub mod mutex_priority_inheritance;
pub mod recursive_mutex;
pub mod sleep;
pub mod thread_join;
pub mod thread_pause;
pub mod thread_priority;
pub mod thread_queue_fifo;
pub mod thread_set_priority;
pub mod thread_yield;
pub mod tick_task_periodic;
pub mod tick_task_stop;
pub mod timer_wait;
pub mod wait_queue_cancel;
pub mod wait_queue_order;
pub mod wait_queue_value_mask;

/// Invoke the specified macro with a description of all defined kernel test
/// cases.
///
/// # Example
///
/// ```rust,ignore
/// macro_rules! instantiate_kernel_tests {
///     ( $( { path: $path:path, name_ident: $name_ident:ident, }, )* ) => {
///         $( mod $name_ident { use $path as test_case; /* ... */ } )*
///     };
/// }
///
/// duet_test_suite::get_kernel_tests!(instantiate_kernel_tests!());
/// ```
#[macro_export]
macro_rules! get_kernel_tests {
    ( $cb:ident!( $($pfx:tt)* ) ) => {
        $cb! {
            $($pfx)*
            { path: $crate::kernel_tests::basic, name_ident: basic, },
            { path: $crate::kernel_tests::condvar, name_ident: condvar, },
            { path: $crate::kernel_tests::interrupt_disallowed_services, name_ident: interrupt_disallowed_services, },
            { path: $crate::kernel_tests::irq_wait, name_ident: irq_wait, },
            { path: $crate::kernel_tests::mailbox, name_ident: mailbox, },
            { path: $crate::kernel_tests::mutex_exit_release, name_ident: mutex_exit_release, },
            { path: $crate::kernel_tests::mutex_misc, name_ident: mutex_misc, },
            { path: $crate::kernel_tests::mutex_priority_inheritance, name_ident: mutex_priority_inheritance, },
            { path: $crate::kernel_tests::recursive_mutex, name_ident: recursive_mutex, },
            { path: $crate::kernel_tests::sleep, name_ident: sleep, },
            { path: $crate::kernel_tests::thread_join, name_ident: thread_join, },
            { path: $crate::kernel_tests::thread_pause, name_ident: thread_pause, },
            { path: $crate::kernel_tests::thread_priority, name_ident: thread_priority, },
            { path: $crate::kernel_tests::thread_queue_fifo, name_ident: thread_queue_fifo, },
            { path: $crate::kernel_tests::thread_set_priority, name_ident: thread_set_priority, },
            { path: $crate::kernel_tests::thread_yield, name_ident: thread_yield, },
            { path: $crate::kernel_tests::tick_task_periodic, name_ident: tick_task_periodic, },
            { path: $crate::kernel_tests::tick_task_stop, name_ident: tick_task_stop, },
            { path: $crate::kernel_tests::timer_wait, name_ident: timer_wait, },
            { path: $crate::kernel_tests::wait_queue_cancel, name_ident: wait_queue_cancel, },
            { path: $crate::kernel_tests::wait_queue_order, name_ident: wait_queue_order, },
            { path: $crate::kernel_tests::wait_queue_value_mask, name_ident: wait_queue_value_mask, },
        }
    };
}
