//! Runs the main thread and checks the initial state of the system.
use core::marker::PhantomData;
use duet_kernel::{KernelTraits, System, ThreadStatus, MAIN_THREAD_PRIORITY};

use super::Driver;

pub struct App<Traits> {
    _phantom: PhantomData<Traits>,
}

impl<Traits: KernelTraits> App<Traits> {
    pub const fn new() -> Self {
        App {
            _phantom: PhantomData,
        }
    }
}

pub fn main<Traits: KernelTraits, D: Driver<App<Traits>>>(param: usize) -> i32 {
    log::trace!("Good morning, Angel!");
    assert_eq!(param, 0);

    let me = System::<Traits>::current_thread().unwrap();
    assert!(core::ptr::eq(me, Traits::state().main_thread()));
    assert_eq!(me.priority(), Ok(MAIN_THREAD_PRIORITY));
    assert_eq!(me.effective_priority(), Ok(MAIN_THREAD_PRIORITY));
    assert_eq!(me.status(), Ok(ThreadStatus::Running));
    assert!(me.local_storage().is_null());

    // Nothing else is runnable, so this returns immediately
    System::<Traits>::yield_now().unwrap();

    D::success();
    0
}
