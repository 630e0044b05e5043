//! Wait queues
use core::{fmt, num::NonZeroU32, ops, ptr::NonNull};

use crate::{
    error::{BadObjectStateError, BlockError, CancelWaitError, UnblockError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    mutex, state,
    thread::{self, Thread, ThreadSt},
    utils::{
        intrusive_list::{self, ListAccessor},
        Init,
    },
    KernelTraits, PortThreading,
};

// Type definitions and trait implementations for wait lists
// ---------------------------------------------------------------------------

/// A reference to a [`Wait`].
pub(crate) struct WaitRef<Traits: PortThreading>(NonNull<Wait<Traits>>);

// Safety: `Wait` is only accessed with CPU Lock active
unsafe impl<Traits: PortThreading> Send for WaitRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for WaitRef<Traits> {}

impl<Traits: PortThreading> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for WaitRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for WaitRef<Traits> {}

use self::unsafe_static::UnsafeStatic;
mod unsafe_static {
    use super::*;

    pub(crate) struct UnsafeStatic {
        _nonexhaustive: (),
    }

    impl UnsafeStatic {
        /// Construct an `UnsafeStatic`.
        ///
        /// # Safety
        ///
        /// All pointees to be accessed through the constructed `UnsafeStatic`
        /// must be valid.
        #[inline]
        pub(crate) const unsafe fn new() -> &'static Self {
            &Self { _nonexhaustive: () }
        }
    }

    impl<Traits: PortThreading> ops::Index<WaitRef<Traits>> for UnsafeStatic {
        type Output = Wait<Traits>;

        #[inline]
        fn index(&self, index: WaitRef<Traits>) -> &Self::Output {
            // Safety: See `wait_queue_accessor`.
            unsafe { &*index.0.as_ptr() }
        }
    }
}

/// Get a `ListAccessor` used to access a wait queue.
macro_rules! wait_queue_accessor {
    ($list:expr, $key:expr) => {
        ListAccessor::new(
            $list,
            // Safety: All elements are extant because we never drop a
            //     `Wait` when it's still in a wait queue.
            unsafe { UnsafeStatic::new() },
            |wait: &Wait<_>| &wait.link,
            $key,
        )
    };
}

// ---------------------------------------------------------------------------

/// *A wait object* describing *which thread* is waiting on *what condition*.
///
/// Constructed on the waiting thread's stack by a wait operation, and only
/// survives until the operation returns, that is, until the thread is not
/// waiting anymore.
pub(crate) struct Wait<Traits: PortThreading> {
    /// The thread that is waiting for something.
    thread: &'static Thread<Traits>,

    /// Forms a linked list headed by `wait_queue.waits`.
    link: CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,

    /// The containing [`WaitQueue`].
    wait_queue: Option<&'static WaitQueue<Traits>>,

    payload: WaitPayload<Traits>,
}

/// What a [`Wait`] is waiting for.
pub(crate) enum WaitPayload<Traits: PortThreading> {
    /// [`WaitQueue::block`]
    Token(u32),
    Mutex(&'static mutex::Mutex<Traits>),
    Join,
    Sleep,
    /// [`System::timer_wait`](crate::System::timer_wait). Holds the address
    /// of the timer's tick task.
    Timer(usize),
}

impl<Traits: PortThreading> Clone for WaitPayload<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for WaitPayload<Traits> {}

/// How a wait operation ended. Set by the waker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitResult {
    Canceled,
    Value,
    Mask(NonZeroU32),
    Exited(i32),
}

/// The outcome of [`WaitQueue::block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockResult {
    /// The wait was canceled by [`WaitQueue::cancel`] or
    /// [`Thread::cancel_wait`].
    Canceled,
    /// The thread was woken by a value match.
    Value,
    /// The thread was woken by a mask match. Holds the intersection of the
    /// thread's token and the mask.
    Mask(NonZeroU32),
}

impl BlockResult {
    /// Get the raw result value: `0` if canceled, `1` for a value match, or
    /// the matched bits for a mask match.
    pub fn to_raw(self) -> u32 {
        match self {
            Self::Canceled => 0,
            Self::Value => 1,
            Self::Mask(bits) => bits.get(),
        }
    }
}

/// A priority-ordered queue of threads blocked on something. Threads of
/// the same effective priority are kept in FIFO order.
///
/// A queue is identified by its address, so it's normally placed in a
/// `static`.
pub struct WaitQueue<Traits: PortThreading> {
    /// Wait objects waiting on this queue. The waiting threads
    /// (`Wait::thread`) must be in the Waiting state.
    ///
    /// All elements of this linked list must be valid.
    waits: CpuLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

/// The wait state of a thread.
pub(crate) struct ThreadWait<Traits: PortThreading> {
    /// The wait object describing the ongoing Waiting state of the thread.
    /// Should be `None` iff the thread is not in the Waiting state.
    ///
    /// The pointee must be valid.
    current_wait: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    /// The result of the last wait operation. Set by a waker.
    wait_result: CpuLockCell<Traits, WaitResult>,
}

impl<Traits: PortThreading> Init for ThreadWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current_wait: Init::INIT,
        wait_result: CpuLockCell::new(WaitResult::Value),
    };
}

impl<Traits: PortThreading> WaitQueue<Traits> {
    /// Construct an empty `WaitQueue`.
    pub const fn new() -> Self {
        Self {
            waits: Init::INIT,
        }
    }
}

impl<Traits: PortThreading> Default for WaitQueue<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: PortThreading> Drop for WaitQueue<Traits> {
    #[inline]
    fn drop(&mut self) {
        if !self.waits.get_mut().is_empty() {
            panic!("wait queue is dropped while threads are waiting on it");
        }
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Block the calling thread on this queue with the given token until
    /// it's woken by a matching unblock operation or canceled.
    pub fn block(&'static self, token: u32) -> Result<BlockResult, BlockError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        Ok(match self.wait(lock.borrow_mut(), WaitPayload::Token(token)) {
            WaitResult::Canceled => BlockResult::Canceled,
            WaitResult::Mask(bits) => BlockResult::Mask(bits),
            WaitResult::Value => BlockResult::Value,
            result => unreachable!("{result:?}"),
        })
    }

    /// Wake the first thread whose token equals `value`. Returns `true` if a
    /// thread was woken.
    pub fn unblock_one_by_value(&'static self, value: u32) -> Result<bool, UnblockError> {
        self.unblock_matching(true, |token| (token == value).then_some(WaitResult::Value))
            .map(|count| count != 0)
    }

    /// Wake the first thread whose token intersects `mask`. Returns `true` if
    /// a thread was woken.
    pub fn unblock_one_by_mask(&'static self, mask: u32) -> Result<bool, UnblockError> {
        self.unblock_matching(true, mask_matcher(mask))
            .map(|count| count != 0)
    }

    /// Wake every thread whose token equals `value`. Returns the number of
    /// woken threads.
    pub fn unblock_all_by_value(&'static self, value: u32) -> Result<usize, UnblockError> {
        self.unblock_matching(false, |token| (token == value).then_some(WaitResult::Value))
    }

    /// Wake every thread whose token intersects `mask`. Returns the number of
    /// woken threads.
    pub fn unblock_all_by_mask(&'static self, mask: u32) -> Result<usize, UnblockError> {
        self.unblock_matching(false, mask_matcher(mask))
    }

    fn unblock_matching(
        &'static self,
        one_only: bool,
        mut cond: impl FnMut(u32) -> Option<WaitResult>,
    ) -> Result<usize, UnblockError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let count = self.wake_up_matching(lock.borrow_mut(), one_only, |payload| match *payload {
            WaitPayload::Token(token) => cond(token),
            _ => None,
        });
        thread::unlock_cpu_and_check_preemption(lock);
        Ok(count)
    }

    /// Cancel the wait of `thread`, which must be blocked in this queue. The
    /// canceled [`block`] call returns [`BlockResult::Canceled`].
    ///
    /// [`block`]: Self::block
    pub fn cancel(&'static self, thread: &'static Thread<Traits>) -> Result<(), CancelWaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let in_this_queue = with_current_wait(lock.borrow_mut(), thread, |wait| {
            wait.and_then(|wait| wait.wait_queue)
                .is_some_and(|queue| core::ptr::eq(queue, self))
        });
        if !in_this_queue {
            return Err(CancelWaitError::BadObjectState);
        }

        interrupt_thread(lock.borrow_mut(), thread, WaitResult::Canceled)?;
        thread::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Return `true` if no threads are blocked in this queue.
    pub fn is_empty(&self) -> Result<bool, UnblockError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.waits.read(&*lock).is_empty())
    }

    /// Insert a wait object pertaining to the currently running thread to
    /// `self`, transitioning the thread into the Waiting state.
    ///
    /// The current context must be waitable (This function doesn't check
    /// that).
    pub(crate) fn wait(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> WaitResult {
        let thread = Traits::state().running_thread().unwrap();
        let wait = Wait {
            thread,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };
        let wait_ref = WaitRef((&wait).into());

        // Insert `wait_ref` into `self.waits`
        let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        let cur_thread_pri = thread.effective_priority.get(&**accessor.cell_key());
        let insert_at = Self::find_insertion_position_by_thread_priority(cur_thread_pri, &accessor);
        if accessor.insert(wait_ref, insert_at).is_err() {
            unreachable!();
        }

        thread.wait.current_wait.replace(&mut *lock, Some(wait_ref));

        // A new waiter can raise the owner's effective priority
        if let WaitPayload::Mutex(mutex) = payload {
            mutex::update_owner_priority(lock.borrow_mut(), mutex);
        }

        // Transition the thread into Waiting. This statement will complete
        // when the thread is woken up.
        thread::wait_until_woken_up(lock.borrow_mut());

        // `wait_ref` should have been removed from a wait queue by a waker
        assert!(wait.link.read(&*lock).is_none());
        assert!(thread.wait.current_wait.get(&*lock).is_none());

        thread.wait.wait_result.get(&*lock)
    }

    /// Find the insertion position for a wait object owned by a thread whose
    /// priority is `cur_thread_pri`.
    fn find_insertion_position_by_thread_priority<MapLink>(
        cur_thread_pri: u8,
        accessor: &ListAccessor<
            '_,
            &CpuLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,
            UnsafeStatic,
            MapLink,
            CpuLockTokenRefMut<'_, Traits>,
        >,
    ) -> Option<WaitRef<Traits>>
    where
        MapLink: Fn(
            &Wait<Traits>,
        ) -> &CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,
    {
        let mut insert_at = None;
        let mut cursor = accessor.back();
        while let Some(next_cursor) = cursor {
            // Should the new wait object be inserted at this or an earlier
            // position?
            let next_cursor_thread = accessor[next_cursor].thread;
            let next_cursor_thread_pri = next_cursor_thread
                .effective_priority
                .get(&**accessor.cell_key());
            if next_cursor_thread_pri > cur_thread_pri {
                insert_at = Some(next_cursor);
                cursor = accessor.prev(next_cursor).unwrap_or(None);
            } else {
                break;
            }
        }
        insert_at
    }

    /// Reposition `wait` in the wait queue after a change in the waiting
    /// thread's effective priority.
    fn reorder_wait(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, wait: &Wait<Traits>) {
        let wait_ref = WaitRef(wait.into());
        let thread = wait.thread;
        debug_assert!(wait.wait_queue.is_some_and(|q| core::ptr::eq(q, self)));

        let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        if accessor.remove(wait_ref).is_err() {
            unreachable!();
        }

        let cur_thread_pri = thread.effective_priority.get(&**accessor.cell_key());
        let insert_at = Self::find_insertion_position_by_thread_priority(cur_thread_pri, &accessor);
        if accessor.insert(wait_ref, insert_at).is_err() {
            unreachable!();
        }
    }

    /// Get the next waiting thread to be woken up.
    pub(crate) fn first_waiting_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static Thread<Traits>> {
        let accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        accessor.front_data().map(|wait| wait.thread)
    }

    /// Wake up up to one waiting thread with `result`. Returns `true` if it
    /// has woken up a thread.
    ///
    /// This method may make a thread Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_one(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        result: WaitResult,
    ) -> bool {
        let mut accessor = wait_queue_accessor!(&self.waits, lock.borrow_mut());
        let Some(wait_ref) = accessor.pop_front() else {
            return false;
        };

        // Safety: `wait_ref` was in `self.waits` at the beginning of this
        // function call, so it points to a valid `Wait`
        let wait = unsafe { wait_ref.0.as_ref() };
        debug_assert!(wait.wait_queue.is_some_and(|q| core::ptr::eq(q, self)));

        complete_wait(lock.borrow_mut(), wait, result);

        true
    }

    /// Wake up every waiting thread with `result`. Returns the number of
    /// woken threads.
    pub(crate) fn wake_up_all(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        result: WaitResult,
    ) -> usize {
        self.wake_up_matching(lock, false, |_| Some(result))
    }

    /// Wake up the waiting threads for which `cond` returns a result, in
    /// queue order. Stops after the first one if `one_only` is set. Returns
    /// the number of woken threads.
    ///
    /// This method may make a thread Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_matching(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        one_only: bool,
        mut cond: impl FnMut(&WaitPayload<Traits>) -> Option<WaitResult>,
    ) -> usize {
        let mut count = 0;
        let mut cur = wait_queue_accessor!(&self.waits, lock.borrow_mut()).front();

        while let Some(wait_ref) = cur {
            // Find the next wait object before we possibly remove `wait_ref`
            // from `self.waits`.
            cur = wait_queue_accessor!(&self.waits, lock.borrow_mut())
                .next(wait_ref)
                .unwrap_or(None);

            // Safety: `wait_ref` is in `self.waits`
            let wait = unsafe { wait_ref.0.as_ref() };

            let Some(result) = cond(&wait.payload) else {
                continue;
            };

            if wait_queue_accessor!(&self.waits, lock.borrow_mut())
                .remove(wait_ref)
                .is_err()
            {
                unreachable!();
            }

            complete_wait(lock.borrow_mut(), wait, result);
            count += 1;

            if one_only {
                break;
            }
        }

        count
    }
}

fn mask_matcher(mask: u32) -> impl FnMut(u32) -> Option<WaitResult> {
    move |token| NonZeroU32::new(token & mask).map(WaitResult::Mask)
}

impl<Traits: KernelTraits> fmt::Debug for Wait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ thread: {:p}, payload: {:?} }}",
            self.thread, self.payload
        )
    }
}

impl<Traits: PortThreading> fmt::Debug for WaitPayload<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Token(token) => write!(f, "Token({token:#x})"),
            Self::Mutex(mutex) => write!(f, "Mutex({mutex:p})"),
            Self::Join => f.write_str("Join"),
            Self::Sleep => f.write_str("Sleep"),
            Self::Timer(addr) => write!(f, "Timer({addr:#x})"),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        struct WaitQueuePrinter<'a, Traits: KernelTraits> {
            waits: &'a CpuLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,
        }

        impl<Traits: KernelTraits> fmt::Debug for WaitQueuePrinter<'_, Traits> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if let Ok(mut lock) = klock::lock_cpu() {
                    let accessor = wait_queue_accessor!(self.waits, lock.borrow_mut());

                    f.debug_list()
                        .entries(accessor.iter().map(|(_, wait)| wait))
                        .finish()
                } else {
                    f.write_str("< locked >")
                }
            }
        }

        f.debug_struct("WaitQueue")
            .field("waits", &WaitQueuePrinter { waits: &self.waits })
            .finish()
    }
}

impl<Traits: KernelTraits> fmt::Debug for ThreadWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadWait")
            .field(
                "current_wait",
                &self.current_wait.debug_fmt_with(|wait_ref, f| {
                    // Safety: `wait_ref` points to an existing `Wait`
                    let payload = wait_ref.map(|r| &unsafe { &*r.0.as_ptr() }.payload);
                    payload.fmt(f)
                }),
            )
            .field("wait_result", &self.wait_result)
            .finish()
    }
}

/// Access the specified thread's current wait object in the supplied
/// closure, without letting the reference escape.
fn with_current_wait<Traits: KernelTraits, R>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &Thread<Traits>,
    f: impl FnOnce(Option<&Wait<Traits>>) -> R,
) -> R {
    let wait_ref = thread.wait.current_wait.get(&*lock);

    // Safety: `wait_ref` points to an existing `Wait`
    let wait = wait_ref.map(|r| unsafe { &*r.0.as_ptr() });

    f(wait)
}

/// Access the specified thread's current wait payload in the supplied
/// closure.
pub(crate) fn with_current_wait_payload<Traits: KernelTraits, R>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &Thread<Traits>,
    f: impl FnOnce(Option<&WaitPayload<Traits>>) -> R,
) -> R {
    with_current_wait(lock, thread, |wait| f(wait.map(|wait| &wait.payload)))
}

/// Reposition the given thread's wait object within its wait queue after a
/// change in the thread's effective priority.
///
/// Does nothing if the thread is not waiting in a queue.
pub(crate) fn reorder_wait_of_thread<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &Thread<Traits>,
) {
    if let Some(wait_ref) = thread.wait.current_wait.get(&*lock) {
        // Safety: `wait_ref` points to an existing `Wait`
        let wait = unsafe { &*wait_ref.0.as_ptr() };

        if let Some(wait_queue) = wait.wait_queue {
            wait_queue.reorder_wait(lock, wait);
        }
    }
}

/// Create a wait object pertaining to the currently running thread but
/// not to any wait queue, and transition the thread into the Waiting state.
///
/// The only way to end such a wait is [`interrupt_thread`].
pub(crate) fn wait_no_queue<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
) -> WaitResult {
    let thread = Traits::state().running_thread().unwrap();
    let wait = Wait {
        thread,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };
    let wait_ref = WaitRef((&wait).into());

    thread.wait.current_wait.replace(&mut *lock, Some(wait_ref));

    thread::wait_until_woken_up(lock.borrow_mut());

    // `wait_ref` should have been removed from `current_wait` by a waker
    assert!(thread.wait.current_wait.get(&*lock).is_none());

    thread.wait.wait_result.get(&*lock)
}

/// Deassociate the specified wait object from its waiting thread and wake
/// up the thread. The caller removes `wait` from its queue beforehand.
///
/// This method may make a thread Ready, but doesn't yield the processor.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
    wait_result: WaitResult,
) {
    let thread = wait.thread;

    assert_eq!(
        *thread.wait.current_wait.read(&*lock),
        Some(WaitRef(wait.into()))
    );
    thread.wait.current_wait.replace(&mut *lock, None);

    thread.wait.wait_result.replace(&mut *lock, wait_result);

    assert_eq!(*thread.st.read(&*lock), ThreadSt::Waiting);

    thread::make_ready(lock, thread);
}

/// Interrupt any ongoing wait operation of the thread.
///
/// This method may make the thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
///
/// Returns `Err(BadObjectState)` if the thread is not in the Waiting state.
pub(crate) fn interrupt_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static Thread<Traits>,
    wait_result: WaitResult,
) -> Result<(), BadObjectStateError> {
    if *thread.st.read(&*lock) != ThreadSt::Waiting {
        return Err(BadObjectStateError::BadObjectState);
    }

    // The thread is in the Waiting state, so `wait_ref` must be `Some(_)`
    let wait_ref = thread.wait.current_wait.get(&*lock).unwrap();

    // Safety: `wait_ref` points to an existing `Wait`
    let wait = unsafe { wait_ref.0.as_ref() };

    if let Some(queue) = wait.wait_queue {
        if wait_queue_accessor!(&queue.waits, lock.borrow_mut())
            .remove(wait_ref)
            .is_err()
        {
            unreachable!();
        }
    }

    // Copy the payload out before `wait` expires
    let payload = wait.payload;

    complete_wait(lock.borrow_mut(), wait, wait_result);

    // A departing waiter can lower the owner's effective priority
    if let WaitPayload::Mutex(mutex) = payload {
        mutex::update_owner_priority(lock, mutex);
    }

    Ok(())
}
