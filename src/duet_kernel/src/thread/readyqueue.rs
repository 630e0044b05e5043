//! The ready queue: one FIFO list per priority level plus a bitmap of the
//! non-empty levels.
use core::{fmt, ops::RangeTo};

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    thread::Thread,
    utils::{
        intrusive_list::{Ident, ListAccessor, Static, StaticListHead},
        DebugFn, Init, PrioBitmap,
    },
    KernelTraits, PortThreading, NUM_PRIORITY_LEVELS,
};

/// The result type of [`ReadyQueue::pop_front_thread`].
pub(crate) enum ScheduleDecision<T> {
    /// Continue running the current thread.
    Keep,
    /// Switch to the specified thread, or go idle.
    SwitchTo(Option<T>),
}

pub(crate) struct ReadyQueue<Traits: PortThreading> {
    /// The Ready threads at each priority level, in FIFO order.
    ///
    /// Invariant: `queues[i].first.is_some() == bitmap.get(i)`
    queues: [CpuLockCell<Traits, StaticListHead<Thread<Traits>>>; NUM_PRIORITY_LEVELS],

    bitmap: CpuLockCell<Traits, PrioBitmap>,
}

impl<Traits: PortThreading> Init for ReadyQueue<Traits> {
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

/// Get a `ListAccessor` used to access a ready queue.
macro_rules! list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessor::new($head, &Static, |thread| &thread.ready_queue_link, $key)
    };
}

impl<Traits: KernelTraits> ReadyQueue<Traits> {
    /// Return a flag indicating whether there's a Ready thread whose
    /// priority is in the specified range.
    pub(crate) fn has_ready_thread_in_priority_range(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        range: RangeTo<usize>,
    ) -> bool {
        let highest = self.bitmap.read(&*lock).first().unwrap_or(usize::MAX);
        highest < range.end
    }

    fn queue_of(
        &self,
        lock: &CpuLockTokenRefMut<'_, Traits>,
        thread: &'static Thread<Traits>,
    ) -> usize {
        thread.effective_priority.get(&**lock) as usize
    }

    /// Insert `thread` after every other thread of the same priority.
    pub(crate) fn push_back_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static Thread<Traits>,
    ) {
        let pri = self.queue_of(&lock, thread);
        if list_accessor!(&self.queues[pri], lock.borrow_mut())
            .push_back(Ident(thread))
            .is_err()
        {
            panic!("thread {thread:p} is already in a ready queue");
        }
        self.bitmap.write(&mut *lock).set(pri);
    }

    /// Insert `thread` before every other thread of the same priority. Used
    /// for a preempted thread so that it keeps its place.
    pub(crate) fn push_front_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static Thread<Traits>,
    ) {
        let pri = self.queue_of(&lock, thread);
        if list_accessor!(&self.queues[pri], lock.borrow_mut())
            .push_front(Ident(thread))
            .is_err()
        {
            panic!("thread {thread:p} is already in a ready queue");
        }
        self.bitmap.write(&mut *lock).set(pri);
    }

    /// Remove `thread`, which must be in the queue at its current effective
    /// priority.
    pub(crate) fn remove_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static Thread<Traits>,
    ) {
        let pri = self.queue_of(&lock, thread);
        self.remove_thread_at(lock.borrow_mut(), thread, pri);
    }

    fn remove_thread_at(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static Thread<Traits>,
        pri: usize,
    ) {
        let mut accessor = list_accessor!(&self.queues[pri], lock.borrow_mut());
        if accessor.remove(Ident(thread)).is_err() {
            panic!("thread {thread:p} is not in a ready queue");
        }
        let now_empty = accessor.is_empty();
        if now_empty {
            self.bitmap.write(&mut *lock).clear(pri);
        }
    }

    /// Choose the next thread to run. `prev_thread_priority` is the
    /// effective priority of the current thread if it can continue running,
    /// or `usize::MAX` otherwise.
    ///
    /// If this method returns `SwitchTo(Some(thread))`, `thread` is removed
    /// from the queue.
    pub(crate) fn pop_front_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        prev_thread_priority: usize,
    ) -> ScheduleDecision<&'static Thread<Traits>> {
        // `usize::MAX - 1` so that an empty queue with no current thread
        // yields `SwitchTo(None)` rather than `Keep`
        let next_thread_priority = self
            .bitmap
            .read(&*lock)
            .first()
            .unwrap_or(usize::MAX - 1);

        if prev_thread_priority <= next_thread_priority {
            ScheduleDecision::Keep
        } else if next_thread_priority < NUM_PRIORITY_LEVELS {
            let mut accessor =
                list_accessor!(&self.queues[next_thread_priority], lock.borrow_mut());
            let next = accessor.pop_front().map(|Ident(thread)| thread);
            let now_empty = accessor.is_empty();
            debug_assert!(next.is_some());

            if now_empty {
                self.bitmap.write(&mut *lock).clear(next_thread_priority);
            }

            ScheduleDecision::SwitchTo(next)
        } else {
            ScheduleDecision::SwitchTo(None)
        }
    }

    /// Move `thread` to the back of the tier for its new effective priority.
    pub(crate) fn reorder_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static Thread<Traits>,
        old_effective_priority: usize,
    ) {
        self.remove_thread_at(lock.borrow_mut(), thread, old_effective_priority);
        self.push_back_thread(lock, thread);
    }
}

impl<Traits: KernelTraits> fmt::Debug for ReadyQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Ok(lock) = crate::klock::lock_cpu::<Traits>() else {
            return f.write_str("ReadyQueue { < locked > }");
        };
        let lock = core::cell::RefCell::new(lock);
        let lock = &lock; // capture-by-reference in the closure below

        let non_empty = *self.bitmap.read(&**lock.borrow());

        f.write_str("ReadyQueue ")?;
        f.debug_map()
            .entries(
                non_empty
                    .iter()
                    .map(|i| (i, &self.queues[i]))
                    .map(|(i, head)| {
                        (
                            // key = priority
                            i,
                            // value = list of threads
                            DebugFn(move |f: &mut fmt::Formatter| {
                                let mut lock = lock.borrow_mut();
                                let accessor = list_accessor!(head, lock.borrow_mut());
                                f.debug_list()
                                    .entries(accessor.iter().map(|(thread, _)| thread))
                                    .finish()
                            }),
                        )
                    }),
            )
            .finish()
    }
}
