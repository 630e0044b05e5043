//! Mailboxes
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    error::{RecvMailboxError, SendMailboxError, TryRecvMailboxError},
    klock::{self, CpuLockCell},
    state, thread,
    wait::{WaitPayload, WaitQueue, WaitResult},
    KernelTraits, PortThreading,
};

/// A bounded FIFO queue of 32-bit messages. Sending never blocks and can be
/// done from an interrupt handler.
pub struct Mailbox<Traits: PortThreading, const N: usize> {
    messages: CpuLockCell<Traits, ArrayVec<u32, N>>,

    /// Threads waiting in [`Mailbox::recv`].
    recv_queue: WaitQueue<Traits>,
}

impl<Traits: PortThreading, const N: usize> Mailbox<Traits, N> {
    /// Construct an empty `Mailbox`.
    pub const fn new() -> Self {
        Self {
            messages: CpuLockCell::new(ArrayVec::new_const()),
            recv_queue: WaitQueue::new(),
        }
    }
}

impl<Traits: PortThreading, const N: usize> Default for Mailbox<Traits, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits, const N: usize> fmt::Debug for Mailbox<Traits, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("messages", &self.messages)
            .field("recv_queue", &self.recv_queue)
            .finish()
    }
}

impl<Traits: KernelTraits, const N: usize> Mailbox<Traits, N> {
    /// Append a message and wake up a receiver. Returns `QueueOverflow` if
    /// the mailbox is full.
    pub fn try_send(&'static self, message: u32) -> Result<(), SendMailboxError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if self.messages.write(&mut *lock).try_push(message).is_err() {
            return Err(SendMailboxError::QueueOverflow);
        }

        self.recv_queue
            .wake_up_one(lock.borrow_mut(), WaitResult::Value);
        thread::unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Remove the oldest message, blocking the calling thread until one is
    /// available.
    pub fn recv(&'static self) -> Result<u32, RecvMailboxError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        loop {
            if let Some(message) = pop_front(self.messages.write(&mut *lock)) {
                return Ok(message);
            }

            // Another thread may take the message before we run, so check
            // again after waking up
            match self.recv_queue.wait(lock.borrow_mut(), WaitPayload::Token(0)) {
                WaitResult::Value => {}
                WaitResult::Canceled => return Err(RecvMailboxError::Interrupted),
                result => unreachable!("{result:?}"),
            }
        }
    }

    /// Remove the oldest message. Returns `Timeout` if the mailbox is empty.
    pub fn try_recv(&'static self) -> Result<u32, TryRecvMailboxError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        pop_front(self.messages.write(&mut *lock)).ok_or(TryRecvMailboxError::Timeout)
    }
}

fn pop_front<const N: usize>(messages: &mut ArrayVec<u32, N>) -> Option<u32> {
    if messages.is_empty() {
        None
    } else {
        Some(messages.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut messages = ArrayVec::<u32, 4>::new();
        messages.push(1);
        messages.push(2);
        messages.push(3);
        assert_eq!(pop_front(&mut messages), Some(1));
        messages.push(4);
        messages.push(5);
        assert!(messages.try_push(6).is_err());
        assert_eq!(pop_front(&mut messages), Some(2));
        assert_eq!(pop_front(&mut messages), Some(3));
        assert_eq!(pop_front(&mut messages), Some(4));
        assert_eq!(pop_front(&mut messages), Some(5));
        assert_eq!(pop_front(&mut messages), None);
    }

    #[test]
    fn zero_capacity() {
        let mut messages = ArrayVec::<u32, 0>::new();
        assert!(messages.try_push(1).is_err());
        assert_eq!(pop_front(&mut messages), None);
    }
}
