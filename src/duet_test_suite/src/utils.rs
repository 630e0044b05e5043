use core::sync::atomic::{AtomicUsize, Ordering};
use duet_kernel::utils::Init;

/// An atomic counter for checking an execution sequence.
pub(crate) struct SeqTracker {
    counter: AtomicUsize,
}

impl Init for SeqTracker {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl SeqTracker {
    /// Construct `SeqTracker`.
    pub(crate) const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    pub(crate) fn get(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    /// Assert that the counter is equal to `old` and then replace it with
    /// `new`.
    #[track_caller]
    pub(crate) fn expect_and_replace(&self, old: usize, new: usize) {
        let got = self.counter.load(Ordering::Relaxed);
        log::debug!("{} (expected: {}) → {}", got, old, new);
        assert_eq!(got, old, "expected {}, got {}", old, got);
        self.counter.store(new, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn expect_and_replace() {
        let seq = SeqTracker::new();
        seq.expect_and_replace(0, 1);
        seq.expect_and_replace(1, 5);
        assert_eq!(seq.get(), 5);
    }

    #[test]
    #[should_panic]
    fn unexpected_value() {
        let seq = SeqTracker::new();
        seq.expect_and_replace(1, 2);
    }

    /// Any chain of transitions is accepted as long as each step starts
    /// where the previous one ended.
    #[quickcheck]
    fn follows_any_chain(steps: Vec<usize>) -> bool {
        let _ = env_logger::builder().is_test(true).try_init();

        let seq = SeqTracker::new();
        let mut current = 0;
        for next in steps {
            seq.expect_and_replace(current, next);
            current = next;
        }
        seq.get() == current
    }
}
