//! The set of non-empty ready queue tiers
use core::fmt;

use super::Init;
use crate::NUM_PRIORITY_LEVELS;

/// A set of priority levels. Finding the highest one (the lowest number) takes
/// a single bit scan.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrioBitmap {
    bits: u64,
}

const _: () = assert!(NUM_PRIORITY_LEVELS <= u64::BITS as usize);

impl Init for PrioBitmap {
    const INIT: Self = Self { bits: 0 };
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl PrioBitmap {
    pub(crate) fn set(&mut self, prio: usize) {
        debug_assert!(prio < NUM_PRIORITY_LEVELS);
        self.bits |= 1 << prio;
    }

    pub(crate) fn clear(&mut self, prio: usize) {
        debug_assert!(prio < NUM_PRIORITY_LEVELS);
        self.bits &= !(1 << prio);
    }

    /// Get the highest priority in the set.
    pub(crate) fn first(&self) -> Option<usize> {
        (self.bits != 0).then(|| self.bits.trailing_zeros() as usize)
    }

    /// Iterate over the priorities in the set, highest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = usize> {
        let mut bits = self.bits;
        core::iter::from_fn(move || {
            let prio = (bits != 0).then(|| bits.trailing_zeros() as usize)?;
            bits &= bits - 1;
            Some(prio)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    #[test]
    fn empty() {
        let bitmap = PrioBitmap::INIT;
        assert_eq!(bitmap.first(), None);
        assert_eq!(bitmap.iter().count(), 0);
        assert_eq!(format!("{bitmap:?}"), "{}");
    }

    #[test]
    fn extremes() {
        let mut bitmap = PrioBitmap::INIT;
        bitmap.set(NUM_PRIORITY_LEVELS - 1);
        assert_eq!(bitmap.first(), Some(NUM_PRIORITY_LEVELS - 1));
        bitmap.set(0);
        assert_eq!(bitmap.first(), Some(0));
        bitmap.clear(0);
        assert_eq!(bitmap.first(), Some(NUM_PRIORITY_LEVELS - 1));
        assert_eq!(format!("{bitmap:?}"), "{63}");
    }

    /// Apply random insertions and removals to `PrioBitmap` and a `BTreeSet`
    /// and compare them after every step.
    #[quickcheck]
    fn matches_btree_set(cmds: Vec<(bool, u8)>) {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut subject = PrioBitmap::INIT;
        let mut reference = BTreeSet::new();

        for (insert, prio) in cmds {
            let prio = usize::from(prio) % NUM_PRIORITY_LEVELS;
            log::trace!("{} {prio}", if insert { "set" } else { "clear" });

            if insert {
                subject.set(prio);
                reference.insert(prio);
            } else {
                subject.clear(prio);
                reference.remove(&prio);
            }

            assert_eq!(subject.first(), reference.first().copied());
            assert_eq!(subject.iter().any(|p| p == prio), insert);
        }

        assert!(subject.iter().eq(reference.iter().copied()));
    }
}
