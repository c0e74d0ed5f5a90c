//! Fixed-capacity duplicate-digest window.
//!
//! When a session sends a packet on more than one path at once (see
//! `token_bucket`), the receiver may see the same payload arrive twice. The
//! reference implementation keeps a 128-entry LRU cache of digests to catch
//! this; we keep the same capacity but as a plain ring buffer plus hash set,
//! since we don't need LRU recency ordering — only "have I seen this
//! recently", and a ring buffer makes the fixed memory bound explicit.

use std::collections::HashSet;

use crate::highway::Digest;

const CAPACITY: usize = 128;

/// A fixed-size membership set over the last `CAPACITY` digests seen.
pub struct DedupWindow {
    ring: [Digest; CAPACITY],
    set: HashSet<Digest>,
    next: usize,
    len: usize,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self {
            ring: [0; CAPACITY],
            set: HashSet::with_capacity(CAPACITY * 2),
            next: 0,
            len: 0,
        }
    }

    /// Records `digest` as seen and returns `true` if it was already
    /// present in the window (i.e. this packet is a duplicate).
    pub fn check_and_insert(&mut self, digest: Digest) -> bool {
        if self.set.contains(&digest) {
            return true;
        }

        if self.len == CAPACITY {
            let evicted = self.ring[self.next];
            self.set.remove(&evicted);
        } else {
            self.len += 1;
        }

        self.ring[self.next] = digest;
        self.set.insert(digest);
        self.next = (self.next + 1) % CAPACITY;
        false
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sight_is_not_a_duplicate() {
        let mut w = DedupWindow::new();
        assert!(!w.check_and_insert(1));
    }

    #[test]
    fn repeat_is_a_duplicate() {
        let mut w = DedupWindow::new();
        assert!(!w.check_and_insert(1));
        assert!(w.check_and_insert(1));
    }

    #[test]
    fn eviction_forgets_oldest() {
        let mut w = DedupWindow::new();
        for i in 0..CAPACITY as u128 {
            assert!(!w.check_and_insert(i));
        }
        // digest 0 should now be evicted by digest CAPACITY.
        assert!(!w.check_and_insert(CAPACITY as u128));
        assert!(!w.check_and_insert(0));
    }
}
