//! Bounded collection trimming
//!
//! Every store caps its collections. [`RetentionEvictor`] trims the oldest
//! entries first, either from the front of an ordered list or by an age key
//! over a keyed map.

use core::hash::Hash;

use hashbrown::HashMap;

/// Oldest-first trimmer for one collection cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionEvictor {
    cap: usize,
}

impl RetentionEvictor {
    /// Create an evictor that keeps at most `cap` entries
    pub fn new(cap: usize) -> Self {
        Self { cap }
    }

    /// The configured cap
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Number of entries that must go for a collection of `len`
    pub fn overflow(&self, len: usize) -> usize {
        len.saturating_sub(self.cap)
    }

    /// Trim an insertion-ordered list from the front, returning the removed entries
    pub fn trim_front<T>(&self, items: &mut Vec<T>) -> Vec<T> {
        let excess = self.overflow(items.len());
        items.drain(..excess).collect()
    }

    /// Trim a keyed map by age, oldest first
    ///
    /// `age` orders entries; ties are broken by key so the result does not
    /// depend on hash iteration order.
    pub fn trim_map<K, V, O, F>(&self, map: &mut HashMap<K, V>, age: F) -> Vec<(K, V)>
    where
        K: Eq + Hash + Ord + Clone,
        O: Ord,
        F: Fn(&K, &V) -> O,
    {
        self.trim_map_protecting(map, age, |_| false)
    }

    /// Like [`RetentionEvictor::trim_map`] but never evicts keys for which
    /// `protect` returns true
    ///
    /// Protected entries still count towards the cap, so the map may end up
    /// above the cap when more entries are protected than it allows.
    pub fn trim_map_protecting<K, V, O, F, P>(
        &self,
        map: &mut HashMap<K, V>,
        age: F,
        protect: P,
    ) -> Vec<(K, V)>
    where
        K: Eq + Hash + Ord + Clone,
        O: Ord,
        F: Fn(&K, &V) -> O,
        P: Fn(&K) -> bool,
    {
        let excess = self.overflow(map.len());
        if excess == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(O, K)> = map
            .iter()
            .filter(|(k, _)| !protect(k))
            .map(|(k, v)| (age(k, v), k.clone()))
            .collect();
        candidates.sort();

        candidates
            .into_iter()
            .take(excess)
            .filter_map(|(_, key)| map.remove(&key).map(|value| (key, value)))
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
