//! Open-addressed hash table keyed by lattice positions.
//!
//! The world map holds every materialized patch in one of these tables. The
//! fixing protocol needs to insert a bounded number of new patches while it
//! walks entries it has already looked up, so the table exposes an explicit
//! [`OpenTable::reserve`] contract: after `reserve(extra)`, the next `extra`
//! insertions are guaranteed not to rehash.

/// Key type stored directly in the slot array.
///
/// Empty slots are marked with [`SlotKey::EMPTY`], so the sentinel value must
/// never be used as a real key. Hashes must be deterministic across runs;
/// table iteration order feeds snapshot layout.
pub trait SlotKey: Copy + Eq {
    /// Reserved sentinel marking a vacant slot.
    const EMPTY: Self;

    /// Deterministic 64-bit hash of the key.
    fn slot_hash(&self) -> u64;
}

/// Open-addressed table with linear probing and sentinel-keyed vacancies.
///
/// Entries are never removed; the world only ever materializes new patches.
#[derive(Debug, Clone)]
pub struct OpenTable<K: SlotKey, V> {
    keys: Vec<K>,
    values: Vec<Option<V>>,
    len: usize,
}

const MIN_SLOTS: usize = 16;

impl<K: SlotKey, V> OpenTable<K, V> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a table pre-sized for `expected` entries without rehashing.
    #[must_use]
    pub fn with_capacity(expected: usize) -> Self {
        let slots = slots_for(expected);
        Self {
            keys: vec![K::EMPTY; slots],
            values: std::iter::repeat_with(|| None).take(slots).collect(),
            len: 0,
        }
    }

    /// Number of occupied entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total slot count currently allocated.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.keys.len() - 1
    }

    /// Finds the slot for `key`: either the slot holding it or the vacant
    /// slot where it would be inserted. The load factor cap guarantees a
    /// vacant slot is always reachable.
    #[inline]
    fn probe(&self, key: &K) -> (usize, bool) {
        let mask = self.mask();
        let mut slot = (key.slot_hash() as usize) & mask;
        loop {
            if self.keys[slot] == K::EMPTY {
                return (slot, false);
            }
            if self.keys[slot] == *key {
                return (slot, true);
            }
            slot = (slot + 1) & mask;
        }
    }

    /// Immutable lookup.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        let (slot, present) = self.probe(key);
        if present {
            self.values[slot].as_ref()
        } else {
            None
        }
    }

    /// Mutable lookup.
    #[must_use]
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let (slot, present) = self.probe(key);
        if present {
            self.values[slot].as_mut()
        } else {
            None
        }
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.probe(key).1
    }

    /// Ensures the next `extra` insertions will not rehash.
    ///
    /// Callers that hold positions of existing entries across a batch of
    /// insertions rely on this to keep probe sequences stable.
    pub fn reserve(&mut self, extra: usize) {
        let needed = self.len + extra;
        if overloaded(needed, self.keys.len()) {
            self.grow(slots_for(needed));
        }
    }

    /// Looks up `key`, inserting `default()` if absent. Grows as needed.
    pub fn get_or_insert_with(&mut self, key: K, default: impl FnOnce() -> V) -> &mut V {
        self.reserve(1);
        self.get_or_insert_with_reserved(key, default)
    }

    /// Looks up `key`, inserting `default()` if absent, without ever
    /// reallocating. The caller must have reserved capacity beforehand;
    /// violating that is a programming error.
    pub fn get_or_insert_with_reserved(&mut self, key: K, default: impl FnOnce() -> V) -> &mut V {
        debug_assert!(key != K::EMPTY, "the sentinel key cannot be inserted");
        let (slot, present) = self.probe(&key);
        if !present {
            debug_assert!(
                !overloaded(self.len + 1, self.keys.len()),
                "insertion without reserved capacity"
            );
            self.keys[slot] = key;
            self.values[slot] = Some(default());
            self.len += 1;
        }
        self.values[slot].as_mut().expect("occupied slot holds a value")
    }

    /// Iterates occupied `(key, value)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.keys
            .iter()
            .zip(self.values.iter())
            .filter(|(k, _)| **k != K::EMPTY)
            .map(|(k, v)| (k, v.as_ref().expect("occupied slot holds a value")))
    }

    /// Iterates occupied `(key, value)` pairs with mutable values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.keys
            .iter()
            .zip(self.values.iter_mut())
            .filter(|(k, _)| **k != K::EMPTY)
            .map(|(k, v)| (k, v.as_mut().expect("occupied slot holds a value")))
    }

    fn grow(&mut self, new_slots: usize) {
        debug_assert!(new_slots.is_power_of_two());
        debug_assert!(new_slots > self.keys.len());
        let old_keys = std::mem::replace(&mut self.keys, vec![K::EMPTY; new_slots]);
        let old_values = std::mem::replace(
            &mut self.values,
            std::iter::repeat_with(|| None).take(new_slots).collect(),
        );
        for (key, value) in old_keys.into_iter().zip(old_values) {
            if key == K::EMPTY {
                continue;
            }
            let (slot, present) = self.probe(&key);
            debug_assert!(!present);
            self.keys[slot] = key;
            self.values[slot] = value;
        }
    }
}

impl<K: SlotKey, V> Default for OpenTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Load factor cap of 3/4: `needed` entries overload `slots` when
/// `needed > slots * 3 / 4`.
#[inline]
fn overloaded(needed: usize, slots: usize) -> bool {
    needed * 4 > slots * 3
}

fn slots_for(expected: usize) -> usize {
    let mut slots = MIN_SLOTS;
    while overloaded(expected, slots) {
        slots *= 2;
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Key(u64);

    impl SlotKey for Key {
        const EMPTY: Self = Key(u64::MAX);

        fn slot_hash(&self) -> u64 {
            // splitmix64 finalizer
            let mut h = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
            h = (h ^ (h >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            h = (h ^ (h >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            h ^ (h >> 31)
        }
    }

    /// Key whose hash collapses to one bucket, forcing probe chains.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Clashing(u64);

    impl SlotKey for Clashing {
        const EMPTY: Self = Clashing(u64::MAX);

        fn slot_hash(&self) -> u64 {
            7
        }
    }

    #[test]
    fn insert_and_lookup() {
        let mut table: OpenTable<Key, String> = OpenTable::new();
        assert!(table.is_empty());
        *table.get_or_insert_with(Key(1), || "one".to_owned()) = "one".to_owned();
        table.get_or_insert_with(Key(2), || "two".to_owned());
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&Key(1)).map(String::as_str), Some("one"));
        assert_eq!(table.get(&Key(2)).map(String::as_str), Some("two"));
        assert!(table.get(&Key(3)).is_none());
        assert!(!table.contains_key(&Key(3)));
    }

    #[test]
    fn get_or_insert_returns_existing_value() {
        let mut table: OpenTable<Key, u32> = OpenTable::new();
        table.get_or_insert_with(Key(9), || 41);
        let value = table.get_or_insert_with(Key(9), || unreachable!("key exists"));
        *value += 1;
        assert_eq!(table.get(&Key(9)), Some(&42));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reserve_prevents_rehash_during_batch_insert() {
        let mut table: OpenTable<Key, u64> = OpenTable::with_capacity(4);
        for i in 0..4 {
            table.get_or_insert_with(Key(i), || i);
        }
        table.reserve(64);
        let slots = table.slot_count();
        for i in 4..68 {
            table.get_or_insert_with_reserved(Key(i), || i);
        }
        assert_eq!(table.slot_count(), slots);
        assert_eq!(table.len(), 68);
        for i in 0..68 {
            assert_eq!(table.get(&Key(i)), Some(&i));
        }
    }

    #[test]
    fn growth_preserves_entries() {
        let mut table: OpenTable<Key, u64> = OpenTable::new();
        for i in 0..500 {
            table.get_or_insert_with(Key(i), || i * 3);
        }
        assert_eq!(table.len(), 500);
        for i in 0..500 {
            assert_eq!(table.get(&Key(i)), Some(&(i * 3)));
        }
    }

    #[test]
    fn colliding_keys_probe_past_each_other() {
        let mut table: OpenTable<Clashing, u64> = OpenTable::new();
        for i in 0..8 {
            table.get_or_insert_with(Clashing(i), || i + 100);
        }
        for i in 0..8 {
            assert_eq!(table.get(&Clashing(i)), Some(&(i + 100)));
        }
        assert!(table.get(&Clashing(8)).is_none());
    }

    #[test]
    fn iteration_is_deterministic_for_identical_histories() {
        let build = || {
            let mut table: OpenTable<Key, u64> = OpenTable::new();
            for i in [12, 3, 77, 41, 5, 900, 6] {
                table.get_or_insert_with(Key(i), || i);
            }
            table
        };
        let a: Vec<_> = build().iter().map(|(k, v)| (*k, *v)).collect();
        let b: Vec<_> = build().iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 7);
    }

    #[test]
    fn iter_mut_updates_in_place() {
        let mut table: OpenTable<Key, u64> = OpenTable::new();
        for i in 0..10 {
            table.get_or_insert_with(Key(i), || 0);
        }
        for (key, value) in table.iter_mut() {
            *value = key.0 * 2;
        }
        assert_eq!(table.get(&Key(4)), Some(&8));
    }
}
