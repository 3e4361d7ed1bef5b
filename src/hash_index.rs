//! ExtendibleHash: directory-of-leaves index keyed by precomputed 64-bit hashes.
//!
//! Keys are assumed already hashed and unique; the index only stores and
//! compares `u64` values. The low `global_depth` bits of a key select a
//! directory slot, the slot names a leaf, and the leaf is scanned linearly.
//! A full leaf is split (doubling the directory first when its local depth
//! equals the global depth) and its entries are redistributed by one more
//! key bit. Removal never merges leaves or shrinks the directory.

use crate::cursor_guard::{CursorSlot, CursorSlotGuard};
use slotmap::{new_key_type, SlotMap};
use std::collections::TryReserveError;

new_key_type! {
    /// Arena key of a leaf. The directory stores these, never addresses.
    struct LeafKey;
}

/// Errors returned by [`ExtendibleHash`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum HashIndexError {
    /// Leaf capacity of zero.
    #[error("leaf capacity must be at least 1")]
    InvalidCapacity,
    /// A live entry already uses this hash key.
    #[error("hash key {0:#018x} is already present")]
    DuplicateKey(u64),
    /// No live entry uses this hash key.
    #[error("hash key {0:#018x} not found")]
    KeyNotFound(u64),
    /// A cursor over the table is still alive.
    #[error("an iteration over the table is already in progress")]
    IterationInProgress,
    /// Growing the directory or allocating a leaf failed.
    #[error("out of memory while growing the hash index")]
    OutOfMemory,
}

impl From<TryReserveError> for HashIndexError {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// A structural invariant of the index does not hold.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("hash index invariant violated: {0}")]
pub struct InvariantViolation(String);

#[derive(Debug)]
struct HashEntry<V> {
    hashkey: u64,
    value: V,
}

#[derive(Debug)]
struct Leaf<V> {
    depth: u32,
    // Fixed length == leaf capacity; `None` marks a free or tombstoned slot.
    slots: Vec<Option<HashEntry<V>>>,
    active: usize,
    next: Option<LeafKey>,
}

impl<V> Leaf<V> {
    fn try_new(capacity: usize, depth: u32) -> Result<Self, TryReserveError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity)?;
        slots.resize_with(capacity, || None);
        Ok(Self {
            depth,
            slots,
            active: 0,
            next: None,
        })
    }

    fn is_full(&self) -> bool {
        self.active == self.slots.len()
    }

    fn position(&self, hashkey: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(e) if e.hashkey == hashkey))
    }

    fn place(&mut self, entry: HashEntry<V>) {
        debug_assert!(!self.is_full());
        if let Some(free) = self.slots.iter_mut().find(|s| s.is_none()) {
            *free = Some(entry);
            self.active += 1;
        }
    }
}

#[inline]
fn mask(depth: u32) -> u64 {
    if depth >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << depth) - 1
    }
}

/// Extendible hash table mapping 64-bit hash keys to values of type `V`.
///
/// Single-threaded; `!Send` and `!Sync`.
#[derive(Debug)]
pub struct ExtendibleHash<V> {
    leaf_capacity: usize,
    global_depth: u32,
    directory: Vec<LeafKey>,
    leaves: SlotMap<LeafKey, Leaf<V>>,
    head: LeafKey,
    len: usize,
    cursor_slot: CursorSlot,
}

impl<V> ExtendibleHash<V> {
    /// Create an empty table whose leaves hold `leaf_capacity` entries.
    pub fn new(leaf_capacity: usize) -> Result<Self, HashIndexError> {
        if leaf_capacity < 1 {
            return Err(HashIndexError::InvalidCapacity);
        }
        let mut leaves = SlotMap::with_key();
        let head = leaves.insert(Leaf::try_new(leaf_capacity, 0)?);
        let mut directory = Vec::new();
        directory.try_reserve_exact(1)?;
        directory.push(head);
        Ok(Self {
            leaf_capacity,
            global_depth: 0,
            directory,
            leaves,
            head,
            len: 0,
            cursor_slot: CursorSlot::new(),
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn leaf_capacity(&self) -> usize {
        self.leaf_capacity
    }
    pub fn global_depth(&self) -> u32 {
        self.global_depth
    }
    pub fn directory_len(&self) -> usize {
        self.directory.len()
    }
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// True while a [`Cursor`] over this table is alive.
    pub fn is_iterating(&self) -> bool {
        self.cursor_slot.is_active()
    }

    #[inline]
    fn leaf_key_for(&self, hashkey: u64) -> LeafKey {
        // Directory length is 2^global_depth, so the masked key always fits.
        self.directory[(hashkey & mask(self.global_depth)) as usize]
    }

    pub fn contains_key(&self, hashkey: u64) -> bool {
        self.lookup(hashkey).is_some()
    }

    pub fn lookup(&self, hashkey: u64) -> Option<&V> {
        let leaf = &self.leaves[self.leaf_key_for(hashkey)];
        leaf.slots
            .iter()
            .flatten()
            .find(|e| e.hashkey == hashkey)
            .map(|e| &e.value)
    }

    pub fn lookup_mut(&mut self, hashkey: u64) -> Option<&mut V> {
        let lk = self.leaf_key_for(hashkey);
        self.leaves[lk]
            .slots
            .iter_mut()
            .flatten()
            .find(|e| e.hashkey == hashkey)
            .map(|e| &mut e.value)
    }

    /// Insert a new entry. Fails with `DuplicateKey` if `hashkey` is live.
    ///
    /// On `OutOfMemory` the table keeps every previously inserted entry
    /// and `value` is dropped.
    pub fn insert(&mut self, hashkey: u64, value: V) -> Result<(), HashIndexError> {
        if self.contains_key(hashkey) {
            return Err(HashIndexError::DuplicateKey(hashkey));
        }
        // Keys sharing a long low-bit prefix may need several splits before
        // the target leaf has room. Unique keys bound this by 64 levels.
        loop {
            let lk = self.leaf_key_for(hashkey);
            let leaf = &mut self.leaves[lk];
            if !leaf.is_full() {
                leaf.place(HashEntry { hashkey, value });
                self.len += 1;
                return Ok(());
            }
            self.split(lk)?;
        }
    }

    /// Replace the value of a live entry, returning the previous one.
    pub fn set_value(&mut self, hashkey: u64, value: V) -> Result<V, HashIndexError> {
        let slot = self
            .lookup_mut(hashkey)
            .ok_or(HashIndexError::KeyNotFound(hashkey))?;
        Ok(core::mem::replace(slot, value))
    }

    /// Remove an entry and return its value. Leaves are never merged.
    pub fn remove(&mut self, hashkey: u64) -> Option<V> {
        let lk = self.leaf_key_for(hashkey);
        let leaf = &mut self.leaves[lk];
        let pos = leaf.position(hashkey)?;
        let entry = leaf.slots[pos].take()?;
        leaf.active -= 1;
        self.len -= 1;
        Some(entry.value)
    }

    fn double_directory(&mut self) -> Result<(), HashIndexError> {
        let len = self.directory.len();
        self.directory.try_reserve_exact(len)?;
        // Slot i + len has bit `global_depth` set and the same low bits as i.
        self.directory.extend_from_within(..);
        self.global_depth += 1;
        Ok(())
    }

    fn split(&mut self, lk: LeafKey) -> Result<(), HashIndexError> {
        let depth = self.leaves[lk].depth;
        debug_assert!(depth < u64::BITS, "full leaf at maximum depth");
        // Allocate before touching the directory so a failure leaves the
        // table exactly as it was.
        let mut sibling = Leaf::try_new(self.leaf_capacity, depth + 1)?;
        if depth == self.global_depth {
            self.double_directory()?;
        }

        let bit = 1u64 << depth;
        let leaf = &mut self.leaves[lk];
        leaf.depth = depth + 1;
        for slot in leaf.slots.iter_mut() {
            if matches!(slot, Some(e) if e.hashkey & bit != 0) {
                if let Some(entry) = slot.take() {
                    leaf.active -= 1;
                    sibling.place(entry);
                }
            }
        }
        sibling.next = leaf.next;
        let sk = self.leaves.insert(sibling);
        self.leaves[lk].next = Some(sk);

        for (i, slot) in self.directory.iter_mut().enumerate() {
            if *slot == lk && (i as u64) & bit != 0 {
                *slot = sk;
            }
        }
        Ok(())
    }

    /// Borrowing iterator in leaf-list order, then slot order.
    ///
    /// Any number of these may coexist; they do not claim the cursor slot.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            leaves: &self.leaves,
            pos: Position::start(self.head),
            remaining: self.len,
        }
    }

    /// Start the table's single resumable cursor.
    ///
    /// Fails with `IterationInProgress` while another cursor is alive. The
    /// cursor borrows the table, so the table cannot be mutated until the
    /// cursor is dropped.
    pub fn cursor(&self) -> Result<Cursor<'_, V>, HashIndexError> {
        let guard = self
            .cursor_slot
            .try_acquire()
            .map_err(|_| HashIndexError::IterationInProgress)?;
        Ok(Cursor {
            table: self,
            pos: Position::start(self.head),
            _guard: guard,
        })
    }

    /// Check the split invariant, leaf bounds and bookkeeping counters.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let violation = |msg: String| Err(InvariantViolation(msg));
        if self.directory.len() as u128 != 1u128 << self.global_depth {
            return violation(format!(
                "directory length {} for global depth {}",
                self.directory.len(),
                self.global_depth
            ));
        }
        for (i, &lk) in self.directory.iter().enumerate() {
            let Some(leaf) = self.leaves.get(lk) else {
                return violation(format!("slot {i} names a missing leaf"));
            };
            if leaf.depth > self.global_depth {
                return violation(format!(
                    "slot {i}: local depth {} exceeds global depth {}",
                    leaf.depth, self.global_depth
                ));
            }
            let m = mask(leaf.depth);
            if let Some(e) = leaf
                .slots
                .iter()
                .flatten()
                .find(|e| e.hashkey & m != (i as u64) & m)
            {
                return violation(format!(
                    "slot {i}: key {:#x} does not match at depth {}",
                    e.hashkey, leaf.depth
                ));
            }
        }

        let mut total = 0;
        let mut listed = 0;
        let mut cur = Some(self.head);
        while let Some(lk) = cur {
            let Some(leaf) = self.leaves.get(lk) else {
                return violation("leaf list names a missing leaf".to_string());
            };
            if leaf.slots.len() != self.leaf_capacity {
                return violation(format!("leaf holds {} slots", leaf.slots.len()));
            }
            let live = leaf.slots.iter().flatten().count();
            if live != leaf.active {
                return violation(format!("leaf counts {} but holds {live}", leaf.active));
            }
            let aliases = self.directory.iter().filter(|&&d| d == lk).count();
            if aliases as u128 != 1u128 << (self.global_depth - leaf.depth) {
                return violation(format!(
                    "leaf at depth {} has {aliases} directory aliases",
                    leaf.depth
                ));
            }
            total += live;
            listed += 1;
            cur = leaf.next;
        }
        if listed != self.leaves.len() {
            return violation(format!(
                "leaf list reaches {listed} of {} leaves",
                self.leaves.len()
            ));
        }
        if total != self.len {
            return violation(format!("table counts {} but holds {total}", self.len));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
struct Position {
    leaf: Option<LeafKey>,
    slot: usize,
}

impl Position {
    fn start(head: LeafKey) -> Self {
        Self {
            leaf: Some(head),
            slot: 0,
        }
    }

    fn advance<'a, V>(&mut self, leaves: &'a SlotMap<LeafKey, Leaf<V>>) -> Option<(u64, &'a V)> {
        while let Some(lk) = self.leaf {
            let leaf = &leaves[lk];
            while self.slot < leaf.slots.len() {
                let i = self.slot;
                self.slot += 1;
                if let Some(e) = &leaf.slots[i] {
                    return Some((e.hashkey, &e.value));
                }
            }
            self.leaf = leaf.next;
            self.slot = 0;
        }
        None
    }
}

/// Iterator over `(hashkey, &value)` pairs of an [`ExtendibleHash`].
pub struct Iter<'a, V> {
    leaves: &'a SlotMap<LeafKey, Leaf<V>>,
    pos: Position,
    remaining: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (u64, &'a V);
    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let item = self.pos.advance(self.leaves)?;
        self.remaining -= 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<V> ExactSizeIterator for Iter<'_, V> {}

/// The table's single resumable cursor; see [`ExtendibleHash::cursor`].
pub struct Cursor<'a, V> {
    table: &'a ExtendibleHash<V>,
    pos: Position,
    _guard: CursorSlotGuard<'a>,
}

impl<'a, V> Cursor<'a, V> {
    /// Yield the next live entry, or `None` once every leaf is exhausted.
    pub fn next_entry(&mut self) -> Option<(u64, &'a V)> {
        let table: &'a ExtendibleHash<V> = self.table;
        self.pos.advance(&table.leaves)
    }

    /// Rewind to the first leaf of the list.
    pub fn reset(&mut self) {
        self.pos = Position::start(self.table.head);
    }
}

impl<'a, V> Iterator for Cursor<'a, V> {
    type Item = (u64, &'a V);
    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// Invariant: A zero leaf capacity is rejected.
    #[test]
    fn zero_capacity_rejected() {
        assert_eq!(
            ExtendibleHash::<u32>::new(0).unwrap_err(),
            HashIndexError::InvalidCapacity
        );
    }

    /// Invariant: Duplicate keys are rejected and the table remains unchanged.
    #[test]
    fn duplicate_insert_rejected() {
        let mut t = ExtendibleHash::new(4).unwrap();
        t.insert(7, "a").unwrap();
        assert_eq!(t.insert(7, "b"), Err(HashIndexError::DuplicateKey(7)));
        assert_eq!(t.lookup(7), Some(&"a"));
        assert_eq!(t.len(), 1);
    }

    /// Invariant: Directory grows 0 -> 1 -> 2 as a capacity-2 leaf overflows
    /// twice, and every key stays reachable.
    #[test]
    fn depth_grows_as_leaves_split() {
        let mut t = ExtendibleHash::new(2).unwrap();
        t.insert(0b00, 0).unwrap();
        t.insert(0b01, 1).unwrap();
        assert_eq!(t.global_depth(), 0);
        t.insert(0b10, 2).unwrap();
        assert_eq!(t.global_depth(), 1);
        t.insert(0b11, 3).unwrap();
        assert_eq!(t.global_depth(), 1);
        t.insert(0b100, 4).unwrap();
        assert_eq!(t.global_depth(), 2);
        assert_eq!(t.directory_len(), 4);
        for k in 0..5u64 {
            assert_eq!(t.lookup(k), Some(&(k as i32)));
        }
        t.validate().unwrap();
    }

    /// Invariant: Four two-bit keys in capacity-2 leaves split once. The
    /// odd keys move to a sibling and the even keys share the original
    /// leaf, so the directory stays at depth 1.
    #[test]
    fn four_two_bit_keys_with_pair_leaves_split_once() {
        let mut t = ExtendibleHash::new(2).unwrap();
        for k in [0b00u64, 0b01, 0b10, 0b11] {
            t.insert(k, k).unwrap();
        }
        assert_eq!(t.global_depth(), 1);
        assert_eq!(t.directory_len(), 2);
        assert_eq!(t.leaf_count(), 2);
        for k in 0..4u64 {
            assert_eq!(t.lookup(k), Some(&k));
        }
        t.validate().unwrap();
    }

    /// Invariant: With single-entry leaves, four two-bit keys need a
    /// depth-2 directory.
    #[test]
    fn four_two_bit_keys_with_unit_leaves() {
        let mut t = ExtendibleHash::new(1).unwrap();
        for k in [0b00u64, 0b01, 0b10, 0b11] {
            t.insert(k, k).unwrap();
            t.validate().unwrap();
        }
        assert_eq!(t.global_depth(), 2);
        assert_eq!(t.directory_len(), 4);
        assert_eq!(t.leaf_count(), 4);
        for k in 0..4u64 {
            assert_eq!(t.lookup(k), Some(&k));
        }
    }

    /// Invariant: Keys sharing a long low-bit prefix force repeated splits in a
    /// single insert; the directory doubles once per shared bit.
    #[test]
    fn shared_prefix_triggers_repeated_splits() {
        let mut t = ExtendibleHash::new(2).unwrap();
        t.insert(0, 'a').unwrap();
        t.insert(1 << 10, 'b').unwrap();
        t.insert(2 << 10, 'c').unwrap();
        assert_eq!(t.global_depth(), 11);
        assert_eq!(t.lookup(0), Some(&'a'));
        assert_eq!(t.lookup(1 << 10), Some(&'b'));
        assert_eq!(t.lookup(2 << 10), Some(&'c'));
        t.validate().unwrap();
    }

    /// Invariant: Removal leaves a tombstone that a later insert reuses, and
    /// never shrinks the directory.
    #[test]
    fn remove_is_grow_only() {
        let mut t = ExtendibleHash::new(1).unwrap();
        for k in 0..8u64 {
            t.insert(k, k * 10).unwrap();
        }
        let depth = t.global_depth();
        let leaves = t.leaf_count();
        for k in 0..8u64 {
            assert_eq!(t.remove(k), Some(k * 10));
        }
        assert!(t.is_empty());
        assert_eq!(t.remove(3), None);
        assert_eq!(t.global_depth(), depth);
        assert_eq!(t.leaf_count(), leaves);
        t.insert(3, 99).unwrap();
        assert_eq!(t.global_depth(), depth);
        assert_eq!(t.lookup(3), Some(&99));
        t.validate().unwrap();
    }

    /// Invariant: `set_value` swaps in place and reports missing keys.
    #[test]
    fn set_value_replaces_or_reports_missing() {
        let mut t = ExtendibleHash::new(2).unwrap();
        t.insert(5, 1).unwrap();
        assert_eq!(t.set_value(5, 2), Ok(1));
        assert_eq!(t.lookup(5), Some(&2));
        assert_eq!(t.set_value(6, 3), Err(HashIndexError::KeyNotFound(6)));
        *t.lookup_mut(5).unwrap() += 40;
        assert_eq!(t.lookup(5), Some(&42));
    }

    /// Invariant: A full walk yields each live key exactly once.
    #[test]
    fn iteration_visits_each_key_once() {
        let mut t = ExtendibleHash::new(3).unwrap();
        let keys: Vec<u64> = (0..200u64).map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15)).collect();
        for &k in &keys {
            t.insert(k, k).unwrap();
        }
        let seen: Vec<u64> = t.iter().map(|(k, _)| k).collect();
        assert_eq!(seen.len(), keys.len());
        assert_eq!(t.iter().len(), keys.len());
        let unique: BTreeSet<u64> = seen.into_iter().collect();
        assert_eq!(unique, keys.iter().copied().collect());
    }

    /// Invariant: Only one cursor may be alive; dropping it frees the slot,
    /// and `reset` restarts the walk.
    #[test]
    fn single_cursor_policy() {
        let mut t = ExtendibleHash::new(2).unwrap();
        for k in 0..5u64 {
            t.insert(k, ()).unwrap();
        }
        let mut c = t.cursor().unwrap();
        assert!(t.is_iterating());
        assert!(matches!(t.cursor(), Err(HashIndexError::IterationInProgress)));
        let first: Vec<u64> = (&mut c).map(|(k, _)| k).collect();
        assert_eq!(first.len(), 5);
        assert!(c.next_entry().is_none());
        c.reset();
        assert_eq!(c.count(), 5);
        assert!(!t.is_iterating());
        assert!(t.cursor().is_ok());
    }
}
