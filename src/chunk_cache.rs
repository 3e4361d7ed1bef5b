//! ChunkCache: LRU-ordered chunk buffers atop ExtendibleHash.
//!
//! Entries live in a slot arena and are linked into a doubly linked
//! recency list by arena key (front = most recently used). The hash index
//! maps the 64-bit hash of an entry's coordinates to its arena key, and
//! lookups confirm the stored coordinates so a hash collision never
//! aliases two chunks.
//!
//! Eviction is the caller's business: the cache never drops an entry on
//! its own, so uncommitted writes cannot disappear behind the caller's
//! back.

use crate::chunk_key::hash_coordinates;
use crate::hash_index::{ExtendibleHash, HashIndexError};
use core::hash::BuildHasher;
use hashbrown::hash_map::DefaultHashBuilder;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    struct EntryKey;
}

/// Leaf capacity used by [`ChunkCache::new`].
pub const DEFAULT_LEAF_CAPACITY: usize = 8;

/// Errors returned by [`ChunkCache`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error("chunk {0:?} is already cached")]
    DuplicateKey(Vec<u64>),
    #[error("chunk {0:?} is not cached")]
    NotFound(Vec<u64>),
    /// Two distinct coordinate tuples hash to the same index key.
    #[error("chunk {0:?} collides with cached chunk {1:?}")]
    KeyCollision(Vec<u64>, Vec<u64>),
    #[error(transparent)]
    Index(#[from] HashIndexError),
}

/// A write-back callback failed; earlier entries in this flush are clean,
/// the failing and remaining entries stay dirty.
#[derive(Debug, thiserror::Error)]
#[error("failed to write back chunk {coordinates:?}")]
pub struct FlushError<E: std::error::Error + 'static> {
    pub coordinates: Vec<u64>,
    #[source]
    pub source: E,
}

/// A cached chunk: its coordinates, payload and modification status.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CacheEntry {
    coordinates: Vec<u64>,
    buffer: Vec<u8>,
    dirty: bool,
}

impl CacheEntry {
    pub fn coordinates(&self) -> &[u64] {
        &self.coordinates
    }
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
    /// Mutable payload access. Does not mark the entry dirty.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

#[derive(Debug)]
struct Node {
    entry: CacheEntry,
    hash: u64,
    prev: Option<EntryKey>,
    next: Option<EntryKey>,
}

/// LRU chunk cache keyed by chunk coordinates.
///
/// Single-threaded; callers serialize access externally. References
/// returned by lookups end at the next mutating call.
pub struct ChunkCache<S = DefaultHashBuilder> {
    hasher: S,
    index: ExtendibleHash<EntryKey>,
    nodes: SlotMap<EntryKey, Node>,
    head: Option<EntryKey>,
    tail: Option<EntryKey>,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::with_leaf_capacity(DEFAULT_LEAF_CAPACITY)
            .expect("default leaf capacity is non-zero")
    }

    pub fn with_leaf_capacity(leaf_capacity: usize) -> Result<Self, CacheError> {
        Self::with_hasher(leaf_capacity, DefaultHashBuilder::default())
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: BuildHasher> ChunkCache<S> {
    pub fn with_hasher(leaf_capacity: usize, hasher: S) -> Result<Self, CacheError> {
        Ok(Self {
            hasher,
            index: ExtendibleHash::new(leaf_capacity)?,
            nodes: SlotMap::with_key(),
            head: None,
            tail: None,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn find(&self, coordinates: &[u64]) -> Option<EntryKey> {
        let hash = hash_coordinates(&self.hasher, coordinates);
        let &key = self.index.lookup(hash)?;
        (self.nodes[key].entry.coordinates == coordinates).then_some(key)
    }

    fn unlink(&mut self, key: EntryKey) {
        let (prev, next) = {
            let node = &self.nodes[key];
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        let node = &mut self.nodes[key];
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, key: EntryKey) {
        let old_head = self.head;
        {
            let node = &mut self.nodes[key];
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => self.nodes[h].prev = Some(key),
            None => self.tail = Some(key),
        }
        self.head = Some(key);
    }

    fn promote(&mut self, key: EntryKey) {
        if self.head != Some(key) {
            self.unlink(key);
            self.push_front(key);
        }
    }

    pub fn contains(&self, coordinates: &[u64]) -> bool {
        self.find(coordinates).is_some()
    }

    /// Borrow an entry without changing its recency.
    pub fn peek(&self, coordinates: &[u64]) -> Option<&CacheEntry> {
        self.find(coordinates).map(|k| &self.nodes[k].entry)
    }

    /// Borrow an entry and move it to the front of the recency list.
    pub fn lookup(&mut self, coordinates: &[u64]) -> Option<&CacheEntry> {
        let key = self.find(coordinates)?;
        self.promote(key);
        Some(&self.nodes[key].entry)
    }

    /// Mutably borrow an entry and move it to the front of the recency list.
    pub fn lookup_mut(&mut self, coordinates: &[u64]) -> Option<&mut CacheEntry> {
        let key = self.find(coordinates)?;
        self.promote(key);
        Some(&mut self.nodes[key].entry)
    }

    /// Insert a clean entry at the front. Callers must `lookup` first.
    pub fn insert(&mut self, coordinates: Vec<u64>, buffer: Vec<u8>) -> Result<(), CacheError> {
        let hash = hash_coordinates(&self.hasher, &coordinates);
        if let Some(&existing) = self.index.lookup(hash) {
            let held = &self.nodes[existing].entry.coordinates;
            return Err(if *held == coordinates {
                CacheError::DuplicateKey(coordinates)
            } else {
                CacheError::KeyCollision(coordinates, held.clone())
            });
        }
        let key = self.nodes.insert(Node {
            entry: CacheEntry {
                coordinates,
                buffer,
                dirty: false,
            },
            hash,
            prev: None,
            next: None,
        });
        if let Err(e) = self.index.insert(hash, key) {
            self.nodes.remove(key);
            return Err(e.into());
        }
        self.push_front(key);
        Ok(())
    }

    /// Move an entry to the front without touching its data.
    pub fn touch(&mut self, coordinates: &[u64]) -> Result<(), CacheError> {
        let key = self
            .find(coordinates)
            .ok_or_else(|| CacheError::NotFound(coordinates.to_vec()))?;
        self.promote(key);
        Ok(())
    }

    pub fn mark_dirty(&mut self, coordinates: &[u64]) -> Result<(), CacheError> {
        let key = self
            .find(coordinates)
            .ok_or_else(|| CacheError::NotFound(coordinates.to_vec()))?;
        self.nodes[key].entry.dirty = true;
        Ok(())
    }

    /// Detach an entry from the index and the recency list and hand it to
    /// the caller, dirty or not.
    pub fn remove(&mut self, coordinates: &[u64]) -> Option<CacheEntry> {
        let key = self.find(coordinates)?;
        self.unlink(key);
        let node = self.nodes.remove(key)?;
        self.index.remove(node.hash);
        Some(node.entry)
    }

    /// The least recently used entry (back of the recency list).
    pub fn least_recent(&self) -> Option<&CacheEntry> {
        self.tail.map(|k| &self.nodes[k].entry)
    }

    /// Coordinates in recency order, most recent first.
    pub fn recency(&self) -> Recency<'_> {
        Recency {
            nodes: &self.nodes,
            cur: self.head,
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.nodes.values().filter(|n| n.entry.dirty).count()
    }

    /// Write back every dirty entry through `write`, clearing dirty bits.
    ///
    /// Walks the hash index, so the write order is unspecified. The first
    /// failure stops the flush; calling `flush` again resumes with the
    /// entries still dirty. Returns the number of entries written.
    pub fn flush<F, E>(&mut self, mut write: F) -> Result<usize, FlushError<E>>
    where
        F: FnMut(&[u64], &[u8]) -> Result<(), E>,
        E: std::error::Error + 'static,
    {
        let dirty: Vec<EntryKey> = self
            .index
            .iter()
            .map(|(_, &k)| k)
            .filter(|&k| self.nodes[k].entry.dirty)
            .collect();
        for &key in &dirty {
            let entry = &mut self.nodes[key].entry;
            if let Err(source) = write(&entry.coordinates, &entry.buffer) {
                return Err(FlushError {
                    coordinates: entry.coordinates.clone(),
                    source,
                });
            }
            entry.dirty = false;
        }
        Ok(dirty.len())
    }

    /// Flush, then drop every entry. On failure nothing is dropped.
    pub fn close<F, E>(&mut self, write: F) -> Result<usize, FlushError<E>>
    where
        F: FnMut(&[u64], &[u8]) -> Result<(), E>,
        E: std::error::Error + 'static,
    {
        let written = self.flush(write)?;
        self.clear_clean();
        Ok(written)
    }

    fn clear_clean(&mut self) {
        debug_assert_eq!(self.dirty_count(), 0);
        let hashes: Vec<u64> = self.nodes.values().map(|n| n.hash).collect();
        for hash in hashes {
            self.index.remove(hash);
        }
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }
}

/// Iterator over cached coordinates, most recently used first.
pub struct Recency<'a> {
    nodes: &'a SlotMap<EntryKey, Node>,
    cur: Option<EntryKey>,
}

impl<'a> Iterator for Recency<'a> {
    type Item = &'a [u64];
    fn next(&mut self) -> Option<Self::Item> {
        let node = &self.nodes[self.cur?];
        self.cur = node.next;
        Some(&node.entry.coordinates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hasher;

    fn order(c: &ChunkCache<impl BuildHasher>) -> Vec<Vec<u64>> {
        c.recency().map(<[u64]>::to_vec).collect()
    }

    #[derive(Debug, thiserror::Error)]
    #[error("store rejected write")]
    struct Rejected;

    /// Invariant: insert pushes to the front, touch promotes.
    #[test]
    fn touch_reorders_front_to_back() {
        let mut c = ChunkCache::new();
        c.insert(vec![0], vec![b'a']).unwrap();
        c.insert(vec![1], vec![b'b']).unwrap();
        c.insert(vec![2], vec![b'c']).unwrap();
        assert_eq!(order(&c), vec![vec![2], vec![1], vec![0]]);
        c.touch(&[0]).unwrap();
        assert_eq!(order(&c), vec![vec![0], vec![2], vec![1]]);
        assert_eq!(c.least_recent().unwrap().coordinates(), &[1]);
        assert_eq!(c.touch(&[9]), Err(CacheError::NotFound(vec![9])));
    }

    /// Invariant: lookup promotes, peek does not.
    #[test]
    fn lookup_promotes_peek_does_not() {
        let mut c = ChunkCache::new();
        c.insert(vec![0, 0], vec![1]).unwrap();
        c.insert(vec![0, 1], vec![2]).unwrap();
        assert_eq!(c.peek(&[0, 0]).unwrap().buffer(), &[1]);
        assert_eq!(order(&c)[0], vec![0, 1]);
        assert_eq!(c.lookup(&[0, 0]).unwrap().buffer(), &[1]);
        assert_eq!(order(&c)[0], vec![0, 0]);
        assert!(c.lookup(&[1, 1]).is_none());
    }

    /// Invariant: duplicate insert is rejected without side effects.
    #[test]
    fn duplicate_insert_rejected() {
        let mut c = ChunkCache::new();
        c.insert(vec![3], vec![1]).unwrap();
        assert_eq!(
            c.insert(vec![3], vec![2]),
            Err(CacheError::DuplicateKey(vec![3]))
        );
        assert_eq!(c.len(), 1);
        assert_eq!(c.peek(&[3]).unwrap().buffer(), &[1]);
    }

    /// Invariant: remove detaches from both structures and returns ownership.
    #[test]
    fn remove_returns_entry_and_relinks_neighbours() {
        let mut c = ChunkCache::new();
        for i in 0..3u64 {
            c.insert(vec![i], vec![i as u8]).unwrap();
        }
        c.mark_dirty(&[1]).unwrap();
        let e = c.remove(&[1]).unwrap();
        assert!(e.is_dirty());
        assert_eq!(e.into_buffer(), vec![1]);
        assert_eq!(order(&c), vec![vec![2], vec![0]]);
        assert!(c.remove(&[1]).is_none());
        assert!(c.remove(&[0]).is_some());
        assert!(c.remove(&[2]).is_some());
        assert!(c.is_empty());
        assert!(c.least_recent().is_none());
        c.insert(vec![5], vec![]).unwrap();
        assert_eq!(order(&c), vec![vec![5]]);
    }

    /// Invariant: a second flush with no writes in between writes nothing.
    #[test]
    fn flush_is_idempotent() {
        let mut c = ChunkCache::new();
        for i in 0..4u64 {
            c.insert(vec![i], vec![0; 4]).unwrap();
        }
        c.lookup_mut(&[1]).unwrap().buffer_mut()[0] = 9;
        c.mark_dirty(&[1]).unwrap();
        c.mark_dirty(&[3]).unwrap();
        let mut written = Vec::new();
        let n = c
            .flush(|k, b| {
                written.push((k.to_vec(), b.to_vec()));
                Ok::<_, Rejected>(())
            })
            .unwrap();
        assert_eq!(n, 2);
        written.sort();
        assert_eq!(written[0], (vec![1], vec![9, 0, 0, 0]));
        assert_eq!(written[1].0, vec![3]);
        let again = c.flush(|_, _| -> Result<(), Rejected> { panic!("nothing is dirty") });
        assert_eq!(again.unwrap(), 0);
    }

    /// Invariant: a failed flush reports the key, keeps it and the rest
    /// dirty, and a retry finishes the job.
    #[test]
    fn failed_flush_is_partial_and_retriable() {
        let mut c = ChunkCache::new();
        for i in 0..5u64 {
            c.insert(vec![i], vec![i as u8]).unwrap();
            c.mark_dirty(&[i]).unwrap();
        }
        let mut calls = 0;
        let err = c
            .flush(|_, _| {
                calls += 1;
                if calls == 3 {
                    Err(Rejected)
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(c.peek(&err.coordinates).unwrap().is_dirty());
        assert_eq!(c.dirty_count(), 3);
        assert_eq!(err.to_string(), format!("failed to write back chunk {:?}", err.coordinates));
        let n = c.flush(|_, _| Ok::<_, Rejected>(())).unwrap();
        assert_eq!(n, 3);
        assert_eq!(c.dirty_count(), 0);
    }

    /// Invariant: close writes back then empties the cache; a failing
    /// close keeps everything.
    #[test]
    fn close_flushes_then_clears() {
        let mut c = ChunkCache::new();
        c.insert(vec![0], vec![1]).unwrap();
        c.insert(vec![1], vec![2]).unwrap();
        c.mark_dirty(&[0]).unwrap();
        assert!(c.close(|_, _| Err(Rejected)).is_err());
        assert_eq!(c.len(), 2);
        assert_eq!(c.close(|_, _| Ok::<_, Rejected>(())).unwrap(), 1);
        assert!(c.is_empty());
        assert!(c.recency().next().is_none());
        c.insert(vec![0], vec![3]).unwrap();
        assert_eq!(c.peek(&[0]).unwrap().buffer(), &[3]);
    }

    /// Invariant: distinct coordinates that hash alike are never aliased.
    #[test]
    fn hash_collision_is_reported() {
        #[derive(Clone, Default)]
        struct ConstBuildHasher;
        struct ConstHasher;
        impl BuildHasher for ConstBuildHasher {
            type Hasher = ConstHasher;
            fn build_hasher(&self) -> Self::Hasher {
                ConstHasher
            }
        }
        impl Hasher for ConstHasher {
            fn write(&mut self, _bytes: &[u8]) {}
            fn finish(&self) -> u64 {
                0
            }
        }

        let mut c = ChunkCache::with_hasher(2, ConstBuildHasher).unwrap();
        c.insert(vec![0], vec![1]).unwrap();
        assert_eq!(
            c.insert(vec![1], vec![2]),
            Err(CacheError::KeyCollision(vec![1], vec![0]))
        );
        assert!(c.peek(&[1]).is_none());
        assert!(c.contains(&[0]));
    }
}
