//! Backing-store seam and an in-memory store.

use std::collections::BTreeMap;

/// Errors from a backing store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The object was never written. Chunk readers treat this as fill-valued.
    #[error("object {0} not found")]
    NotFound(String),
    #[error("object {key} holds {actual} bytes, expected {expected}")]
    SizeMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },
    #[error("a write operation was attempted on a read only store")]
    ReadOnly,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// The two operations a chunk cache needs from its backing store.
///
/// Keys are rendered chunk keys (see [`encode_chunk_key`](crate::encode_chunk_key)).
/// Implementations own their retry policy; callers never retry.
pub trait ChunkStore {
    /// Fill `dest` with the stored bytes of `key`.
    ///
    /// Returns [`StorageError::NotFound`] for a chunk that was never written.
    fn read_chunk(&mut self, key: &str, dest: &mut [u8]) -> Result<(), StorageError>;

    fn write_chunk(&mut self, key: &str, src: &[u8]) -> Result<(), StorageError>;
}

impl<T: ChunkStore + ?Sized> ChunkStore for &mut T {
    fn read_chunk(&mut self, key: &str, dest: &mut [u8]) -> Result<(), StorageError> {
        (**self).read_chunk(key, dest)
    }
    fn write_chunk(&mut self, key: &str, src: &[u8]) -> Result<(), StorageError> {
        (**self).write_chunk(key, src)
    }
}

/// A store keeping chunk objects in a `BTreeMap`. Counts reads and writes.
#[derive(Debug, Default, Clone)]
pub struct MemoryChunkStore {
    objects: BTreeMap<String, Vec<u8>>,
    reads: usize,
    writes: usize,
    read_only: bool,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every subsequent write with [`StorageError::ReadOnly`].
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.objects.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Successful and failed `read_chunk` calls so far.
    pub fn read_count(&self) -> usize {
        self.reads
    }
    /// Successful `write_chunk` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes
    }
}

impl ChunkStore for MemoryChunkStore {
    fn read_chunk(&mut self, key: &str, dest: &mut [u8]) -> Result<(), StorageError> {
        self.reads += 1;
        let data = self
            .objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        if data.len() != dest.len() {
            return Err(StorageError::SizeMismatch {
                key: key.to_string(),
                expected: dest.len(),
                actual: data.len(),
            });
        }
        dest.copy_from_slice(data);
        Ok(())
    }

    fn write_chunk(&mut self, key: &str, src: &[u8]) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        self.objects.insert(key.to_string(), src.to_vec());
        self.writes += 1;
        Ok(())
    }
}
