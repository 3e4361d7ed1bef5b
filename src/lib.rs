//! hyperchunk: the storage core of a chunked multidimensional array
//! library. An extendible hash index, an LRU cache of chunk buffers built
//! on it, and the arithmetic that maps strided hyperslab selections onto
//! chunks.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: build chunked slice I/O in small layers that can each be
//!   tested without the ones above.
//! - Layers:
//!   - ExtendibleHash<V>: directory of leaves indexed by the low bits of a
//!     precomputed 64-bit hash. Leaves split on overflow; the directory
//!     doubles when a splitting leaf is as deep as the directory.
//!   - ChunkCache<S>: chunk buffers keyed by coordinate tuples, hashed
//!     with `S` into an ExtendibleHash and ordered on a recency list.
//!   - Projection: per-dimension chunk ranges and per-chunk copy plans for
//!     a strided selection, recombined by an Odometer.
//!   - ChunkedVariable<T, S>: read/write of slices through the cache
//!     against a ChunkStore, with fill values for never-written chunks.
//!
//! Constraints
//! - Single-threaded: the index and cache are `!Sync`; callers serialize.
//! - No pointers between nodes. Leaves and cache entries live in slot
//!   arenas and refer to one another by arena key.
//! - Directory growth and leaf allocation are fallible; a failed growth
//!   leaves the index unchanged and returns `OutOfMemory`.
//!
//! Iteration policy
//! - `ExtendibleHash::iter` borrows the table, so no mutation can
//!   interleave with it.
//! - `ExtendibleHash::cursor` is the table's single resumable cursor. A
//!   second cursor while one is alive fails with `IterationInProgress`.
//!
//! Removal
//! - The index is grow-only: removal frees a leaf slot but never merges
//!   leaves or shrinks the directory.
//!
//! Cache ownership
//! - The cache evicts nothing by itself. `ChunkedVariable` evicts the
//!   least recently used chunk when `CacheConfig::max_chunks` is reached,
//!   writing it back first when dirty.
//! - `flush` stops at the first store failure and leaves the remaining
//!   dirty entries dirty, so a later flush retries them.

mod cursor_guard;
pub mod chunk_cache;
pub mod chunk_key;
pub mod hash_index;
mod hash_index_proptest;
pub mod layout;
pub mod odometer;
pub mod projection;
pub mod store;
pub mod variable;

// Public surface
pub use chunk_cache::{CacheEntry, CacheError, ChunkCache, FlushError, DEFAULT_LEAF_CAPACITY};
pub use chunk_key::{decode_chunk_key, encode_chunk_key, hash_coordinates, ChunkKeySeparator};
pub use hash_index::{ExtendibleHash, HashIndexError, InvariantViolation};
pub use layout::{CacheConfig, ChunkLayout, LayoutError};
pub use odometer::Odometer;
pub use projection::{
    compute_chunk_range, compute_projection, compute_projections, ChunkRange, DimProjections,
    Projection, Slice, SliceError, SliceProjection,
};
pub use store::{ChunkStore, MemoryChunkStore, StorageError};
pub use variable::{ChunkedVariable, VariableError};
