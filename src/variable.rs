//! ChunkedVariable: slice reads and writes through the chunk cache.
//!
//! A request is projected onto chunks first (no I/O). Each touched chunk
//! is then served from the cache, loading it from the store on a miss or
//! synthesizing it from the fill value when the store has never seen it.
//! Writes dirty the cached chunk; `flush` and `close` write dirty chunks
//! back. With `CacheConfig::max_chunks` set, the least recently used chunk
//! is evicted before a new one is inserted, written back first if dirty.

use crate::chunk_cache::{CacheError, ChunkCache, FlushError};
use crate::layout::{CacheConfig, ChunkLayout, LayoutError};
use crate::odometer::Odometer;
use crate::projection::{ChunkRange, Projection, Slice, SliceError, SliceProjection};
use crate::store::{ChunkStore, StorageError};
use core::hash::BuildHasher;
use hashbrown::hash_map::DefaultHashBuilder;
use log::{debug, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum VariableError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Slice(#[from] SliceError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to read chunk {key}")]
    Read {
        key: String,
        #[source]
        source: StorageError,
    },
    #[error("failed to write back evicted chunk {key}")]
    WriteBack {
        key: String,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Flush(#[from] FlushError<StorageError>),
    #[error("buffer holds {actual} bytes but the selection needs {expected}")]
    BufferSize { expected: usize, actual: usize },
}

/// One chunked variable bound to a backing store.
pub struct ChunkedVariable<T, S = DefaultHashBuilder> {
    layout: ChunkLayout,
    config: CacheConfig,
    store: T,
    cache: ChunkCache<S>,
}

impl<T: ChunkStore> ChunkedVariable<T> {
    pub fn open(layout: ChunkLayout, config: CacheConfig, store: T) -> Result<Self, VariableError> {
        Self::with_hasher(layout, config, store, DefaultHashBuilder::default())
    }
}

impl<T: ChunkStore, S: BuildHasher> ChunkedVariable<T, S> {
    pub fn with_hasher(
        layout: ChunkLayout,
        config: CacheConfig,
        store: T,
        hasher: S,
    ) -> Result<Self, VariableError> {
        layout.validate()?;
        config.validate()?;
        let cache = ChunkCache::with_hasher(config.leaf_capacity, hasher)?;
        Ok(Self {
            layout,
            config,
            store,
            cache,
        })
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
    pub fn cache(&self) -> &ChunkCache<S> {
        &self.cache
    }
    pub fn store(&self) -> &T {
        &self.store
    }

    fn selection_bytes(&self, projection: &SliceProjection) -> Result<usize, VariableError> {
        usize::try_from(projection.num_elements())
            .ok()
            .and_then(|n| n.checked_mul(self.layout.element_size))
            .ok_or(VariableError::Slice(SliceError::TooManyElements))
    }

    fn project(&self, slices: &[Slice], buffer_len: usize) -> Result<SliceProjection, VariableError> {
        let projection = SliceProjection::new(&self.layout.shape, &self.layout.chunk_shape, slices)?;
        let expected = self.selection_bytes(&projection)?;
        if expected != buffer_len {
            return Err(VariableError::BufferSize {
                expected,
                actual: buffer_len,
            });
        }
        Ok(projection)
    }

    /// Copy the selection into `out`, a dense row-major buffer of the
    /// selection's shape.
    pub fn read_slice(&mut self, slices: &[Slice], out: &mut [u8]) -> Result<(), VariableError> {
        let projection = self.project(slices, out.len())?;
        self.read_projected(&projection, out)
    }

    /// Read the selection into a freshly allocated buffer.
    pub fn read_slice_vec(&mut self, slices: &[Slice]) -> Result<Vec<u8>, VariableError> {
        let projection = SliceProjection::new(&self.layout.shape, &self.layout.chunk_shape, slices)?;
        let len = self.selection_bytes(&projection)?;
        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(SliceError::from)?;
        out.resize(len, 0);
        self.read_projected(&projection, &mut out)?;
        Ok(out)
    }

    fn read_projected(&mut self, projection: &SliceProjection, out: &mut [u8]) -> Result<(), VariableError> {
        let element_size = self.layout.element_size;
        for (chunk, projections) in projection.touched_chunks() {
            self.load(&chunk, true)?;
            let entry = self
                .cache
                .lookup(&chunk)
                .ok_or_else(|| CacheError::NotFound(chunk.clone()))?;
            let src = entry.buffer();
            copy_runs(
                &projections,
                &self.layout.chunk_shape,
                projection.selection_shape(),
                element_size,
                |chunk_at, user_at, len| {
                    out[user_at..user_at + len].copy_from_slice(&src[chunk_at..chunk_at + len]);
                },
            );
        }
        Ok(())
    }

    /// Copy `data`, a dense row-major buffer of the selection's shape, into
    /// the selected elements. Touched chunks become dirty in the cache.
    pub fn write_slice(&mut self, slices: &[Slice], data: &[u8]) -> Result<(), VariableError> {
        let projection = self.project(slices, data.len())?;
        let element_size = self.layout.element_size;
        for (chunk, projections) in projection.touched_chunks() {
            let covers_chunk = projections
                .iter()
                .zip(&self.layout.chunk_shape)
                .all(|(p, &len)| p.chunk_slice.stride == 1 && p.iocount == len);
            self.load(&chunk, !covers_chunk)?;
            let entry = self
                .cache
                .lookup_mut(&chunk)
                .ok_or_else(|| CacheError::NotFound(chunk.clone()))?;
            let dst = entry.buffer_mut();
            copy_runs(
                &projections,
                &self.layout.chunk_shape,
                projection.selection_shape(),
                element_size,
                |chunk_at, user_at, len| {
                    dst[chunk_at..chunk_at + len].copy_from_slice(&data[user_at..user_at + len]);
                },
            );
            entry.mark_dirty();
        }
        Ok(())
    }

    /// Write back every dirty chunk. Returns the number written.
    pub fn flush(&mut self) -> Result<usize, VariableError> {
        let (layout, store) = (&self.layout, &mut self.store);
        let written = self
            .cache
            .flush(|coordinates, buffer| store.write_chunk(&layout.chunk_key(coordinates), buffer))?;
        debug!("flushed {written} dirty chunks");
        Ok(written)
    }

    /// Flush and drop every cached chunk. On failure the cache is kept so
    /// the close can be retried.
    pub fn close(&mut self) -> Result<usize, VariableError> {
        let (layout, store) = (&self.layout, &mut self.store);
        match self
            .cache
            .close(|coordinates, buffer| store.write_chunk(&layout.chunk_key(coordinates), buffer))
        {
            Ok(written) => {
                debug!("closed variable after writing {written} dirty chunks");
                Ok(written)
            }
            Err(e) => {
                warn!(
                    "closing variable left {} dirty chunks: {e}",
                    self.cache.dirty_count()
                );
                Err(e.into())
            }
        }
    }

    /// Close the variable and hand back its store.
    pub fn into_store(mut self) -> Result<T, VariableError> {
        self.close()?;
        Ok(self.store)
    }

    fn load(&mut self, chunk: &[u64], read_from_store: bool) -> Result<(), VariableError> {
        if self.cache.contains(chunk) {
            return Ok(());
        }
        self.make_room()?;
        let key = self.layout.chunk_key(chunk);
        let mut buffer = self.layout.fill_chunk()?;
        if read_from_store {
            match self.store.read_chunk(&key, &mut buffer) {
                Ok(()) => trace!("chunk {key} loaded from store"),
                Err(e) if e.is_not_found() => {
                    trace!("chunk {key} never written, using fill value");
                    buffer = self.layout.fill_chunk()?;
                }
                Err(source) => return Err(VariableError::Read { key, source }),
            }
        }
        self.cache.insert(chunk.to_vec(), buffer)?;
        Ok(())
    }

    fn make_room(&mut self) -> Result<(), VariableError> {
        let Some(max_chunks) = self.config.max_chunks else {
            return Ok(());
        };
        while self.cache.len() >= max_chunks {
            let Some(victim) = self.cache.least_recent().map(|e| e.coordinates().to_vec()) else {
                break;
            };
            self.evict(&victim)?;
        }
        Ok(())
    }

    fn evict(&mut self, coordinates: &[u64]) -> Result<(), VariableError> {
        let key = self.layout.chunk_key(coordinates);
        if let Some(entry) = self.cache.peek(coordinates) {
            if entry.is_dirty() {
                self.store
                    .write_chunk(&key, entry.buffer())
                    .map_err(|source| VariableError::WriteBack {
                        key: key.clone(),
                        source,
                    })?;
            }
        }
        self.cache.remove(coordinates);
        debug!("evicted chunk {key}");
        Ok(())
    }
}

fn row_major_strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Enumerate the byte runs linking one chunk buffer to the caller's buffer.
///
/// `f(chunk_offset, user_offset, len)` is called once per run. When the
/// innermost chunk-local stride is 1 a run spans the innermost count;
/// otherwise each run is a single element.
fn copy_runs<F>(
    projections: &[Projection],
    chunk_shape: &[u64],
    selection_shape: &[u64],
    element_size: usize,
    mut f: F,
) where
    F: FnMut(usize, usize, usize),
{
    let chunk_strides = row_major_strides(chunk_shape);
    let user_strides = row_major_strides(selection_shape);
    let inner_contiguous = projections
        .last()
        .is_some_and(|p| p.chunk_slice.stride == 1);
    let outer = if inner_contiguous {
        projections.len() - 1
    } else {
        projections.len()
    };
    let run = match projections.last() {
        Some(p) if inner_contiguous => p.iocount,
        _ => 1,
    } as usize
        * element_size;

    let steps = projections[..outer]
        .iter()
        .map(|p| ChunkRange {
            start: 0,
            stop: p.iocount,
        })
        .collect();
    for step in Odometer::new(steps) {
        let mut chunk_at = 0u64;
        let mut user_at = 0u64;
        for (d, &k) in step.iter().enumerate() {
            let p = &projections[d];
            chunk_at += (p.chunk_slice.start + k * p.chunk_slice.stride) * chunk_strides[d];
            user_at += (p.iopos + k) * user_strides[d];
        }
        if inner_contiguous {
            let d = outer;
            chunk_at += projections[d].chunk_slice.start * chunk_strides[d];
            user_at += projections[d].iopos * user_strides[d];
        }
        f(
            chunk_at as usize * element_size,
            user_at as usize * element_size,
            run,
        );
    }
}
