//! Hyperslab-to-chunk projection.
//!
//! Pure arithmetic over `(dimension length, chunk length, slice)` triples:
//! which chunks a strided selection touches along one dimension, and for
//! each touched chunk which local elements to copy and where they land in
//! the caller's dense buffer. Dimensions are projected independently and
//! recombined by an [`Odometer`] over the per-dimension chunk ranges.

use crate::odometer::Odometer;
use core::fmt;
use std::collections::TryReserveError;
use serde::{Deserialize, Serialize};

/// Half-open strided selection along one dimension: `start, start+stride, ... < stop`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Slice {
    pub start: u64,
    pub stop: u64,
    pub stride: u64,
}

impl Slice {
    pub const fn new(start: u64, stop: u64, stride: u64) -> Self {
        Self {
            start,
            stop,
            stride,
        }
    }

    /// Unit-stride selection of `start..stop`.
    pub const fn contiguous(start: u64, stop: u64) -> Self {
        Self::new(start, stop, 1)
    }

    /// Every element of a dimension of length `len`.
    pub const fn whole(len: u64) -> Self {
        Self::new(0, len, 1)
    }

    /// Number of selected elements; zero for empty or malformed slices.
    pub fn count(&self) -> u64 {
        if self.stride == 0 || self.stop <= self.start {
            0
        } else {
            (self.stop - self.start).div_ceil(self.stride)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}:{}]", self.start, self.stop, self.stride)
    }
}

impl From<core::ops::Range<u64>> for Slice {
    fn from(range: core::ops::Range<u64>) -> Self {
        Self::contiguous(range.start, range.end)
    }
}

/// Span of chunk indices `[start, stop)` that a slice intersects.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChunkRange {
    pub start: u64,
    pub stop: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.stop.saturating_sub(self.start)
    }
    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }
    pub fn contains(&self, chunk_index: u64) -> bool {
        self.start <= chunk_index && chunk_index < self.stop
    }
}

/// How one chunk along one dimension maps into a selection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Projection {
    pub chunk_index: u64,
    /// Offset in the caller's per-dimension output where copying starts.
    pub iopos: u64,
    /// Number of elements to copy; zero when the stride steps over the chunk.
    pub iocount: u64,
    /// Selected elements in chunk-local coordinates.
    pub chunk_slice: Slice,
    /// The chunk extends past the end of the dimension.
    pub short: bool,
}

impl Projection {
    /// Destination range in the caller's per-dimension output.
    pub fn memory_slice(&self) -> Slice {
        Slice::contiguous(self.iopos, self.iopos + self.iocount)
    }

    /// No selected element lies in this chunk.
    pub fn is_skip(&self) -> bool {
        self.iocount == 0
    }
}

/// Errors from slice validation and projection.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SliceError {
    #[error("invalid slice {slice} for dimension of length {dim_len}: {reason}")]
    InvalidSlice {
        slice: Slice,
        dim_len: u64,
        reason: &'static str,
    },
    #[error("chunk length must be at least 1")]
    InvalidChunkLength,
    #[error("chunk {chunk_index} is outside the touched chunk range {start}..{stop}")]
    ChunkIndexOutOfRange { chunk_index: u64, start: u64, stop: u64 },
    #[error("expected {expected} per-dimension values, got {actual}")]
    RankMismatch { expected: usize, actual: usize },
    /// The selection holds more than `u64::MAX` elements.
    #[error("selection element count overflows")]
    TooManyElements,
    #[error("out of memory while projecting a selection")]
    OutOfMemory,
}

impl From<TryReserveError> for SliceError {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Product of per-dimension counts, or `TooManyElements` on overflow.
pub(crate) fn checked_element_count(counts: impl IntoIterator<Item = u64>) -> Result<u64, SliceError> {
    counts
        .into_iter()
        .try_fold(1u64, |acc, c| acc.checked_mul(c))
        .ok_or(SliceError::TooManyElements)
}

fn validate(dim_len: u64, chunk_len: u64, slice: &Slice) -> Result<(), SliceError> {
    if chunk_len == 0 {
        return Err(SliceError::InvalidChunkLength);
    }
    let reason = if slice.stride == 0 {
        "stride is zero"
    } else if slice.start > slice.stop {
        "start exceeds stop"
    } else if slice.stop > dim_len {
        "stop exceeds the dimension length"
    } else {
        return Ok(());
    };
    Err(SliceError::InvalidSlice {
        slice: *slice,
        dim_len,
        reason,
    })
}

/// Chunks touched by `slice`: `start / chunk_len .. ceil(stop / chunk_len)`.
///
/// The stride does not narrow the range; trailing chunks the stride steps
/// over project to skipped [`Projection`]s. An empty slice touches nothing.
pub fn compute_chunk_range(dim_len: u64, chunk_len: u64, slice: &Slice) -> Result<ChunkRange, SliceError> {
    validate(dim_len, chunk_len, slice)?;
    let start = slice.start / chunk_len;
    if slice.start == slice.stop {
        return Ok(ChunkRange { start, stop: start });
    }
    Ok(ChunkRange {
        start,
        stop: slice.stop.div_ceil(chunk_len),
    })
}

/// Project `slice` onto chunk `chunk_index` of a dimension.
pub fn compute_projection(
    dim_len: u64,
    chunk_len: u64,
    chunk_index: u64,
    slice: &Slice,
) -> Result<Projection, SliceError> {
    let range = compute_chunk_range(dim_len, chunk_len, slice)?;
    if !range.contains(chunk_index) {
        return Err(SliceError::ChunkIndexOutOfRange {
            chunk_index,
            start: range.start,
            stop: range.stop,
        });
    }
    Ok(project_unchecked(dim_len, chunk_len, chunk_index, slice))
}

// Caller guarantees a validated slice and `chunk_index` inside its range,
// which implies chunk_start < slice.stop and chunk_stop > slice.start.
fn project_unchecked(dim_len: u64, chunk_len: u64, chunk_index: u64, slice: &Slice) -> Projection {
    let chunk_start = chunk_index * chunk_len;
    let chunk_stop = chunk_start + chunk_len;
    let lo = slice.start.max(chunk_start);
    let hi = slice.stop.min(chunk_stop);

    // Selected elements preceding `lo`, i.e. the first stride step at or after it.
    let before = (lo - slice.start).div_ceil(slice.stride);
    let first = slice.start + before * slice.stride;
    let short = chunk_stop > dim_len;

    if first >= hi {
        let local = hi - chunk_start;
        return Projection {
            chunk_index,
            iopos: before.min(slice.count()),
            iocount: 0,
            chunk_slice: Slice::new(local, local, slice.stride),
            short,
        };
    }

    let iocount = (hi - first).div_ceil(slice.stride);
    let last = first + (iocount - 1) * slice.stride;
    Projection {
        chunk_index,
        iopos: before,
        iocount,
        chunk_slice: Slice::new(first - chunk_start, last - chunk_start + 1, slice.stride),
        short,
    }
}

/// The chunk range of one dimension together with one projection per chunk in it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DimProjections {
    pub range: ChunkRange,
    pub projections: Vec<Projection>,
}

impl DimProjections {
    /// Projection for an absolute chunk index along this dimension.
    pub fn get(&self, chunk_index: u64) -> Option<&Projection> {
        if !self.range.contains(chunk_index) {
            return None;
        }
        self.projections.get((chunk_index - self.range.start) as usize)
    }

    /// Total selected elements along this dimension.
    pub fn count(&self) -> u64 {
        self.projections.iter().map(|p| p.iocount).sum()
    }
}

/// Range and per-chunk projections of `slice` along one dimension.
pub fn compute_projections(dim_len: u64, chunk_len: u64, slice: &Slice) -> Result<DimProjections, SliceError> {
    let range = compute_chunk_range(dim_len, chunk_len, slice)?;
    let len = usize::try_from(range.len()).map_err(|_| SliceError::OutOfMemory)?;
    let mut projections = Vec::new();
    projections.try_reserve_exact(len)?;
    projections.extend((range.start..range.stop).map(|c| project_unchecked(dim_len, chunk_len, c, slice)));
    Ok(DimProjections { range, projections })
}

/// Per-dimension projections of a multi-dimensional selection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SliceProjection {
    dims: Vec<DimProjections>,
    counts: Vec<u64>,
    num_elements: u64,
}

impl SliceProjection {
    /// Project `slices` over an array of `shape` split into `chunk_shape` chunks.
    pub fn new(shape: &[u64], chunk_shape: &[u64], slices: &[Slice]) -> Result<Self, SliceError> {
        let rank = shape.len();
        for actual in [chunk_shape.len(), slices.len()] {
            if actual != rank {
                return Err(SliceError::RankMismatch {
                    expected: rank,
                    actual,
                });
            }
        }
        for ((&dim_len, &chunk_len), slice) in shape.iter().zip(chunk_shape).zip(slices) {
            validate(dim_len, chunk_len, slice)?;
        }
        let counts: Vec<u64> = slices.iter().map(Slice::count).collect();
        let num_elements = checked_element_count(counts.iter().copied())?;
        let dims = shape
            .iter()
            .zip(chunk_shape)
            .zip(slices)
            .map(|((&dim_len, &chunk_len), slice)| compute_projections(dim_len, chunk_len, slice))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            dims,
            counts,
            num_elements,
        })
    }

    pub fn dims(&self) -> &[DimProjections] {
        &self.dims
    }

    /// Shape of the caller's dense buffer for this selection.
    pub fn selection_shape(&self) -> &[u64] {
        &self.counts
    }

    /// Elements in the selection; checked against overflow on construction.
    pub fn num_elements(&self) -> u64 {
        self.num_elements
    }

    pub fn chunk_ranges(&self) -> Vec<ChunkRange> {
        self.dims.iter().map(|d| d.range).collect()
    }

    /// Odometer over every chunk tuple in the cartesian product of ranges.
    pub fn odometer(&self) -> Odometer {
        Odometer::new(self.chunk_ranges())
    }

    /// Per-dimension projections for a chunk tuple, if it is in range.
    pub fn projections_for(&self, chunk: &[u64]) -> Option<Vec<Projection>> {
        if chunk.len() != self.dims.len() {
            return None;
        }
        self.dims
            .iter()
            .zip(chunk)
            .map(|(d, &c)| d.get(c).copied())
            .collect()
    }

    /// Chunk tuples holding at least one selected element, with their projections.
    pub fn touched_chunks(&self) -> impl Iterator<Item = (Vec<u64>, Vec<Projection>)> + '_ {
        self.odometer().filter_map(move |chunk| {
            let projections = self.projections_for(&chunk)?;
            if projections.iter().any(Projection::is_skip) {
                None
            } else {
                Some((chunk, projections))
            }
        })
    }
}
