//! Row-major counter over the cartesian product of per-dimension chunk ranges.

use crate::projection::ChunkRange;

/// A bounded counter vector. The last dimension turns fastest; when the
/// leading digit carries past its range the odometer stops with the
/// leading index left at its stop value.
///
/// For rank ≥ 1, `more()` is exactly `indices[0] < ranges[0].stop`. A
/// rank-0 odometer yields a single empty tuple.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Odometer {
    indices: Vec<u64>,
    ranges: Vec<ChunkRange>,
    done: bool,
}

impl Odometer {
    pub fn new(ranges: Vec<ChunkRange>) -> Self {
        let indices = ranges.iter().map(|r| r.start).collect();
        let mut odometer = Self {
            indices,
            ranges,
            done: false,
        };
        if odometer.ranges.iter().any(ChunkRange::is_empty) {
            odometer.finish();
        }
        odometer
    }

    fn finish(&mut self) {
        if let (Some(first), Some(range)) = (self.indices.first_mut(), self.ranges.first()) {
            *first = range.stop;
        }
        self.done = true;
    }

    pub fn rank(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[ChunkRange] {
        &self.ranges
    }

    /// The current tuple. Meaningful only while `more()` holds.
    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    pub fn more(&self) -> bool {
        !self.done
    }

    /// Step to the next tuple, carrying into slower dimensions.
    pub fn advance(&mut self) {
        if self.done {
            return;
        }
        for d in (0..self.indices.len()).rev() {
            self.indices[d] += 1;
            if self.indices[d] < self.ranges[d].stop {
                return;
            }
            if d == 0 {
                // Leading digit stays at its stop value.
                self.done = true;
                return;
            }
            self.indices[d] = self.ranges[d].start;
        }
        // Rank 0: the single empty tuple has been visited.
        self.done = true;
    }

    /// Total number of tuples the odometer enumerates from its start.
    pub fn total(&self) -> u64 {
        self.ranges.iter().map(ChunkRange::len).product()
    }
}

impl Iterator for Odometer {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.indices.clone();
        self.advance();
        Some(current)
    }
}

impl core::iter::FusedIterator for Odometer {}
