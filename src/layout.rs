//! Per-variable chunk layout and cache configuration.
//!
//! Both are handed over by the metadata layer, typically deserialized from
//! JSON, and validated once before a variable is opened.

use crate::chunk_cache::DEFAULT_LEAF_CAPACITY;
use crate::chunk_key::{encode_chunk_key, ChunkKeySeparator};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("shape has {shape} dimensions but chunk shape has {chunk_shape}")]
    RankMismatch { shape: usize, chunk_shape: usize },
    #[error("chunk length of dimension {0} is zero")]
    ZeroChunkLength(usize),
    #[error("element size must be at least one byte")]
    ZeroElementSize,
    #[error("fill value has {actual} bytes, element size is {expected}")]
    FillValueSize { expected: usize, actual: usize },
    #[error("a chunk of this layout does not fit in memory")]
    ChunkTooLarge,
    #[error("leaf capacity must be at least 1")]
    ZeroLeafCapacity,
    #[error("maximum cached chunk count must be at least 1")]
    ZeroMaxChunks,
}

/// Shape, chunking and element encoding of one variable.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChunkLayout {
    pub shape: Vec<u64>,
    pub chunk_shape: Vec<u64>,
    pub element_size: usize,
    #[serde(default)]
    pub separator: ChunkKeySeparator,
    /// Bytes of one element used for never-written chunks; zeros when absent.
    #[serde(default)]
    pub fill_value: Option<Vec<u8>>,
}

impl ChunkLayout {
    pub fn new(shape: Vec<u64>, chunk_shape: Vec<u64>, element_size: usize) -> Result<Self, LayoutError> {
        let layout = Self {
            shape,
            chunk_shape,
            element_size,
            separator: ChunkKeySeparator::default(),
            fill_value: None,
        };
        layout.validate()?;
        Ok(layout)
    }

    #[must_use]
    pub fn with_separator(mut self, separator: ChunkKeySeparator) -> Self {
        self.separator = separator;
        self
    }

    pub fn with_fill_value(mut self, fill_value: Vec<u8>) -> Result<Self, LayoutError> {
        self.fill_value = Some(fill_value);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.shape.len() != self.chunk_shape.len() {
            return Err(LayoutError::RankMismatch {
                shape: self.shape.len(),
                chunk_shape: self.chunk_shape.len(),
            });
        }
        if let Some(dim) = self.chunk_shape.iter().position(|&c| c == 0) {
            return Err(LayoutError::ZeroChunkLength(dim));
        }
        if self.element_size == 0 {
            return Err(LayoutError::ZeroElementSize);
        }
        if let Some(fill) = &self.fill_value {
            if fill.len() != self.element_size {
                return Err(LayoutError::FillValueSize {
                    expected: self.element_size,
                    actual: fill.len(),
                });
            }
        }
        self.chunk_bytes().map(|_| ())
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of chunks along each dimension.
    pub fn grid_shape(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(&s, &c)| s.div_ceil(c))
            .collect()
    }

    pub fn chunk_elements(&self) -> u64 {
        self.chunk_shape.iter().product()
    }

    /// Byte size of one full chunk buffer; edge chunks are stored full size.
    pub fn chunk_bytes(&self) -> Result<usize, LayoutError> {
        self.chunk_shape
            .iter()
            .try_fold(self.element_size, |acc, &c| {
                usize::try_from(c).ok().and_then(|c| acc.checked_mul(c))
            })
            .ok_or(LayoutError::ChunkTooLarge)
    }

    pub fn chunk_key(&self, coordinates: &[u64]) -> String {
        encode_chunk_key(coordinates, self.separator)
    }

    /// A chunk buffer holding only the fill value.
    pub fn fill_chunk(&self) -> Result<Vec<u8>, LayoutError> {
        let bytes = self.chunk_bytes()?;
        let mut chunk = Vec::new();
        chunk
            .try_reserve_exact(bytes)
            .map_err(|_| LayoutError::ChunkTooLarge)?;
        match &self.fill_value {
            Some(fill) => {
                for _ in 0..bytes / self.element_size {
                    chunk.extend_from_slice(fill);
                }
            }
            None => chunk.resize(bytes, 0),
        }
        Ok(chunk)
    }
}

/// Cache sizing for a chunked variable.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries per hash-index leaf.
    pub leaf_capacity: usize,
    /// Evict least recently used chunks beyond this count; unbounded when absent.
    pub max_chunks: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            leaf_capacity: DEFAULT_LEAF_CAPACITY,
            max_chunks: None,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.leaf_capacity == 0 {
            return Err(LayoutError::ZeroLeafCapacity);
        }
        if self.max_chunks == Some(0) {
            return Err(LayoutError::ZeroMaxChunks);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_from_json() {
        let layout: ChunkLayout = serde_json::from_str(
            r#"{"shape":[10,7],"chunk_shape":[4,3],"element_size":2,"separator":"/","fill_value":[255,1]}"#,
        )
        .unwrap();
        layout.validate().unwrap();
        assert_eq!(layout.grid_shape(), vec![3, 3]);
        assert_eq!(layout.chunk_bytes(), Ok(24));
        assert_eq!(layout.chunk_key(&[2, 0]), "2/0");
        let fill = layout.fill_chunk().unwrap();
        assert_eq!(fill.len(), 24);
        assert_eq!(&fill[..4], &[255, 1, 255, 1]);
    }

    #[test]
    fn defaults_apply_when_fields_are_absent() {
        let layout: ChunkLayout =
            serde_json::from_str(r#"{"shape":[4],"chunk_shape":[2],"element_size":1}"#).unwrap();
        assert_eq!(layout.separator, ChunkKeySeparator::Dot);
        assert_eq!(layout.fill_chunk().unwrap(), vec![0, 0]);
        let config: CacheConfig = serde_json::from_str(r#"{"max_chunks":4}"#).unwrap();
        assert_eq!(config.leaf_capacity, DEFAULT_LEAF_CAPACITY);
        assert_eq!(config.max_chunks, Some(4));
    }

    #[test]
    fn invalid_layouts_are_rejected() {
        assert_eq!(
            ChunkLayout::new(vec![4, 4], vec![2], 1),
            Err(LayoutError::RankMismatch { shape: 2, chunk_shape: 1 })
        );
        assert_eq!(
            ChunkLayout::new(vec![4, 4], vec![2, 0], 1),
            Err(LayoutError::ZeroChunkLength(1))
        );
        assert_eq!(
            ChunkLayout::new(vec![4], vec![2], 0),
            Err(LayoutError::ZeroElementSize)
        );
        assert_eq!(
            ChunkLayout::new(vec![4], vec![2], 4).unwrap().with_fill_value(vec![1]),
            Err(LayoutError::FillValueSize { expected: 4, actual: 1 })
        );
        assert_eq!(
            ChunkLayout::new(vec![u64::MAX, u64::MAX], vec![u64::MAX, u64::MAX], 8),
            Err(LayoutError::ChunkTooLarge)
        );
        assert!(CacheConfig { leaf_capacity: 0, max_chunks: None }.validate().is_err());
        assert!(CacheConfig { leaf_capacity: 1, max_chunks: Some(0) }.validate().is_err());
    }
}
