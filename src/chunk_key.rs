//! Chunk key rendering and coordinate hashing.
//!
//! A chunk coordinate tuple `(i0, i1, ..., ik)` names its backing-store
//! object as the decimal string `"i0.i1...ik"`; the separator is supplied
//! by the format layer. The in-memory index uses a 64-bit hash of the same
//! tuple instead of the string.

use core::fmt;
use core::hash::BuildHasher;
use serde::{Deserialize, Serialize};

/// Separator placed between coordinates in a rendered chunk key.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ChunkKeySeparator {
    /// The dot `.` character.
    #[default]
    #[serde(rename = ".")]
    Dot,
    /// The slash `/` character.
    #[serde(rename = "/")]
    Slash,
}

impl ChunkKeySeparator {
    pub const fn as_char(self) -> char {
        match self {
            Self::Dot => '.',
            Self::Slash => '/',
        }
    }
}

impl fmt::Display for ChunkKeySeparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl TryFrom<char> for ChunkKeySeparator {
    type Error = char;

    fn try_from(separator: char) -> Result<Self, Self::Error> {
        match separator {
            '.' => Ok(Self::Dot),
            '/' => Ok(Self::Slash),
            other => Err(other),
        }
    }
}

/// Render chunk coordinates as a backing-store key.
///
/// A rank-0 (scalar) variable has a single chunk named `"0"`.
pub fn encode_chunk_key(coordinates: &[u64], separator: ChunkKeySeparator) -> String {
    if coordinates.is_empty() {
        return "0".to_string();
    }
    coordinates
        .iter()
        .map(u64::to_string)
        .collect::<Vec<String>>()
        .join(&separator.to_string())
}

/// Parse a key produced by [`encode_chunk_key`] for a variable of `rank`
/// dimensions. Components with leading zeros are rejected.
pub fn decode_chunk_key(key: &str, separator: ChunkKeySeparator, rank: usize) -> Option<Vec<u64>> {
    if rank == 0 {
        return (key == "0").then(Vec::new);
    }
    let coordinates = key
        .split(separator.as_char())
        .map(|part| {
            let canonical = !part.is_empty()
                && part.bytes().all(|b| b.is_ascii_digit())
                && (part == "0" || !part.starts_with('0'));
            if canonical {
                part.parse::<u64>().ok()
            } else {
                None
            }
        })
        .collect::<Option<Vec<u64>>>()?;
    (coordinates.len() == rank).then_some(coordinates)
}

/// 64-bit index key of a coordinate tuple under `hasher`.
///
/// Stable for the lifetime of a given `hasher` value.
#[inline]
pub fn hash_coordinates<S: BuildHasher>(hasher: &S, coordinates: &[u64]) -> u64 {
    hasher.hash_one(coordinates)
}
