use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, Result, SyncError};
use crate::security::ContentDigest;

/// Immutable slice of a file, identified by its zero-based index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(index: u32, data: Vec<u8>) -> Self {
        Self { index, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn digest(&self) -> ContentDigest {
        ChunkCodec::digest(&self.data)
    }
}

/// Splits files into fixed-size chunks and puts them back together
pub struct ChunkCodec;

impl ChunkCodec {
    /// Split `bytes` sequentially into chunks of `chunk_size` bytes.
    ///
    /// Only the last chunk may be shorter. An empty file yields a single
    /// empty chunk so that every file version references at least one chunk.
    /// A zero `chunk_size` is rejected as a configuration error.
    pub fn split(bytes: &[u8], chunk_size: usize) -> Result<Vec<Chunk>> {
        check_chunk_size(chunk_size)?;

        if bytes.is_empty() {
            return Ok(vec![Chunk::new(0, Vec::new())]);
        }

        Ok(bytes
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, data)| Chunk::new(index as u32, data.to_vec()))
            .collect())
    }

    /// Number of chunks `split` produces for a file of `size` bytes
    pub fn chunk_count(size: u64, chunk_size: usize) -> Result<u32> {
        check_chunk_size(chunk_size)?;
        if size == 0 {
            Ok(1)
        } else {
            Ok(size.div_ceil(chunk_size as u64) as u32)
        }
    }

    /// Extract chunk `index` from `bytes` without splitting the whole file
    pub fn chunk_at(bytes: &[u8], index: u32, chunk_size: usize) -> Option<Chunk> {
        if chunk_size == 0 {
            return None;
        }
        if bytes.is_empty() {
            return (index == 0).then(|| Chunk::new(0, Vec::new()));
        }
        let start = (index as usize).checked_mul(chunk_size)?;
        if start >= bytes.len() {
            return None;
        }
        let end = start.saturating_add(chunk_size).min(bytes.len());
        Some(Chunk::new(index, bytes[start..end].to_vec()))
    }

    /// Content fingerprint of a chunk payload
    pub fn digest(bytes: &[u8]) -> ContentDigest {
        ContentDigest::of(bytes)
    }

    /// Concatenate `chunks` in index order.
    ///
    /// Fails with [`SyncError::IncompleteFile`] if any index in `[0, expected)`
    /// is missing; completion order of the input does not matter.
    pub fn reassemble<I>(chunks: I, expected: u32) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = Chunk>,
    {
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; expected as usize];
        for chunk in chunks {
            if let Some(slot) = slots.get_mut(chunk.index as usize) {
                *slot = Some(chunk.data);
            }
        }

        let missing: Vec<u32> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u32)
            .collect();
        if !missing.is_empty() {
            return Err(SyncError::IncompleteFile { expected, missing });
        }

        Ok(slots.into_iter().flatten().flatten().collect())
    }
}

fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(ConfigurationError::ValidationFailed {
            key: "file.chunk_size".to_string(),
            reason: "chunk size must be positive".to_string(),
        }
        .into());
    }
    Ok(())
}
