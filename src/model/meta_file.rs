use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use libp2p::identity::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::security::ContentDigest;

/// Identity of a file: base58 id of the file's public key.
///
/// Used as storage location key and carried in chunk requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey(String);

impl FileKey {
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(key.to_peer_id().to_base58())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position and digest of one chunk within a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaChunk {
    pub index: u32,
    pub digest: ContentDigest,
    /// Plaintext length in bytes
    pub size: u32,
}

/// One immutable version of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFileVersion {
    pub version_id: u64,
    pub chunks: Vec<MetaChunk>,
    pub total_size: u64,
    /// Chunk size the version was split with
    pub chunk_size: u32,
    /// Creation time, milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl MetaFileVersion {
    /// Build a version, checking that chunk indices are contiguous from 0
    pub fn new(version_id: u64, chunk_size: u32, mut chunks: Vec<MetaChunk>) -> Result<Self> {
        chunks.sort_by_key(|c| c.index);

        if chunks.is_empty() {
            return Err(SyncError::InvalidMetaFile {
                reason: format!("version {} has no chunks", version_id),
            });
        }
        if let Some((position, chunk)) = chunks
            .iter()
            .enumerate()
            .find(|(position, chunk)| chunk.index as usize != *position)
        {
            return Err(SyncError::InvalidMetaFile {
                reason: format!(
                    "version {} expected chunk index {} but found {}",
                    version_id, position, chunk.index
                ),
            });
        }

        let total_size = chunks.iter().map(|c| c.size as u64).sum();
        Ok(Self {
            version_id,
            chunks,
            total_size,
            chunk_size,
            timestamp: now_millis(),
        })
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn chunk(&self, index: u32) -> Option<&MetaChunk> {
        self.chunks.get(index as usize)
    }
}

/// Versioned metadata of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFile {
    pub file_key: FileKey,
    versions: Vec<MetaFileVersion>,
}

impl MetaFile {
    pub fn new(file_key: FileKey) -> Self {
        Self {
            file_key,
            versions: Vec::new(),
        }
    }

    pub fn versions(&self) -> &[MetaFileVersion] {
        &self.versions
    }

    /// Authoritative version for reads
    pub fn latest(&self) -> Option<&MetaFileVersion> {
        self.versions.last()
    }

    pub fn version(&self, version_id: u64) -> Option<&MetaFileVersion> {
        self.versions.iter().find(|v| v.version_id == version_id)
    }

    /// Id the next appended version must carry
    pub fn next_version_id(&self) -> u64 {
        self.latest().map_or(0, |v| v.version_id + 1)
    }

    /// Append a version; ids must increase monotonically
    pub fn append_version(&mut self, version: MetaFileVersion) -> Result<()> {
        if let Some(latest) = self.latest() {
            if version.version_id <= latest.version_id {
                return Err(SyncError::InvalidMetaFile {
                    reason: format!(
                        "version {} does not follow latest version {}",
                        version.version_id, latest.version_id
                    ),
                });
            }
        }
        self.versions.push(version);
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn meta_chunk(index: u32, size: u32) -> MetaChunk {
        MetaChunk {
            index,
            digest: ContentDigest::of(&index.to_be_bytes()),
            size,
        }
    }

    #[test]
    fn test_version_totals_and_order() {
        let version =
            MetaFileVersion::new(0, 10, vec![meta_chunk(1, 4), meta_chunk(0, 10)]).unwrap();
        assert_eq!(version.total_size, 14);
        assert_eq!(version.chunk_count(), 2);
        assert_eq!(version.chunk(0).unwrap().index, 0);
    }

    #[test]
    fn test_version_rejects_gaps() {
        let err = MetaFileVersion::new(0, 10, vec![meta_chunk(0, 10), meta_chunk(2, 3)])
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidMetaFile { .. }));
        assert!(MetaFileVersion::new(0, 10, Vec::new()).is_err());
    }

    #[test]
    fn test_versions_are_monotonic() {
        let key = Keypair::generate_ed25519();
        let mut meta = MetaFile::new(FileKey::from_public_key(&key.public()));
        assert_eq!(meta.next_version_id(), 0);
        assert!(meta.latest().is_none());

        meta.append_version(MetaFileVersion::new(0, 10, vec![meta_chunk(0, 1)]).unwrap())
            .unwrap();
        assert_eq!(meta.next_version_id(), 1);

        let stale = MetaFileVersion::new(0, 10, vec![meta_chunk(0, 2)]).unwrap();
        assert!(meta.append_version(stale).is_err());

        meta.append_version(MetaFileVersion::new(1, 10, vec![meta_chunk(0, 3)]).unwrap())
            .unwrap();
        assert_eq!(meta.versions().len(), 2);
        assert_eq!(meta.latest().unwrap().total_size, 3);
        assert_eq!(meta.version(0).unwrap().total_size, 1);
    }
}
