use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use libp2p::identity::PublicKey;
use libp2p::PeerId;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::SyncError;
use crate::model::{FileKey, MetaChunk, MetaFileVersion};
use crate::security::SymmetricKey;

/// Where a verified chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSource {
    Peer(PeerId),
    Store,
}

/// Per-chunk download state
#[derive(Debug, Clone, Default)]
pub struct ChunkState {
    /// Peers still worth asking, in selection order
    pub candidates: Vec<PeerId>,
    /// Peers dropped after failing this chunk
    pub failed: Vec<PeerId>,
    /// Verified temporary copy of the chunk
    pub downloaded: Option<PathBuf>,
    pub source: Option<ChunkSource>,
    /// Error of the most recent failed attempt
    pub last_error: Option<SyncError>,
}

/// Coordination object of one file download.
///
/// Each chunk's state is only mutated by the sub-process resolving that
/// chunk and by the response handler of its current attempt.
pub struct DownloadTask {
    pub file_key: FileKey,
    pub version: MetaFileVersion,
    /// Public key chunk requests are addressed to
    pub recipient: PublicKey,
    /// Decrypts chunks read back from the content store
    pub secret: SymmetricKey,
    pub temp_dir: PathBuf,
    chunks: Mutex<BTreeMap<u32, ChunkState>>,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<SyncError>>,
}

impl DownloadTask {
    pub fn new(
        file_key: FileKey,
        version: MetaFileVersion,
        recipient: PublicKey,
        secret: SymmetricKey,
        candidates: Vec<PeerId>,
        temp_dir: PathBuf,
    ) -> Self {
        let chunks = (0..version.chunk_count())
            .map(|index| {
                (
                    index,
                    ChunkState {
                        candidates: candidates.clone(),
                        ..ChunkState::default()
                    },
                )
            })
            .collect();

        Self {
            file_key,
            version,
            recipient,
            secret,
            temp_dir,
            chunks: Mutex::new(chunks),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
        }
    }

    pub fn meta_chunk(&self, index: u32) -> Option<&MetaChunk> {
        self.version.chunk(index)
    }

    /// Where the verified copy of chunk `index` is written
    pub fn temp_path(&self, index: u32) -> PathBuf {
        self.temp_dir.join(format!("chunk-{:06}", index))
    }

    pub async fn state(&self, index: u32) -> Option<ChunkState> {
        self.chunks.lock().await.get(&index).cloned()
    }

    /// First remaining candidate for chunk `index`
    pub async fn select_candidate(&self, index: u32) -> Option<PeerId> {
        self.chunks
            .lock()
            .await
            .get(&index)
            .and_then(|state| state.candidates.first().copied())
    }

    /// Drop `peer` from the candidates of chunk `index`
    pub async fn drop_candidate(&self, index: u32, peer: &PeerId) -> bool {
        let mut chunks = self.chunks.lock().await;
        let Some(state) = chunks.get_mut(&index) else {
            return false;
        };
        let before = state.candidates.len();
        state.candidates.retain(|p| p != peer);
        let dropped = before != state.candidates.len();
        if dropped {
            state.failed.push(*peer);
        }
        dropped
    }

    pub async fn mark_resolved(&self, index: u32, path: PathBuf, source: ChunkSource) {
        if let Some(state) = self.chunks.lock().await.get_mut(&index) {
            state.downloaded = Some(path);
            state.source = Some(source);
        }
    }

    pub async fn record_failure(&self, index: u32, error: SyncError) {
        if let Some(state) = self.chunks.lock().await.get_mut(&index) {
            state.last_error = Some(error);
        }
    }

    /// Indices without a verified copy, ascending
    pub async fn remaining(&self) -> Vec<u32> {
        self.chunks
            .lock()
            .await
            .iter()
            .filter(|(_, state)| state.downloaded.is_none())
            .map(|(index, _)| *index)
            .collect()
    }

    /// Verified temporary copies in index order
    pub async fn downloaded(&self) -> Vec<(u32, PathBuf)> {
        self.chunks
            .lock()
            .await
            .iter()
            .filter_map(|(index, state)| state.downloaded.clone().map(|path| (*index, path)))
            .collect()
    }

    /// Mark the task aborted; only the first reason is kept
    pub async fn abort(&self, reason: SyncError) {
        let mut slot = self.abort_reason.lock().await;
        if slot.is_none() {
            warn!(file_key = %self.file_key, "Aborting download: {}", reason);
            *slot = Some(reason);
        }
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub async fn abort_reason(&self) -> Option<SyncError> {
        self.abort_reason.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::ChunkCodec;
    use libp2p::identity::Keypair;

    fn task(peers: Vec<PeerId>) -> DownloadTask {
        let chunks = (0..3)
            .map(|index| MetaChunk {
                index,
                digest: ChunkCodec::digest(&[index as u8]),
                size: 1,
            })
            .collect();
        let key = Keypair::generate_ed25519().public();
        DownloadTask::new(
            FileKey::from_public_key(&key),
            MetaFileVersion::new(0, 1, chunks).unwrap(),
            key,
            SymmetricKey::generate(),
            peers,
            PathBuf::from("/tmp/task"),
        )
    }

    #[tokio::test]
    async fn test_candidate_lists_are_per_chunk() {
        let (a, b) = (PeerId::random(), PeerId::random());
        let task = task(vec![a, b]);

        assert!(task.drop_candidate(1, &a).await);
        assert!(!task.drop_candidate(1, &a).await);

        assert_eq!(task.select_candidate(1).await, Some(b));
        assert_eq!(task.select_candidate(0).await, Some(a));
        assert_eq!(task.state(1).await.unwrap().failed, vec![a]);
    }

    #[tokio::test]
    async fn test_resolution_and_abort() {
        let task = task(vec![]);
        assert_eq!(task.remaining().await, vec![0, 1, 2]);

        task.mark_resolved(2, task.temp_path(2), ChunkSource::Store).await;
        task.mark_resolved(0, task.temp_path(0), ChunkSource::Peer(PeerId::random()))
            .await;
        assert_eq!(task.remaining().await, vec![1]);
        let indices: Vec<u32> = task.downloaded().await.into_iter().map(|(i, _)| i).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(task.state(2).await.unwrap().source, Some(ChunkSource::Store));

        task.record_failure(1, SyncError::Crypto("bad payload".into())).await;
        let last = task.state(1).await.unwrap().last_error.unwrap();
        assert_eq!(last.kind(), ErrorKind::Crypto);

        assert!(!task.is_aborted());
        task.abort(SyncError::NoCandidates {
            file_key: task.file_key.to_string(),
            chunk_index: 1,
        })
        .await;
        task.abort(SyncError::Crypto("second".into())).await;
        assert!(task.is_aborted());
        assert_eq!(task.abort_reason().await.unwrap().kind(), ErrorKind::Exhaustion);
    }
}
