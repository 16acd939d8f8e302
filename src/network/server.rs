use libp2p::identity::PublicKey;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::MAX_CHUNK_SIZE;
use crate::file_manager::{self, FileIndex};
use crate::model::ChunkCodec;
use crate::network::messages::{DirectRequest, DirectResponse, ResponseContent};

/// Answers direct chunk requests from the node's indexed local files.
///
/// The server stays inactive until a user logs in; afterwards it only
/// answers requests addressed to that user's public key.
pub struct ChunkServer {
    index: FileIndex,
    serving_key: RwLock<Option<PublicKey>>,
}

impl ChunkServer {
    pub fn new(index: FileIndex) -> Self {
        Self {
            index,
            serving_key: RwLock::new(None),
        }
    }

    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    /// Serve requests addressed to `key`
    pub async fn activate(&self, key: PublicKey) {
        info!(user_peer = %key.to_peer_id(), "Chunk server activated");
        *self.serving_key.write().await = Some(key);
    }

    pub async fn deactivate(&self) {
        *self.serving_key.write().await = None;
    }

    pub async fn is_active(&self) -> bool {
        self.serving_key.read().await.is_some()
    }

    pub async fn serve(&self, request: &DirectRequest) -> DirectResponse {
        let content = self.content_for(request).await;
        DirectResponse::reply(request, content)
    }

    async fn content_for(&self, request: &DirectRequest) -> ResponseContent {
        let addressed = match self.serving_key.read().await.as_ref() {
            Some(key) => request.is_addressed_to(key),
            None => {
                return ResponseContent::Refused {
                    reason: "no user logged in".to_string(),
                }
            }
        };
        if !addressed {
            return ResponseContent::Refused {
                reason: "request addressed to another user".to_string(),
            };
        }

        let chunk = &request.request;
        if chunk.chunk_size == 0 || chunk.chunk_size > MAX_CHUNK_SIZE {
            debug!(chunk_size = chunk.chunk_size, "Requested chunk size out of bounds");
            return ResponseContent::Absent;
        }
        let Some(path) = self.index.get(&chunk.file_key).await else {
            debug!(file_key = %chunk.file_key, "Requested file is not indexed");
            return ResponseContent::Absent;
        };

        let data = match file_manager::read_chunk(&path, chunk.chunk_index, chunk.chunk_size).await {
            Ok(Some(data)) => data,
            Ok(None) => return ResponseContent::Absent,
            Err(e) => {
                warn!(path = %path.display(), "Failed to read chunk: {}", e);
                return ResponseContent::Absent;
            }
        };

        // a modified local copy no longer matches the requested version
        if ChunkCodec::digest(&data) != chunk.expected_digest {
            debug!(
                file_key = %chunk.file_key,
                chunk = chunk.chunk_index,
                "Local chunk differs from requested version"
            );
            return ResponseContent::Absent;
        }

        debug!(file_key = %chunk.file_key, chunk = chunk.chunk_index, bytes = data.len(), "Serving chunk");
        ResponseContent::Chunk(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileKey;
    use crate::network::messages::ChunkRequest;
    use crate::security::ContentDigest;
    use libp2p::identity::Keypair;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        server: ChunkServer,
        user: Keypair,
        file_key: FileKey,
    }

    async fn fixture(content: &[u8]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("served.bin");
        tokio::fs::write(&path, content).await.unwrap();

        let file_key = FileKey::from_public_key(&Keypair::generate_ed25519().public());
        let index = FileIndex::new();
        index.insert(file_key.clone(), path).await;

        Fixture {
            _dir: dir,
            server: ChunkServer::new(index),
            user: Keypair::generate_ed25519(),
            file_key,
        }
    }

    fn request(f: &Fixture, index: u32, expected: &[u8], to: &PublicKey) -> DirectRequest {
        DirectRequest::new(
            ChunkRequest {
                file_key: f.file_key.clone(),
                chunk_index: index,
                chunk_size: 4,
                expected_digest: ContentDigest::of(expected),
            },
            to,
        )
    }

    #[tokio::test]
    async fn test_serves_matching_chunk() {
        let f = fixture(b"0123456789").await;
        f.server.activate(f.user.public()).await;

        let response = f.server.serve(&request(&f, 1, b"4567", &f.user.public())).await;
        assert_eq!(response.content, ResponseContent::Chunk(b"4567".to_vec()));

        let last = f.server.serve(&request(&f, 2, b"89", &f.user.public())).await;
        assert_eq!(last.content, ResponseContent::Chunk(b"89".to_vec()));
    }

    #[tokio::test]
    async fn test_absent_cases() {
        let f = fixture(b"0123456789").await;
        f.server.activate(f.user.public()).await;
        let key = f.user.public();

        let stale = f.server.serve(&request(&f, 0, b"zzzz", &key)).await;
        assert_eq!(stale.content, ResponseContent::Absent);

        let beyond = f.server.serve(&request(&f, 3, b"", &key)).await;
        assert_eq!(beyond.content, ResponseContent::Absent);

        let mut oversized = request(&f, 0, b"0123456789", &key);
        oversized.request.chunk_size = MAX_CHUNK_SIZE + 1;
        assert_eq!(f.server.serve(&oversized).await.content, ResponseContent::Absent);

        let mut unknown = request(&f, 0, b"0123", &key);
        unknown.request.file_key = FileKey::from_public_key(&Keypair::generate_ed25519().public());
        assert_eq!(f.server.serve(&unknown).await.content, ResponseContent::Absent);
    }

    #[tokio::test]
    async fn test_refuses_before_login_and_other_users() {
        let f = fixture(b"0123").await;
        let req = request(&f, 0, b"0123", &f.user.public());
        assert!(matches!(
            f.server.serve(&req).await.content,
            ResponseContent::Refused { .. }
        ));

        f.server.activate(Keypair::generate_ed25519().public()).await;
        assert!(f.server.is_active().await);
        assert!(matches!(
            f.server.serve(&req).await.content,
            ResponseContent::Refused { .. }
        ));

        f.server.deactivate().await;
        assert!(!f.server.is_active().await);
    }
}
