use libp2p::identity::PublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::FileKey;
use crate::security::ContentDigest;

/// Protocol name of the direct chunk exchange
pub const PROTOCOL_NAME: &str = "/p2p-sync/chunk/1.0.0";

/// Identity under which a response handler is registered.
///
/// Every request attempt gets a fresh `attempt` id, so a late response for
/// an abandoned attempt never reaches the handler of a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId {
    pub file_key: FileKey,
    pub chunk_index: u32,
    pub attempt: Uuid,
}

/// Logical fields of a chunk request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub file_key: FileKey,
    pub chunk_index: u32,
    /// Chunk size the requester's version was split with
    pub chunk_size: u32,
    pub expected_digest: ContentDigest,
}

/// Envelope sent to a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectRequest {
    pub correlation_id: CorrelationId,
    /// Protobuf-encoded public key of the user the request is addressed to
    pub recipient_key: Vec<u8>,
    pub request: ChunkRequest,
}

impl DirectRequest {
    /// Wrap `request` for a new attempt addressed to `recipient`
    pub fn new(request: ChunkRequest, recipient: &PublicKey) -> Self {
        Self {
            correlation_id: CorrelationId {
                file_key: request.file_key.clone(),
                chunk_index: request.chunk_index,
                attempt: Uuid::new_v4(),
            },
            recipient_key: recipient.encode_protobuf(),
            request,
        }
    }

    pub fn is_addressed_to(&self, key: &PublicKey) -> bool {
        self.recipient_key == key.encode_protobuf()
    }
}

/// Kinds of content a peer can answer with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseContent {
    /// Best-effort chunk payload; the requester still verifies it
    Chunk(Vec<u8>),
    /// The peer does not have the chunk
    Absent,
    /// The request was rejected or could not be delivered
    Refused { reason: String },
}

/// Envelope returned by a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectResponse {
    pub correlation_id: CorrelationId,
    pub content: ResponseContent,
}

impl DirectResponse {
    pub fn reply(request: &DirectRequest, content: ResponseContent) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    #[test]
    fn test_attempts_get_distinct_correlation() {
        let file = Keypair::generate_ed25519();
        let user = Keypair::generate_ed25519();
        let request = ChunkRequest {
            file_key: FileKey::from_public_key(&file.public()),
            chunk_index: 2,
            chunk_size: 1024,
            expected_digest: ContentDigest::of(b"chunk"),
        };

        let first = DirectRequest::new(request.clone(), &user.public());
        let second = DirectRequest::new(request, &user.public());

        assert_eq!(first.correlation_id.chunk_index, 2);
        assert_ne!(first.correlation_id, second.correlation_id);
        assert!(first.is_addressed_to(&user.public()));
        assert!(!first.is_addressed_to(&file.public()));

        let response = DirectResponse::reply(&first, ResponseContent::Absent);
        assert_eq!(response.correlation_id, first.correlation_id);
    }

    #[test]
    fn test_bincode_envelope() {
        let user = Keypair::generate_ed25519();
        let file = Keypair::generate_ed25519();
        let request = DirectRequest::new(
            ChunkRequest {
                file_key: FileKey::from_public_key(&file.public()),
                chunk_index: 0,
                chunk_size: 16,
                expected_digest: ContentDigest::of(b""),
            },
            &user.public(),
        );

        let bytes = bincode::serialize(&request).unwrap();
        let decoded: DirectRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.correlation_id, request.correlation_id);
        assert_eq!(decoded.request, request.request);
    }
}
