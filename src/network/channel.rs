use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::network::messages::{CorrelationId, DirectRequest, DirectResponse};

/// Point-to-point message channel between peers.
///
/// `send_direct` only hands the request over; the peer's answer arrives
/// asynchronously through the [`ResponseRouter`] the channel was built with.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    fn local_peer(&self) -> PeerId;

    async fn send_direct(&self, peer: &PeerId, request: DirectRequest) -> Result<()>;
}

/// Receives the response to one registered correlation id
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(&self, from: PeerId, response: DirectResponse);
}

/// Routes incoming responses to the handler registered for their correlation id.
///
/// Responses without a registered handler are late or unsolicited and are
/// dropped.
#[derive(Clone, Default)]
pub struct ResponseRouter {
    handlers: Arc<RwLock<HashMap<CorrelationId, Arc<dyn ResponseHandler>>>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, correlation_id: CorrelationId, handler: Arc<dyn ResponseHandler>) {
        self.handlers.write().await.insert(correlation_id, handler);
    }

    /// Returns false if nothing was registered under `correlation_id`
    pub async fn deregister(&self, correlation_id: &CorrelationId) -> bool {
        self.handlers.write().await.remove(correlation_id).is_some()
    }

    /// Hand `response` to its handler; false if it was discarded
    pub async fn dispatch(&self, from: PeerId, response: DirectResponse) -> bool {
        let handler = self
            .handlers
            .read()
            .await
            .get(&response.correlation_id)
            .cloned();

        match handler {
            Some(handler) => {
                handler.handle(from, response).await;
                true
            }
            None => {
                debug!(
                    peer = %from,
                    file_key = %response.correlation_id.file_key,
                    chunk = response.correlation_id.chunk_index,
                    "Discarding response without registered handler"
                );
                false
            }
        }
    }

    /// Number of registered handlers
    pub async fn pending(&self) -> usize {
        self.handlers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileKey;
    use crate::network::messages::{ChunkRequest, ResponseContent};
    use crate::security::ContentDigest;
    use libp2p::identity::Keypair;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<ResponseContent>>,
    }

    #[async_trait]
    impl ResponseHandler for Collect {
        async fn handle(&self, _from: PeerId, response: DirectResponse) {
            self.seen.lock().unwrap().push(response.content);
        }
    }

    fn request() -> DirectRequest {
        let file = Keypair::generate_ed25519();
        let user = Keypair::generate_ed25519();
        DirectRequest::new(
            ChunkRequest {
                file_key: FileKey::from_public_key(&file.public()),
                chunk_index: 0,
                chunk_size: 8,
                expected_digest: ContentDigest::of(b"x"),
            },
            &user.public(),
        )
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_handler_only() {
        let router = ResponseRouter::new();
        let handler = Arc::new(Collect::default());
        let registered = request();
        let stranger = request();

        router
            .register(registered.correlation_id.clone(), handler.clone())
            .await;
        assert_eq!(router.pending().await, 1);

        let peer = PeerId::random();
        assert!(
            router
                .dispatch(peer, DirectResponse::reply(&registered, ResponseContent::Absent))
                .await
        );
        assert!(
            !router
                .dispatch(peer, DirectResponse::reply(&stranger, ResponseContent::Absent))
                .await
        );

        assert!(router.deregister(&registered.correlation_id).await);
        assert!(!router.deregister(&registered.correlation_id).await);
        assert!(
            !router
                .dispatch(peer, DirectResponse::reply(&registered, ResponseContent::Absent))
                .await
        );
        assert_eq!(*handler.seen.lock().unwrap(), vec![ResponseContent::Absent]);
    }
}
