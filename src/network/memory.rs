//! In-process transport connecting nodes of one test or demo run.
//!
//! Requests are served on spawned tasks so responses arrive asynchronously,
//! like they would over a real connection. Faults can be injected per peer
//! (and optionally per chunk) to exercise failover.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::network::channel::{PeerChannel, ResponseRouter};
use crate::network::messages::{DirectRequest, DirectResponse, ResponseContent};
use crate::network::server::ChunkServer;

/// Misbehaviour of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Sending to the peer fails immediately
    Offline,
    /// The request is accepted but never answered
    Silent,
    /// The peer answers that it has no such chunk
    Absent,
    /// The peer answers with altered chunk bytes
    Corrupt,
    /// The peer answers correctly after a delay
    Delay(Duration),
}

#[derive(Debug, Clone)]
struct FaultRule {
    fault: Fault,
    chunk: Option<u32>,
    remaining: Option<usize>,
}

impl FaultRule {
    fn matches(&self, chunk_index: u32) -> bool {
        self.chunk.map_or(true, |c| c == chunk_index)
    }
}

#[derive(Clone)]
struct Endpoint {
    server: Arc<ChunkServer>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerId, Endpoint>,
    faults: HashMap<PeerId, Vec<FaultRule>>,
    requests: HashMap<PeerId, usize>,
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node; its responses are delivered to `router`
    pub async fn join(
        &self,
        peer: PeerId,
        server: Arc<ChunkServer>,
        router: ResponseRouter,
    ) -> MemoryChannel {
        self.state
            .lock()
            .await
            .endpoints
            .insert(peer, Endpoint { server });
        debug!(peer = %peer, "Peer joined memory network");
        MemoryChannel {
            local: peer,
            network: self.clone(),
            router,
        }
    }

    /// Detach a node; requests to it fail as unreachable
    pub async fn leave(&self, peer: &PeerId) {
        self.state.lock().await.endpoints.remove(peer);
    }

    /// Make `peer` misbehave for every chunk, or only for `chunk`.
    ///
    /// With `times` set the fault fires that many times and is then
    /// forgotten; otherwise it stays until cleared.
    pub async fn inject(&self, peer: PeerId, fault: Fault, chunk: Option<u32>, times: Option<usize>) {
        self.state
            .lock()
            .await
            .faults
            .entry(peer)
            .or_default()
            .push(FaultRule {
                fault,
                chunk,
                remaining: times,
            });
    }

    pub async fn clear_faults(&self, peer: &PeerId) {
        self.state.lock().await.faults.remove(peer);
    }

    /// Requests sent to `peer` so far
    pub async fn request_count(&self, peer: &PeerId) -> usize {
        self.state
            .lock()
            .await
            .requests
            .get(peer)
            .copied()
            .unwrap_or(0)
    }

    pub async fn total_requests(&self) -> usize {
        self.state.lock().await.requests.values().sum()
    }

    /// Record a request and pick the fault it triggers
    async fn admit(&self, peer: &PeerId, chunk_index: u32) -> (Option<Endpoint>, Option<Fault>) {
        let mut state = self.state.lock().await;
        *state.requests.entry(*peer).or_insert(0) += 1;

        let mut fault = None;
        if let Some(rules) = state.faults.get_mut(peer) {
            if let Some(position) = rules.iter().position(|r| r.matches(chunk_index)) {
                let rule = &mut rules[position];
                fault = Some(rule.fault);
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        rules.remove(position);
                    }
                }
            }
        }

        (state.endpoints.get(peer).cloned(), fault)
    }
}

/// A node's handle on the [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryChannel {
    local: PeerId,
    network: MemoryNetwork,
    router: ResponseRouter,
}

impl MemoryChannel {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn send_direct(&self, peer: &PeerId, request: DirectRequest) -> Result<()> {
        let (endpoint, fault) = self
            .network
            .admit(peer, request.correlation_id.chunk_index)
            .await;

        if fault == Some(Fault::Offline) {
            return Err(TransportError::SendFailed {
                peer: *peer,
                reason: "peer offline".to_string(),
            }
            .into());
        }
        let Some(endpoint) = endpoint else {
            return Err(TransportError::PeerUnreachable { peer: *peer }.into());
        };
        if fault == Some(Fault::Silent) {
            debug!(peer = %peer, chunk = request.correlation_id.chunk_index, "Request swallowed");
            return Ok(());
        }

        let from = *peer;
        let router = self.router.clone();
        tokio::spawn(async move {
            let response = match fault {
                Some(Fault::Absent) => DirectResponse::reply(&request, ResponseContent::Absent),
                Some(Fault::Corrupt) => corrupt(endpoint.server.serve(&request).await),
                Some(Fault::Delay(delay)) => {
                    tokio::time::sleep(delay).await;
                    endpoint.server.serve(&request).await
                }
                _ => endpoint.server.serve(&request).await,
            };
            router.dispatch(from, response).await;
        });
        Ok(())
    }
}

fn corrupt(mut response: DirectResponse) -> DirectResponse {
    if let ResponseContent::Chunk(data) = &mut response.content {
        match data.first_mut() {
            Some(byte) => *byte ^= 0xff,
            None => data.push(0),
        }
    }
    response
}
