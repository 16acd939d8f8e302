//! libp2p transport: tcp + noise + yamux with a request-response behaviour
//! carrying bincode-encoded direct messages.
//!
//! A single event loop task owns the swarm. The channel handle talks to it
//! over a command queue; inbound requests are served on separate tasks and
//! their answers fed back into the loop.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, StreamExt};
use libp2p::identity::Keypair;
use libp2p::request_response::{self, OutboundRequestId, ProtocolSupport, ResponseChannel};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{NetworkConfig, MAX_CHUNK_SIZE};
use crate::error::{self, TransportError};
use crate::network::channel::{PeerChannel, ResponseRouter};
use crate::network::messages::{
    CorrelationId, DirectRequest, DirectResponse, ResponseContent, PROTOCOL_NAME,
};
use crate::network::server::ChunkServer;

/// Upper bound for one encoded message: a full chunk plus envelope
const MAX_MESSAGE_SIZE: u64 = MAX_CHUNK_SIZE as u64 + 64 * 1024;

/// Bincode codec for the direct chunk exchange protocol
#[derive(Debug, Clone, Default)]
pub struct DirectMessageCodec;

async fn read_message<T, M>(io: &mut T) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    let mut buf = Vec::new();
    io.take(MAX_MESSAGE_SIZE).read_to_end(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_message<T, M>(io: &mut T, message: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: Serialize,
{
    let data =
        bincode::serialize(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    io.write_all(&data).await?;
    io.close().await
}

#[async_trait]
impl request_response::Codec for DirectMessageCodec {
    type Protocol = StreamProtocol;
    type Request = DirectRequest;
    type Response = DirectResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_message(io).await
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_message(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_message(io, &req).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_message(io, &res).await
    }
}

#[derive(NetworkBehaviour)]
struct SyncBehaviour {
    direct: request_response::Behaviour<DirectMessageCodec>,
}

enum Command {
    Send {
        peer: PeerId,
        request: DirectRequest,
    },
    AddAddress {
        peer: PeerId,
        addr: Multiaddr,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// [`PeerChannel`] over a libp2p swarm
#[derive(Clone)]
pub struct SwarmPeerChannel {
    local: PeerId,
    commands: mpsc::Sender<Command>,
}

impl SwarmPeerChannel {
    /// Build the swarm, start listening and spawn its event loop.
    ///
    /// Inbound requests are answered by `server`; responses to our own
    /// requests are delivered to `router`.
    pub fn start(
        keypair: Keypair,
        config: &NetworkConfig,
        server: Arc<ChunkServer>,
        router: ResponseRouter,
    ) -> error::Result<Self> {
        let local = keypair.public().to_peer_id();
        let behaviour = SyncBehaviour {
            direct: request_response::Behaviour::with_codec(
                DirectMessageCodec,
                [(StreamProtocol::new(PROTOCOL_NAME), ProtocolSupport::Full)],
                request_response::Config::default()
                    .with_request_timeout(Duration::from_secs(config.request_timeout_secs)),
            ),
        };

        let idle_timeout = Duration::from_secs(config.idle_connection_timeout_secs);
        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(setup_error)?
            .with_behaviour(|_| behaviour)
            .map_err(setup_error)?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
            .build();

        let listen_addr: Multiaddr = config.listen_addr.parse().map_err(setup_error)?;
        swarm.listen_on(listen_addr).map_err(setup_error)?;
        info!(peer = %local, "Swarm started");

        let (commands, command_rx) = mpsc::channel(256);
        let (served_tx, served_rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            swarm,
            commands: command_rx,
            served_tx,
            served_rx,
            server,
            router,
            pending: HashMap::new(),
            listen_addrs: Vec::new(),
        };
        tokio::spawn(event_loop.run());

        Ok(Self { local, commands })
    }

    /// Make `addr` known as a dial address of `peer`
    pub async fn add_peer_address(&self, peer: PeerId, addr: Multiaddr) -> error::Result<()> {
        self.command(Command::AddAddress { peer, addr }).await
    }

    /// Addresses the swarm currently listens on
    pub async fn listen_addrs(&self) -> error::Result<Vec<Multiaddr>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::ListenAddrs { reply }).await?;
        rx.await.map_err(|_| TransportError::ChannelClosed.into())
    }

    async fn command(&self, command: Command) -> error::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::ChannelClosed.into())
    }
}

#[async_trait]
impl PeerChannel for SwarmPeerChannel {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn send_direct(&self, peer: &PeerId, request: DirectRequest) -> error::Result<()> {
        self.command(Command::Send {
            peer: *peer,
            request,
        })
        .await
    }
}

fn setup_error(err: impl std::fmt::Display) -> error::SyncError {
    TransportError::Setup {
        reason: err.to_string(),
    }
    .into()
}

struct EventLoop {
    swarm: Swarm<SyncBehaviour>,
    commands: mpsc::Receiver<Command>,
    served_tx: mpsc::UnboundedSender<(ResponseChannel<DirectResponse>, DirectResponse)>,
    served_rx: mpsc::UnboundedReceiver<(ResponseChannel<DirectResponse>, DirectResponse)>,
    server: Arc<ChunkServer>,
    router: ResponseRouter,
    pending: HashMap<OutboundRequestId, CorrelationId>,
    listen_addrs: Vec<Multiaddr>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All channel handles dropped; stopping swarm");
                        break;
                    }
                },
                Some((channel, response)) = self.served_rx.recv() => {
                    if self.swarm.behaviour_mut().direct.send_response(channel, response).is_err() {
                        warn!("Requester went away before the response was sent");
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { peer, request } => {
                let correlation_id = request.correlation_id.clone();
                let request_id = self.swarm.behaviour_mut().direct.send_request(&peer, request);
                self.pending.insert(request_id, correlation_id);
            }
            Command::AddAddress { peer, addr } => {
                debug!(peer = %peer, addr = %addr, "Adding peer address");
                #[allow(deprecated)]
                self.swarm.behaviour_mut().direct.add_address(&peer, addr);
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.listen_addrs.clone());
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<SyncBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "Listening");
                self.listen_addrs.push(address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!(peer = %peer_id, "Connection established");
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!(peer = %peer_id, ?cause, "Connection closed");
            }
            SwarmEvent::Behaviour(SyncBehaviourEvent::Direct(event)) => self.handle_direct(event),
            _ => {}
        }
    }

    fn handle_direct(&mut self, event: request_response::Event<DirectRequest, DirectResponse>) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    debug!(peer = %peer, chunk = request.correlation_id.chunk_index, "Inbound chunk request");
                    let server = Arc::clone(&self.server);
                    let served = self.served_tx.clone();
                    tokio::spawn(async move {
                        let response = server.serve(&request).await;
                        let _ = served.send((channel, response));
                    });
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    self.pending.remove(&request_id);
                    let router = self.router.clone();
                    tokio::spawn(async move {
                        router.dispatch(peer, response).await;
                    });
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
            } => {
                warn!(peer = %peer, "Outbound request failed: {}", error);
                if let Some(correlation_id) = self.pending.remove(&request_id) {
                    let response = DirectResponse {
                        correlation_id,
                        content: ResponseContent::Refused {
                            reason: error.to_string(),
                        },
                    };
                    let router = self.router.clone();
                    tokio::spawn(async move {
                        router.dispatch(peer, response).await;
                    });
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                error!(peer = %peer, "Inbound request failed: {}", error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::FileIndex;
    use crate::model::FileKey;
    use crate::network::channel::ResponseHandler;
    use crate::network::messages::ChunkRequest;
    use crate::security::ContentDigest;

    struct Forward(mpsc::UnboundedSender<ResponseContent>);

    #[async_trait]
    impl ResponseHandler for Forward {
        async fn handle(&self, _from: PeerId, response: DirectResponse) {
            let _ = self.0.send(response.content);
        }
    }

    fn local_config() -> NetworkConfig {
        NetworkConfig {
            listen_addr: "/ip4/127.0.0.1/tcp/0".to_string(),
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_request_over_tcp() {
        let user = Keypair::generate_ed25519();
        let seeder_server = Arc::new(ChunkServer::new(FileIndex::new()));
        seeder_server.activate(user.public()).await;

        let seeder_key = Keypair::generate_ed25519();
        let seeder = SwarmPeerChannel::start(
            seeder_key,
            &local_config(),
            seeder_server,
            ResponseRouter::new(),
        )
        .unwrap();

        let router = ResponseRouter::new();
        let client = SwarmPeerChannel::start(
            Keypair::generate_ed25519(),
            &local_config(),
            Arc::new(ChunkServer::new(FileIndex::new())),
            router.clone(),
        )
        .unwrap();

        let mut addrs = Vec::new();
        for _ in 0..50 {
            addrs = seeder.listen_addrs().await.unwrap();
            if !addrs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        client
            .add_peer_address(seeder.local_peer(), addrs[0].clone())
            .await
            .unwrap();

        let request = DirectRequest::new(
            ChunkRequest {
                file_key: FileKey::from_public_key(&Keypair::generate_ed25519().public()),
                chunk_index: 0,
                chunk_size: 16,
                expected_digest: ContentDigest::of(b""),
            },
            &user.public(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        router
            .register(request.correlation_id.clone(), Arc::new(Forward(tx)))
            .await;

        client.send_direct(&seeder.local_peer(), request).await.unwrap();

        let content = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        // the seeder does not index the file
        assert_eq!(content, ResponseContent::Absent);
    }
}
