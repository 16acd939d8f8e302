//! Overlay network collaborators: content store, direct peer messaging and
//! the chunk serving side.

pub mod channel;
pub mod memory;
pub mod messages;
pub mod server;
pub mod store;
pub mod swarm;

pub use channel::{PeerChannel, ResponseHandler, ResponseRouter};
pub use memory::{Fault, MemoryChannel, MemoryNetwork};
pub use messages::{
    ChunkRequest, CorrelationId, DirectRequest, DirectResponse, ResponseContent, PROTOCOL_NAME,
};
pub use server::ChunkServer;
pub use store::{ContentStore, MemoryContentStore, VersionedPayload};
pub use swarm::SwarmPeerChannel;
