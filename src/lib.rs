//! P2P File Sync Library
//!
//! Synchronization core for a user's devices: files are split into
//! content-addressed chunks, stored encrypted in a shared content store and
//! described by versioned meta files. Downloads fetch chunks directly from
//! the user's other online devices, verifying every chunk and failing over
//! between candidate peers.
//!
//! Every user-facing operation is a [`process::Process`]: an ordered list of
//! steps that is rolled back in reverse when a step fails.

pub mod config;
pub mod error;
pub mod file_manager;
pub mod model;
pub mod network;
pub mod node;
pub mod process;
pub mod processes;
pub mod security;

pub use config::Config;
pub use error::{ErrorKind, Result, SyncError};
pub use node::SyncNode;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        config::Config,
        error::{ErrorKind, Result, SyncError},
        model::{ChunkCodec, FileKey, MetaFile, MetaFileVersion, UserCredentials},
        network::{ContentStore, MemoryContentStore, MemoryNetwork, PeerChannel},
        node::SyncNode,
        process::{LoggingListener, Process, ProcessListener, ProcessState},
    };

    pub use libp2p::{Multiaddr, PeerId};
    pub use tracing::{debug, error, info, warn};
}
