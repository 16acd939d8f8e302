//! Error taxonomy for the synchronization core
//!
//! Errors are grouped the way failures are handled:
//! - transport and integrity errors stay local to one candidate peer and are
//!   recovered by failover
//! - resource errors abort the running download task
//! - authentication errors fail fast before any chunk work begins
//! - exhaustion errors end a download once no candidate is left for a chunk

use std::path::PathBuf;
use std::time::Duration;

use libp2p::PeerId;
use thiserror::Error;

/// Result type alias for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type of the crate
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Send failures, timeouts and missing responses
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Content that does not match its expected digest or size
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// Local resource failures (disk, limits)
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Credential and profile lookup failures
    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthenticationError),

    /// Content store failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Process state machine contract violations
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Every candidate peer for a chunk has failed
    #[error("No candidate peer left for chunk {chunk_index} of file {file_key}")]
    NoCandidates { file_key: String, chunk_index: u32 },

    /// Reassembly found a gap in the chunk indices
    #[error("Incomplete file: {expected} chunks expected, missing indices {missing:?}")]
    IncompleteFile { expected: u32, missing: Vec<u32> },

    /// The user's file tree has no entry with that name
    #[error("File '{name}' is not part of the user profile")]
    FileNotFound { name: String },

    /// Another upload linked a different file under the same name
    #[error("File '{name}' was created concurrently by another upload")]
    FileConflict { name: String },

    /// The meta file has no version with that id
    #[error("Version {version_id} of file {file_key} does not exist")]
    VersionNotFound { file_key: String, version_id: u64 },

    /// A meta file or version violates its structural invariants
    #[error("Invalid meta file: {reason}")]
    InvalidMetaFile { reason: String },

    /// Encryption, decryption or key decoding failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// (De)serialization of a stored document failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transport-level errors, local to one candidate peer
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The message could not be handed to the peer
    #[error("Failed to send message to peer {peer}: {reason}")]
    SendFailed { peer: PeerId, reason: String },

    /// No response arrived within the bounded wait
    #[error("Peer {peer} did not respond within {duration:?}")]
    Timeout { peer: PeerId, duration: Duration },

    /// The peer is not known to the channel
    #[error("Peer {peer} is unreachable")]
    PeerUnreachable { peer: PeerId },

    /// The channel has been shut down
    #[error("Peer channel closed")]
    ChannelClosed,

    /// Transport or swarm construction failed
    #[error("Transport setup failed: {reason}")]
    Setup { reason: String },
}

/// Integrity errors, treated like transport errors during failover
#[derive(Error, Debug, Clone)]
pub enum IntegrityError {
    /// Payload digest differs from the one recorded in the meta file
    #[error("Digest mismatch for chunk {chunk_index}: expected {expected}, got {actual}")]
    DigestMismatch {
        chunk_index: u32,
        expected: String,
        actual: String,
    },

    /// Reassembled file has the wrong length
    #[error("Size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Local resource errors, fatal to the current download task
#[derive(Error, Debug, Clone)]
pub enum ResourceError {
    /// Writing to disk failed
    #[error("Failed to write '{path}': {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    /// Reading from disk failed
    #[error("Failed to read '{path}': {reason}")]
    ReadFailed { path: PathBuf, reason: String },

    /// Removing temporary data failed
    #[error("Cleanup of '{path}' failed: {reason}")]
    CleanupFailed { path: PathBuf, reason: String },

    /// File exceeds the configured maximum
    #[error("File too large: {size} bytes exceeds maximum {max_size} bytes")]
    FileTooLarge { size: u64, max_size: u64 },
}

/// Authentication and profile lookup errors
#[derive(Error, Debug, Clone)]
pub enum AuthenticationError {
    /// No profile is stored for these credentials
    #[error("No user profile found for user '{user_id}'")]
    ProfileNotFound { user_id: String },

    /// A profile exists but cannot be opened with these credentials
    #[error("Wrong credentials for user '{user_id}'")]
    WrongCredentials { user_id: String },

    /// Registration of an already existing user
    #[error("User '{user_id}' is already registered")]
    UserExists { user_id: String },

    /// The node has no logged-in user
    #[error("No user is logged in on this node")]
    NotLoggedIn,
}

/// Content store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Put was rejected
    #[error("Put of {location}/{content} failed: {reason}")]
    PutFailed {
        location: String,
        content: String,
        reason: String,
    },

    /// Get failed for a reason other than absence
    #[error("Get of {location}/{content} failed: {reason}")]
    GetFailed {
        location: String,
        content: String,
        reason: String,
    },

    /// Remove was rejected
    #[error("Remove of {location}/{content} (version {version}) failed: {reason}")]
    RemoveFailed {
        location: String,
        content: String,
        version: u64,
        reason: String,
    },
}

/// Process engine contract violations
#[derive(Error, Debug, Clone)]
pub enum ProcessError {
    /// An operation was invoked in a state that does not permit it
    #[error("Invalid process state for '{operation}': expected {expected}, current {current}")]
    InvalidState {
        operation: String,
        expected: String,
        current: String,
    },

    /// The spawned process task did not finish
    #[error("Process '{name}' did not complete: {reason}")]
    Interrupted { name: String, reason: String },
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigurationError {
    /// Missing configuration file
    #[error("Configuration file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Configuration validation failed
    #[error("Configuration validation failed for '{key}': {reason}")]
    ValidationFailed { key: String, reason: String },
}

/// Machine-readable error kind reported in terminal notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Integrity,
    Resource,
    Authentication,
    Exhaustion,
    Incomplete,
    NotFound,
    Conflict,
    Store,
    InvalidState,
    Configuration,
    Crypto,
    Serialization,
}

impl SyncError {
    /// Classify the error for callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transport(_) => ErrorKind::Transport,
            SyncError::Integrity(_) => ErrorKind::Integrity,
            SyncError::Resource(_) => ErrorKind::Resource,
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::Store(_) => ErrorKind::Store,
            SyncError::Process(_) => ErrorKind::InvalidState,
            SyncError::Configuration(_) => ErrorKind::Configuration,
            SyncError::NoCandidates { .. } => ErrorKind::Exhaustion,
            SyncError::IncompleteFile { .. } => ErrorKind::Incomplete,
            SyncError::FileNotFound { .. } | SyncError::VersionNotFound { .. } => {
                ErrorKind::NotFound
            }
            SyncError::FileConflict { .. } => ErrorKind::Conflict,
            SyncError::InvalidMetaFile { .. } => ErrorKind::Integrity,
            SyncError::Crypto(_) => ErrorKind::Crypto,
            SyncError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Whether the error is local to one candidate peer and handled by failover
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Integrity(_))
    }

    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        SyncError::Serialization(err.to_string())
    }

    pub(crate) fn crypto(err: impl std::fmt::Display) -> Self {
        SyncError::Crypto(err.to_string())
    }

    pub(crate) fn invalid_state(
        operation: &str,
        expected: impl std::fmt::Display,
        current: impl std::fmt::Display,
    ) -> Self {
        SyncError::Process(ProcessError::InvalidState {
            operation: operation.to_string(),
            expected: expected.to_string(),
            current: current.to_string(),
        })
    }
}

impl ResourceError {
    pub(crate) fn write(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        ResourceError::WriteFailed {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn read(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        ResourceError::ReadFailed {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}
