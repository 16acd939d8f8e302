use std::collections::BTreeMap;
use std::fmt;

use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::model::meta_file::FileKey;
use crate::security::{self, SymmetricKey};

/// Credentials identifying and unlocking a user profile
#[derive(Clone)]
pub struct UserCredentials {
    pub user_id: String,
    password: String,
    pin: String,
}

impl UserCredentials {
    pub fn new(user_id: impl Into<String>, password: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
            pin: pin.into(),
        }
    }

    /// Storage location of the profile; differs for every credential triple
    pub fn profile_location_key(&self) -> String {
        security::location_key(&[
            self.user_id.as_bytes(),
            self.password.as_bytes(),
            self.pin.as_bytes(),
        ])
    }

    /// Key encrypting the profile and the locations document
    pub fn profile_key(&self) -> SymmetricKey {
        SymmetricKey::derive(&[
            b"user-profile",
            self.password.as_bytes(),
            self.pin.as_bytes(),
            self.user_id.as_bytes(),
        ])
    }
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Entry of the user's file tree naming one synchronized file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTreeNode {
    pub name: String,
    pub file_key: FileKey,
    /// Protobuf-encoded file key pair
    key_pair: Vec<u8>,
    /// Encrypts the meta file and the stored chunks
    pub secret: SymmetricKey,
}

impl FileTreeNode {
    /// New entry with a fresh file identity
    pub fn generate(name: impl Into<String>) -> Result<Self> {
        let key_pair = Keypair::generate_ed25519();
        Ok(Self {
            name: name.into(),
            file_key: FileKey::from_public_key(&key_pair.public()),
            key_pair: encode_key_pair(&key_pair)?,
            secret: SymmetricKey::generate(),
        })
    }

    pub fn key_pair(&self) -> Result<Keypair> {
        Keypair::from_protobuf_encoding(&self.key_pair).map_err(SyncError::crypto)
    }
}

/// A user's profile: identity and file tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    key_pair: Vec<u8>,
    files: BTreeMap<String, FileTreeNode>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            user_id: user_id.into(),
            key_pair: encode_key_pair(&Keypair::generate_ed25519())?,
            files: BTreeMap::new(),
        })
    }

    pub fn key_pair(&self) -> Result<Keypair> {
        Keypair::from_protobuf_encoding(&self.key_pair).map_err(SyncError::crypto)
    }

    /// Public key other devices address direct requests to
    pub fn public_key(&self) -> Result<PublicKey> {
        Ok(self.key_pair()?.public())
    }

    pub fn file(&self, name: &str) -> Option<&FileTreeNode> {
        self.files.get(name)
    }

    pub fn file_by_key(&self, file_key: &FileKey) -> Option<&FileTreeNode> {
        self.files.values().find(|node| &node.file_key == file_key)
    }

    /// Add an entry; returns false if the name is taken
    pub fn add_file(&mut self, node: FileTreeNode) -> bool {
        if self.files.contains_key(&node.name) {
            return false;
        }
        self.files.insert(node.name.clone(), node);
        true
    }

    pub fn remove_file(&mut self, name: &str) -> Option<FileTreeNode> {
        self.files.remove(name)
    }

    pub fn files(&self) -> impl Iterator<Item = &FileTreeNode> {
        self.files.values()
    }
}

/// Peers on which a user is currently logged in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locations {
    pub user_id: String,
    peers: Vec<PeerId>,
}

impl Locations {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            peers: Vec::new(),
        }
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    /// Returns false if the peer was already listed
    pub fn add_peer(&mut self, peer: PeerId) -> bool {
        if self.peers.contains(&peer) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != peer);
        before != self.peers.len()
    }

    /// Download candidates, in listing order, without the local peer
    pub fn candidates_excluding(&self, local: &PeerId) -> Vec<PeerId> {
        self.peers.iter().filter(|p| *p != local).copied().collect()
    }
}

fn encode_key_pair(key_pair: &Keypair) -> Result<Vec<u8>> {
    key_pair.to_protobuf_encoding().map_err(SyncError::crypto)
}
