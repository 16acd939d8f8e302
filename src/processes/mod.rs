//! Step implementations of the user-facing processes
//!
//! Every process runs against a context holding the node's shared
//! [`Services`] plus its own working state. Steps needing the user profile
//! work through [`SessionContext`].

pub mod common;
pub mod download;
pub mod login;
pub mod register;
pub mod upload;

use std::sync::Arc;

use crate::config::Config;
use crate::error::{AuthenticationError, Result};
use crate::file_manager::{FileIndex, FileManager};
use crate::model::{UserCredentials, UserProfile};
use crate::network::{ChunkServer, ContentStore, PeerChannel, ResponseRouter};

pub use common::{GetUserProfileStep, ProfileManager};
pub use download::{ChunkSource, DownloadContext, DownloadTask};
pub use login::LoginContext;
pub use register::RegisterContext;
pub use upload::UploadContext;

/// Collaborators shared by all processes of a node
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub store: Arc<dyn ContentStore>,
    pub channel: Arc<dyn PeerChannel>,
    pub router: ResponseRouter,
    pub server: Arc<ChunkServer>,
    pub files: FileManager,
    pub profiles: ProfileManager,
}

impl Services {
    pub fn index(&self) -> &FileIndex {
        self.server.index()
    }
}

/// Credentials of the acting user and, once loaded, their profile
#[derive(Debug, Clone)]
pub struct Session {
    pub credentials: UserCredentials,
    profile: Option<UserProfile>,
    profile_version: u64,
}

impl Session {
    pub fn new(credentials: UserCredentials) -> Self {
        Self {
            credentials,
            profile: None,
            profile_version: 0,
        }
    }

    pub fn profile(&self) -> Result<&UserProfile> {
        self.profile
            .as_ref()
            .ok_or_else(|| AuthenticationError::NotLoggedIn.into())
    }

    pub fn profile_mut(&mut self) -> Result<&mut UserProfile> {
        self.profile
            .as_mut()
            .ok_or_else(|| AuthenticationError::NotLoggedIn.into())
    }

    /// Store version the loaded profile was read at
    pub fn profile_version(&self) -> u64 {
        self.profile_version
    }

    pub fn set_profile(&mut self, profile: UserProfile, version: u64) {
        self.profile = Some(profile);
        self.profile_version = version;
    }
}

/// Process context that carries a [`Session`]
pub trait SessionContext: Send + 'static {
    fn services(&self) -> &Services;

    fn session(&self) -> &Session;

    fn session_mut(&mut self) -> &mut Session;
}
