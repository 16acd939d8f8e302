//! Node facade: wires the shared services of one device and hands out the
//! user-facing processes, unstarted, with the node's listeners attached.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libp2p::identity::Keypair;
use libp2p::PeerId;
use tracing::info;

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::file_manager::{FileIndex, FileManager};
use crate::model::UserCredentials;
use crate::network::{
    ChunkServer, ContentStore, MemoryNetwork, PeerChannel, ResponseRouter, SwarmPeerChannel,
};
use crate::process::{Process, ProcessListener};
use crate::processes::{
    download, login, register, upload, DownloadContext, LoginContext, ProfileManager,
    RegisterContext, Services, UploadContext,
};

/// One device taking part in synchronization
pub struct SyncNode {
    services: Services,
    listeners: Vec<Arc<dyn ProcessListener>>,
}

impl SyncNode {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            listeners: Vec::new(),
        }
    }

    /// Node attached to an in-process network under a random peer id
    pub async fn in_memory(
        network: &MemoryNetwork,
        store: Arc<dyn ContentStore>,
        config: Config,
        root: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let router = ResponseRouter::new();
        let server = Arc::new(ChunkServer::new(FileIndex::new()));
        let channel = network
            .join(PeerId::random(), Arc::clone(&server), router.clone())
            .await;

        Ok(Self::assemble(config, store, Arc::new(channel), router, server, root.into()))
    }

    /// Node speaking the direct protocol over a libp2p swarm.
    ///
    /// The swarm handle is returned alongside so callers can add peer
    /// addresses and query listen addresses.
    pub fn with_swarm(
        keypair: Keypair,
        store: Arc<dyn ContentStore>,
        config: Config,
        root: impl Into<PathBuf>,
    ) -> Result<(Self, SwarmPeerChannel)> {
        config.validate()?;
        let router = ResponseRouter::new();
        let server = Arc::new(ChunkServer::new(FileIndex::new()));
        let swarm = SwarmPeerChannel::start(
            keypair,
            &config.network,
            Arc::clone(&server),
            router.clone(),
        )?;

        let node = Self::assemble(
            config,
            store,
            Arc::new(swarm.clone()),
            router,
            server,
            root.into(),
        );
        Ok((node, swarm))
    }

    fn assemble(
        config: Config,
        store: Arc<dyn ContentStore>,
        channel: Arc<dyn PeerChannel>,
        router: ResponseRouter,
        server: Arc<ChunkServer>,
        root: PathBuf,
    ) -> Self {
        let files = FileManager::new(root, config.file.temp_dir_name.clone());
        info!(
            peer = %channel.local_peer(),
            root = %files.root().display(),
            "Node ready"
        );
        Self::new(Services {
            config: Arc::new(config),
            store,
            channel,
            router,
            server,
            files,
            profiles: ProfileManager::new(),
        })
    }

    /// Observe terminal outcomes of every process handed out afterwards
    pub fn add_listener(&mut self, listener: Arc<dyn ProcessListener>) {
        self.listeners.push(listener);
    }

    pub fn local_peer(&self) -> PeerId {
        self.services.channel.local_peer()
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn index(&self) -> &FileIndex {
        self.services.index()
    }

    pub fn server(&self) -> &Arc<ChunkServer> {
        &self.services.server
    }

    pub fn root(&self) -> &Path {
        self.services.files.root()
    }

    pub fn register(&self, credentials: UserCredentials) -> Process<RegisterContext> {
        self.attach(register::build(self.services.clone(), credentials))
    }

    pub fn login(&self, credentials: UserCredentials) -> Process<LoginContext> {
        self.attach(login::build(self.services.clone(), credentials))
    }

    /// Upload `source`, named after its file name
    pub fn upload(
        &self,
        credentials: UserCredentials,
        source: impl Into<PathBuf>,
    ) -> Result<Process<UploadContext>> {
        let source = self.services.files.resolve(source.into());
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SyncError::FileNotFound {
                name: source.display().to_string(),
            })?;
        Ok(self.upload_as(credentials, source, file_name))
    }

    /// Upload `source` under an explicit name
    pub fn upload_as(
        &self,
        credentials: UserCredentials,
        source: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> Process<UploadContext> {
        let source = self.services.files.resolve(source.into());
        self.attach(upload::build(
            self.services.clone(),
            credentials,
            source,
            file_name.into(),
        ))
    }

    /// Download `file_name` (latest version unless `version_id` is given)
    pub fn download(
        &self,
        credentials: UserCredentials,
        file_name: impl Into<String>,
        version_id: Option<u64>,
        destination: impl Into<PathBuf>,
    ) -> Process<DownloadContext> {
        self.attach(download::build(
            self.services.clone(),
            credentials,
            file_name.into(),
            version_id,
            destination.into(),
        ))
    }

    fn attach<C: Send + 'static>(&self, process: Process<C>) -> Process<C> {
        self.listeners
            .iter()
            .fold(process, |process, listener| process.with_listener(Arc::clone(listener)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryContentStore;
    use crate::process::{LoggingListener, ProcessState};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_processes_come_unstarted() {
        let dir = TempDir::new().unwrap();
        let mut node = SyncNode::in_memory(
            &MemoryNetwork::new(),
            Arc::new(MemoryContentStore::new()),
            Config::default(),
            dir.path(),
        )
        .await
        .unwrap();
        node.add_listener(Arc::new(LoggingListener));

        let creds = UserCredentials::new("alice", "secret", "1234");
        let process = node.register(creds.clone());
        assert_eq!(process.state(), ProcessState::Created);
        assert_eq!(
            process.step_names(),
            vec!["check-user-absent", "put-user-profile", "put-locations"]
        );

        let upload = node.upload(creds, "notes.txt").unwrap();
        assert_eq!(upload.context().file_name, "notes.txt");
        assert_eq!(upload.context().source, dir.path().join("notes.txt"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.file.chunk_size = 0;
        let result = SyncNode::in_memory(
            &MemoryNetwork::new(),
            Arc::new(MemoryContentStore::new()),
            config,
            dir.path(),
        )
        .await;
        assert!(result.is_err());
    }
}
