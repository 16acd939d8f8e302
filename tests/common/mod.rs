//! Shared fixtures: an in-process cluster of devices of one user

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use p2p_file_sync::error::{ErrorKind, SyncError};
use p2p_file_sync::model::{MetaFile, UserCredentials};
use p2p_file_sync::network::store::{get_document, META_FILE};
use p2p_file_sync::network::{ContentStore, MemoryContentStore, MemoryNetwork};
use p2p_file_sync::process::ProcessListener;
use p2p_file_sync::processes::UploadContext;
use p2p_file_sync::{Config, SyncNode};
use tempfile::TempDir;

/// Terminal outcome seen by [`RecordingListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded(String),
    Failed(String, ErrorKind),
}

/// Listener keeping every terminal notification
#[derive(Default)]
pub struct RecordingListener {
    outcomes: Mutex<Vec<Outcome>>,
}

impl RecordingListener {
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<(String, ErrorKind)> {
        self.outcomes()
            .into_iter()
            .filter_map(|o| match o {
                Outcome::Failed(name, kind) => Some((name, kind)),
                Outcome::Succeeded(_) => None,
            })
            .collect()
    }
}

impl ProcessListener for RecordingListener {
    fn on_succeeded(&self, process: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .push(Outcome::Succeeded(process.to_string()));
    }

    fn on_failed(&self, process: &str, error: &SyncError) {
        self.outcomes
            .lock()
            .unwrap()
            .push(Outcome::Failed(process.to_string(), error.kind()));
    }
}

/// Config with small chunks and a short response bound
pub fn test_config(chunk_size: u32) -> Config {
    let mut config = Config::default();
    config.file.chunk_size = chunk_size;
    config.transfer.direct_download_timeout_ms = 300;
    config
}

/// Deterministic, non-repeating test content
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub struct Device {
    pub node: SyncNode,
    pub dir: TempDir,
}

/// Devices of one user sharing a memory network and content store
pub struct Cluster {
    pub network: MemoryNetwork,
    pub store: Arc<MemoryContentStore>,
    pub credentials: UserCredentials,
    pub listener: Arc<RecordingListener>,
    pub devices: Vec<Device>,
}

impl Cluster {
    /// Start `count` devices without registering anyone
    pub async fn start(count: usize, config: Config) -> Self {
        let network = MemoryNetwork::new();
        let store = Arc::new(MemoryContentStore::new());
        let listener = Arc::new(RecordingListener::default());

        let mut devices = Vec::with_capacity(count);
        for _ in 0..count {
            let dir = TempDir::new().unwrap();
            let mut node = SyncNode::in_memory(&network, store.clone(), config.clone(), dir.path())
                .await
                .unwrap();
            node.add_listener(listener.clone());
            devices.push(Device { node, dir });
        }

        Self {
            network,
            store,
            credentials: UserCredentials::new("alice", "correct horse", "2468"),
            listener,
            devices,
        }
    }

    /// Start `count` devices, register the user and log every device in
    pub async fn with_user(count: usize, config: Config) -> Self {
        let cluster = Self::start(count, config).await;
        cluster
            .node(0)
            .register(cluster.credentials.clone())
            .execute()
            .await
            .unwrap();
        for device in &cluster.devices {
            device
                .node
                .login(cluster.credentials.clone())
                .execute()
                .await
                .unwrap();
        }
        cluster
    }

    pub fn node(&self, device: usize) -> &SyncNode {
        &self.devices[device].node
    }

    /// Write `bytes` to `name` in the device's root
    pub async fn write_file(&self, device: usize, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.devices[device].dir.path().join(name);
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    /// Put `bytes` on the device and upload them as `name`
    pub async fn upload(&self, device: usize, name: &str, bytes: &[u8]) -> UploadContext {
        let path = self.write_file(device, name, bytes).await;
        self.node(device)
            .upload(self.credentials.clone(), path)
            .unwrap()
            .execute()
            .await
            .unwrap()
    }

    /// Current meta file of an uploaded file
    pub async fn meta_file(&self, upload: &UploadContext) -> Option<MetaFile> {
        let node = upload.node.as_ref()?;
        get_document(
            self.store.as_ref(),
            node.file_key.as_str(),
            META_FILE,
            &node.secret,
        )
        .await
        .unwrap()
        .map(|(meta, _)| meta)
    }

    /// Delete every stored chunk of an uploaded file, keeping its meta file
    pub async fn drop_stored_chunks(&self, upload: &UploadContext) {
        let location = upload.file_key().unwrap().to_string();
        for content in self.store.content_keys(&location).await {
            if content == META_FILE {
                continue;
            }
            for version in self.store.versions(&location, &content).await {
                self.store.remove(&location, &content, version).await.unwrap();
            }
        }
    }

    /// Download destination inside the device's root
    pub fn destination(&self, device: usize, name: &str) -> PathBuf {
        self.devices[device].dir.path().join("downloads").join(name)
    }
}
