//! Local filesystem side of a node: the sync root, the index of files the
//! node can serve, and per-download temporary chunk directories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{ResourceError, Result};
use crate::model::FileKey;

/// Files this node holds a complete local copy of, keyed by file key
#[derive(Clone, Default)]
pub struct FileIndex {
    files: Arc<RwLock<HashMap<FileKey, PathBuf>>>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, file_key: FileKey, path: PathBuf) {
        debug!(file_key = %file_key, path = %path.display(), "Indexing file");
        self.files.write().await.insert(file_key, path);
    }

    pub async fn remove(&self, file_key: &FileKey) -> Option<PathBuf> {
        self.files.write().await.remove(file_key)
    }

    pub async fn get(&self, file_key: &FileKey) -> Option<PathBuf> {
        self.files.read().await.get(file_key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

/// Node-local file storage
#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
    temp_dir_name: String,
}

impl FileManager {
    pub fn new(root: impl Into<PathBuf>, temp_dir_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            temp_dir_name: temp_dir_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a destination relative to the root; absolute paths are kept
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Fresh temporary directory for one download task
    pub async fn create_task_dir(&self, task_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(&self.temp_dir_name).join(task_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ResourceError::write(&dir, e))?;
        Ok(dir)
    }

    /// Remove a task directory and its contents; missing directories are fine
    pub async fn remove_task_dir(&self, dir: &Path) -> Result<()> {
        match fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %dir.display(), "Failed to remove temporary directory: {}", e);
                Err(ResourceError::CleanupFailed {
                    path: dir.to_path_buf(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
            .await
            .map_err(|e| ResourceError::read(path, e).into())
    }

    /// Write `data` next to `dest` first, then move it into place
    pub async fn write_atomic(&self, dest: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ResourceError::write(parent, e))?;
        }

        let mut partial = dest.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        fs::write(&partial, data)
            .await
            .map_err(|e| ResourceError::write(&partial, e))?;
        fs::rename(&partial, dest)
            .await
            .map_err(|e| ResourceError::write(dest, e))?;
        Ok(())
    }
}

/// Read chunk `index` of the file at `path` without loading the whole file.
///
/// Returns `None` when the index lies beyond the end of the file. An empty
/// file has exactly one, empty, chunk.
pub async fn read_chunk(path: &Path, index: u32, chunk_size: u32) -> std::io::Result<Option<Vec<u8>>> {
    let mut file = fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let offset = index as u64 * chunk_size as u64;

    if len == 0 {
        return Ok((index == 0).then(Vec::new));
    }
    if offset >= len {
        return Ok(None);
    }

    let size = (len - offset).min(chunk_size as u64) as usize;
    let mut data = vec![0u8; size];
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.read_exact(&mut data).await?;
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_chunk_bounds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"abcdefghij").await.unwrap();

        assert_eq!(read_chunk(&path, 0, 4).await.unwrap().unwrap(), b"abcd");
        assert_eq!(read_chunk(&path, 2, 4).await.unwrap().unwrap(), b"ij");
        assert!(read_chunk(&path, 3, 4).await.unwrap().is_none());

        let empty = dir.path().join("empty.bin");
        fs::write(&empty, b"").await.unwrap();
        assert_eq!(read_chunk(&empty, 0, 4).await.unwrap().unwrap(), b"");
        assert!(read_chunk(&empty, 1, 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_dirs_and_atomic_write() {
        let dir = TempDir::new().unwrap();
        let manager = FileManager::new(dir.path(), ".tmp");

        let task = manager.create_task_dir("task-1").await.unwrap();
        fs::write(task.join("0"), b"chunk").await.unwrap();
        manager.remove_task_dir(&task).await.unwrap();
        assert!(!task.exists());
        manager.remove_task_dir(&task).await.unwrap();

        let dest = manager.resolve("out/file.txt");
        manager.write_atomic(&dest, b"content").await.unwrap();
        assert_eq!(manager.read_file(&dest).await.unwrap(), b"content");
        assert!(!dir.path().join("out/file.txt.part").exists());
    }

    #[tokio::test]
    async fn test_file_index() {
        let index = FileIndex::new();
        let key = FileKey::from_public_key(&libp2p::identity::Keypair::generate_ed25519().public());

        assert!(index.is_empty().await);
        index.insert(key.clone(), PathBuf::from("/tmp/a")).await;
        assert_eq!(index.get(&key).await, Some(PathBuf::from("/tmp/a")));
        assert_eq!(index.remove(&key).await, Some(PathBuf::from("/tmp/a")));
        assert_eq!(index.len().await, 0);
    }
}
