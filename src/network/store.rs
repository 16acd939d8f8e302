use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, StoreError, SyncError};
use crate::security::{self, SymmetricKey};

/// Content key of the encrypted user profile
pub const USER_PROFILE: &str = "USER_PROFILE";
/// Content key of the encrypted locations document
pub const LOCATIONS: &str = "LOCATIONS";
/// Content key of the encrypted meta file
pub const META_FILE: &str = "META_FILE";

/// Opaque, encrypted payload tagged with a version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedPayload {
    pub version: u64,
    pub data: Vec<u8>,
}

/// Content-addressed key-value store of the overlay network.
///
/// Entries are addressed by `(location, content)` and keep one payload per
/// version; `get` returns the highest remaining version. Implementations must
/// tolerate concurrent use by unrelated uploads and downloads.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, location: &str, content: &str, payload: VersionedPayload) -> Result<()>;

    async fn get(&self, location: &str, content: &str) -> Result<Option<VersionedPayload>>;

    /// Remove one version; removing an absent version is not an error
    async fn remove(&self, location: &str, content: &str, version: u64) -> Result<()>;
}

type EntryKey = (String, String);

/// In-process store used by tests and the demo
#[derive(Default)]
pub struct MemoryContentStore {
    entries: RwLock<HashMap<EntryKey, BTreeMap<u64, Vec<u8>>>>,
    failing_content: RwLock<HashSet<String>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put of `content` fail until [`Self::clear_failures`]
    pub async fn fail_puts_for(&self, content: &str) {
        self.failing_content.write().await.insert(content.to_string());
    }

    pub async fn clear_failures(&self) {
        self.failing_content.write().await.clear();
    }

    /// Versions stored under `(location, content)`, ascending
    pub async fn versions(&self, location: &str, content: &str) -> Vec<u64> {
        self.entries
            .read()
            .await
            .get(&(location.to_string(), content.to_string()))
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of `(location, content)` entries holding at least one version
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Content keys stored under `location`
    pub async fn content_keys(&self, location: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .await
            .keys()
            .filter(|(loc, _)| loc == location)
            .map(|(_, content)| content.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, location: &str, content: &str, payload: VersionedPayload) -> Result<()> {
        if self.failing_content.read().await.contains(content) {
            warn!(location, content, "Injected put failure");
            return Err(StoreError::PutFailed {
                location: location.to_string(),
                content: content.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }

        debug!(location, content, version = payload.version, bytes = payload.data.len(), "put");
        self.entries
            .write()
            .await
            .entry((location.to_string(), content.to_string()))
            .or_default()
            .insert(payload.version, payload.data);
        Ok(())
    }

    async fn get(&self, location: &str, content: &str) -> Result<Option<VersionedPayload>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(location.to_string(), content.to_string()))
            .and_then(|versions| versions.iter().next_back())
            .map(|(version, data)| VersionedPayload {
                version: *version,
                data: data.clone(),
            }))
    }

    async fn remove(&self, location: &str, content: &str, version: u64) -> Result<()> {
        let mut entries = self.entries.write().await;
        let key = (location.to_string(), content.to_string());
        if let Some(versions) = entries.get_mut(&key) {
            versions.remove(&version);
            if versions.is_empty() {
                entries.remove(&key);
            }
        }
        debug!(location, content, version, "remove");
        Ok(())
    }
}

/// Serialize, encrypt and store a document
pub async fn put_document<T: Serialize>(
    store: &dyn ContentStore,
    location: &str,
    content: &str,
    version: u64,
    document: &T,
    key: &SymmetricKey,
) -> Result<()> {
    let plain = bincode::serialize(document).map_err(SyncError::serialization)?;
    let data = security::encrypt(key, &plain)?;
    store
        .put(location, content, VersionedPayload { version, data })
        .await
}

/// Fetch, decrypt and deserialize the latest version of a document
pub async fn get_document<T: DeserializeOwned>(
    store: &dyn ContentStore,
    location: &str,
    content: &str,
    key: &SymmetricKey,
) -> Result<Option<(T, u64)>> {
    let Some(payload) = store.get(location, content).await? else {
        return Ok(None);
    };
    let plain = security::decrypt(key, &payload.data)?;
    let document = bincode::deserialize(&plain).map_err(SyncError::serialization)?;
    Ok(Some((document, payload.version)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn payload(version: u64, data: &[u8]) -> VersionedPayload {
        VersionedPayload {
            version,
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_latest_version_wins() {
        let store = MemoryContentStore::new();
        store.put("loc", "c", payload(0, b"v0")).await.unwrap();
        store.put("loc", "c", payload(1, b"v1")).await.unwrap();

        assert_eq!(store.get("loc", "c").await.unwrap().unwrap().data, b"v1");

        store.remove("loc", "c", 1).await.unwrap();
        assert_eq!(store.get("loc", "c").await.unwrap().unwrap().version, 0);

        store.remove("loc", "c", 0).await.unwrap();
        store.remove("loc", "c", 0).await.unwrap();
        assert!(store.get("loc", "c").await.unwrap().is_none());
        assert_eq!(store.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_injected_put_failure() {
        let store = MemoryContentStore::new();
        store.fail_puts_for(META_FILE).await;

        let err = store.put("loc", META_FILE, payload(0, b"x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
        store.put("loc", "other", payload(0, b"x")).await.unwrap();

        store.clear_failures().await;
        store.put("loc", META_FILE, payload(0, b"x")).await.unwrap();
        assert_eq!(store.content_keys("loc").await, vec![META_FILE, "other"]);
    }

    #[tokio::test]
    async fn test_documents_are_encrypted() {
        let store = MemoryContentStore::new();
        let key = SymmetricKey::generate();
        let doc = vec!["plain".to_string(), "text".to_string()];

        put_document(&store, "loc", "doc", 3, &doc, &key).await.unwrap();

        let raw = store.get("loc", "doc").await.unwrap().unwrap();
        assert!(!raw.data.windows(5).any(|w| w == b"plain"));

        let (loaded, version): (Vec<String>, u64) =
            get_document(&store, "loc", "doc", &key).await.unwrap().unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(version, 3);

        let wrong = SymmetricKey::generate();
        let err = get_document::<Vec<String>>(&store, "loc", "doc", &wrong)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
        assert!(get_document::<Vec<String>>(&store, "loc", "none", &key)
            .await
            .unwrap()
            .is_none());
    }
}
