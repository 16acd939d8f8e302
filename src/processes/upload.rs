//! Upload: split a local file into chunks, store them encrypted, publish a
//! new meta file version and link the file into the user's profile.
//!
//! All store writes are compensated on failure, so a failed upload never
//! leaves a published version that references its chunks.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{ResourceError, Result, SyncError};
use crate::model::{
    Chunk, ChunkCodec, FileKey, FileTreeNode, MetaChunk, MetaFile, MetaFileVersion,
    UserCredentials,
};
use crate::network::store::{get_document, put_document, VersionedPayload, META_FILE};
use crate::process::{Process, ProcessStep, StepContext};
use crate::processes::common::GetUserProfileStep;
use crate::processes::{Services, Session, SessionContext};
use crate::security;

/// Working state of an upload
pub struct UploadContext {
    pub services: Services,
    pub session: Session,
    pub source: PathBuf,
    pub file_name: String,
    /// File tree entry the upload targets
    pub node: Option<FileTreeNode>,
    /// Whether the entry was created by this upload
    pub created: bool,
    /// Meta file as it was before this upload
    pub previous: Option<MetaFile>,
    /// Id of the version being created
    pub version_id: u64,
    pub chunk_size: u32,
    pub chunks: Vec<MetaChunk>,
    /// Meta file including the new version
    pub meta_file: Option<MetaFile>,
}

impl UploadContext {
    fn node(&self) -> Result<&FileTreeNode> {
        self.node.as_ref().ok_or_else(|| {
            SyncError::invalid_state("upload", "resolved file entry", "no file entry")
        })
    }

    pub fn file_key(&self) -> Option<&FileKey> {
        self.node.as_ref().map(|n| &n.file_key)
    }
}

impl fmt::Debug for UploadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadContext")
            .field("file_name", &self.file_name)
            .field("source", &self.source)
            .field("file_key", &self.file_key().map(|k| k.to_string()))
            .field("created", &self.created)
            .field("version_id", &self.version_id)
            .field("chunks", &self.chunks.len())
            .finish_non_exhaustive()
    }
}

impl SessionContext for UploadContext {
    fn services(&self) -> &Services {
        &self.services
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

/// Build the upload process for `source`, stored under `file_name`
pub fn build(
    services: Services,
    credentials: UserCredentials,
    source: PathBuf,
    file_name: String,
) -> Process<UploadContext> {
    let name = format!("upload:{}", file_name);
    let chunk_size = services.config.file.chunk_size;
    Process::new(
        name,
        UploadContext {
            services,
            session: Session::new(credentials),
            source,
            file_name,
            node: None,
            created: false,
            previous: None,
            version_id: 0,
            chunk_size,
            chunks: Vec::new(),
            meta_file: None,
        },
    )
    .with_step(GetUserProfileStep)
    .with_step(ResolveUploadTargetStep)
    .with_step(SplitFileStep)
    .with_step(CreateMetaFileVersionStep)
    .with_step(PutMetaFileStep { stored: None })
    .with_step(UpdateUserProfileStep { linked: false })
    .with_step(IndexLocalFileStep { replaced: None, indexed: false })
}

/// Picks the file entry and previous meta file, or creates a new entry
struct ResolveUploadTargetStep;

#[async_trait]
impl ProcessStep<UploadContext> for ResolveUploadTargetStep {
    fn name(&self) -> &str {
        "resolve-upload-target"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, UploadContext>) -> Result<()> {
        let existing = ctx.session.profile()?.file(&ctx.file_name).cloned();

        let Some(node) = existing else {
            let node = FileTreeNode::generate(ctx.file_name.clone())?;
            info!(file = %ctx.file_name, file_key = %node.file_key, "Creating new file");
            ctx.node = Some(node);
            ctx.created = true;
            ctx.version_id = 0;
            return Ok(());
        };

        let store = ctx.services.store.clone();
        let previous: Option<(MetaFile, u64)> =
            get_document(store.as_ref(), node.file_key.as_str(), META_FILE, &node.secret).await?;

        ctx.version_id = previous
            .as_ref()
            .map_or(0, |(meta, _)| meta.next_version_id());
        info!(file = %ctx.file_name, version = ctx.version_id, "Uploading new version");
        ctx.previous = previous.map(|(meta, _)| meta);
        ctx.node = Some(node);
        Ok(())
    }
}

/// Reads the source and schedules one put step per chunk
struct SplitFileStep;

#[async_trait]
impl ProcessStep<UploadContext> for SplitFileStep {
    fn name(&self) -> &str {
        "split-file"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, UploadContext>) -> Result<()> {
        let source = ctx.source.clone();
        let max_size = ctx.services.config.file.max_file_size;

        let size = fs::metadata(&source)
            .await
            .map_err(|e| ResourceError::read(&source, e))?
            .len();
        if size > max_size {
            return Err(ResourceError::FileTooLarge { size, max_size }.into());
        }

        let bytes = fs::read(&source)
            .await
            .map_err(|e| ResourceError::read(&source, e))?;
        let chunks = ChunkCodec::split(&bytes, ctx.chunk_size as usize)?;
        debug!(bytes = bytes.len(), chunks = chunks.len(), "File split");

        for chunk in chunks {
            ctx.insert_next(PutChunkStep {
                chunk,
                stored: None,
            });
        }
        Ok(())
    }
}

/// Encrypts one chunk and stores it under its plaintext digest
struct PutChunkStep {
    chunk: Chunk,
    stored: Option<(String, u64)>,
}

#[async_trait]
impl ProcessStep<UploadContext> for PutChunkStep {
    fn name(&self) -> &str {
        "put-chunk"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, UploadContext>) -> Result<()> {
        let node = ctx.node()?.clone();
        let store = ctx.services.store.clone();
        let version = ctx.version_id;

        let digest = self.chunk.digest();
        let data = security::encrypt(&node.secret, &self.chunk.data)?;
        let content = digest.to_hex();

        store
            .put(
                node.file_key.as_str(),
                &content,
                VersionedPayload { version, data },
            )
            .await?;
        debug!(chunk = self.chunk.index, digest = %digest, "Chunk stored");

        self.stored = Some((content, version));
        ctx.chunks.push(MetaChunk {
            index: self.chunk.index,
            digest,
            size: self.chunk.len() as u32,
        });
        Ok(())
    }

    async fn rollback(&mut self, context: &mut UploadContext) -> Result<()> {
        let Some((content, version)) = self.stored.take() else {
            return Ok(());
        };
        let location = context.node()?.file_key.to_string();
        debug!(chunk = self.chunk.index, "Removing stored chunk");
        context.services.store.remove(&location, &content, version).await
    }
}

struct CreateMetaFileVersionStep;

#[async_trait]
impl ProcessStep<UploadContext> for CreateMetaFileVersionStep {
    fn name(&self) -> &str {
        "create-meta-file-version"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, UploadContext>) -> Result<()> {
        let version = MetaFileVersion::new(ctx.version_id, ctx.chunk_size, ctx.chunks.clone())?;
        let mut meta_file = match &ctx.previous {
            Some(previous) => previous.clone(),
            None => MetaFile::new(ctx.node()?.file_key.clone()),
        };
        meta_file.append_version(version)?;
        ctx.meta_file = Some(meta_file);
        Ok(())
    }
}

/// Publishes the meta file; rollback brings back the previous snapshot
struct PutMetaFileStep {
    stored: Option<u64>,
}

#[async_trait]
impl ProcessStep<UploadContext> for PutMetaFileStep {
    fn name(&self) -> &str {
        "put-meta-file"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, UploadContext>) -> Result<()> {
        let node = ctx.node()?.clone();
        let store = ctx.services.store.clone();
        let version = ctx.version_id;
        let meta_file = ctx.meta_file.clone().ok_or_else(|| {
            SyncError::invalid_state("put-meta-file", "created version", "no version")
        })?;

        put_document(
            store.as_ref(),
            node.file_key.as_str(),
            META_FILE,
            version,
            &meta_file,
            &node.secret,
        )
        .await?;
        info!(file_key = %node.file_key, version, "Meta file published");
        self.stored = Some(version);
        Ok(())
    }

    async fn rollback(&mut self, context: &mut UploadContext) -> Result<()> {
        let Some(version) = self.stored.take() else {
            return Ok(());
        };
        let node = context.node()?.clone();
        let store = context.services.store.clone();

        store
            .remove(node.file_key.as_str(), META_FILE, version)
            .await?;
        if let Some(previous) = &context.previous {
            if let Some(latest) = previous.latest() {
                put_document(
                    store.as_ref(),
                    node.file_key.as_str(),
                    META_FILE,
                    latest.version_id,
                    previous,
                    &node.secret,
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// Links a newly created file into the user's profile.
///
/// Works on the latest stored profile, not the snapshot loaded at the start
/// of the process, so concurrent uploads of different files all survive.
struct UpdateUserProfileStep {
    linked: bool,
}

#[async_trait]
impl ProcessStep<UploadContext> for UpdateUserProfileStep {
    fn name(&self) -> &str {
        "update-user-profile"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, UploadContext>) -> Result<()> {
        if !ctx.created {
            return Ok(());
        }
        let node = ctx.node()?.clone();
        let services = ctx.services.clone();
        let credentials = ctx.session.credentials.clone();

        let (profile, version, changed) = services
            .profiles
            .modify(&services, &credentials, |profile| {
                match profile.file(&node.name).map(|e| e.file_key == node.file_key) {
                    Some(true) => Ok(false),
                    Some(false) => Err(SyncError::FileConflict {
                        name: node.name.clone(),
                    }),
                    None => Ok(profile.add_file(node.clone())),
                }
            })
            .await?;
        if !changed {
            warn!(file = %node.name, "File entry already present in profile");
        }

        self.linked = changed;
        ctx.session.set_profile(profile, version);
        Ok(())
    }

    async fn rollback(&mut self, context: &mut UploadContext) -> Result<()> {
        if !std::mem::take(&mut self.linked) {
            return Ok(());
        }
        let node = context.node()?.clone();
        let services = context.services.clone();
        let credentials = context.session.credentials.clone();

        let (profile, version, _) = services
            .profiles
            .modify(&services, &credentials, |profile| {
                let ours = profile.file_by_key(&node.file_key).is_some();
                Ok(ours && profile.remove_file(&node.name).is_some())
            })
            .await?;
        context.session.set_profile(profile, version);
        Ok(())
    }
}

/// Lets the node serve the uploaded file to the user's other devices
struct IndexLocalFileStep {
    replaced: Option<PathBuf>,
    indexed: bool,
}

#[async_trait]
impl ProcessStep<UploadContext> for IndexLocalFileStep {
    fn name(&self) -> &str {
        "index-local-file"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, UploadContext>) -> Result<()> {
        let file_key = ctx.node()?.file_key.clone();
        let source = ctx.source.clone();
        let path = fs::canonicalize(&source).await.unwrap_or(source);
        let index = ctx.services.index().clone();

        self.replaced = index.get(&file_key).await;
        index.insert(file_key, path).await;
        self.indexed = true;
        Ok(())
    }

    async fn rollback(&mut self, context: &mut UploadContext) -> Result<()> {
        if !self.indexed {
            return Ok(());
        }
        let file_key = context.node()?.file_key.clone();
        let index = context.services.index().clone();
        match self.replaced.take() {
            Some(path) => index.insert(file_key, path).await,
            None => {
                index.remove(&file_key).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::processes::testing::memory_services;
    use crate::processes::{common, register};
    use tempfile::TempDir;

    async fn registered() -> (Services, TempDir, UserCredentials) {
        let (services, dir) = memory_services().await;
        let credentials = UserCredentials::new("carol", "pw", "42");
        register::build(services.clone(), credentials.clone())
            .execute()
            .await
            .unwrap();
        (services, dir, credentials)
    }

    #[tokio::test]
    async fn test_versions_are_appended() {
        let (services, dir, credentials) = registered().await;
        let source = dir.path().join("doc.txt");
        fs::write(&source, b"first").await.unwrap();

        let first = build(services.clone(), credentials.clone(), source.clone(), "doc.txt".into())
            .execute()
            .await
            .unwrap();
        assert!(first.created);

        fs::write(&source, b"second version").await.unwrap();
        let second = build(services.clone(), credentials.clone(), source, "doc.txt".into())
            .execute()
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.version_id, 1);

        let meta = second.meta_file.unwrap();
        assert_eq!(meta.versions().len(), 2);
        assert_eq!(meta.latest().unwrap().total_size, 14);

        let (profile, _) = common::load_profile(&services, &credentials).await.unwrap();
        assert_eq!(profile.files().count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_file_is_rejected() {
        let (mut services, dir, credentials) = registered().await;
        let mut config = (*services.config).clone();
        config.file.max_file_size = 4;
        services.config = std::sync::Arc::new(config);

        let source = dir.path().join("big.bin");
        fs::write(&source, vec![0u8; 5]).await.unwrap();

        let err = build(services, credentials, source, "big.bin".into())
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Resource(ResourceError::FileTooLarge { size: 5, max_size: 4 })
        ));
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_fails_without_panic() {
        let (mut services, dir, credentials) = registered().await;
        let mut config = (*services.config).clone();
        config.file.chunk_size = 0;
        services.config = std::sync::Arc::new(config);

        let source = dir.path().join("small.txt");
        fs::write(&source, b"abc").await.unwrap();

        let mut process = build(services.clone(), credentials, source, "small.txt".into());
        let err = process.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let file_key = process.context().file_key().cloned().unwrap();
        let stored = services.store.get(file_key.as_str(), META_FILE).await.unwrap();
        assert!(stored.is_none());
    }
}
