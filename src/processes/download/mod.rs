//! Download: resolve a file version from the user's profile and fetch its
//! chunks directly from the user's other devices, falling back to the
//! content store for chunks no device can deliver.

pub mod direct;
pub mod task;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::error::{IntegrityError, Result, SyncError};
use crate::model::{Chunk, ChunkCodec, FileTreeNode, MetaFile, MetaFileVersion, UserCredentials};
use crate::network::store::{get_document, META_FILE};
use crate::process::{Process, ProcessStep, StepContext};
use crate::processes::common::{load_locations, GetUserProfileStep};
use crate::processes::{Services, Session, SessionContext};

pub use direct::{ChunkContext, ChunkOutcome, FailureReason};
pub use task::{ChunkSource, ChunkState, DownloadTask};

/// Working state of a download
pub struct DownloadContext {
    pub services: Services,
    pub session: Session,
    pub file_name: String,
    /// Requested version; latest when `None`
    pub version_id: Option<u64>,
    pub destination: PathBuf,
    pub node: Option<FileTreeNode>,
    pub version: Option<MetaFileVersion>,
    pub task: Option<Arc<DownloadTask>>,
}

impl DownloadContext {
    fn node(&self) -> Result<&FileTreeNode> {
        self.node.as_ref().ok_or_else(|| {
            SyncError::invalid_state("download", "resolved file entry", "no file entry")
        })
    }

    fn task(&self) -> Result<Arc<DownloadTask>> {
        self.task.clone().ok_or_else(|| {
            SyncError::invalid_state("download", "initialized task", "no task")
        })
    }
}

impl fmt::Debug for DownloadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadContext")
            .field("file_name", &self.file_name)
            .field("version_id", &self.version_id)
            .field("destination", &self.destination)
            .field("file_key", &self.node.as_ref().map(|n| n.file_key.to_string()))
            .finish_non_exhaustive()
    }
}

impl SessionContext for DownloadContext {
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

/// Build the download process for `file_name` into `destination`
pub fn build(
    services: Services,
    credentials: UserCredentials,
    file_name: String,
    version_id: Option<u64>,
    destination: PathBuf,
) -> Process<DownloadContext> {
    let name = format!("download:{}", file_name);
    Process::new(
        name,
        DownloadContext {
            services,
            session: Session::new(credentials),
            file_name,
            version_id,
            destination,
            node: None,
            version: None,
            task: None,
        },
    )
    .with_step(GetUserProfileStep)
    .with_step(ResolveFileStep)
    .with_step(GetMetaFileStep)
    .with_step(InitDownloadTaskStep)
    .with_step(DownloadChunksStep)
    .with_step(MergeChunksStep)
}

struct ResolveFileStep;

#[async_trait]
impl ProcessStep<DownloadContext> for ResolveFileStep {
    fn name(&self) -> &str {
        "resolve-file"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, DownloadContext>) -> Result<()> {
        let node = ctx
            .session
            .profile()?
            .file(&ctx.file_name)
            .cloned()
            .ok_or_else(|| SyncError::FileNotFound {
                name: ctx.file_name.clone(),
            })?;
        ctx.node = Some(node);
        Ok(())
    }
}

/// Loads the meta file and selects the target version
struct GetMetaFileStep;

#[async_trait]
impl ProcessStep<DownloadContext> for GetMetaFileStep {
    fn name(&self) -> &str {
        "get-meta-file"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, DownloadContext>) -> Result<()> {
        let node = ctx.node()?.clone();
        let store = ctx.services.store.clone();

        let meta_file: MetaFile =
            get_document(store.as_ref(), node.file_key.as_str(), META_FILE, &node.secret)
                .await?
                .map(|(meta, _)| meta)
                .ok_or_else(|| SyncError::FileNotFound {
                    name: node.name.clone(),
                })?;

        let version = match ctx.version_id {
            Some(id) => meta_file.version(id),
            None => meta_file.latest(),
        }
        .cloned()
        .ok_or_else(|| SyncError::VersionNotFound {
            file_key: node.file_key.to_string(),
            version_id: ctx.version_id.unwrap_or_default(),
        })?;

        info!(
            file = %node.name,
            version = version.version_id,
            chunks = version.chunk_count(),
            bytes = version.total_size,
            "Selected version"
        );
        ctx.version = Some(version);
        Ok(())
    }
}

/// Collects candidate peers and prepares temporary storage
struct InitDownloadTaskStep;

#[async_trait]
impl ProcessStep<DownloadContext> for InitDownloadTaskStep {
    fn name(&self) -> &str {
        "init-download-task"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, DownloadContext>) -> Result<()> {
        let services = ctx.services.clone();
        let credentials = ctx.session.credentials.clone();
        let recipient = ctx.session.profile()?.public_key()?;
        let node = ctx.node()?.clone();
        let version = ctx.version.clone().ok_or_else(|| {
            SyncError::invalid_state("init-download-task", "selected version", "no version")
        })?;

        let local = services.channel.local_peer();
        let candidates = load_locations(&services, &credentials)
            .await?
            .map(|(locations, _)| locations.candidates_excluding(&local))
            .unwrap_or_default();
        debug!(candidates = candidates.len(), "Candidate peers");

        let temp_dir = services
            .files
            .create_task_dir(&uuid::Uuid::new_v4().to_string())
            .await?;

        ctx.task = Some(Arc::new(DownloadTask::new(
            node.file_key,
            version,
            recipient,
            node.secret,
            candidates,
            temp_dir,
        )));
        Ok(())
    }

    async fn rollback(&mut self, context: &mut DownloadContext) -> Result<()> {
        match &context.task {
            Some(task) => context.services.files.remove_task_dir(&task.temp_dir).await,
            None => Ok(()),
        }
    }
}

/// Runs one sub-process per unresolved chunk, a bounded number at a time
struct DownloadChunksStep;

#[async_trait]
impl ProcessStep<DownloadContext> for DownloadChunksStep {
    fn name(&self) -> &str {
        "download-chunks"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, DownloadContext>) -> Result<()> {
        let task = ctx.task()?;
        let services = ctx.services.clone();
        let timeout = services.config.direct_download_timeout();
        let parallel = services.config.transfer.max_parallel_chunks.max(1);

        let results: Vec<Result<ChunkContext>> = stream::iter(task.remaining().await)
            .map(|index| {
                direct::chunk_process(
                    Arc::clone(&task),
                    index,
                    Arc::clone(&services.channel),
                    services.router.clone(),
                    Arc::clone(&services.store),
                    timeout,
                )
                .spawn()
                .join()
            })
            .buffer_unordered(parallel)
            .collect()
            .await;

        if let Some(reason) = task.abort_reason().await {
            return Err(reason);
        }
        if let Some(Err(err)) = results.into_iter().find(|r| r.is_err()) {
            return Err(err);
        }

        let missing = task.remaining().await;
        if !missing.is_empty() {
            return Err(SyncError::IncompleteFile {
                expected: task.version.chunk_count(),
                missing,
            });
        }
        Ok(())
    }

    async fn rollback(&mut self, context: &mut DownloadContext) -> Result<()> {
        match &context.task {
            Some(task) => context.services.files.remove_task_dir(&task.temp_dir).await,
            None => Ok(()),
        }
    }
}

/// Reassembles verified chunks and moves the file into place
struct MergeChunksStep;

#[async_trait]
impl ProcessStep<DownloadContext> for MergeChunksStep {
    fn name(&self) -> &str {
        "merge-chunks"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, DownloadContext>) -> Result<()> {
        let task = ctx.task()?;
        let services = ctx.services.clone();
        let destination = services.files.resolve(&ctx.destination);

        let mut chunks = Vec::new();
        for (index, path) in task.downloaded().await {
            chunks.push(Chunk::new(index, services.files.read_file(&path).await?));
        }
        let bytes = ChunkCodec::reassemble(chunks, task.version.chunk_count())?;
        if bytes.len() as u64 != task.version.total_size {
            return Err(IntegrityError::SizeMismatch {
                expected: task.version.total_size,
                actual: bytes.len() as u64,
            }
            .into());
        }

        services.files.write_atomic(&destination, &bytes).await?;
        services.files.remove_task_dir(&task.temp_dir).await?;
        services.index().insert(task.file_key.clone(), destination.clone()).await;

        info!(
            file_key = %task.file_key,
            path = %destination.display(),
            bytes = bytes.len(),
            "Download complete"
        );
        ctx.destination = destination;
        Ok(())
    }
}
