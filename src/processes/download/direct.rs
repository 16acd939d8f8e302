//! Per-chunk direct download sub-protocol.
//!
//! A chunk sub-process starts as `select -> ask`. When an attempt fails the
//! asking step drops the peer from the chunk's candidates and schedules a new
//! `select -> ask` pair after itself, so retries end when the candidate list
//! runs dry. A chunk without candidates is read back from the content store
//! once; if that fails too the whole download is exhausted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{IntegrityError, ResourceError, Result, SyncError, TransportError};
use crate::model::ChunkCodec;
use crate::network::{
    ChunkRequest, ContentStore, DirectRequest, DirectResponse, PeerChannel, ResponseContent,
    ResponseHandler, ResponseRouter,
};
use crate::process::{CompletionLatch, LatchClaim, Process, ProcessStep, StepContext, WaitOutcome};
use crate::processes::download::task::{ChunkSource, DownloadTask};
use crate::security::{self, ContentDigest};

/// Why one attempt for a chunk failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    SendFailed,
    Absent,
    Refused,
    DigestMismatch,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::SendFailed => "send_failed",
            FailureReason::Absent => "absent",
            FailureReason::Refused => "refused",
            FailureReason::DigestMismatch => "digest_mismatch",
        }
    }
}

/// Decision the response handler hands to the waiting step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Accepted,
    Rejected(FailureReason),
    /// Storing the verified chunk failed and the task was aborted
    Aborted,
}

/// State of one chunk sub-process
pub struct ChunkContext {
    pub task: Arc<DownloadTask>,
    pub index: u32,
    pub channel: Arc<dyn PeerChannel>,
    pub router: ResponseRouter,
    pub store: Arc<dyn ContentStore>,
    pub timeout: Duration,
    /// Peer chosen by the last select step
    pub selected: Option<PeerId>,
}

/// Build the sub-process resolving chunk `index` of `task`
pub fn chunk_process(
    task: Arc<DownloadTask>,
    index: u32,
    channel: Arc<dyn PeerChannel>,
    router: ResponseRouter,
    store: Arc<dyn ContentStore>,
    timeout: Duration,
) -> Process<ChunkContext> {
    Process::new(
        format!("chunk:{}:{}", task.file_key, index),
        ChunkContext {
            task,
            index,
            channel,
            router,
            store,
            timeout,
            selected: None,
        },
    )
    .with_step(SelectPeerStep)
    .with_step(AskForChunkStep)
}

fn no_candidates(task: &DownloadTask, index: u32) -> SyncError {
    SyncError::NoCandidates {
        file_key: task.file_key.to_string(),
        chunk_index: index,
    }
}

/// Picks the first remaining candidate for the chunk, or hands the chunk to
/// the content store once the candidates are used up
pub struct SelectPeerStep;

#[async_trait]
impl ProcessStep<ChunkContext> for SelectPeerStep {
    fn name(&self) -> &str {
        "select-peer"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, ChunkContext>) -> Result<()> {
        let task = Arc::clone(&ctx.task);
        if task.is_aborted() {
            ctx.selected = None;
            return Ok(());
        }

        match task.select_candidate(ctx.index).await {
            Some(peer) => {
                debug!(chunk = ctx.index, peer = %peer, "Selected candidate");
                ctx.selected = Some(peer);
                Ok(())
            }
            None => {
                info!(chunk = ctx.index, "No peer left for chunk; reading it from the store");
                ctx.selected = None;
                ctx.insert_next(FetchFromStoreStep);
                Ok(())
            }
        }
    }
}

/// Reads the encrypted chunk back from the content store and verifies it.
///
/// Last resort for a chunk; any failure here exhausts the download.
pub struct FetchFromStoreStep;

impl FetchFromStoreStep {
    async fn fetch(task: &DownloadTask, store: &dyn ContentStore, index: u32) -> Result<Vec<u8>> {
        let meta_chunk = task.meta_chunk(index).ok_or_else(|| SyncError::InvalidMetaFile {
            reason: format!("version has no chunk {}", index),
        })?;
        let expected = meta_chunk.digest;

        let payload = store
            .get(task.file_key.as_str(), &expected.to_hex())
            .await?
            .ok_or_else(|| SyncError::FileNotFound {
                name: format!("{}/{}", task.file_key, expected),
            })?;
        let data = security::decrypt(&task.secret, &payload.data)?;

        let actual = ChunkCodec::digest(&data);
        if actual != expected {
            return Err(IntegrityError::DigestMismatch {
                chunk_index: index,
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            }
            .into());
        }
        Ok(data)
    }
}

#[async_trait]
impl ProcessStep<ChunkContext> for FetchFromStoreStep {
    fn name(&self) -> &str {
        "fetch-from-store"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, ChunkContext>) -> Result<()> {
        let task = Arc::clone(&ctx.task);
        let store = Arc::clone(&ctx.store);
        let index = ctx.index;
        if task.is_aborted() {
            return Ok(());
        }

        let data = match Self::fetch(&task, store.as_ref(), index).await {
            Ok(data) => data,
            Err(e) => {
                warn!(file_key = %task.file_key, chunk = index, "Store fallback failed: {}", e);
                task.record_failure(index, e).await;
                let err = no_candidates(&task, index);
                task.abort(err.clone()).await;
                return Err(err);
            }
        };

        let path = task.temp_path(index);
        if let Err(e) = fs::write(&path, &data).await {
            task.abort(ResourceError::write(&path, e).into()).await;
            return Ok(());
        }
        task.mark_resolved(index, path, ChunkSource::Store).await;
        debug!(chunk = index, bytes = data.len(), "Chunk resolved from store");
        Ok(())
    }
}

/// Requests the chunk from the selected peer and waits for the verdict
pub struct AskForChunkStep;

impl AskForChunkStep {
    fn fail_over(ctx: &mut StepContext<'_, ChunkContext>) {
        ctx.insert_next(SelectPeerStep);
        ctx.insert_next(AskForChunkStep);
    }
}

#[async_trait]
impl ProcessStep<ChunkContext> for AskForChunkStep {
    fn name(&self) -> &str {
        "ask-for-chunk"
    }

    async fn execute(&mut self, ctx: &mut StepContext<'_, ChunkContext>) -> Result<()> {
        let task = Arc::clone(&ctx.task);
        let index = ctx.index;
        let Some(peer) = ctx.selected.take() else {
            return Ok(());
        };
        if task.is_aborted() {
            return Ok(());
        }
        let Some(meta_chunk) = task.meta_chunk(index).cloned() else {
            return Err(SyncError::InvalidMetaFile {
                reason: format!("version has no chunk {}", index),
            });
        };

        let request = DirectRequest::new(
            ChunkRequest {
                file_key: task.file_key.clone(),
                chunk_index: index,
                chunk_size: task.version.chunk_size,
                expected_digest: meta_chunk.digest,
            },
            &task.recipient,
        );
        let correlation_id = request.correlation_id.clone();

        let (latch, waiter) = CompletionLatch::new();
        let handler = Arc::new(ChunkResponseHandler {
            task: Arc::clone(&task),
            index,
            expected: meta_chunk.digest,
            path: task.temp_path(index),
            latch,
        });

        let channel = Arc::clone(&ctx.channel);
        let router = ctx.router.clone();
        let timeout = ctx.timeout;

        router.register(correlation_id.clone(), handler).await;
        let outcome = match channel.send_direct(&peer, request).await {
            Ok(()) => match waiter.wait(timeout).await {
                WaitOutcome::Released(outcome) => outcome,
                WaitOutcome::TimedOut => {
                    let err = TransportError::Timeout {
                        peer,
                        duration: timeout,
                    };
                    task.record_failure(index, err.into()).await;
                    ChunkOutcome::Rejected(FailureReason::Timeout)
                }
                WaitOutcome::Abandoned => ChunkOutcome::Rejected(FailureReason::Absent),
            },
            Err(e) => {
                debug!(chunk = index, peer = %peer, "Send failed: {}", e);
                task.record_failure(index, e).await;
                ChunkOutcome::Rejected(FailureReason::SendFailed)
            }
        };
        router.deregister(&correlation_id).await;

        match outcome {
            ChunkOutcome::Accepted => {
                debug!(chunk = index, peer = %peer, "Chunk resolved");
                Ok(())
            }
            // the task carries the error; sibling steps see the flag and stop
            ChunkOutcome::Aborted => Ok(()),
            ChunkOutcome::Rejected(reason) => {
                warn!(
                    file_key = %task.file_key,
                    chunk = index,
                    peer = %peer,
                    reason = reason.as_str(),
                    "Chunk attempt failed; trying next candidate"
                );
                task.drop_candidate(index, &peer).await;
                Self::fail_over(ctx);
                Ok(())
            }
        }
    }
}

/// Verifies and stores the response of one request attempt.
///
/// Only this handler decides whether a response is accepted. It releases the
/// waiting step exactly once, whatever the outcome.
pub struct ChunkResponseHandler {
    task: Arc<DownloadTask>,
    index: u32,
    expected: ContentDigest,
    path: PathBuf,
    latch: Arc<CompletionLatch<ChunkOutcome>>,
}

impl ChunkResponseHandler {
    async fn decide(&self, claim: LatchClaim<ChunkOutcome>, from: PeerId, content: ResponseContent) {
        let outcome = match content {
            ResponseContent::Chunk(data) => self.accept(from, data).await,
            ResponseContent::Absent => ChunkOutcome::Rejected(FailureReason::Absent),
            ResponseContent::Refused { reason } => {
                debug!(chunk = self.index, "Request refused: {}", reason);
                ChunkOutcome::Rejected(FailureReason::Refused)
            }
        };
        claim.complete(outcome);
    }

    async fn accept(&self, from: PeerId, data: Vec<u8>) -> ChunkOutcome {
        let actual = ChunkCodec::digest(&data);
        if actual != self.expected {
            let err = IntegrityError::DigestMismatch {
                chunk_index: self.index,
                expected: self.expected.to_hex(),
                actual: actual.to_hex(),
            };
            debug!(peer = %from, "{}", err);
            self.task.record_failure(self.index, err.into()).await;
            return ChunkOutcome::Rejected(FailureReason::DigestMismatch);
        }

        if let Err(e) = fs::write(&self.path, &data).await {
            self.task
                .abort(ResourceError::write(&self.path, e).into())
                .await;
            return ChunkOutcome::Aborted;
        }
        self.task
            .mark_resolved(self.index, self.path.clone(), ChunkSource::Peer(from))
            .await;
        ChunkOutcome::Accepted
    }
}

#[async_trait]
impl ResponseHandler for ChunkResponseHandler {
    async fn handle(&self, from: PeerId, response: DirectResponse) {
        let Some(claim) = self.latch.try_claim() else {
            debug!(chunk = self.index, peer = %from, "Discarding late response");
            return;
        };
        self.decide(claim, from, response.content).await;
    }
}
