use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    listener::NoopListener,
    transport::{execute_cancellable, TEXT_PLAIN},
    BlockFailure, BlockGeometry, BlockProgress, BlockUploader, ChunkTransport, CommitReceipt,
    ContentSource, FileSource, ProgressStore, StaleContextPolicy, StatusCodePolicy, TargetId,
    TransportRequest, UploadConfig, UploadEndpoints, UploadError, UploadListener, UploadResult,
    UploadTask, MAX_BLOCK_SIZE_EXP, MIN_BLOCK_SIZE_EXP,
};

/// Splits content into blocks, uploads them in parallel and commits the object.
///
/// Blocks that fail leave their progress in the [`ProgressStore`], so running the
/// same task again only sends what the server has not acknowledged yet.
pub struct ResumableUploader {
    transport: Arc<dyn ChunkTransport>,
    progress: Arc<dyn ProgressStore>,
    endpoints: Arc<UploadEndpoints>,
    stale_policy: Arc<dyn StaleContextPolicy>,
    listener: Arc<dyn UploadListener>,
    config: UploadConfig,
}

impl ResumableUploader {
    pub fn new<T, P>(
        transport: T,
        progress: P,
        endpoints: UploadEndpoints,
        config: UploadConfig,
    ) -> Self
    where
        T: ChunkTransport + 'static,
        P: ProgressStore + 'static,
    {
        Self::from_shared(Arc::new(transport), Arc::new(progress), endpoints, config)
    }

    /// Build from collaborators that are shared with other owners
    pub fn from_shared(
        transport: Arc<dyn ChunkTransport>,
        progress: Arc<dyn ProgressStore>,
        endpoints: UploadEndpoints,
        config: UploadConfig,
    ) -> Self {
        let stale_policy = Arc::new(StatusCodePolicy::new(
            config.stale_context_statuses.iter().copied(),
        ));
        Self {
            transport,
            progress,
            endpoints: Arc::new(endpoints),
            stale_policy,
            listener: Arc::new(NoopListener),
            config,
        }
    }

    /// Replace the status-code based stale context check
    pub fn with_stale_policy<S: StaleContextPolicy + 'static>(mut self, policy: S) -> Self {
        self.stale_policy = Arc::new(policy);
        self
    }

    pub fn with_listener<L: UploadListener + 'static>(mut self, listener: L) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// A task for `target` using the configured block size
    pub fn task<T: Into<TargetId>>(&self, target: T, total_size: u64) -> UploadTask {
        UploadTask::new(target, total_size).with_block_size_exp(self.config.block_size_exp)
    }

    /// Progress persisted for `task` by an earlier, unfinished run
    pub async fn stored_progress(&self, task: &UploadTask) -> Option<Vec<BlockProgress>> {
        self.progress.load(&task.progress_key()).await
    }

    /// Forget any persisted progress so the next run starts from scratch
    pub async fn discard_progress(&self, task: &UploadTask) -> UploadResult<()> {
        self.progress.delete(&task.progress_key()).await
    }

    /// Upload a file from disk, resuming earlier progress for the same target and size
    pub async fn upload_file<T, P>(
        &self,
        target: T,
        path: P,
        mime_type: &str,
        cancel: CancellationToken,
    ) -> UploadResult<CommitReceipt>
    where
        T: Into<TargetId>,
        P: AsRef<Path>,
    {
        let source = FileSource::open(path).await?;
        let task = self.task(target, source.size()).with_mime_type(mime_type);
        self.upload(&task, Arc::new(source), cancel).await
    }

    /// Run `task` to completion, resuming any stored progress.
    ///
    /// Fails with [`UploadError::Incomplete`] when any block could not be uploaded
    /// and with [`UploadError::FinalizeFailed`] when every block is stored but the
    /// commit call failed. Both leave resumable progress behind.
    #[instrument(
        skip(self, task, source, cancel),
        fields(target = %task.target, total_size = task.total_size, run_id = %uuid::Uuid::new_v4())
    )]
    pub async fn upload(
        &self,
        task: &UploadTask,
        source: Arc<dyn ContentSource>,
        cancel: CancellationToken,
    ) -> UploadResult<CommitReceipt> {
        self.config.validate()?;
        if !(MIN_BLOCK_SIZE_EXP..=MAX_BLOCK_SIZE_EXP).contains(&task.block_size_exp) {
            return Err(UploadError::invalid(format!(
                "Task block size exponent {} out of range ({}-{})",
                task.block_size_exp, MIN_BLOCK_SIZE_EXP, MAX_BLOCK_SIZE_EXP
            )));
        }
        if source.size() != task.total_size {
            return Err(UploadError::invalid(format!(
                "Source is {} bytes but task expects {}",
                source.size(),
                task.total_size
            )));
        }

        let geometry = task.geometry();
        let key = task.progress_key();
        let mut blocks = self.initial_progress(&key, &geometry).await;
        let resumed_blocks = blocks.iter().filter(|b| b.is_complete()).count();

        info!(
            blocks = blocks.len(),
            resumed_blocks,
            block_size = geometry.block_size(),
            "Starting upload"
        );

        let failed = self
            .upload_blocks(&geometry, &mut blocks, source, &cancel)
            .await;

        if !failed.is_empty() {
            let persisted = self.persist(&key, &blocks).await;

            if failed.iter().any(|f| matches!(f.error, UploadError::Cancelled)) {
                for f in failed.iter().filter(|f| !matches!(f.error, UploadError::Cancelled)) {
                    error!(block = f.block, error = %f.error, "Block failed before cancellation");
                }
                info!(persisted, "Upload cancelled");
                return Err(UploadError::Cancelled);
            }

            error!(failed = failed.len(), persisted, "Upload incomplete");
            return Err(UploadError::Incomplete {
                failed,
                progress: blocks,
                persisted,
            });
        }

        let response = match self.commit(task, &blocks, &cancel).await {
            Ok(response) => response,
            Err(e) => {
                let persisted = self.persist(&key, &blocks).await;
                if matches!(e, UploadError::Cancelled) {
                    return Err(e);
                }
                error!(error = %e, persisted, "Commit failed after all blocks were stored");
                return Err(UploadError::FinalizeFailed {
                    source: Box::new(e),
                    progress: blocks,
                });
            }
        };

        if let Err(e) = self.progress.delete(&key).await {
            warn!(error = %e, "Failed to clear upload progress");
        }

        info!("Upload committed");
        Ok(CommitReceipt {
            target: task.target.clone(),
            total_size: task.total_size,
            blocks: blocks.len(),
            resumed_blocks,
            hash: response
                .get("hash")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            key: response
                .get("key")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            response,
        })
    }

    /// Stored progress when it still matches the geometry, fresh state otherwise
    async fn initial_progress(&self, key: &str, geometry: &BlockGeometry) -> Vec<BlockProgress> {
        let count = geometry.block_count();

        let Some(mut blocks) = self.progress.load(key).await else {
            return vec![BlockProgress::default(); count];
        };

        if blocks.len() != count {
            warn!(
                stored = blocks.len(),
                expected = count,
                "Stored progress does not match block count, starting fresh"
            );
            return vec![BlockProgress::default(); count];
        }

        for (index, block) in blocks.iter_mut().enumerate() {
            if !block.is_consistent(geometry.block_len(index)) {
                warn!(block = index, "Inconsistent block progress, block starts over");
                *block = BlockProgress::default();
            }
        }

        info!(blocks = count, "Resuming from stored progress");
        blocks
    }

    /// Upload every incomplete block, at most `max_concurrency` at a time.
    ///
    /// Each worker owns its block's progress and hands it back when done. A failed
    /// block does not stop its siblings.
    async fn upload_blocks(
        &self,
        geometry: &BlockGeometry,
        blocks: &mut [BlockProgress],
        source: Arc<dyn ContentSource>,
        cancel: &CancellationToken,
    ) -> Vec<BlockFailure> {
        let uploader = BlockUploader::new(
            self.transport.clone(),
            source,
            self.endpoints.clone(),
            &self.config,
        )
        .with_stale_policy(self.stale_policy.clone())
        .with_listener(self.listener.clone())
        .with_cancellation(cancel.clone());

        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut workers = JoinSet::new();

        for (index, block) in blocks.iter().enumerate() {
            if block.is_complete() {
                debug!(block = index, "Block already complete, skipping");
                continue;
            }

            let uploader = uploader.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();
            let mut progress = block.clone();
            let block_offset = geometry.block_offset(index);
            let block_len = geometry.block_len(index);

            workers.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = permits.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return (index, progress, Err(UploadError::Cancelled));
                };

                let before = progress.clone();
                let outcome = AssertUnwindSafe(uploader.upload_block(
                    index,
                    block_offset,
                    block_len,
                    &mut progress,
                ))
                .catch_unwind()
                .await;

                match outcome {
                    Ok(result) => (index, progress, result),
                    Err(_) => {
                        error!(block = index, "Block worker panicked");
                        (index, before, Err(UploadError::invalid("block worker panicked")))
                    }
                }
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, progress, result)) => {
                    blocks[index] = progress;
                    if let Err(error) = result {
                        failed.push(BlockFailure { block: index, error });
                    }
                }
                Err(e) => error!(error = %e, "Block worker did not finish"),
            }
        }

        for (index, block) in blocks.iter().enumerate() {
            if !block.is_complete() && !failed.iter().any(|f| f.block == index) {
                failed.push(BlockFailure {
                    block: index,
                    error: UploadError::invalid("block worker ended without completing"),
                });
            }
        }

        failed.sort_by_key(|f| f.block);
        failed
    }

    /// Assemble the stored blocks, contexts joined in block order
    async fn commit(
        &self,
        task: &UploadTask,
        blocks: &[BlockProgress],
        cancel: &CancellationToken,
    ) -> UploadResult<serde_json::Value> {
        let body = blocks
            .iter()
            .map(|b| b.context.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let url = self
            .endpoints
            .make_file(&task.target, task.total_size, &task.mime_type);

        let request = TransportRequest::post(url, TEXT_PLAIN, Bytes::from(body));
        let response = execute_cancellable(
            self.transport.as_ref(),
            request,
            self.config.chunk_timeout(),
            cancel,
        )
        .await?;

        if !response.is_success() {
            return Err(UploadError::server(response.status, &response.body));
        }
        if response.body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| UploadError::protocol(format!("Invalid commit response: {}", e)))
    }

    /// Save progress, reporting whether it stuck
    async fn persist(&self, key: &str, blocks: &[BlockProgress]) -> bool {
        match self.progress.save(key, blocks).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist upload progress, resume will start over");
                false
            }
        }
    }
}
