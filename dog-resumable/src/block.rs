use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::{
    listener::NoopListener,
    transport::{execute_cancellable, OCTET_STREAM},
    BlockProgress, ChunkReceipt, ChunkTransport, ContentSource, StaleContextPolicy,
    StatusCodePolicy, TransportRequest, UploadConfig, UploadEndpoints, UploadError, UploadListener,
    UploadResult,
};

/// Drives one block through negotiate, append and completion.
///
/// A stale context sends the block back to the start without touching the retry
/// budget. Transport errors, bad responses and checksum mismatches resend the same
/// chunk until `max_retries` is spent.
#[derive(Clone)]
pub struct BlockUploader {
    transport: Arc<dyn ChunkTransport>,
    source: Arc<dyn ContentSource>,
    endpoints: Arc<UploadEndpoints>,
    stale_policy: Arc<dyn StaleContextPolicy>,
    listener: Arc<dyn UploadListener>,
    chunk_size: u64,
    max_retries: u32,
    chunk_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl BlockUploader {
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        source: Arc<dyn ContentSource>,
        endpoints: Arc<UploadEndpoints>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            transport,
            source,
            endpoints,
            stale_policy: Arc::new(StatusCodePolicy::new(
                config.stale_context_statuses.iter().copied(),
            )),
            listener: Arc::new(NoopListener),
            chunk_size: config.chunk_size,
            max_retries: config.max_retries,
            chunk_timeout: config.chunk_timeout(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_stale_policy(mut self, policy: Arc<dyn StaleContextPolicy>) -> Self {
        self.stale_policy = policy;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn UploadListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Upload block `index`, which covers `block_len` bytes of the source starting at
    /// `block_offset`, resuming from whatever `progress` already records.
    ///
    /// `progress` is updated after every acknowledged chunk, so it is accurate even
    /// when this returns an error.
    #[instrument(skip(self, progress), fields(context = %progress.context))]
    pub async fn upload_block(
        &self,
        index: usize,
        block_offset: u64,
        block_len: u64,
        progress: &mut BlockProgress,
    ) -> UploadResult<()> {
        if !progress.is_negotiated() {
            progress.reset(block_len);
        }

        let mut retries_left = self.max_retries;
        let mut attempts = 0u32;

        while progress.rest_size > 0 {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let chunk_len = self.chunk_size.min(progress.rest_size);
            let data = self
                .read_chunk(block_offset + progress.offset, chunk_len)
                .await?;
            let crc = crc32fast::hash(&data);

            let negotiating = !progress.is_negotiated();
            let url = if negotiating {
                self.endpoints.make_block(progress.rest_size)
            } else {
                self.endpoints.put_chunk(&progress.context, progress.offset)
            };

            let failure = match self.send_chunk(index, url, data, negotiating).await {
                Ok(receipt) if receipt.crc32 == crc => {
                    progress.context = receipt.ctx;
                    progress.checksum = receipt.checksum;
                    progress.offset += chunk_len;
                    progress.rest_size -= chunk_len;
                    retries_left = self.max_retries;
                    attempts = 0;

                    debug!(
                        block = index,
                        offset = progress.offset,
                        rest = progress.rest_size,
                        "Chunk acknowledged"
                    );
                    self.listener.on_chunk_uploaded(index, progress);
                    continue;
                }
                Ok(receipt) => UploadError::ChecksumMismatch {
                    block: index,
                    offset: progress.offset,
                    expected: crc,
                    actual: receipt.crc32,
                },
                Err(UploadError::StaleContext { status, .. }) => {
                    warn!(block = index, status, offset = progress.offset, "Block context is stale, restarting block");
                    progress.reset(block_len);
                    retries_left = self.max_retries;
                    attempts = 0;
                    self.listener.on_block_restarted(index);
                    continue;
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            attempts += 1;
            self.listener.on_chunk_failed(index, &failure);

            if retries_left == 0 {
                error!(block = index, attempts, error = %failure, "Block failed, retries exhausted");
                return Err(UploadError::RetryExhausted {
                    block: index,
                    attempts,
                    source: Box::new(failure),
                });
            }

            retries_left -= 1;
            warn!(
                block = index,
                offset = progress.offset,
                retries_left,
                error = %failure,
                "Chunk failed, retrying"
            );
        }

        self.listener.on_block_completed(index);
        Ok(())
    }

    async fn read_chunk(&self, offset: u64, len: u64) -> UploadResult<Bytes> {
        let data = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
            data = self.source.read_range(offset, len) => data?,
        };

        if data.len() as u64 != len {
            return Err(UploadError::invalid(format!(
                "Short read at offset {}: wanted {} bytes, got {}",
                offset,
                len,
                data.len()
            )));
        }
        Ok(data)
    }

    async fn send_chunk(
        &self,
        index: usize,
        url: String,
        body: Bytes,
        negotiating: bool,
    ) -> UploadResult<ChunkReceipt> {
        let request = TransportRequest::post(url, OCTET_STREAM, body);
        let response = execute_cancellable(
            self.transport.as_ref(),
            request,
            self.chunk_timeout,
            &self.cancel,
        )
        .await?;

        if response.is_success() {
            return serde_json::from_slice(&response.body)
                .map_err(|e| UploadError::protocol(format!("Invalid chunk response: {}", e)));
        }

        // Only a held context can go stale; a failing negotiate stays bounded.
        if !negotiating && self.stale_policy.is_stale(response.status, &response.body) {
            return Err(UploadError::StaleContext {
                block: index,
                status: response.status,
            });
        }

        Err(UploadError::server(response.status, &response.body))
    }
}
