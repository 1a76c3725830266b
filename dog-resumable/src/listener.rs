use crate::{BlockProgress, UploadError};

/// Observer for per-block upload events.
///
/// Callbacks run on the block's worker task and should return quickly.
pub trait UploadListener: Send + Sync {
    /// A chunk was acknowledged; `progress` is the block's state after it
    fn on_chunk_uploaded(&self, _block: usize, _progress: &BlockProgress) {}

    /// A chunk attempt failed and will be retried if budget remains
    fn on_chunk_failed(&self, _block: usize, _error: &UploadError) {}

    /// The block's context went stale and the block starts over
    fn on_block_restarted(&self, _block: usize) {}

    fn on_block_completed(&self, _block: usize) {}
}

/// Listener that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl UploadListener for NoopListener {}
