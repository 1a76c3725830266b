//! # dog-resumable: Resumable block uploads
//!
//! `dog-resumable` uploads large payloads to block-based object storage APIs that
//! hand out a server-side *context* per block. Content is split into power-of-two
//! blocks, each block is sent as a series of CRC32-checked chunks, blocks upload in
//! parallel, and the object is assembled by a final commit call.
//!
//! ## Key Features
//!
//! - **Resumable**: per-block progress is persisted when a run fails, and the next run
//!   skips acknowledged bytes
//! - **Self-healing blocks**: an expired context restarts only its block; network errors
//!   and checksum mismatches resend the same chunk within a bounded budget
//! - **Bounded concurrency**: a semaphore caps how many blocks are in flight
//! - **Cancellable**: a `CancellationToken` aborts in-flight calls and both retry loops
//! - **Transport agnostic**: bring any signed HTTP client through [`ChunkTransport`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_resumable::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(transport: impl ChunkTransport + 'static) -> UploadResult<()> {
//! let uploader = ResumableUploader::new(
//!     transport,
//!     FileProgressStore::new("/var/lib/myapp/uploads"),
//!     UploadEndpoints::new("https://upload.example.com"),
//!     UploadConfig::default().with_max_concurrency(8),
//! );
//!
//! let data = vec![0u8; 10 * 1024 * 1024];
//! let task = uploader
//!     .task("videos:intro.mp4", data.len() as u64)
//!     .with_mime_type("video/mp4");
//!
//! match uploader.upload(&task, Arc::new(MemorySource::new(data)), CancellationToken::new()).await {
//!     Ok(receipt) => println!("stored {:?}", receipt.hash),
//!     Err(e) if e.is_resumable() => println!("run again later to resume: {}", e),
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │ ResumableUploader  │  ← partition, fan-out, fan-in, commit
//! ├────────────────────┤
//! │   BlockUploader    │  ← negotiate → append → (retry | restart) → complete
//! ├────────────────────┤
//! │ ContentSource      │  ChunkTransport  │  ProgressStore
//! └────────────────────┘
//! ```

mod block;
mod config;
mod coordinator;
mod error;
mod listener;
pub mod progress;
mod source;
pub mod transport;
mod types;

// Re-export main types for clean API
pub use block::BlockUploader;
pub use config::{UploadConfig, DEFAULT_BLOCK_SIZE_EXP, MAX_BLOCK_SIZE_EXP, MIN_BLOCK_SIZE_EXP};
pub use coordinator::ResumableUploader;
pub use error::{BlockFailure, UploadError, UploadResult};
pub use listener::{NoopListener, UploadListener};
pub use progress::{
    progress_key, FileProgressStore, MemoryProgressStore, ProgressRecord, ProgressStore,
};
pub use source::{ContentSource, FileSource, MemorySource};
pub use transport::{
    ChunkTransport, Method, StaleContextPolicy, StatusCodePolicy, TransportRequest,
    TransportResponse, UploadEndpoints,
};
pub use types::{
    BlockGeometry, BlockProgress, ChunkReceipt, CommitReceipt, TargetId, UploadTask,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ChunkTransport, ContentSource, FileProgressStore, FileSource, MemoryProgressStore,
        MemorySource, ProgressStore, ResumableUploader, TransportRequest, TransportResponse,
        UploadConfig, UploadEndpoints, UploadError, UploadResult, UploadTask,
    };
}
