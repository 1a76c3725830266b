use thiserror::Error;

use crate::BlockProgress;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors that can occur while uploading blocks or committing the object
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Transport error: {source}")]
    Transport {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Server returned status {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Malformed server response: {message}")]
    Protocol { message: String },

    #[error("Checksum mismatch for block {block} at offset {offset}: local crc32 {expected:#010x}, server crc32 {actual:#010x}")]
    ChecksumMismatch {
        block: usize,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("Context for block {block} is no longer valid (status {status})")]
    StaleContext { block: usize, status: u16 },

    #[error("Block {block} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        block: usize,
        attempts: u32,
        #[source]
        source: Box<UploadError>,
    },

    #[error("All blocks are stored but commit failed: {source}")]
    FinalizeFailed {
        #[source]
        source: Box<UploadError>,
        progress: Vec<BlockProgress>,
    },

    #[error("Upload incomplete: {} of {} blocks failed", failed.len(), progress.len())]
    Incomplete {
        failed: Vec<BlockFailure>,
        progress: Vec<BlockProgress>,
        persisted: bool,
    },

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// Terminal failure of a single block within a run
#[derive(Debug)]
pub struct BlockFailure {
    pub block: usize,
    pub error: UploadError,
}

impl UploadError {
    /// Create a transport error from any error type
    pub fn transport<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            source: Box::new(error),
        }
    }

    /// Create a server error from a status code and raw response body
    pub fn server(status: u16, body: &[u8]) -> Self {
        Self::Server {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Whether this error counts against a block's bounded retry budget
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Server { .. }
                | Self::Protocol { .. }
                | Self::ChecksumMismatch { .. }
        )
    }

    /// Whether a later run with the same task can pick up where this one stopped
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Incomplete { .. } | Self::FinalizeFailed { .. } | Self::Cancelled
        )
    }

    /// Block progress captured when the run stopped, if any
    pub fn progress(&self) -> Option<&[BlockProgress]> {
        match self {
            Self::Incomplete { progress, .. } | Self::FinalizeFailed { progress, .. } => {
                Some(progress)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for BlockFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block {}: {}", self.block, self.error)
    }
}
