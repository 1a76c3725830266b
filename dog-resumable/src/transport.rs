use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{TargetId, UploadError, UploadResult};

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TEXT_PLAIN: &str = "text/plain";

/// HTTP method of a transport request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
        }
    }
}

/// One signed request against the upload service
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl TransportRequest {
    pub fn post(url: String, content_type: &'static str, body: Bytes) -> Self {
        Self {
            method: Method::Post,
            url,
            content_type,
            body,
        }
    }

    pub fn body_len(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Raw status and body returned by the service
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new<B: Into<Bytes>>(status: u16, body: B) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes signed HTTP calls for chunk, block and commit requests.
///
/// Any status code is returned as a response; `Err` is reserved for failures to
/// reach the server at all (use [`crate::UploadError::transport`]).
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> UploadResult<TransportResponse>;
}

/// Run one request, giving up on timeout or cancellation
pub(crate) async fn execute_cancellable(
    transport: &dyn ChunkTransport,
    request: TransportRequest,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> UploadResult<TransportResponse> {
    let call = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, transport.execute(request))
                .await
                .map_err(UploadError::transport)?,
            None => transport.execute(request).await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        result = call => result,
    }
}

/// Decides whether an error response means the held block context has expired
pub trait StaleContextPolicy: Send + Sync {
    fn is_stale(&self, status: u16, body: &[u8]) -> bool;
}

impl<F> StaleContextPolicy for F
where
    F: Fn(u16, &[u8]) -> bool + Send + Sync,
{
    fn is_stale(&self, status: u16, body: &[u8]) -> bool {
        self(status, body)
    }
}

/// Treats a fixed set of status codes as stale context
#[derive(Debug, Clone, Default)]
pub struct StatusCodePolicy {
    statuses: Vec<u16>,
}

impl StatusCodePolicy {
    pub fn new<I: IntoIterator<Item = u16>>(statuses: I) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
        }
    }
}

impl StaleContextPolicy for StatusCodePolicy {
    fn is_stale(&self, status: u16, _body: &[u8]) -> bool {
        self.statuses.contains(&status)
    }
}

/// Builds request URLs for the block upload endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEndpoints {
    host: String,
}

impl UploadEndpoints {
    pub fn new<S: Into<String>>(host: S) -> Self {
        let host = host.into();
        Self {
            host: host.trim_end_matches('/').to_string(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Create a block of `block_size` bytes; the body is its first chunk
    pub fn make_block(&self, block_size: u64) -> String {
        format!("{}/mkblk/{}", self.host, block_size)
    }

    /// Append a chunk to the block identified by `context`
    pub fn put_chunk(&self, context: &str, offset: u64) -> String {
        format!("{}/bput/{}/{}", self.host, context, offset)
    }

    /// Assemble completed blocks into the target object
    pub fn make_file(&self, target: &TargetId, total_size: u64, mime_type: &str) -> String {
        format!(
            "{}/mkfile/{}/fsize/{}/mimeType/{}",
            self.host,
            URL_SAFE.encode(target.as_str()),
            total_size,
            URL_SAFE.encode(mime_type)
        )
    }
}
