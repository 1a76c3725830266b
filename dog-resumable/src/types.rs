use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_BLOCK_SIZE_EXP;

/// Identifier of the destination object, e.g. `"bucket:key"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(pub String);

impl TargetId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TargetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One logical transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub target: TargetId,
    pub mime_type: String,
    pub total_size: u64,
    pub block_size_exp: u8,
}

impl UploadTask {
    pub fn new<T: Into<TargetId>>(target: T, total_size: u64) -> Self {
        Self {
            target: target.into(),
            mime_type: "application/octet-stream".to_string(),
            total_size,
            block_size_exp: DEFAULT_BLOCK_SIZE_EXP,
        }
    }

    pub fn with_mime_type<S: Into<String>>(mut self, mime_type: S) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_block_size_exp(mut self, exp: u8) -> Self {
        self.block_size_exp = exp;
        self
    }

    pub fn geometry(&self) -> BlockGeometry {
        BlockGeometry::new(self.total_size, self.block_size_exp)
    }

    /// Key under which this task's progress is persisted
    pub fn progress_key(&self) -> String {
        crate::progress::progress_key(&self.target, self.total_size)
    }
}

/// How a payload of `total_size` bytes splits into power-of-two blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    total_size: u64,
    block_size_exp: u8,
}

impl BlockGeometry {
    pub fn new(total_size: u64, block_size_exp: u8) -> Self {
        Self {
            total_size,
            block_size_exp,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Size of every block but the last
    pub fn block_size(&self) -> u64 {
        1u64 << self.block_size_exp
    }

    pub fn block_count(&self) -> usize {
        self.total_size.div_ceil(self.block_size()) as usize
    }

    /// Offset of block `index` within the content
    pub fn block_offset(&self, index: usize) -> u64 {
        (index as u64) << self.block_size_exp
    }

    /// Length of block `index`; zero past the end
    pub fn block_len(&self, index: usize) -> u64 {
        let start = self.block_offset(index);
        if start >= self.total_size {
            return 0;
        }
        (self.total_size - start).min(self.block_size())
    }
}

/// Resumable state of one block
///
/// An empty `context` means the block has not been negotiated yet. Once it has,
/// `offset + rest_size` equals the block length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockProgress {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub rest_size: u64,
    #[serde(default)]
    pub checksum: String,
}

impl BlockProgress {
    /// A block that has already been negotiated and partially (or fully) sent
    pub fn negotiated<S: Into<String>>(context: S, offset: u64, rest_size: u64) -> Self {
        Self {
            context: context.into(),
            offset,
            rest_size,
            checksum: String::new(),
        }
    }

    pub fn is_negotiated(&self) -> bool {
        !self.context.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.is_negotiated() && self.rest_size == 0
    }

    /// Forget the server context and start the block over
    pub fn reset(&mut self, block_len: u64) {
        self.context.clear();
        self.checksum.clear();
        self.offset = 0;
        self.rest_size = block_len;
    }

    /// Whether this record describes a block of `block_len` bytes
    pub fn is_consistent(&self, block_len: u64) -> bool {
        if !self.is_negotiated() {
            return true;
        }
        self.offset.checked_add(self.rest_size) == Some(block_len)
    }
}

/// Server reply to a negotiate or append call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub ctx: String,
    #[serde(default)]
    pub checksum: String,
    pub crc32: u32,
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<i64>,
}

/// Outcome of a committed upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub target: TargetId,
    pub total_size: u64,
    pub blocks: usize,
    /// Blocks skipped because a previous run had already completed them
    pub resumed_blocks: usize,
    pub hash: Option<String>,
    pub key: Option<String>,
    /// Everything the server returned from the commit call
    pub response: serde_json::Value,
}
