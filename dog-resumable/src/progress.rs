use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{BlockProgress, TargetId, UploadResult};

/// Key for the persisted progress of a (target, total size) pair.
///
/// Different content of the same size uploaded to the same target shares a key.
pub fn progress_key(target: &TargetId, total_size: u64) -> String {
    format!("{}{}", target.as_str(), total_size)
}

/// Storage for per-block upload progress
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Load a record; missing or unreadable records are `None`
    async fn load(&self, key: &str) -> Option<Vec<BlockProgress>>;

    /// Overwrite the record for `key`
    async fn save(&self, key: &str, blocks: &[BlockProgress]) -> UploadResult<()>;

    /// Remove the record for `key`, if any
    async fn delete(&self, key: &str) -> UploadResult<()>;
}

/// Persisted form of a task's progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub blocks: Vec<BlockProgress>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredProgress {
    Record(ProgressRecord),
    Bare(Vec<BlockProgress>),
}

impl ProgressRecord {
    pub fn new(blocks: Vec<BlockProgress>) -> Self {
        Self {
            blocks,
            updated_at: Utc::now(),
        }
    }

    /// Parse either a full record or a bare block array
    pub fn parse(bytes: &[u8]) -> UploadResult<Vec<BlockProgress>> {
        Ok(match serde_json::from_slice(bytes)? {
            StoredProgress::Record(record) => record.blocks,
            StoredProgress::Bare(blocks) => blocks,
        })
    }
}

/// In-memory progress store
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: Mutex<HashMap<String, ProgressRecord>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn load(&self, key: &str) -> Option<Vec<BlockProgress>> {
        self.records.lock().get(key).map(|r| r.blocks.clone())
    }

    async fn save(&self, key: &str, blocks: &[BlockProgress]) -> UploadResult<()> {
        self.records
            .lock()
            .insert(key.to_string(), ProgressRecord::new(blocks.to_vec()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> UploadResult<()> {
        self.records.lock().remove(key);
        Ok(())
    }
}

/// Progress store keeping one JSON file per key in a directory
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `key`, named by the SHA-256 of the key so any key fits
    pub fn record_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir
            .join(format!("{}.progress.json", hex::encode(digest)))
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn load(&self, key: &str) -> Option<Vec<BlockProgress>> {
        let path = self.record_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable progress record, starting fresh");
                return None;
            }
        };

        match ProgressRecord::parse(&bytes) {
            Ok(blocks) => Some(blocks),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt progress record, starting fresh");
                None
            }
        }
    }

    async fn save(&self, key: &str, blocks: &[BlockProgress]) -> UploadResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.record_path(key);
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        let json = serde_json::to_vec_pretty(&ProgressRecord::new(blocks.to_vec()))?;

        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(path = %path.display(), blocks = blocks.len(), "Saved upload progress");
        Ok(())
    }

    async fn delete(&self, key: &str) -> UploadResult<()> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
