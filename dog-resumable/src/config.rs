use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{UploadError, UploadResult};

/// 4 MiB blocks
pub const DEFAULT_BLOCK_SIZE_EXP: u8 = 22;

/// Smallest block exponent accepted by [`UploadConfig::validate`] (1 KiB)
pub const MIN_BLOCK_SIZE_EXP: u8 = 10;

/// Largest block exponent accepted by [`UploadConfig::validate`] (1 TiB)
pub const MAX_BLOCK_SIZE_EXP: u8 = 40;

/// Configuration for resumable uploads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Block size as a power of two
    pub block_size_exp: u8,

    /// Bytes sent per chunk request
    pub chunk_size: u64,

    /// Retries allowed per chunk before its block fails
    pub max_retries: u32,

    /// Blocks uploaded at the same time
    pub max_concurrency: usize,

    /// Optional per-request timeout; expiry is treated as a transport error
    pub chunk_timeout_ms: Option<u64>,

    /// Status codes that mean "the held block context is no longer valid"
    pub stale_context_statuses: Vec<u16>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_size_exp: DEFAULT_BLOCK_SIZE_EXP,
            chunk_size: 4 * 1024 * 1024, // 4MB
            max_retries: 3,
            max_concurrency: 4,
            chunk_timeout_ms: None,
            stale_context_statuses: vec![701],
        }
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set block size exponent
    pub fn with_block_size_exp(mut self, exp: u8) -> Self {
        self.block_size_exp = exp;
        self
    }

    /// Set chunk size
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the per-chunk retry budget
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the number of concurrent block workers
    pub fn with_max_concurrency(mut self, workers: usize) -> Self {
        self.max_concurrency = workers;
        self
    }

    /// Set a per-request timeout
    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Replace the status codes treated as stale context
    pub fn with_stale_context_statuses<I: IntoIterator<Item = u16>>(mut self, statuses: I) -> Self {
        self.stale_context_statuses = statuses.into_iter().collect();
        self
    }

    /// Block size in bytes
    pub fn block_size(&self) -> u64 {
        1u64 << self.block_size_exp
    }

    pub fn chunk_timeout(&self) -> Option<Duration> {
        self.chunk_timeout_ms.map(Duration::from_millis)
    }

    /// Check the config for values the uploader cannot work with
    pub fn validate(&self) -> UploadResult<()> {
        if !(MIN_BLOCK_SIZE_EXP..=MAX_BLOCK_SIZE_EXP).contains(&self.block_size_exp) {
            return Err(UploadError::invalid(format!(
                "Block size exponent {} out of range ({}-{})",
                self.block_size_exp, MIN_BLOCK_SIZE_EXP, MAX_BLOCK_SIZE_EXP
            )));
        }
        if self.chunk_size == 0 {
            return Err(UploadError::invalid("Chunk size must be greater than zero"));
        }
        if self.max_concurrency == 0 {
            return Err(UploadError::invalid("Concurrency must be at least 1"));
        }
        Ok(())
    }

    /// Build a config from defaults overlaid with environment variables.
    ///
    /// `DOG_UPLOAD__CHUNK_SIZE=1048576` sets `chunk_size` for prefix `DOG_UPLOAD__`.
    /// `stale_context_statuses` takes a comma-separated list.
    pub fn from_env(prefix: &str) -> UploadResult<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    fn from_vars<I>(prefix: &str, vars: I) -> UploadResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();

        for (key, value) in vars {
            let Some(stripped) = key.strip_prefix(prefix) else {
                continue;
            };
            let normalized = stripped.to_lowercase().replace("__", ".");
            let value = value.trim();

            match normalized.as_str() {
                "block_size_exp" => config.block_size_exp = parse_value(&key, value)?,
                "chunk_size" => config.chunk_size = parse_value(&key, value)?,
                "max_retries" => config.max_retries = parse_value(&key, value)?,
                "max_concurrency" => config.max_concurrency = parse_value(&key, value)?,
                "chunk_timeout_ms" => config.chunk_timeout_ms = Some(parse_value(&key, value)?),
                "stale_context_statuses" => {
                    config.stale_context_statuses = value
                        .split(',')
                        .filter(|s| !s.trim().is_empty())
                        .map(|s| parse_value(&key, s.trim()))
                        .collect::<UploadResult<_>>()?;
                }
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> UploadResult<T> {
    value
        .parse()
        .map_err(|_| UploadError::invalid(format!("Invalid value for {}: {:?}", key, value)))
}
