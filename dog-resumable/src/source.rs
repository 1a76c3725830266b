use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{UploadError, UploadResult};

/// Size-bounded, randomly readable content
///
/// Implementations must tolerate concurrent reads at independent offsets.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Total length in bytes
    fn size(&self) -> u64;

    /// Read exactly `len` bytes starting at `offset`
    async fn read_range(&self, offset: u64, len: u64) -> UploadResult<Bytes>;
}

/// Content held in memory
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new<B: Into<Bytes>>(data: B) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, offset: u64, len: u64) -> UploadResult<Bytes> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.size())
            .ok_or_else(|| {
                UploadError::invalid(format!(
                    "Range {}+{} exceeds content size {}",
                    offset,
                    len,
                    self.size()
                ))
            })?;
        Ok(self.data.slice(offset as usize..end as usize))
    }
}

/// A file on disk read with positional I/O
#[derive(Debug, Clone)]
pub struct FileSource {
    file: Arc<std::fs::File>,
    size: u64,
}

impl FileSource {
    /// Open `path` and capture its current length
    pub async fn open<P: AsRef<Path>>(path: P) -> UploadResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, size) = tokio::task::spawn_blocking(move || -> std::io::Result<_> {
            let file = std::fs::File::open(&path)?;
            let size = file.metadata()?.len();
            Ok((file, size))
        })
        .await
        .map_err(|e| UploadError::Io {
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })??;

        Ok(Self {
            file: Arc::new(file),
            size,
        })
    }
}

#[async_trait]
impl ContentSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, offset: u64, len: u64) -> UploadResult<Bytes> {
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(UploadError::invalid(format!(
                "Range {}+{} exceeds file size {}",
                offset, len, self.size
            )));
        }

        let file = self.file.clone();
        let buf = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut buf = vec![0u8; len as usize];
            read_exact_at(&file, &mut buf, offset)?;
            Ok(buf)
        })
        .await
        .map_err(|e| UploadError::Io {
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })??;

        Ok(Bytes::from(buf))
    }
}

#[cfg(unix)]
fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &std::fs::File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn memory_source_slices() {
        let source = MemorySource::new(&b"hello, world"[..]);
        assert_eq!(source.size(), 12);
        assert_eq!(source.read_range(7, 5).await.unwrap(), Bytes::from_static(b"world"));
        assert!(source.read_range(10, 5).await.is_err());
        assert!(source.read_range(u64::MAX, 2).await.is_err());
    }

    #[tokio::test]
    async fn file_source_reads_concurrently() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let source = Arc::new(FileSource::open(file.path()).await.unwrap());
        assert_eq!(source.size(), 4096);

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                (i, source.read_range(i * 512, 512).await.unwrap())
            }));
        }
        for handle in handles {
            let (i, chunk) = handle.await.unwrap();
            let start = (i * 512) as usize;
            assert_eq!(&chunk[..], &data[start..start + 512]);
        }

        assert!(source.read_range(4000, 200).await.is_err());
    }
}
