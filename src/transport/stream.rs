//! Bounded-memory streaming helpers / 流式读写工具
//!
//! Part bodies are read from disk through a fixed buffer; downloads land in a
//! guarded file that disappears unless the transfer completes.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::{Body, Response};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use crate::error::{Result, StorageError};

/// Fixed I/O buffer per stream / 固定缓冲区大小
pub const IO_BUFFER: usize = 64 * 1024;

/// Stream `len` bytes of `path` starting at `offset` as a request body
pub async fn file_part_body(path: &Path, offset: u64, len: u64) -> Result<Body> {
    let mut file = File::open(path)
        .await
        .map_err(|e| StorageError::from(e).context(path.display()))?;
    if offset > 0 {
        file.seek(std::io::SeekFrom::Start(offset)).await?;
    }
    let stream = ReaderStream::with_capacity(file.take(len), IO_BUFFER);
    Ok(Body::wrap_stream(stream))
}

/// Read exactly one part into memory (for SDKs that take owned buffers)
pub async fn read_part(file: &mut File, len: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Download target staged in `<dst>.part` and renamed over `dst` on commit / 下载目标文件守卫
///
/// `dst` is not touched until the transfer completes; the staging file is
/// removed on drop unless committed.
pub struct PartialFile {
    target: PathBuf,
    staging: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl PartialFile {
    /// Create the staging file next to `path`; the parent must exist
    pub async fn create(path: &Path) -> Result<Self> {
        let staging = staging_path(path)?;
        let file = File::create(&staging)
            .await
            .map_err(|e| StorageError::from(e).context(staging.display()))?;
        Ok(Self {
            target: path.to_path_buf(),
            staging,
            file: Some(file),
            committed: false,
        })
    }

    /// Final destination / 最终路径
    pub fn path(&self) -> &Path {
        &self.target
    }

    pub fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| StorageError::new(crate::error::ErrorKind::LocalIoError, "download target already closed"))
    }

    /// Copy an HTTP response body into the file / 写入响应体
    pub async fn write_response(&mut self, resp: Response) -> Result<u64> {
        let file = self.file_mut()?;
        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    /// Copy any async reader into the file / 写入任意读取器
    pub async fn write_reader<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<u64> {
        let file = self.file_mut()?;
        let mut buffered = tokio::io::BufReader::with_capacity(IO_BUFFER, reader);
        Ok(tokio::io::copy_buf(&mut buffered, file).await?)
    }

    /// Flush, then move the staging file over the destination / 提交
    pub async fn commit(mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&self.staging, &self.target)
            .await
            .map_err(|e| StorageError::from(e).context(self.target.display()))?;
        self.committed = true;
        Ok(())
    }
}

fn staging_path(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| StorageError::invalid_path(format!("{} has no file name", path.display())))?;
    let mut staged = name.to_os_string();
    staged.push(".part");
    Ok(path.with_file_name(staged))
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.file.take();
        if let Err(e) = std::fs::remove_file(&self.staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove partial download {:?}: {}", self.staging, e);
            }
        } else {
            tracing::debug!("removed partial download {:?}", self.staging);
        }
    }
}
