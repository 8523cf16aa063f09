//! Client handle: one driver plus the cross-driver contract / 存储句柄

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::error::{ErrorKind, Result, StorageError};
use crate::transport::{OperationTimeouts, TokenPhase};
use crate::utils::ObjectPath;

use super::{Capability, ProviderTag, StorageDriver, UploadSource};

/// Provider-bound handle returned by the factory / 由工厂创建的句柄
///
/// Safe to share across tasks; independent operations run concurrently.
pub struct Client {
    tag: ProviderTag,
    driver: Box<dyn StorageDriver>,
    timeouts: OperationTimeouts,
}

impl Client {
    pub(crate) fn new(tag: ProviderTag, driver: Box<dyn StorageDriver>, timeouts: OperationTimeouts) -> Self {
        Self { tag, driver, timeouts }
    }

    pub fn tag(&self) -> ProviderTag {
        self.tag
    }

    pub fn capabilities(&self) -> Capability {
        self.driver.capabilities()
    }

    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        self.control("list buckets", self.driver.list_buckets()).await
    }

    /// Names directly under `prefix`; a missing prefix lists as empty / 列出目录
    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = ObjectPath::parse(prefix)?;
        match self.control("list objects", self.driver.list_objects(&prefix)).await {
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    /// Never fails for a missing object / 不存在时返回 false
    pub async fn exist(&self, path: &str) -> Result<bool> {
        let path = ObjectPath::parse(path)?;
        match self.control("exist", self.driver.exist(&path)).await {
            Err(e) if e.is_not_found() => Ok(false),
            other => other,
        }
    }

    pub async fn size(&self, path: &str) -> Result<u64> {
        let path = ObjectPath::parse(path)?;
        self.control("size", self.driver.size(&path)).await
    }

    /// Upload one local file / 上传文件
    pub async fn upload(&self, src: impl AsRef<Path>, dst: &str) -> Result<bool> {
        let dst = ObjectPath::parse(dst)?;
        if dst.is_root() {
            return Err(StorageError::invalid_path("upload destination is the account root"));
        }
        let src = UploadSource::open(src.as_ref()).await?;
        tracing::debug!("[{}] upload {:?} ({} bytes) -> {}", self.tag, src.path, src.size, dst);

        self.transfer("upload", self.driver.upload(&src, &dst)).await?;
        tracing::info!("[{}] uploaded {} ({} bytes)", self.tag, dst, src.size);
        Ok(true)
    }

    /// Download to a local file; a failed transfer leaves no file behind / 下载文件
    pub async fn download(&self, src: &str, dst: impl AsRef<Path>) -> Result<bool> {
        let src = ObjectPath::parse(src)?;
        if src.is_root() {
            return Err(StorageError::invalid_path("download source is the account root"));
        }
        let dst = dst.as_ref();
        if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from(e).context(parent.display()))?;
        }
        tracing::debug!("[{}] download {} -> {:?}", self.tag, src, dst);

        self.transfer("download", self.driver.download(&src, dst)).await?;
        tracing::info!("[{}] downloaded {}", self.tag, src);
        Ok(true)
    }

    /// Idempotent: a missing path is already deleted / 幂等删除
    pub async fn delete(&self, path: &str) -> Result<bool> {
        let path = ObjectPath::parse(path)?;
        if path.is_root() {
            return Err(StorageError::invalid_path("refusing to delete the account root"));
        }
        match self.control("delete", self.driver.delete(&path)).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => {
                tracing::debug!("[{}] delete {}: already absent", self.tag, path);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh token currently held by the handle, rotations included
    pub async fn current_refresh_token(&self) -> Option<String> {
        match self.driver.tokens() {
            Some(tokens) => Some(tokens.refresh_token().await),
            None => None,
        }
    }

    pub fn token_phase(&self) -> Option<TokenPhase> {
        self.driver.tokens().map(|t| t.phase())
    }

    /// Leave the terminal `Failed` token state so the next call refreshes again
    pub fn retry_auth(&self) -> bool {
        self.driver.tokens().map(|t| t.retry()).unwrap_or(false)
    }

    async fn control<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_deadline(op, self.timeouts.control, fut).await
    }

    async fn transfer<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_deadline(op, self.timeouts.transfer, fut).await
    }
}

/// Dropping the inner future cancels in-flight requests and fires cleanup guards
async fn with_deadline<T>(op: &str, deadline: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::new(
            ErrorKind::Timeout,
            format!("{} exceeded {:?}", op, deadline),
        )),
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("tag", &self.tag)
            .field("driver", &self.driver.name())
            .finish()
    }
}
