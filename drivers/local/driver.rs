use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, Result, StorageError};
use crate::storage::account::require;
use crate::storage::{Capability, ProviderTag, StorageDriver, UploadSource};
use crate::transport::PartialFile;
use crate::utils::ObjectPath;

/// 本地存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// 根目录（绝对路径）
    pub path: String,
}

impl LocalConfig {
    pub fn validate(&self) -> Result<()> {
        require(ProviderTag::Local, "path", &self.path)?;
        if !Path::new(&self.path).is_absolute() {
            return Err(StorageError::invalid_config(format!(
                "LOCAL config: path must be absolute, got {}",
                self.path
            )));
        }
        Ok(())
    }
}

pub struct LocalDriver {
    root: PathBuf,
}

impl LocalDriver {
    /// 根目录不存在时自动创建
    pub async fn connect(config: LocalConfig) -> Result<Self> {
        let root = PathBuf::from(&config.path);
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| fs_error(e, &root))?;
        tracing::debug!("local storage root: {:?}", root);
        Ok(Self { root })
    }

    /// 对象路径已规范化，直接拼接到根目录下
    fn full_path(&self, path: &ObjectPath) -> PathBuf {
        path.segments().iter().fold(self.root.clone(), |acc, s| acc.join(s))
    }
}

/// 本地 IO 错误：不存在/无权限按远端语义处理，其余为 LocalIOError
///
/// A path running through a regular file (ENOTDIR) does not exist either.
fn fs_error(e: std::io::Error, path: &Path) -> StorageError {
    let kind = match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory => ErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => ErrorKind::LocalIoError,
    };
    StorageError::new(kind, format!("{}: {}", path.display(), e))
}

/// 源文件与目标是否为同一文件
async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    fn name(&self) -> &str {
        "local"
    }

    fn capabilities(&self) -> Capability {
        Capability::default()
    }

    async fn list_objects(&self, prefix: &ObjectPath) -> Result<Vec<String>> {
        let dir = self.full_path(prefix);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| fs_error(e, &dir))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| fs_error(e, &dir))? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn exist(&self, path: &ObjectPath) -> Result<bool> {
        let full = self.full_path(path);
        tokio::fs::try_exists(&full).await.map_err(|e| fs_error(e, &full))
    }

    async fn size(&self, path: &ObjectPath) -> Result<u64> {
        let full = self.full_path(path);
        let meta = tokio::fs::metadata(&full).await.map_err(|e| fs_error(e, &full))?;
        if meta.is_dir() {
            return Err(StorageError::not_found(format!("{} is a directory", path)));
        }
        Ok(meta.len())
    }

    async fn upload(&self, src: &UploadSource, dst: &ObjectPath) -> Result<()> {
        let target = self.full_path(dst);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| fs_error(e, parent))?;
        }
        if same_file(&src.path, &target).await {
            return Err(StorageError::invalid_path(format!(
                "{} is already stored at {}",
                src.path.display(),
                dst
            )));
        }
        // 先写入 .part 文件，成功后再替换目标
        let mut partial = PartialFile::create(&target).await?;
        let mut file = src.open_file().await?;
        let written = partial.write_reader(&mut file).await?;
        if written != src.size {
            return Err(StorageError::new(
                ErrorKind::PartialTransfer,
                format!("wrote {} of {} bytes to {}", written, src.size, dst),
            ));
        }
        partial.commit().await
    }

    async fn download(&self, src: &ObjectPath, dst: &Path) -> Result<()> {
        let source = self.full_path(src);
        let mut file = tokio::fs::File::open(&source)
            .await
            .map_err(|e| fs_error(e, &source))?;
        let mut partial = PartialFile::create(dst).await?;
        partial.write_reader(&mut file).await?;
        partial.commit().await
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        let full = self.full_path(path);
        let meta = tokio::fs::symlink_metadata(&full).await.map_err(|e| fs_error(e, &full))?;
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        removed.map_err(|e| fs_error(e, &full))
    }
}
