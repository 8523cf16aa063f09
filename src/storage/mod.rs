use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, StorageError};
use crate::transport::{resolver, token, OperationTimeouts, TokenManager, TokenStore};
use crate::utils::ObjectPath;

/// Provider tags, exact wire strings / 存储类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderTag {
    #[serde(rename = "LOCAL")]
    Local,
    #[serde(rename = "S3")]
    S3,
    #[serde(rename = "MINIO")]
    MinIo,
    #[serde(rename = "OSS")]
    Oss,
    #[serde(rename = "COS")]
    Cos,
    #[serde(rename = "KODO")]
    Kodo,
    #[serde(rename = "SFTP")]
    Sftp,
    #[serde(rename = "WEBDAV")]
    WebDav,
    #[serde(rename = "ONEDRIVE")]
    OneDrive,
    #[serde(rename = "GOOGLE")]
    GoogleDrive,
    #[serde(rename = "ALIYUN")]
    Aliyun,
    #[serde(rename = "UPYUN")]
    Upyun,
}

impl ProviderTag {
    pub const ALL: [ProviderTag; 12] = [
        ProviderTag::Local,
        ProviderTag::S3,
        ProviderTag::MinIo,
        ProviderTag::Oss,
        ProviderTag::Cos,
        ProviderTag::Kodo,
        ProviderTag::Sftp,
        ProviderTag::WebDav,
        ProviderTag::OneDrive,
        ProviderTag::GoogleDrive,
        ProviderTag::Aliyun,
        ProviderTag::Upyun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTag::Local => "LOCAL",
            ProviderTag::S3 => "S3",
            ProviderTag::MinIo => "MINIO",
            ProviderTag::Oss => "OSS",
            ProviderTag::Cos => "COS",
            ProviderTag::Kodo => "KODO",
            ProviderTag::Sftp => "SFTP",
            ProviderTag::WebDav => "WEBDAV",
            ProviderTag::OneDrive => "ONEDRIVE",
            ProviderTag::GoogleDrive => "GOOGLE",
            ProviderTag::Aliyun => "ALIYUN",
            ProviderTag::Upyun => "UPYUN",
        }
    }

    /// Refresh-token based providers / 使用 refresh_token 的存储
    pub fn is_oauth(&self) -> bool {
        matches!(self, ProviderTag::OneDrive | ProviderTag::GoogleDrive | ProviderTag::Aliyun)
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderTag {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        ProviderTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| StorageError::new(ErrorKind::UnsupportedProvider, format!("unsupported provider: {}", s)))
    }
}

/// Driver capability declaration / 驱动能力声明
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Capability {
    /// Addresses files by opaque IDs / 通过 ID 寻址
    pub drive_style: bool,
    /// Requires OAuth refresh tokens / 需要OAuth认证
    pub requires_oauth: bool,
    /// Chunked upload protocol / 支持分片上传
    pub can_multipart_upload: bool,
    /// Backend exposes an abort primitive for multipart uploads / 支持中止分片上传
    pub can_abort_upload: bool,
    /// Colliding names are renamed by the server instead of overwritten / 同名自动重命名
    pub auto_rename: bool,
    /// Part size used for uploads (None: single stream) / 分片大小
    pub part_size: Option<u64>,
    /// Largest downloadable object (None means no limit) / 最大下载大小
    pub max_download_size: Option<u64>,
}

/// Local upload source, already stat'ed / 本地上传源
#[derive(Debug, Clone)]
pub struct UploadSource {
    pub path: PathBuf,
    pub size: u64,
}

impl UploadSource {
    pub async fn open(path: &Path) -> Result<Self> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| StorageError::from(e).context(path.display()))?;
        if meta.is_dir() {
            return Err(StorageError::invalid_path(format!(
                "{} is a directory; upload files one by one",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
        })
    }

    pub async fn open_file(&self) -> Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| StorageError::from(e).context(self.path.display()))
    }
}

/// Storage driver interface / 存储驱动接口
///
/// Paths are already normalized by [`Client`]. Drivers report missing objects
/// as `NotFound`; the client turns that into `false` / `true` where the
/// contract says so.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Driver name / 驱动名称
    fn name(&self) -> &str;

    /// Driver capabilities / 驱动能力
    fn capabilities(&self) -> Capability;

    /// Account buckets; drive-style backends have none / 列出存储桶
    async fn list_buckets(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Names directly under `prefix`, non-recursive / 列出目录
    async fn list_objects(&self, prefix: &ObjectPath) -> Result<Vec<String>>;

    async fn exist(&self, path: &ObjectPath) -> Result<bool>;

    async fn size(&self, path: &ObjectPath) -> Result<u64>;

    /// Upload a local file / 上传
    async fn upload(&self, src: &UploadSource, dst: &ObjectPath) -> Result<()>;

    /// Download into `dst`; the parent directory already exists / 下载
    async fn download(&self, src: &ObjectPath, dst: &Path) -> Result<()>;

    async fn delete(&self, path: &ObjectPath) -> Result<()>;

    /// Token state for OAuth providers / OAuth 令牌状态
    fn tokens(&self) -> Option<&TokenManager> {
        None
    }
}

/// Handle construction options / 句柄构建选项
#[derive(Clone)]
pub struct ClientOptions {
    /// Account name, used for logs and token persistence / 账户名
    pub account: String,
    pub timeouts: OperationTimeouts,
    pub token_store: Option<Arc<dyn TokenStore>>,
    pub token_safety_margin: Duration,
    pub path_cache_ttl: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            account: "default".to_string(),
            timeouts: OperationTimeouts::default(),
            token_store: None,
            token_safety_margin: token::DEFAULT_SAFETY_MARGIN,
            path_cache_ttl: resolver::DEFAULT_CACHE_TTL,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("account", &self.account)
            .field("timeouts", &self.timeouts)
            .field("token_store", &self.token_store.is_some())
            .field("token_safety_margin", &self.token_safety_margin)
            .field("path_cache_ttl", &self.path_cache_ttl)
            .finish()
    }
}

pub mod account;
pub mod client;
pub mod factory;
pub mod manager;

pub use account::{BackupAccount, ProviderConfig};
pub use client::Client;
pub use factory::{new_cloud_storage_client, new_cloud_storage_client_with, refresh_token};
pub use manager::StorageManager;
