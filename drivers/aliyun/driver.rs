//! 阿里云盘驱动实现

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use super::client::{AliyunClient, AliyunRefresher};
use super::types::*;
use super::upload::upload_file;
use crate::error::{ErrorKind, Result, StorageError};
use crate::storage::account::{check_part_size, lenient, require};
use crate::storage::{Capability, ClientOptions, ProviderTag, StorageDriver, UploadSource};
use crate::transport::multipart::{DRIVE_PART_SIZE, MIB};
use crate::transport::{http, DriveItem, DriveTree, PartialFile, PathResolver, TokenManager};
use crate::utils::ObjectPath;

/// 超过此大小需通过客户端下载
pub const MAX_DOWNLOAD_SIZE: u64 = 100 * MIB;

/// 阿里云盘配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliyunConfig {
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub drive_id: String,
    /// API 地址覆盖
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub root_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_number")]
    pub part_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub insecure_skip_verify: bool,
}

impl AliyunConfig {
    pub fn validate(&self) -> Result<()> {
        require(ProviderTag::Aliyun, "refresh_token", &self.refresh_token)?;
        require(ProviderTag::Aliyun, "drive_id", &self.drive_id)?;
        check_part_size(ProviderTag::Aliyun, self.part_size)?;
        Ok(())
    }

    pub fn api(&self) -> String {
        self.api_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(API_URL)
            .trim_end_matches('/')
            .to_string()
    }
}

/// 阿里云盘驱动
pub struct AliyunDriver {
    api: Arc<AliyunClient>,
    root_id: String,
    part_size: u64,
    resolver: PathResolver,
}

impl AliyunDriver {
    /// 构建时用 refresh_token 登录
    pub async fn connect(config: AliyunConfig, options: &ClientOptions) -> Result<Self> {
        let client = http::build_client(config.insecure_skip_verify, &options.timeouts)?;
        let refresher = AliyunRefresher::new(&config, client.clone(), options.timeouts.response_header);
        let tokens = TokenManager::new(options.account.clone(), config.refresh_token.clone(), Arc::new(refresher))
            .with_store(options.token_store.clone())
            .with_safety_margin(options.token_safety_margin);
        tokens.access_token().await?;

        let api = AliyunClient {
            client,
            api: config.api(),
            drive_id: config.drive_id.clone(),
            tokens,
            header_timeout: options.timeouts.response_header,
        };
        Ok(Self {
            api: Arc::new(api),
            root_id: config.root_id.clone().filter(|r| !r.is_empty()).unwrap_or_else(|| "root".to_string()),
            part_size: config.part_size.filter(|s| *s > 0).unwrap_or(DRIVE_PART_SIZE),
            resolver: PathResolver::new(options.path_cache_ttl),
        })
    }

    async fn download_url(&self, file_id: &str) -> Result<String> {
        let body = json!({ "drive_id": self.api.drive_id, "file_id": file_id });
        let resp: DownloadUrlResponse = self.api.post("/v2/file/get_download_url", &body).await?;
        Ok(resp.url)
    }
}

#[async_trait]
impl DriveTree for AliyunDriver {
    fn root_id(&self) -> &str {
        &self.root_id
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<DriveItem>> {
        let mut items = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self.api.list_page(parent_id, marker.as_deref()).await?;
            items.extend(page.items.into_iter().map(DriveItem::from));
            match page.next_marker.filter(|m| !m.is_empty()) {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(items)
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String> {
        // refuse 模式下同名目录直接返回已有 ID
        let body = json!({
            "drive_id": self.api.drive_id,
            "parent_file_id": parent_id,
            "name": name,
            "type": "folder",
            "check_name_mode": "refuse",
        });
        let created: FileIdResponse = self.api.post("/adrive/v2/file/createWithFolders", &body).await?;
        Ok(created.file_id)
    }
}

#[async_trait]
impl StorageDriver for AliyunDriver {
    fn name(&self) -> &str {
        "aliyun"
    }

    fn capabilities(&self) -> Capability {
        Capability {
            drive_style: true,
            requires_oauth: true,
            can_multipart_upload: true,
            can_abort_upload: true,
            auto_rename: true,
            part_size: Some(self.part_size),
            max_download_size: Some(MAX_DOWNLOAD_SIZE),
        }
    }

    async fn list_objects(&self, prefix: &ObjectPath) -> Result<Vec<String>> {
        let dir = self.resolver.resolve_dir(self, prefix).await?;
        Ok(self.list_children(&dir).await?.into_iter().map(|c| c.name).collect())
    }

    async fn exist(&self, path: &ObjectPath) -> Result<bool> {
        match self.resolver.resolve(self, path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self, path: &ObjectPath) -> Result<u64> {
        Ok(self.resolver.resolve(self, path).await?.size)
    }

    async fn upload(&self, src: &UploadSource, dst: &ObjectPath) -> Result<()> {
        let name = dst
            .name()
            .ok_or_else(|| StorageError::invalid_path("upload destination has no file name"))?;
        let parent_id = self.resolver.mkdir_all(self, &dst.parent()).await?;
        upload_file(&self.api, &parent_id, name, src, self.part_size).await
    }

    async fn download(&self, src: &ObjectPath, dst: &Path) -> Result<()> {
        let item = self.resolver.resolve(self, src).await?;
        if item.is_dir {
            return Err(StorageError::invalid_path(format!("{} is a folder", src)));
        }
        // 先检查大小，不创建本地文件
        if item.size > MAX_DOWNLOAD_SIZE {
            return Err(StorageError::new(
                ErrorKind::SizeLimitExceeded,
                format!(
                    "{} is {} bytes, larger than the {} MiB download limit",
                    src,
                    item.size,
                    MAX_DOWNLOAD_SIZE / MIB
                ),
            ));
        }
        let url = self.download_url(&item.id).await?;
        tracing::debug!("GET download url for {}", src);
        let req = self
            .api
            .client
            .get(&url)
            .header(reqwest::header::REFERER, WEB_REFERER)
            .header(reqwest::header::ORIGIN, WEB_ORIGIN);
        let resp = http::ensure_success(http::send(req, self.api.header_timeout).await?).await?;
        let mut partial = PartialFile::create(dst).await?;
        partial.write_response(resp).await?;
        partial.commit().await
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        let item = self.resolver.resolve(self, path).await?;
        let body = json!({ "drive_id": self.api.drive_id, "file_id": item.id });
        // 204 或 200 都视为成功
        let result = self.api.post_raw("/v2/file/delete", &body).await;
        self.resolver.invalidate_prefix(path);
        result.map(|_| ())
    }

    fn tokens(&self) -> Option<&TokenManager> {
        Some(&self.api.tokens)
    }
}
