//! Google Drive 驱动实现
//!
//! 可恢复上传（resumable）按分片顺序 PUT，中间分片返回 308

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorKind, Result, StorageError};
use crate::storage::account::{check_part_size, lenient, require};
use crate::storage::{Capability, ClientOptions, ProviderTag, StorageDriver, UploadSource};
use crate::transport::multipart::{put_ranges, DRIVE_PART_SIZE};
use crate::transport::token::{oauth2_form_refresh, send_authorized};
use crate::transport::{
    http, AbortOnDrop, DriveItem, DriveTree, MultipartUpload, PartPlan, PartialFile, PathResolver, TokenGrant,
    TokenManager, TokenRefresher,
};
use crate::utils::ObjectPath;

const DEFAULT_API: &str = "https://www.googleapis.com";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILES_LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,size)";
/// 分片必须是 256KiB 的倍数（最后一片除外）
const CHUNK_UNIT: u64 = 256 * 1024;

// ============ 配置结构 ============

/// Google Drive 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleDriveConfig {
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// 根目录ID（默认为root）
    #[serde(default)]
    pub root_id: Option<String>,
    /// API 地址覆盖
    #[serde(default)]
    pub api_url: Option<String>,
    /// 令牌地址覆盖
    #[serde(default)]
    pub oauth_url: Option<String>,
    /// 分片大小（字节）
    #[serde(default, deserialize_with = "lenient::opt_number")]
    pub part_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub insecure_skip_verify: bool,
}

impl GoogleDriveConfig {
    pub fn validate(&self) -> Result<()> {
        require(ProviderTag::GoogleDrive, "refresh_token", &self.refresh_token)?;
        require(ProviderTag::GoogleDrive, "client_id", &self.client_id)?;
        require(ProviderTag::GoogleDrive, "client_secret", &self.client_secret)?;
        check_part_size(ProviderTag::GoogleDrive, self.part_size)?;
        Ok(())
    }

    fn api(&self) -> String {
        self.api_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_API)
            .trim_end_matches('/')
            .to_string()
    }

    fn token_url(&self) -> String {
        let host = self
            .oauth_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_API)
            .trim_end_matches('/');
        format!("{}/oauth2/v4/token", host)
    }

    fn chunk_size(&self) -> u64 {
        let wanted = self.part_size.unwrap_or(DRIVE_PART_SIZE);
        (wanted / CHUNK_UNIT).max(1) * CHUNK_UNIT
    }
}

/// 刷新访问令牌
pub struct GoogleRefresher {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    header_timeout: Duration,
}

impl GoogleRefresher {
    pub fn new(config: &GoogleDriveConfig, client: Client, header_timeout: Duration) -> Self {
        Self {
            client,
            token_url: config.token_url(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            header_timeout,
        }
    }
}

#[async_trait]
impl TokenRefresher for GoogleRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        oauth2_form_refresh(&self.client, &self.token_url, &params, self.header_timeout).await
    }
}

// ============ API响应结构 ============

#[derive(Debug, Deserialize)]
struct GoogleFile {
    id: String,
    name: String,
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    /// 大小以字符串返回
    #[serde(default)]
    size: Option<String>,
}

impl From<GoogleFile> for DriveItem {
    fn from(file: GoogleFile) -> Self {
        DriveItem {
            is_dir: file.mime_type == FOLDER_MIME,
            size: file.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            id: file.id,
            name: file.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<GoogleFile>,
    #[serde(rename = "nextPageToken", default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

/// Google Drive 驱动
pub struct GoogleDriveDriver {
    client: Client,
    api: String,
    root_id: String,
    chunk_size: u64,
    header_timeout: Duration,
    tokens: TokenManager,
    resolver: PathResolver,
}

impl GoogleDriveDriver {
    pub async fn connect(config: GoogleDriveConfig, options: &ClientOptions) -> Result<Self> {
        let client = http::build_client(config.insecure_skip_verify, &options.timeouts)?;
        let refresher = GoogleRefresher::new(&config, client.clone(), options.timeouts.response_header);
        let tokens = TokenManager::new(options.account.clone(), config.refresh_token.clone(), Arc::new(refresher))
            .with_store(options.token_store.clone())
            .with_safety_margin(options.token_safety_margin);
        tokens.access_token().await?;

        Ok(Self {
            client,
            api: config.api(),
            root_id: config.root_id.clone().filter(|r| !r.is_empty()).unwrap_or_else(|| "root".to_string()),
            chunk_size: config.chunk_size(),
            header_timeout: options.timeouts.response_header,
            tokens,
            resolver: PathResolver::new(options.path_cache_ttl),
        })
    }

    async fn call<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let resp = send_authorized(&self.tokens, self.header_timeout, build).await?;
        http::ensure_success(resp).await
    }

    /// 创建可恢复上传会话，返回 Location
    async fn create_upload_session(&self, parent_id: &str, name: &str, size: u64) -> Result<String> {
        let url = format!("{}/upload/drive/v3/files?uploadType=resumable&supportsAllDrives=true", self.api);
        let metadata = json!({ "name": name, "parents": [parent_id] });
        tracing::debug!("POST {} name={} size={}", url, name, size);
        let resp = self
            .call(|t| {
                self.client
                    .post(&url)
                    .bearer_auth(t)
                    .header("X-Upload-Content-Type", "application/octet-stream")
                    .header("X-Upload-Content-Length", size)
                    .json(&metadata)
            })
            .await?;
        resp.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::provider("未获取到上传URL"))
    }
}

#[async_trait]
impl DriveTree for GoogleDriveDriver {
    fn root_id(&self) -> &str {
        &self.root_id
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<DriveItem>> {
        let url = format!("{}/drive/v3/files", self.api);
        let q = format!("'{}' in parents and trashed=false", parent_id);
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("q", q.as_str()),
                ("fields", FILES_LIST_FIELDS),
                ("pageSize", "1000"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            tracing::debug!("GET {} parent={}", url, parent_id);
            let page: FileList = self
                .call(|t| self.client.get(&url).bearer_auth(t).query(&query))
                .await?
                .json()
                .await?;
            items.extend(page.files.into_iter().map(DriveItem::from));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(items)
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String> {
        let url = format!("{}/drive/v3/files?supportsAllDrives=true", self.api);
        let body = json!({ "name": name, "mimeType": FOLDER_MIME, "parents": [parent_id] });
        tracing::debug!("POST {} folder={}", url, name);
        let created: CreatedFile = self
            .call(|t| self.client.post(&url).bearer_auth(t).json(&body))
            .await?
            .json()
            .await?;
        Ok(created.id)
    }
}

#[async_trait]
impl StorageDriver for GoogleDriveDriver {
    fn name(&self) -> &str {
        "google_drive"
    }

    fn capabilities(&self) -> Capability {
        Capability {
            drive_style: true,
            requires_oauth: true,
            can_multipart_upload: true,
            can_abort_upload: true,
            auto_rename: true,
            part_size: Some(self.chunk_size),
            max_download_size: None,
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
        let session_url = self.create_upload_session(&parent_id, name, src.size).await?;

        if src.size == 0 {
            let req = self
                .client
                .put(&session_url)
                .header(reqwest::header::CONTENT_LENGTH, 0)
                .header(reqwest::header::CONTENT_RANGE, "bytes */0")
                .body(Vec::new());
            http::ensure_success(http::send_body(req).await?).await?;
            return Ok(());
        }

        let plan = PartPlan::checked(src.size, self.chunk_size)?;
        tracing::debug!("Google Drive upload {} in {} chunks", dst, plan.part_count());
        let guard = {
            let client = self.client.clone();
            let url = session_url.clone();
            AbortOnDrop::new(
                dst.to_string(),
                Box::pin(async move {
                    // 取消会话返回 499
                    let resp = http::send_body(client.delete(&url)).await?;
                    match resp.status().as_u16() {
                        200..=299 | 499 => Ok(()),
                        code => Err(http::classify_status(code, "")),
                    }
                }),
            )
        };
        let mut upload = MultipartUpload::new(session_url.clone(), plan);
        match put_ranges(&self.client, &session_url, &src.path, &mut upload, &[308]).await {
            Ok(_) => {
                guard.disarm();
                Ok(())
            }
            Err(e) => {
                guard.abort().await;
                Err(e)
            }
        }
    }

    async fn download(&self, src: &ObjectPath, dst: &Path) -> Result<()> {
        let item = self.resolver.resolve(self, src).await?;
        if item.is_dir {
            return Err(StorageError::invalid_path(format!("{} is a folder", src)));
        }
        let url = format!(
            "{}/drive/v3/files/{}?alt=media&acknowledgeAbuse=true&supportsAllDrives=true",
            self.api, item.id
        );
        tracing::debug!("GET {}", url);
        let resp = self.call(|t| self.client.get(&url).bearer_auth(t)).await?;
        let mut partial = PartialFile::create(dst).await?;
        partial.write_response(resp).await?;
        partial.commit().await
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        let item = self.resolver.resolve(self, path).await?;
        let url = format!("{}/drive/v3/files/{}?supportsAllDrives=true", self.api, item.id);
        tracing::debug!("DELETE {}", url);
        let result = self.call(|t| self.client.delete(&url).bearer_auth(t)).await;
        self.resolver.invalidate_prefix(path);
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn tokens(&self) -> Option<&TokenManager> {
        Some(&self.tokens)
    }
}
