//! OneDrive OAuth driver implementation / OneDrive OAuth 驱动实现
//!
//! Items are addressed by ID; paths go through the shared resolver / 通过 ID 寻址

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
use crate::transport::multipart::{put_ranges, DRIVE_PART_SIZE, MIB};
use crate::transport::token::{oauth2_form_refresh, send_authorized};
use crate::transport::{
    http, AbortOnDrop, DriveItem, DriveTree, MultipartUpload, PartPlan, PartialFile, PathResolver, TokenGrant,
    TokenManager, TokenRefresher,
};
use crate::utils::ObjectPath;

/// Graph upload sessions accept fragments up to 60 MiB / 单个分片上限
const MAX_FRAGMENT: u64 = 60 * MIB;
/// Fragments must be multiples of 320 KiB / 分片必须是 320KiB 的倍数
const FRAGMENT_UNIT: u64 = 320 * 1024;

/// OneDrive region configuration / OneDrive区域配置
struct HostConfig {
    oauth: &'static str,
    api: &'static str,
}

/// Region to host mapping / 区域到主机的映射
fn get_host_config(region: &str) -> HostConfig {
    match region {
        "cn" => HostConfig {
            oauth: "https://login.chinacloudapi.cn",
            api: "https://microsoftgraph.chinacloudapi.cn",
        },
        "us" => HostConfig {
            oauth: "https://login.microsoftonline.us",
            api: "https://graph.microsoft.us",
        },
        "de" => HostConfig {
            oauth: "https://login.microsoftonline.de",
            api: "https://graph.microsoft.de",
        },
        _ => HostConfig {
            oauth: "https://login.microsoftonline.com",
            api: "https://graph.microsoft.com",
        },
    }
}

/// OneDrive OAuth configuration / OneDrive OAuth 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneDriveConfig {
    /// Region: global, cn, us, de / 区域
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Graph host override / API 地址覆盖
    #[serde(default)]
    pub api_url: Option<String>,
    /// Login host override / 登录地址覆盖
    #[serde(default)]
    pub oauth_url: Option<String>,
    #[serde(default)]
    pub root_id: Option<String>,
    /// Upload fragment size in bytes / 分片大小
    #[serde(default, deserialize_with = "lenient::opt_number")]
    pub part_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub insecure_skip_verify: bool,
}

impl OneDriveConfig {
    pub fn validate(&self) -> Result<()> {
        require(ProviderTag::OneDrive, "refresh_token", &self.refresh_token)?;
        require(ProviderTag::OneDrive, "client_id", &self.client_id)?;
        check_part_size(ProviderTag::OneDrive, self.part_size)?;
        Ok(())
    }

    fn api_base(&self) -> String {
        let host = self
            .api_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| get_host_config(&self.region).api.to_string());
        format!("{}/v1.0/me/drive", host)
    }

    fn token_url(&self) -> String {
        let host = self
            .oauth_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| get_host_config(&self.region).oauth.to_string());
        format!("{}/common/oauth2/v2.0/token", host)
    }

    /// Capped at 60 MiB and rounded down to 320 KiB / 分片大小取整
    fn fragment_size(&self) -> u64 {
        let wanted = self.part_size.unwrap_or(DRIVE_PART_SIZE).min(MAX_FRAGMENT);
        (wanted / FRAGMENT_UNIT).max(1) * FRAGMENT_UNIT
    }
}

/// Refresh via the Microsoft identity platform / 刷新访问令牌
pub struct OneDriveRefresher {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    header_timeout: Duration,
}

impl OneDriveRefresher {
    pub fn new(config: &OneDriveConfig, client: Client, header_timeout: Duration) -> Self {
        Self {
            client,
            token_url: config.token_url(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            header_timeout,
        }
    }
}

#[async_trait]
impl TokenRefresher for OneDriveRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if !self.client_secret.is_empty() {
            params.push(("client_secret", self.client_secret.as_str()));
        }
        if !self.redirect_uri.is_empty() {
            params.push(("redirect_uri", self.redirect_uri.as_str()));
        }
        oauth2_form_refresh(&self.client, &self.token_url, &params, self.header_timeout).await
    }
}

/// OneDrive文件信息
#[derive(Debug, Deserialize)]
struct OneDriveItem {
    id: String,
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    folder: Option<serde_json::Value>,
    #[serde(rename = "@microsoft.graph.downloadUrl", default)]
    download_url: Option<String>,
}

impl From<OneDriveItem> for DriveItem {
    fn from(item: OneDriveItem) -> Self {
        DriveItem {
            is_dir: item.folder.is_some(),
            size: item.size.unwrap_or(0),
            id: item.id,
            name: item.name,
        }
    }
}

/// 文件列表响应
#[derive(Debug, Deserialize)]
struct ChildrenPage {
    value: Vec<OneDriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// 上传会话响应
#[derive(Debug, Deserialize)]
struct UploadSessionResponse {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
}

/// OneDrive OAuth 驱动
pub struct OneDriveDriver {
    client: Client,
    api: String,
    root_id: String,
    part_size: u64,
    header_timeout: Duration,
    tokens: TokenManager,
    resolver: PathResolver,
}

impl OneDriveDriver {
    /// 初始化时完成一次令牌交换
    pub async fn connect(config: OneDriveConfig, options: &ClientOptions) -> Result<Self> {
        let client = http::build_client(config.insecure_skip_verify, &options.timeouts)?;
        let refresher = OneDriveRefresher::new(&config, client.clone(), options.timeouts.response_header);
        let tokens = TokenManager::new(options.account.clone(), config.refresh_token.clone(), Arc::new(refresher))
            .with_store(options.token_store.clone())
            .with_safety_margin(options.token_safety_margin);
        tokens.access_token().await?;

        Ok(Self {
            client,
            api: config.api_base(),
            root_id: config.root_id.clone().filter(|r| !r.is_empty()).unwrap_or_else(|| "root".to_string()),
            part_size: config.fragment_size(),
            header_timeout: options.timeouts.response_header,
            tokens,
            resolver: PathResolver::new(options.path_cache_ttl),
        })
    }

    /// 带令牌发送，401/403 时刷新一次后重试
    async fn call<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let resp = send_authorized(&self.tokens, self.header_timeout, build).await?;
        http::ensure_success(resp).await
    }

    async fn get_item(&self, id: &str) -> Result<OneDriveItem> {
        let url = format!("{}/items/{}", self.api, id);
        tracing::debug!("GET {}", url);
        Ok(self.call(|t| self.client.get(&url).bearer_auth(t)).await?.json().await?)
    }

    /// 同名文件由服务端重命名
    async fn create_upload_session(&self, parent_id: &str, name: &str) -> Result<String> {
        let url = format!(
            "{}/items/{}:/{}:/createUploadSession",
            self.api,
            parent_id,
            urlencoding::encode(name)
        );
        let body = json!({ "item": { "@microsoft.graph.conflictBehavior": "rename" } });
        tracing::debug!("POST {}", url);
        let session: UploadSessionResponse = self
            .call(|t| self.client.post(&url).bearer_auth(t).json(&body))
            .await?
            .json()
            .await?;
        Ok(session.upload_url)
    }

    /// 空文件走简单上传
    async fn upload_empty(&self, parent_id: &str, name: &str) -> Result<()> {
        let url = format!(
            "{}/items/{}:/{}:/content?@microsoft.graph.conflictBehavior=rename",
            self.api,
            parent_id,
            urlencoding::encode(name)
        );
        tracing::debug!("PUT {}", url);
        self.call(|t| {
            self.client
                .put(&url)
                .bearer_auth(t)
                .header(reqwest::header::CONTENT_LENGTH, 0)
                .body(Vec::new())
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DriveTree for OneDriveDriver {
    fn root_id(&self) -> &str {
        &self.root_id
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<DriveItem>> {
        let mut items = Vec::new();
        let mut next = Some(format!(
            "{}/items/{}/children?$top=1000&$select=id,name,size,folder",
            self.api, parent_id
        ));
        while let Some(url) = next.take() {
            tracing::debug!("GET {}", url);
            let page: ChildrenPage = self.call(|t| self.client.get(&url).bearer_auth(t)).await?.json().await?;
            items.extend(page.value.into_iter().map(DriveItem::from));
            next = page.next_link;
        }
        Ok(items)
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String> {
        let url = format!("{}/items/{}/children", self.api, parent_id);
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
        tracing::debug!("POST {} name={}", url, name);
        let resp = send_authorized(&self.tokens, self.header_timeout, |t| {
            self.client.post(&url).bearer_auth(t).json(&body)
        })
        .await?;
        if resp.status().as_u16() == 409 {
            // 并发创建：使用已存在的同名目录
            return self
                .list_children(parent_id)
                .await?
                .into_iter()
                .find(|c| c.is_dir && c.name == name)
                .map(|c| c.id)
                .ok_or_else(|| StorageError::provider(format!("create folder {}: HTTP 409", name)));
        }
        let item: OneDriveItem = http::ensure_success(resp).await?.json().await?;
        Ok(item.id)
    }
}

#[async_trait]
impl StorageDriver for OneDriveDriver {
    fn name(&self) -> &str {
        "onedrive"
    }

    fn capabilities(&self) -> Capability {
        Capability {
            drive_style: true,
            requires_oauth: true,
            can_multipart_upload: true,
            can_abort_upload: true,
            auto_rename: true,
            part_size: Some(self.part_size),
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
        if src.size == 0 {
            return self.upload_empty(&parent_id, name).await;
        }

        let session_url = self.create_upload_session(&parent_id, name).await?;
        let plan = PartPlan::checked(src.size, self.part_size)?;
        tracing::debug!("OneDrive upload {} in {} fragments", dst, plan.part_count());

        let guard = {
            let client = self.client.clone();
            let url = session_url.clone();
            AbortOnDrop::new(
                dst.to_string(),
                Box::pin(async move {
                    http::ensure_success(http::send_body(client.delete(&url)).await?).await?;
                    Ok(())
                }),
            )
        };
        let mut upload = MultipartUpload::new(session_url.clone(), plan);
        match put_ranges(&self.client, &session_url, &src.path, &mut upload, &[]).await {
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
        // 下载地址短期有效，每次重新获取
        let url = self
            .get_item(&item.id)
            .await?
            .download_url
            .ok_or_else(|| StorageError::new(ErrorKind::ProviderError, format!("no download url for {}", src)))?;
        let resp = http::ensure_success(http::send(self.client.get(&url), self.header_timeout).await?).await?;
        let mut partial = PartialFile::create(dst).await?;
        partial.write_response(resp).await?;
        partial.commit().await
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        let item = self.resolver.resolve(self, path).await?;
        let url = format!("{}/items/{}", self.api, item.id);
        tracing::debug!("DELETE {}", url);
        let result = self.call(|t| self.client.delete(&url).bearer_auth(t)).await;
        self.resolver.invalidate_prefix(path);
        result.map(|_| ())
    }

    fn tokens(&self) -> Option<&TokenManager> {
        Some(&self.tokens)
    }
}
