//! 又拍云存储驱动实现

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::sign::{authorization, http_date};
use crate::error::{Result, StorageError};
use crate::storage::account::{lenient, require};
use crate::storage::{Capability, ClientOptions, ProviderTag, StorageDriver, UploadSource};
use crate::transport::multipart::MIB;
use crate::transport::{http, stream, MultipartUpload, PartPlan, PartialFile};
use crate::utils::ObjectPath;

const DEFAULT_API: &str = "https://v0.api.upyun.com";
/// 列表结束标记
const LIST_END: &str = "g2gCZAAEbmV4dGQAA2VvZg";
const LIST_LIMIT: &str = "1000";
/// 断点续传分片大小，需为 1MiB 的整数倍
const PART_SIZE: u64 = 10 * MIB;

/// 又拍云配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpyunConfig {
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub insecure_skip_verify: bool,
}

impl UpyunConfig {
    pub fn validate(&self) -> Result<()> {
        require(ProviderTag::Upyun, "operator", &self.operator)?;
        require(ProviderTag::Upyun, "password", &self.password)?;
        require(ProviderTag::Upyun, "bucket", &self.bucket)?;
        Ok(())
    }

    fn api(&self) -> String {
        self.api_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(http::with_scheme)
            .unwrap_or_else(|| DEFAULT_API.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    files: Vec<ListEntry>,
    #[serde(default)]
    iter: String,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
}

/// 又拍云驱动
pub struct UpyunDriver {
    client: Client,
    api: String,
    operator: String,
    password: String,
    bucket: String,
    header_timeout: Duration,
}

impl UpyunDriver {
    /// 先解析 API 地址，主机不可达时立即失败
    pub async fn connect(config: UpyunConfig, options: &ClientOptions) -> Result<Self> {
        http::resolve_endpoint(&config.api()).await?;
        Self::new(config, options)
    }

    pub fn new(config: UpyunConfig, options: &ClientOptions) -> Result<Self> {
        let client = http::build_client(config.insecure_skip_verify, &options.timeouts)?;
        Ok(Self {
            client,
            api: config.api(),
            operator: config.operator,
            password: config.password,
            bucket: config.bucket,
            header_timeout: options.timeouts.response_header,
        })
    }

    /// `/<bucket>/<encoded path>`，目录以 `/` 结尾
    fn uri(&self, path: &ObjectPath, dir: bool) -> String {
        let key = path.encoded();
        match (key.is_empty(), dir) {
            (true, _) => format!("/{}/", self.bucket),
            (false, true) => format!("/{}/{}/", self.bucket, key),
            (false, false) => format!("/{}/{}", self.bucket, key),
        }
    }

    /// 构建已签名请求
    fn request(&self, method: Method, uri: &str) -> Result<RequestBuilder> {
        let date = http_date(Utc::now());
        let auth = authorization(&self.operator, &self.password, method.as_str(), uri, &date)?;
        tracing::debug!("{} {}{}", method, self.api, uri);
        Ok(self
            .client
            .request(method, format!("{}{}", self.api, uri))
            .header("Date", date)
            .header(reqwest::header::AUTHORIZATION, auth))
    }

    async fn head(&self, path: &ObjectPath) -> Result<reqwest::Response> {
        let req = self.request(Method::HEAD, &self.uri(path, false))?;
        http::ensure_success(http::send(req, self.header_timeout).await?).await
    }

    async fn put_single(&self, uri: &str, src: &UploadSource) -> Result<()> {
        let body = stream::file_part_body(&src.path, 0, src.size).await?;
        let req = self
            .request(Method::PUT, uri)?
            .header(reqwest::header::CONTENT_LENGTH, src.size)
            .body(body);
        http::ensure_success(http::send_body(req).await?).await?;
        Ok(())
    }

    /// 断点续传：initiate / upload / complete
    async fn put_multi_stage(&self, uri: &str, src: &UploadSource) -> Result<()> {
        let req = self
            .request(Method::PUT, uri)?
            .header("X-Upyun-Multi-Stage", "initiate")
            .header("X-Upyun-Multi-Length", src.size)
            .header("X-Upyun-Multi-Type", "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, 0);
        let resp = http::ensure_success(http::send(req, self.header_timeout).await?).await?;
        let uuid = resp
            .headers()
            .get("X-Upyun-Multi-Uuid")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::provider("initiate multi-stage upload: missing X-Upyun-Multi-Uuid"))?;

        let plan = PartPlan::checked(src.size, PART_SIZE)?;
        let mut upload = MultipartUpload::new(uuid.clone(), plan);
        for part in plan.parts() {
            let body = stream::file_part_body(&src.path, part.offset, part.len).await?;
            let req = self
                .request(Method::PUT, uri)?
                .header("X-Upyun-Multi-Stage", "upload")
                .header("X-Upyun-Multi-Uuid", &uuid)
                .header("X-Upyun-Part-Id", part.number - 1)
                .header(reqwest::header::CONTENT_LENGTH, part.len)
                .body(body);
            let resp = http::send_body(req)
                .await
                .map_err(|e| e.context(format!("upload part {}", part.number)))?;
            http::ensure_success(resp)
                .await
                .map_err(|e| e.context(format!("upload part {}", part.number)))?;
            upload.record(part.number, (part.number - 1).to_string())?;
        }
        upload.manifest()?;

        let req = self
            .request(Method::PUT, uri)?
            .header("X-Upyun-Multi-Stage", "complete")
            .header("X-Upyun-Multi-Uuid", &uuid)
            .header(reqwest::header::CONTENT_LENGTH, 0);
        http::ensure_success(http::send(req, self.header_timeout).await?).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for UpyunDriver {
    fn name(&self) -> &str {
        "upyun"
    }

    fn capabilities(&self) -> Capability {
        Capability {
            drive_style: false,
            requires_oauth: false,
            can_multipart_upload: true,
            can_abort_upload: false,
            auto_rename: false,
            part_size: Some(PART_SIZE),
            max_download_size: None,
        }
    }

    async fn list_objects(&self, prefix: &ObjectPath) -> Result<Vec<String>> {
        let uri = self.uri(prefix, true);
        let mut names = Vec::new();
        let mut iter = String::new();
        loop {
            let mut req = self
                .request(Method::GET, &uri)?
                .header(reqwest::header::ACCEPT, "application/json")
                .header("x-list-limit", LIST_LIMIT);
            if !iter.is_empty() {
                req = req.header("x-list-iter", &iter);
            }
            let page: ListResponse = http::ensure_success(http::send(req, self.header_timeout).await?)
                .await?
                .json()
                .await?;
            names.extend(page.files.into_iter().map(|f| f.name));
            if page.iter.is_empty() || page.iter == LIST_END {
                break;
            }
            iter = page.iter;
        }
        Ok(names)
    }

    async fn exist(&self, path: &ObjectPath) -> Result<bool> {
        match self.head(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self, path: &ObjectPath) -> Result<u64> {
        let resp = self.head(path).await?;
        let headers = resp.headers();
        headers
            .get("x-upyun-file-size")
            .or_else(|| headers.get(reqwest::header::CONTENT_LENGTH))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StorageError::provider(format!("no size reported for {}", path)))
    }

    async fn upload(&self, src: &UploadSource, dst: &ObjectPath) -> Result<()> {
        // 父目录由服务端自动创建
        let uri = self.uri(dst, false);
        if src.size <= PART_SIZE {
            self.put_single(&uri, src).await
        } else {
            self.put_multi_stage(&uri, src).await
        }
    }

    async fn download(&self, src: &ObjectPath, dst: &Path) -> Result<()> {
        let req = self.request(Method::GET, &self.uri(src, false))?;
        let resp = http::ensure_success(http::send(req, self.header_timeout).await?).await?;
        let mut partial = PartialFile::create(dst).await?;
        partial.write_response(resp).await?;
        partial.commit().await
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        let req = self.request(Method::DELETE, &self.uri(path, false))?;
        http::ensure_success(http::send(req, self.header_timeout).await?).await?;
        Ok(())
    }
}
