//! WebDAV 驱动实现
//!
//! 使用reqwest实现WebDAV协议，支持流式上传下载

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, StorageError};
use crate::storage::account::{lenient, require};
use crate::storage::{Capability, ClientOptions, ProviderTag, StorageDriver, UploadSource};
use crate::transport::http::{self, classify_status};
use crate::transport::stream::file_part_body;
use crate::transport::PartialFile;
use crate::utils::ObjectPath;

use super::propfind::{parse_multistatus, DavEntry, PROPFIND_BODY};

/// WebDAV 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDavConfig {
    /// WebDAV服务器地址 (如 https://dav.example.com/files)
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// 根目录路径
    #[serde(default)]
    pub path: String,
    /// 跳过TLS证书验证
    #[serde(default, deserialize_with = "lenient::flag")]
    pub insecure_skip_verify: bool,
}

impl WebDavConfig {
    pub fn validate(&self) -> Result<()> {
        require(ProviderTag::WebDav, "address", &self.address)?;
        require(ProviderTag::WebDav, "username", &self.username)?;
        url::Url::parse(&self.address)
            .map_err(|e| StorageError::invalid_config(format!("WEBDAV config: address {}: {}", self.address, e)))?;
        Ok(())
    }
}

/// WebDAV 驱动
pub struct WebDavDriver {
    config: WebDavConfig,
    client: Client,
    header_timeout: Duration,
}

impl WebDavDriver {
    /// 先解析服务器地址，主机不可达时立即失败
    pub async fn connect(config: WebDavConfig, options: &ClientOptions) -> Result<Self> {
        http::resolve_endpoint(&config.address).await?;
        Self::new(config, options)
    }

    pub fn new(config: WebDavConfig, options: &ClientOptions) -> Result<Self> {
        let client = http::build_client(config.insecure_skip_verify, &options.timeouts)?;
        Ok(Self {
            config,
            client,
            header_timeout: options.timeouts.response_header,
        })
    }

    /// 构建完整URL，集合（目录）以 `/` 结尾
    fn build_url(&self, path: &ObjectPath, collection: bool) -> String {
        let base = self.config.address.trim_end_matches('/');
        let root = self
            .config
            .path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let mut url = base.to_string();
        for part in [root, path.encoded()] {
            if !part.is_empty() {
                url.push('/');
                url.push_str(&part);
            }
        }
        if collection {
            url.push('/');
        }
        url
    }

    /// 获取认证头
    fn auth_header(&self) -> String {
        use base64::Engine;
        let credentials = format!("{}:{}", self.config.username, self.config.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes());
        format!("Basic {}", encoded)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
    }

    async fn propfind(&self, path: &ObjectPath, depth: &str) -> Result<(String, Vec<DavEntry>)> {
        let url = self.build_url(path, depth != "0");
        let method = Method::from_bytes(b"PROPFIND").map_err(|e| StorageError::provider(e.to_string()))?;
        tracing::debug!("WebDAV PROPFIND depth={} {}", depth, url);
        let req = self
            .request(method, &url)
            .header("Depth", depth)
            .header(reqwest::header::CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        let resp = http::ensure_success(http::send(req, self.header_timeout).await?).await?;
        let xml = resp.text().await?;
        let self_path = url::Url::parse(&url)
            .map(|u| urlencoding::decode(u.path()).map(|s| s.into_owned()).unwrap_or_default())
            .unwrap_or_default();
        Ok((self_path.trim_end_matches('/').to_string(), parse_multistatus(&xml)?))
    }

    /// 逐级 MKCOL，已存在（405）视为成功
    async fn ensure_collections(&self, dir: &ObjectPath) -> Result<()> {
        let method = Method::from_bytes(b"MKCOL").map_err(|e| StorageError::provider(e.to_string()))?;
        for depth in 1..=dir.len() {
            let url = self.build_url(&dir.prefix(depth), true);
            let resp = http::send(self.request(method.clone(), &url), self.header_timeout).await?;
            match resp.status().as_u16() {
                200..=299 => tracing::debug!("WebDAV MKCOL {}", url),
                405 => {}
                code => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(classify_status(code, &body).context(format!("MKCOL {}", dir.prefix(depth))));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for WebDavDriver {
    fn name(&self) -> &str {
        "webdav"
    }

    fn capabilities(&self) -> Capability {
        Capability::default()
    }

    async fn list_objects(&self, prefix: &ObjectPath) -> Result<Vec<String>> {
        let (self_path, entries) = self.propfind(prefix, "1").await?;
        Ok(entries
            .iter()
            .filter(|e| e.path != self_path)
            .map(|e| e.name().to_string())
            .filter(|name| !name.is_empty())
            .collect())
    }

    async fn exist(&self, path: &ObjectPath) -> Result<bool> {
        match self.propfind(path, "0").await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self, path: &ObjectPath) -> Result<u64> {
        let (_, entries) = self.propfind(path, "0").await?;
        entries
            .first()
            .map(|e| e.size)
            .ok_or_else(|| StorageError::not_found(path.to_string()))
    }

    async fn upload(&self, src: &UploadSource, dst: &ObjectPath) -> Result<()> {
        self.ensure_collections(&dst.parent()).await?;

        let url = self.build_url(dst, false);
        tracing::debug!("WebDAV PUT {} ({} bytes)", url, src.size);
        let body = file_part_body(&src.path, 0, src.size).await?;
        let req = self
            .request(Method::PUT, &url)
            .header(reqwest::header::CONTENT_LENGTH, src.size)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        http::ensure_success(http::send_body(req).await?).await?;
        Ok(())
    }

    async fn download(&self, src: &ObjectPath, dst: &Path) -> Result<()> {
        let url = self.build_url(src, false);
        tracing::debug!("WebDAV GET {}", url);
        let resp = http::ensure_success(http::send(self.request(Method::GET, &url), self.header_timeout).await?).await?;
        let mut partial = PartialFile::create(dst).await?;
        partial.write_response(resp).await?;
        partial.commit().await
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        let url = self.build_url(path, false);
        tracing::debug!("WebDAV DELETE {}", url);
        http::ensure_success(http::send(self.request(Method::DELETE, &url), self.header_timeout).await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(address: &str, root: &str) -> WebDavDriver {
        let config = WebDavConfig {
            address: address.into(),
            username: "u".into(),
            password: "p".into(),
            path: root.into(),
            insecure_skip_verify: false,
        };
        WebDavDriver::new(config, &ClientOptions::default()).unwrap()
    }

    #[test]
    fn test_build_url() {
        let d = driver("https://dav.example.com/files/", "/backup/");
        let p = ObjectPath::parse("a b/c.txt").unwrap();
        assert_eq!(d.build_url(&p, false), "https://dav.example.com/files/backup/a%20b/c.txt");
        assert_eq!(d.build_url(&ObjectPath::root(), true), "https://dav.example.com/files/backup/");

        let d = driver("https://dav.example.com", "");
        assert_eq!(d.build_url(&ObjectPath::root(), true), "https://dav.example.com/");
    }

    #[test]
    fn test_basic_auth_header() {
        assert_eq!(driver("https://dav", "").auth_header(), "Basic dTpw");
    }

    #[test]
    fn test_address_must_be_url() {
        let config = WebDavConfig {
            address: "not a url".into(),
            username: "u".into(),
            password: String::new(),
            path: String::new(),
            insecure_skip_verify: false,
        };
        assert!(config.validate().is_err());
    }
}
