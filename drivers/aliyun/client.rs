//! 阿里云盘 HTTP 客户端和认证

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use super::driver::AliyunConfig;
use super::types::*;
use crate::error::Result;
use crate::transport::token::{classify_refresh_failure, send_authorized, OAuthTokenResponse};
use crate::transport::{http, TokenGrant, TokenManager, TokenRefresher};
use crate::utils::truncate;

/// refresh_token 换取 access_token，服务端会轮换 refresh_token
pub struct AliyunRefresher {
    client: Client,
    api: String,
    header_timeout: Duration,
}

impl AliyunRefresher {
    pub fn new(config: &AliyunConfig, client: Client, header_timeout: Duration) -> Self {
        Self {
            client,
            api: config.api(),
            header_timeout,
        }
    }
}

#[async_trait]
impl TokenRefresher for AliyunRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let url = format!("{}/token/refresh", self.api);
        let body = RefreshTokenRequest {
            grant_type: "refresh_token",
            refresh_token,
        };
        tracing::debug!("POST {}", url);
        let resp = http::send(self.client.post(&url).json(&body), self.header_timeout).await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_refresh_failure(status, truncate(&text, 512)));
        }
        let token: OAuthTokenResponse = resp.json().await?;
        Ok(token.into())
    }
}

/// 带认证的 JSON API 客户端
pub struct AliyunClient {
    pub client: Client,
    pub api: String,
    pub drive_id: String,
    pub tokens: TokenManager,
    pub header_timeout: Duration,
}

impl AliyunClient {
    /// POST JSON 并解析响应
    pub async fn post<B, T>(&self, uri: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self.post_raw(uri, body).await?;
        Ok(resp.json().await?)
    }

    /// POST JSON，只检查状态码
    pub async fn post_raw<B>(&self, uri: &str, body: &B) -> Result<reqwest::Response>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.api, uri);
        tracing::debug!("POST {}", url);
        let resp = send_authorized(&self.tokens, self.header_timeout, |t| {
            self.client.post(&url).bearer_auth(t).json(body)
        })
        .await?;
        http::ensure_success(resp).await
    }

    /// 单页文件列表
    pub async fn list_page(&self, parent_id: &str, marker: Option<&str>) -> Result<FileList> {
        let req = ListRequest {
            drive_id: &self.drive_id,
            parent_file_id: parent_id,
            limit: LIST_LIMIT,
            fields: "*",
            marker,
        };
        self.post("/adrive/v3/file/list", &req).await
    }
}
