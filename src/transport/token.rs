//! OAuth token state machine / 令牌刷新状态机
//!
//! `Fresh -> Refreshing -> Valid | Failed`, `Valid -> Refreshing` near expiry or
//! after a 401/403, `Failed -> Refreshing` only through [`TokenManager::retry`].
//! The slot mutex is held across the refresh request, so concurrent callers
//! wait for the in-flight refresh instead of starting their own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{ErrorKind, Result, StorageError};
use crate::transport::http;

/// Lifetime assumed when the provider omits `expires_in`
const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

/// Default safety margin subtracted from expiry / 默认安全余量
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    Fresh,
    Refreshing,
    Valid,
    Failed,
}

/// Result of one refresh exchange / 刷新结果
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// Set when the provider rotates the refresh token
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
}

/// Provider-specific refresh request / 具体的刷新请求
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

/// Persists rotated refresh tokens back to the account store / 持久化新的 refresh_token
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn persist(&self, account: &str, refresh_token: &str) -> Result<()>;
}

struct TokenSlot {
    access_token: Option<String>,
    refresh_token: String,
    /// Instant after which the access token must not be used
    use_until: Option<Instant>,
    ever_valid: bool,
}

pub struct TokenManager {
    account: String,
    refresher: Arc<dyn TokenRefresher>,
    store: Option<Arc<dyn TokenStore>>,
    safety_margin: Duration,
    slot: Mutex<TokenSlot>,
    phase: parking_lot::Mutex<TokenPhase>,
}

impl TokenManager {
    pub fn new(account: impl Into<String>, refresh_token: impl Into<String>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            account: account.into(),
            refresher,
            store: None,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            slot: Mutex::new(TokenSlot {
                access_token: None,
                refresh_token: refresh_token.into(),
                use_until: None,
                ever_valid: false,
            }),
            phase: parking_lot::Mutex::new(TokenPhase::Fresh),
        }
    }

    pub fn with_store(mut self, store: Option<Arc<dyn TokenStore>>) -> Self {
        self.store = store;
        self
    }

    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn phase(&self) -> TokenPhase {
        *self.phase.lock()
    }

    /// Current refresh token, including any rotation / 当前 refresh_token
    pub async fn refresh_token(&self) -> String {
        self.slot.lock().await.refresh_token.clone()
    }

    /// Caller-initiated retry: `Failed -> Fresh`. Returns whether a reset happened.
    pub fn retry(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase == TokenPhase::Failed {
            *phase = TokenPhase::Fresh;
            true
        } else {
            false
        }
    }

    /// Access token usable right now, refreshing when stale / 获取可用的 access_token
    pub async fn access_token(&self) -> Result<String> {
        let mut slot = self.slot.lock().await;
        self.ensure_not_failed(&slot)?;
        if let (Some(token), Some(until)) = (&slot.access_token, slot.use_until) {
            if Instant::now() < until {
                return Ok(token.clone());
            }
            tracing::debug!("access token for {} is within its safety margin", self.account);
        }
        self.refresh_locked(&mut slot).await
    }

    /// Refresh after the provider rejected `stale`; skipped if someone else already did
    pub async fn force_refresh(&self, stale: &str) -> Result<String> {
        let mut slot = self.slot.lock().await;
        self.ensure_not_failed(&slot)?;
        if let (Some(token), Some(until)) = (&slot.access_token, slot.use_until) {
            if token != stale && Instant::now() < until {
                return Ok(token.clone());
            }
        }
        self.refresh_locked(&mut slot).await
    }

    fn ensure_not_failed(&self, slot: &TokenSlot) -> Result<()> {
        if self.phase() == TokenPhase::Failed {
            let kind = if slot.ever_valid { ErrorKind::TokenExpired } else { ErrorKind::AuthFailure };
            return Err(StorageError::new(
                kind,
                format!("token refresh for {} failed earlier; retry required", self.account),
            ));
        }
        Ok(())
    }

    fn set_phase(&self, phase: TokenPhase) {
        *self.phase.lock() = phase;
    }

    async fn refresh_locked(&self, slot: &mut TokenSlot) -> Result<String> {
        self.set_phase(TokenPhase::Refreshing);
        tracing::debug!("refreshing access token for {}", self.account);

        let grant = match self.refresher.refresh(&slot.refresh_token).await {
            Ok(grant) => grant,
            Err(e) if e.kind().is_auth_rejection() => {
                slot.access_token = None;
                self.set_phase(TokenPhase::Failed);
                let kind = if slot.ever_valid { ErrorKind::TokenExpired } else { ErrorKind::AuthFailure };
                tracing::warn!("token refresh rejected for {}: {}", self.account, e);
                return Err(StorageError::new(kind, e.message().to_string()).context("refresh token rejected"));
            }
            Err(e) => {
                self.set_phase(if slot.access_token.is_some() { TokenPhase::Valid } else { TokenPhase::Fresh });
                return Err(e.context("token refresh"));
            }
        };

        if let Some(rotated) = grant.refresh_token.filter(|t| !t.is_empty() && *t != slot.refresh_token) {
            // keep the rotation in memory even if persisting fails; the old token may be dead
            slot.refresh_token = rotated.clone();
            if let Some(store) = &self.store {
                if let Err(e) = store.persist(&self.account, &rotated).await {
                    slot.access_token = None;
                    self.set_phase(TokenPhase::Fresh);
                    return Err(e.context("persist rotated refresh token"));
                }
            }
            tracing::info!("refresh token rotated for {}", self.account);
        }

        let lifetime = grant.expires_in.unwrap_or(DEFAULT_LIFETIME);
        let margin = self.safety_margin.min(lifetime / 2);
        let now = Instant::now();
        // absurd expires_in values would overflow Instant
        slot.use_until = now
            .checked_add(lifetime - margin)
            .or_else(|| now.checked_add(DEFAULT_LIFETIME - self.safety_margin.min(DEFAULT_LIFETIME / 2)));
        slot.access_token = Some(grant.access_token.clone());
        slot.ever_valid = true;
        self.set_phase(TokenPhase::Valid);
        Ok(grant.access_token)
    }
}

/// Standard OAuth2 token endpoint response / OAuth2 令牌响应
#[derive(Debug, Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl From<OAuthTokenResponse> for TokenGrant {
    fn from(resp: OAuthTokenResponse) -> Self {
        TokenGrant {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_in: resp.expires_in.map(Duration::from_secs),
        }
    }
}

/// A rejected grant comes back as 400 `invalid_grant` or 401 / 刷新失败分类
pub fn classify_refresh_failure(status: u16, body: &str) -> StorageError {
    match status {
        400 | 401 => StorageError::new(ErrorKind::AuthFailure, format!("HTTP {} - {}", status, body.trim())),
        _ => http::classify_status(status, body),
    }
}

/// `grant_type=refresh_token` form exchange shared by OneDrive and Google
pub async fn oauth2_form_refresh(
    client: &reqwest::Client,
    token_url: &str,
    params: &[(&str, &str)],
    header_timeout: Duration,
) -> Result<TokenGrant> {
    tracing::debug!("POST {}", token_url);
    let resp = http::send(client.post(token_url).form(params), header_timeout).await?;
    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_refresh_failure(status, crate::utils::truncate(&body, 512)));
    }
    let token: OAuthTokenResponse = resp.json().await?;
    Ok(token.into())
}

/// Send with a bearer token; on 401/403 refresh once and resend / 带令牌发送请求
///
/// A second 401 surfaces as `TokenExpired`; a second 403 falls through to the
/// caller's status check as `PermissionDenied`.
pub async fn send_authorized<F>(tokens: &TokenManager, header_timeout: Duration, build: F) -> Result<Response>
where
    F: Fn(&str) -> RequestBuilder,
{
    let token = tokens.access_token().await?;
    let resp = http::send(build(&token), header_timeout).await?;
    let status = resp.status().as_u16();
    if status != 401 && status != 403 {
        return Ok(resp);
    }
    tracing::debug!("request rejected with HTTP {}, refreshing token once", status);
    let token = tokens.force_refresh(&token).await?;
    let resp = http::send(build(&token), header_timeout).await?;
    if resp.status().as_u16() == 401 {
        return Err(StorageError::new(ErrorKind::TokenExpired, "access token rejected after refresh"));
    }
    Ok(resp)
}
