//! HTTP client construction, timeouts and status classification / HTTP 客户端

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, StorageError};
use crate::utils::truncate;

/// Maximum provider body kept in error messages
const ERROR_BODY_LIMIT: usize = 512;

/// Per-attempt deadlines / 超时配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTimeouts {
    /// Upload / download / 传输
    #[serde(with = "secs")]
    pub transfer: Duration,
    /// List / exist / size / delete / 控制面操作
    #[serde(with = "secs")]
    pub control: Duration,
    #[serde(with = "secs")]
    pub response_header: Duration,
    /// Folded into the connect phase by reqwest / 并入连接阶段
    #[serde(with = "secs")]
    pub tls_handshake: Duration,
    #[serde(with = "secs")]
    pub dial: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            transfer: Duration::from_secs(24 * 60 * 60),
            control: Duration::from_secs(5 * 60),
            response_header: Duration::from_secs(10),
            tls_handshake: Duration::from_secs(5),
            dial: Duration::from_secs(60),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Build the per-handle connection pool / 构建每个句柄独立的连接池
pub fn build_client(insecure_skip_verify: bool, timeouts: &OperationTimeouts) -> Result<Client> {
    if insecure_skip_verify {
        tracing::warn!("TLS certificate verification disabled for this account");
    }
    Client::builder()
        .danger_accept_invalid_certs(insecure_skip_verify)
        .connect_timeout(timeouts.dial)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(8)
        .tcp_nodelay(true)
        .build()
        .map_err(|e| StorageError::invalid_config(format!("build HTTP client: {}", e)))
}

/// Send a control-plane request; the response head must arrive within `header_timeout`
pub async fn send(req: RequestBuilder, header_timeout: Duration) -> Result<Response> {
    match tokio::time::timeout(header_timeout, req.send()).await {
        Ok(resp) => Ok(resp?),
        Err(_) => Err(StorageError::new(
            ErrorKind::Timeout,
            format!("no response headers within {:?}", header_timeout),
        )),
    }
}

/// Send a request carrying a part body; bounded only by the operation deadline
pub async fn send_body(req: RequestBuilder) -> Result<Response> {
    Ok(req.send().await?)
}

/// Pass 2xx through, classify everything else / 非 2xx 转换为错误
pub async fn ensure_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().path().to_string();
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), truncate(&body, ERROR_BODY_LIMIT)).context(url))
}

/// Map an HTTP status to the taxonomy / 状态码分类
pub fn classify_status(status: u16, body: &str) -> StorageError {
    let kind = match status {
        401 => ErrorKind::AuthFailure,
        403 => ErrorKind::PermissionDenied,
        404 => ErrorKind::NotFound,
        408 | 504 => ErrorKind::Timeout,
        _ => ErrorKind::ProviderError,
    };
    let body = body.trim();
    if body.is_empty() {
        StorageError::new(kind, format!("HTTP {}", status))
    } else {
        StorageError::new(kind, format!("HTTP {} - {}", status, body))
    }
}

/// Resolve the endpoint host once so a dead host fails at construction / 预先解析端点
pub async fn resolve_endpoint(endpoint: &str) -> Result<()> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| StorageError::invalid_config(format!("invalid endpoint {}: {}", endpoint, e)))?;
    let host = match url.host() {
        Some(url::Host::Domain(host)) => host.to_string(),
        Some(_) => return Ok(()),
        None => return Err(StorageError::invalid_config(format!("endpoint {} has no host", endpoint))),
    };
    let port = url.port_or_known_default().unwrap_or(443);
    tracing::debug!("resolving {}:{}", host, port);
    let mut addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| StorageError::new(ErrorKind::Unreachable, format!("resolve {}: {}", host, e)))?;
    if addrs.next().is_none() {
        return Err(StorageError::new(ErrorKind::Unreachable, format!("resolve {}: no addresses", host)));
    }
    Ok(())
}

/// Prepend `https://` when the endpoint carries no scheme
pub fn with_scheme(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_endpoint() {
        resolve_endpoint("http://127.0.0.1:9000").await.unwrap();
        resolve_endpoint("https://[::1]/dav").await.unwrap();
        resolve_endpoint("http://localhost:8080").await.unwrap();

        let err = resolve_endpoint("https://no-such-host.invalid").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        let err = resolve_endpoint("not a url").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(401, "").kind(), ErrorKind::AuthFailure);
        assert_eq!(classify_status(403, "").kind(), ErrorKind::PermissionDenied);
        assert_eq!(classify_status(404, "").kind(), ErrorKind::NotFound);
        assert_eq!(classify_status(504, "").kind(), ErrorKind::Timeout);
        assert_eq!(classify_status(409, "").kind(), ErrorKind::ProviderError);

        let err = classify_status(500, " internal ");
        assert_eq!(err.kind(), ErrorKind::ProviderError);
        assert_eq!(err.message(), "HTTP 500 - internal");
    }

    #[test]
    fn test_default_timeouts() {
        let t = OperationTimeouts::default();
        assert_eq!(t.transfer, Duration::from_secs(86_400));
        assert_eq!(t.control, Duration::from_secs(300));
        assert_eq!(t.response_header, Duration::from_secs(10));
        assert_eq!(t.tls_handshake, Duration::from_secs(5));
        assert_eq!(t.dial, Duration::from_secs(60));
    }

    #[test]
    fn test_timeouts_serialize_as_seconds() {
        let json = serde_json::to_value(OperationTimeouts::default()).unwrap();
        assert_eq!(json["control"], 300);
        let back: OperationTimeouts = serde_json::from_value(json).unwrap();
        assert_eq!(back, OperationTimeouts::default());
    }

    #[test]
    fn test_with_scheme() {
        assert_eq!(with_scheme("s3.local"), "https://s3.local");
        assert_eq!(with_scheme("http://127.0.0.1:9000/"), "http://127.0.0.1:9000");
    }
}
