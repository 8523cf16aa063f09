//! Error taxonomy shared by every driver / 统一错误分类
//!
//! Callers match on [`ErrorKind`]; the message is free-form provider text
//! meant for logs.

use std::fmt;

use thiserror::Error;

/// The only tags callers are expected to match on / 错误类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnsupportedProvider,
    InvalidConfig,
    InvalidPath,
    AuthFailure,
    /// Refresh exhausted / 刷新已耗尽
    TokenExpired,
    PermissionDenied,
    NotFound,
    SizeLimitExceeded,
    Timeout,
    Unreachable,
    TlsFailure,
    /// Backend 5xx or unclassified 4xx / 服务端错误
    ProviderError,
    /// Local source open or destination write / 本地读写错误
    LocalIoError,
    /// Backend acknowledged fewer parts than planned / 分片数不完整
    PartialTransfer,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedProvider => "UnsupportedProvider",
            ErrorKind::InvalidConfig => "InvalidConfig",
            ErrorKind::InvalidPath => "InvalidPath",
            ErrorKind::AuthFailure => "AuthFailure",
            ErrorKind::TokenExpired => "TokenExpired",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::SizeLimitExceeded => "SizeLimitExceeded",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Unreachable => "Unreachable",
            ErrorKind::TlsFailure => "TLSFailure",
            ErrorKind::ProviderError => "ProviderError",
            ErrorKind::LocalIoError => "LocalIOError",
            ErrorKind::PartialTransfer => "PartialTransfer",
        }
    }

    /// Credential rejections end the token state machine in `Failed`
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            ErrorKind::AuthFailure | ErrorKind::TokenExpired | ErrorKind::PermissionDenied | ErrorKind::InvalidConfig
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error envelope: taxonomy tag plus provider message / 错误信封
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct StorageError {
    kind: ErrorKind,
    message: String,
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// Prefix the message with operation context, keeping the tag
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{}: {}", ctx, self.message),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPath, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderError, message)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::new(ErrorKind::Timeout, e.to_string()),
            _ => Self::new(ErrorKind::LocalIoError, e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::provider(format!("malformed response: {}", e))
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        let chain = error_chain(&e);
        if e.is_timeout() {
            return Self::new(ErrorKind::Timeout, chain);
        }
        if let Some(status) = e.status() {
            return crate::transport::http::classify_status(status.as_u16(), &chain);
        }
        if looks_like_tls(&chain) {
            return Self::new(ErrorKind::TlsFailure, chain);
        }
        if e.is_connect() {
            return Self::new(ErrorKind::Unreachable, chain);
        }
        if e.is_builder() {
            return Self::invalid_config(chain);
        }
        Self::provider(chain)
    }
}

/// Classify transport failures that only surface as text (SSH, rust-s3)
pub fn classify_transport_message(message: String) -> StorageError {
    let lower = message.to_lowercase();
    let kind = if lower.contains("timed out") || lower.contains("timeout") {
        ErrorKind::Timeout
    } else if looks_like_tls(&lower) {
        ErrorKind::TlsFailure
    } else if lower.contains("dns")
        || lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
        || lower.contains("connection refused")
        || lower.contains("error trying to connect")
        || lower.contains("tcp connect error")
        || lower.contains("unreachable")
    {
        ErrorKind::Unreachable
    } else {
        ErrorKind::ProviderError
    };
    StorageError::new(kind, message)
}

fn looks_like_tls(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") || lower.contains("handshake")
}

/// Display of `e` followed by every source / 完整错误链
pub fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}
