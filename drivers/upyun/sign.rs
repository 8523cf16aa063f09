//! 又拍云 REST API 签名

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{Result, StorageError};

type HmacSha1 = Hmac<Sha1>;

/// RFC1123 GMT 日期
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `UPYUN operator:base64(HMAC-SHA1(md5(password), METHOD&URI&DATE))`
///
/// `uri` is the request path starting with `/<bucket>`, already encoded.
pub fn authorization(operator: &str, password: &str, method: &str, uri: &str, date: &str) -> Result<String> {
    let key = format!("{:x}", md5::compute(password.as_bytes()));
    let data = format!("{}&{}&{}", method, uri, date);
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|e| StorageError::invalid_config(format!("UPYUN signing key: {}", e)))?;
    mac.update(data.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!("UPYUN {}:{}", operator, signature))
}
