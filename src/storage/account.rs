//! Account rows and typed provider configuration / 账户与存储配置
//!
//! The admin plane hands over an untyped string -> value map. It is decoded
//! into one record per provider right here and nowhere else.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ProviderTag;
use crate::drivers::aliyun::AliyunConfig;
use crate::drivers::google_drive::GoogleDriveConfig;
use crate::drivers::local::LocalConfig;
use crate::drivers::onedrive::OneDriveConfig;
use crate::drivers::s3::{S3Config, S3Flavor};
use crate::drivers::sftp::SftpConfig;
use crate::drivers::upyun::UpyunConfig;
use crate::drivers::webdav::WebDavConfig;
use crate::error::{Result, StorageError};
use crate::transport::multipart::MIN_PART_SIZE;

/// Persisted backup account / 备份账户
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupAccount {
    pub name: String,
    #[serde(rename = "type")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,
    #[serde(default)]
    pub vars: Map<String, Value>,
}

impl BackupAccount {
    pub fn tag(&self) -> Result<ProviderTag> {
        self.provider.parse()
    }

    /// Credentials map with the row's bucket folded in / 合并 bucket 后的配置
    pub fn client_vars(&self) -> Map<String, Value> {
        let mut vars = self.vars.clone();
        if !self.bucket.is_empty() && !vars.contains_key("bucket") {
            vars.insert("bucket".to_string(), Value::String(self.bucket.clone()));
        }
        vars
    }
}

/// One config record per provider / 各存储的配置
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    Local(LocalConfig),
    S3(S3Config),
    Sftp(SftpConfig),
    WebDav(WebDavConfig),
    OneDrive(OneDriveConfig),
    GoogleDrive(GoogleDriveConfig),
    Aliyun(AliyunConfig),
    Upyun(UpyunConfig),
}

impl ProviderConfig {
    /// Decode and validate the ingestion map for `tag` / 解析并校验
    pub fn parse(tag: ProviderTag, vars: &Map<String, Value>) -> Result<Self> {
        let config = match tag {
            ProviderTag::Local => ProviderConfig::Local(decode(tag, vars)?),
            ProviderTag::S3 | ProviderTag::MinIo | ProviderTag::Oss | ProviderTag::Cos | ProviderTag::Kodo => {
                let mut config: S3Config = decode(tag, vars)?;
                config.flavor = S3Flavor::from_tag(tag);
                ProviderConfig::S3(config)
            }
            ProviderTag::Sftp => ProviderConfig::Sftp(decode(tag, vars)?),
            ProviderTag::WebDav => ProviderConfig::WebDav(decode(tag, vars)?),
            ProviderTag::OneDrive => ProviderConfig::OneDrive(decode(tag, vars)?),
            ProviderTag::GoogleDrive => ProviderConfig::GoogleDrive(decode(tag, vars)?),
            ProviderTag::Aliyun => ProviderConfig::Aliyun(decode(tag, vars)?),
            ProviderTag::Upyun => ProviderConfig::Upyun(decode(tag, vars)?),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self {
            ProviderConfig::Local(c) => c.validate(),
            ProviderConfig::S3(c) => c.validate(),
            ProviderConfig::Sftp(c) => c.validate(),
            ProviderConfig::WebDav(c) => c.validate(),
            ProviderConfig::OneDrive(c) => c.validate(),
            ProviderConfig::GoogleDrive(c) => c.validate(),
            ProviderConfig::Aliyun(c) => c.validate(),
            ProviderConfig::Upyun(c) => c.validate(),
        }
    }
}

fn decode<T: DeserializeOwned>(tag: ProviderTag, vars: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(vars.clone()))
        .map_err(|e| StorageError::invalid_config(format!("{} config: {}", tag, e)))
}

/// Fail with `InvalidConfig` when a mandatory string is blank / 必填项校验
pub fn require(tag: ProviderTag, key: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StorageError::invalid_config(format!("{} config: missing {}", tag, key)));
    }
    Ok(())
}

/// Optional `part_size`: 0 means the provider default, anything else has a floor / 分片大小校验
pub fn check_part_size(tag: ProviderTag, part_size: Option<u64>) -> Result<()> {
    match part_size {
        Some(size) if size > 0 && size < MIN_PART_SIZE => Err(StorageError::invalid_config(format!(
            "{} config: part_size {} is below the {}-byte minimum",
            tag, size, MIN_PART_SIZE
        ))),
        _ => Ok(()),
    }
}

/// Deserializers tolerant of the admin plane storing numbers and flags as strings
pub mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        match Value::deserialize(d)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "" | "false" | "0" | "no" | "off" => Ok(false),
                other => Err(D::Error::custom(format!("invalid boolean {:?}", other))),
            },
            other => Err(D::Error::custom(format!("invalid boolean {}", other))),
        }
    }

    pub fn opt_flag<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(None),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            other => flag(other).map(Some).map_err(D::Error::custom),
        }
    }

    pub fn opt_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(None),
            Value::Number(n) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid number {}", n))),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("invalid number {:?}", s))),
            other => Err(D::Error::custom(format!("invalid number {}", other))),
        }
    }

    pub fn port<'de, D: Deserializer<'de>>(d: D) -> Result<u16, D::Error> {
        match opt_number(d)? {
            None => Ok(22),
            Some(p) => u16::try_from(p).map_err(|_| D::Error::custom(format!("port out of range: {}", p))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn vars(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_bucket_folded_into_vars() {
        let account = BackupAccount {
            name: "s3-main".into(),
            provider: "S3".into(),
            bucket: "b1".into(),
            vars: vars(json!({"accessKey": "AK"})),
        };
        assert_eq!(account.client_vars()["bucket"], "b1");
        assert_eq!(account.tag().unwrap(), ProviderTag::S3);
    }

    #[test]
    fn test_s3_family_parses_with_flavor() {
        let config = ProviderConfig::parse(
            ProviderTag::MinIo,
            &vars(json!({"accessKey": "AK", "secretKey": "SK", "endpoint": "http://127.0.0.1:9000", "bucket": "b1"})),
        )
        .unwrap();
        match config {
            ProviderConfig::S3(c) => assert_eq!(c.flavor, S3Flavor::MinIo),
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_missing_mandatory_key() {
        let err = ProviderConfig::parse(ProviderTag::S3, &vars(json!({"accessKey": "AK", "bucket": "b1"}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        let err = ProviderConfig::parse(ProviderTag::Aliyun, &vars(json!({"drive_id": "1"}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_tiny_part_size_rejected() {
        let err = ProviderConfig::parse(
            ProviderTag::Aliyun,
            &vars(json!({"refresh_token": "r0", "drive_id": "1", "part_size": 16})),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(err.message().contains("part_size"));

        assert!(check_part_size(ProviderTag::OneDrive, Some(0)).is_ok());
        assert!(check_part_size(ProviderTag::OneDrive, None).is_ok());
        assert!(check_part_size(ProviderTag::GoogleDrive, Some(MIN_PART_SIZE)).is_ok());
    }

    #[test]
    fn test_lenient_port_and_flags() {
        let config = ProviderConfig::parse(
            ProviderTag::Sftp,
            &vars(json!({"address": "10.0.0.2", "port": "2222", "username": "u", "password": "p", "path": "/backup"})),
        )
        .unwrap();
        match config {
            ProviderConfig::Sftp(c) => assert_eq!(c.port, 2222),
            other => panic!("unexpected config {:?}", other),
        }

        let err = ProviderConfig::parse(
            ProviderTag::WebDav,
            &vars(json!({"address": "https://dav", "username": "u", "password": "p", "insecure_skip_verify": "maybe"})),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}
