//! S3驱动配置（S3 / MinIO / OSS / COS / KODO 共用）

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::storage::account::{lenient, require};
use crate::storage::ProviderTag;
use crate::transport::http::with_scheme;

/// 兼容 S3 协议的服务商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum S3Flavor {
    #[default]
    Aws,
    MinIo,
    Oss,
    Cos,
    Kodo,
}

impl S3Flavor {
    pub fn from_tag(tag: ProviderTag) -> Self {
        match tag {
            ProviderTag::MinIo => S3Flavor::MinIo,
            ProviderTag::Oss => S3Flavor::Oss,
            ProviderTag::Cos => S3Flavor::Cos,
            ProviderTag::Kodo => S3Flavor::Kodo,
            _ => S3Flavor::Aws,
        }
    }

    pub fn tag(&self) -> ProviderTag {
        match self {
            S3Flavor::Aws => ProviderTag::S3,
            S3Flavor::MinIo => ProviderTag::MinIo,
            S3Flavor::Oss => ProviderTag::Oss,
            S3Flavor::Cos => ProviderTag::Cos,
            S3Flavor::Kodo => ProviderTag::Kodo,
        }
    }

    /// 未配置 endpoint 时按区域推导
    /// AWS: s3.{region}.amazonaws.com
    /// 阿里云OSS: oss-{region}.aliyuncs.com
    /// 腾讯云COS: cos.{region}.myqcloud.com
    /// 七牛KODO: s3.{region}.qiniucs.com
    fn default_endpoint(&self, region: &str) -> Option<String> {
        match self {
            S3Flavor::Aws => Some(format!("s3.{}.amazonaws.com", region)),
            S3Flavor::Oss => Some(format!("oss-{}.aliyuncs.com", region)),
            S3Flavor::Cos => Some(format!("cos.{}.myqcloud.com", region)),
            S3Flavor::Kodo => Some(format!("s3.{}.qiniucs.com", region)),
            S3Flavor::MinIo => None,
        }
    }
}

/// S3配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(rename = "accessKey", default)]
    pub access_key: String,
    #[serde(rename = "secretKey", default)]
    pub secret_key: String,
    /// 端点地址，可不带协议（默认 https）
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    /// 存储类型（x-amz-storage-class）
    #[serde(rename = "scType", default)]
    pub sc_type: Option<String>,
    /// 强制路径风格，MinIO 默认开启
    #[serde(rename = "forcePathStyle", default, deserialize_with = "lenient::opt_flag")]
    pub force_path_style: Option<bool>,
    /// 桶内根目录
    #[serde(default)]
    pub root_path: String,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub insecure_skip_verify: bool,
    #[serde(skip)]
    pub flavor: S3Flavor,
}

impl S3Config {
    pub fn validate(&self) -> Result<()> {
        let tag = self.flavor.tag();
        require(tag, "accessKey", &self.access_key)?;
        require(tag, "secretKey", &self.secret_key)?;
        require(tag, "bucket", &self.bucket)?;
        if self.endpoint.trim().is_empty() {
            match self.flavor {
                S3Flavor::MinIo => require(tag, "endpoint", &self.endpoint)?,
                S3Flavor::Aws => {}
                _ => require(tag, "region", &self.region)?,
            }
        }
        Ok(())
    }

    pub fn region_name(&self) -> String {
        match self.region.trim() {
            "" => "us-east-1".to_string(),
            r => r.to_string(),
        }
    }

    /// 带协议的 endpoint
    pub fn endpoint_url(&self) -> Result<String> {
        if !self.endpoint.trim().is_empty() {
            return Ok(with_scheme(&self.endpoint));
        }
        self.flavor
            .default_endpoint(&self.region_name())
            .map(|e| with_scheme(&e))
            .ok_or_else(|| StorageError::invalid_config(format!("{} config: missing endpoint", self.flavor.tag())))
    }

    pub fn path_style(&self) -> bool {
        self.force_path_style.unwrap_or(self.flavor == S3Flavor::MinIo)
    }
}
