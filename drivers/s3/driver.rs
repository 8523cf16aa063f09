//! S3驱动实现（rust-s3）
//!
//! 小文件单次 PUT，大文件按分片顺序上传；失败或取消时中止分片上传

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use s3::serde_types::Part;
use s3::Bucket;
use std::path::Path;

use crate::error::{classify_transport_message, error_chain, Result, StorageError};
use crate::storage::{Capability, ClientOptions, StorageDriver, UploadSource};
use crate::transport::http::{self, classify_status};
use crate::transport::multipart::MIB;
use crate::transport::stream::read_part;
use crate::transport::{AbortOnDrop, MultipartUpload, PartPlan, PartialFile};
use crate::utils::{truncate, ObjectPath};

use super::config::S3Config;

/// 服务端允许的最小分片
const MIN_PART_SIZE: u64 = 5 * MIB;
/// 分片数上限
const MAX_PARTS: u64 = 10_000;

const CONTENT_TYPE: &str = "application/octet-stream";

/// 分片大小：不低于 5MiB，且保证分片数不超过 10000
pub fn part_size_for(size: u64) -> u64 {
    MIN_PART_SIZE.max(size.div_ceil(MAX_PARTS))
}

pub struct S3Driver {
    config: S3Config,
    bucket: Box<Bucket>,
    region: Region,
    credentials: Credentials,
}

impl S3Driver {
    /// 先解析 endpoint，主机不可达时立即失败
    pub async fn connect(config: S3Config, options: &ClientOptions) -> Result<Self> {
        http::resolve_endpoint(&config.endpoint_url()?).await?;
        Self::new(config, options)
    }

    pub fn new(config: S3Config, options: &ClientOptions) -> Result<Self> {
        let credentials = Credentials::new(Some(&config.access_key), Some(&config.secret_key), None, None, None)
            .map_err(|e| StorageError::invalid_config(format!("创建S3凭证失败: {}", e)))?;
        let region = Region::Custom {
            region: config.region_name(),
            endpoint: config.endpoint_url()?,
        };

        let bucket = Bucket::new(&config.bucket, region.clone(), credentials.clone())
            .map_err(|e| StorageError::invalid_config(format!("创建S3 Bucket失败: {}", e)))?;
        let mut bucket = if config.path_style() {
            bucket.with_path_style()
        } else {
            bucket
        };
        if config.insecure_skip_verify {
            tracing::warn!("TLS certificate verification disabled for bucket {}", config.bucket);
            bucket = Box::new(bucket.set_dangerous_config(true, true).map_err(s3_error)?);
        }
        // 单个请求的上限交给调用方的操作超时
        bucket.set_request_timeout(Some(options.timeouts.transfer));

        tracing::debug!("S3 bucket {} at {:?}", config.bucket, region);
        Ok(Self {
            config,
            bucket,
            region,
            credentials,
        })
    }

    /// 获取完整的对象键
    fn key(&self, path: &ObjectPath) -> String {
        path.key_under(&self.config.root_path)
    }

    /// 获取目录前缀
    fn prefix(&self, path: &ObjectPath) -> String {
        let key = self.key(path);
        if key.is_empty() {
            key
        } else {
            format!("{}/", key)
        }
    }

    /// 上传用的 bucket，附带存储类型头
    fn upload_bucket(&self) -> Box<Bucket> {
        let mut bucket = self.bucket.clone();
        if let Some(class) = self.config.sc_type.as_deref().filter(|c| !c.is_empty()) {
            bucket.add_header("x-amz-storage-class", class);
        }
        bucket
    }

    async fn multipart_upload(&self, src: &UploadSource, key: &str, plan: PartPlan) -> Result<()> {
        let bucket = self.upload_bucket();
        let init = bucket
            .initiate_multipart_upload(key, CONTENT_TYPE)
            .await
            .map_err(|e| s3_error(e).context("初始化分片上传失败"))?;
        tracing::debug!("S3分片上传开始: key={}, upload_id={}, parts={}", key, init.upload_id, plan.part_count());

        let guard = {
            let bucket = bucket.clone();
            let key = key.to_string();
            let upload_id = init.upload_id.clone();
            AbortOnDrop::new(
                format!("{}/{}", self.config.bucket, key),
                Box::pin(async move { bucket.abort_upload(&key, &upload_id).await.map_err(s3_error) }),
            )
        };

        let mut upload = MultipartUpload::new(init.upload_id.clone(), plan);
        let result = async {
            let mut file = src.open_file().await?;
            for part in plan.parts() {
                let chunk = read_part(&mut file, part.len).await?;
                tracing::debug!("S3上传分片: key={}, part={}, size={}", key, part.number, part.len);
                let uploaded = bucket
                    .put_multipart_chunk(chunk, key, part.number, &upload.upload_id, CONTENT_TYPE)
                    .await
                    .map_err(|e| s3_error(e).context(format!("upload part {}", part.number)))?;
                upload.record(part.number, uploaded.etag)?;
            }

            let parts: Vec<Part> = upload
                .manifest()?
                .iter()
                .map(|(number, etag)| Part {
                    part_number: *number,
                    etag: etag.clone(),
                })
                .collect();
            bucket
                .complete_multipart_upload(key, &upload.upload_id, parts)
                .await
                .map_err(|e| s3_error(e).context("完成分片上传失败"))?;
            Ok::<_, StorageError>(())
        }
        .await;

        match result {
            Ok(()) => {
                guard.disarm();
                tracing::debug!("S3分片上传完成: key={}", key);
                Ok(())
            }
            Err(e) => {
                guard.abort().await;
                Err(e)
            }
        }
    }
}

/// rust-s3 错误转换：HTTP 失败按状态码分类，其余按传输错误文本分类
fn s3_error(e: S3Error) -> StorageError {
    match e {
        S3Error::HttpFailWithBody(code, body) => classify_status(code, truncate(&body, 512)),
        // the source chain carries the DNS / connect cause
        other => classify_transport_message(error_chain(&other)),
    }
}

#[async_trait]
impl StorageDriver for S3Driver {
    fn name(&self) -> &str {
        "s3"
    }

    fn capabilities(&self) -> Capability {
        Capability {
            can_multipart_upload: true,
            can_abort_upload: true,
            part_size: Some(MIN_PART_SIZE),
            ..Default::default()
        }
    }

    async fn list_buckets(&self) -> Result<Vec<String>> {
        let resp = Bucket::list_buckets(self.region.clone(), self.credentials.clone())
            .await
            .map_err(|e| s3_error(e).context("list buckets"))?;
        Ok(resp.bucket_names().collect())
    }

    async fn list_objects(&self, prefix: &ObjectPath) -> Result<Vec<String>> {
        let prefix = self.prefix(prefix);
        let results = self
            .bucket
            .list(prefix.clone(), Some("/".to_string()))
            .await
            .map_err(|e| s3_error(e).context("列出S3对象失败"))?;

        let mut names = Vec::new();
        for result in results {
            // 公共前缀即子目录
            for cp in result.common_prefixes.unwrap_or_default() {
                let name = cp.prefix[prefix.len().min(cp.prefix.len())..].trim_end_matches('/');
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
            for obj in result.contents {
                let Some(name) = obj.key.strip_prefix(&prefix) else {
                    continue;
                };
                // 跳过目录占位对象
                if name.is_empty() || name.ends_with('/') {
                    continue;
                }
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    async fn exist(&self, path: &ObjectPath) -> Result<bool> {
        match self.size(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self, path: &ObjectPath) -> Result<u64> {
        let key = self.key(path);
        let (head, _) = self
            .bucket
            .head_object(&key)
            .await
            .map_err(|e| s3_error(e).context(&key))?;
        Ok(head.content_length.unwrap_or(0).max(0) as u64)
    }

    async fn upload(&self, src: &UploadSource, dst: &ObjectPath) -> Result<()> {
        let key = self.key(dst);
        let plan = PartPlan::checked(src.size, part_size_for(src.size))?;
        if !plan.is_single() {
            return self.multipart_upload(src, &key, plan).await;
        }

        let mut file = src.open_file().await?;
        let body = read_part(&mut file, src.size).await?;
        tracing::debug!("S3上传: key={}, size={}", key, src.size);
        self.upload_bucket()
            .put_object_with_content_type(&key, &body, CONTENT_TYPE)
            .await
            .map_err(|e| s3_error(e).context(&key))?;
        Ok(())
    }

    async fn download(&self, src: &ObjectPath, dst: &Path) -> Result<()> {
        let key = self.key(src);
        // 先确认对象存在，避免为不存在的对象创建本地文件
        self.size(src).await?;
        let mut partial = PartialFile::create(dst).await?;
        self.bucket
            .get_object_to_writer(&key, partial.file_mut()?)
            .await
            .map_err(|e| s3_error(e).context(&key))?;
        partial.commit().await
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        let key = self.key(path);
        self.bucket
            .delete_object(&key)
            .await
            .map_err(|e| s3_error(e).context(&key))?;
        Ok(())
    }
}
