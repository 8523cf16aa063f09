//! 阿里云盘分片上传
//!
//! create 返回每个分片的预签名地址，逐片 PUT 后 complete

use serde_json::json;
use std::sync::Arc;

use super::client::AliyunClient;
use super::types::*;
use crate::error::{ErrorKind, Result, StorageError};
use crate::storage::UploadSource;
use crate::transport::{http, stream, AbortOnDrop, MultipartUpload, PartPlan};

/// 按计划上传文件；失败时删除未完成的文件
pub async fn upload_file(
    api: &Arc<AliyunClient>,
    parent_id: &str,
    name: &str,
    src: &UploadSource,
    part_size: u64,
) -> Result<()> {
    let plan = PartPlan::checked(src.size, part_size)?;
    let part_info_list: Vec<PartInfo> = plan
        .parts()
        .map(|p| PartInfo {
            part_number: p.number,
            upload_url: String::new(),
        })
        .collect();
    let body = json!({
        "drive_id": api.drive_id,
        "parent_file_id": parent_id,
        "name": name,
        "type": "file",
        "size": src.size,
        "check_name_mode": "auto_rename",
        "part_info_list": part_info_list,
    });
    let created: CreateFileResponse = api.post("/v2/file/create", &body).await?;
    check_part_urls(&created.part_info_list, plan.part_count())?;
    tracing::debug!(
        "aliyun upload {} file_id={} parts={}",
        name,
        created.file_id,
        plan.part_count()
    );

    let guard = abort_guard(api, &created.file_id, name);
    match put_parts(api, &created, src, plan).await {
        Ok(()) => {
            guard.disarm();
            Ok(())
        }
        Err(e) => {
            guard.abort().await;
            Err(e)
        }
    }
}

async fn put_parts(api: &AliyunClient, created: &CreateFileResponse, src: &UploadSource, plan: PartPlan) -> Result<()> {
    let mut upload = MultipartUpload::new(created.upload_id.clone(), plan);
    for (part, info) in plan.parts().zip(created.part_info_list.iter()) {
        let body = stream::file_part_body(&src.path, part.offset, part.len).await?;
        tracing::debug!("PUT part {}/{}", part.number, plan.part_count());
        // 预签名地址，不带认证头
        let req = api
            .client
            .put(&info.upload_url)
            .header(reqwest::header::CONTENT_LENGTH, part.len)
            .body(body);
        let resp = http::send_body(req)
            .await
            .map_err(|e| e.context(format!("upload part {}", part.number)))?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(http::classify_status(status, "").context(format!("upload part {}", part.number)));
        }
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        upload.record(part.number, etag)?;
    }
    upload.manifest()?;

    let body = json!({
        "drive_id": api.drive_id,
        "file_id": created.file_id,
        "upload_id": created.upload_id,
    });
    api.post_raw("/v2/file/complete", &body).await?;
    Ok(())
}

/// 服务端返回的分片必须与计划一致
fn check_part_urls(parts: &[PartInfo], planned: u32) -> Result<()> {
    if parts.len() != planned as usize {
        return Err(StorageError::new(
            ErrorKind::PartialTransfer,
            format!("server returned {} upload urls for {} parts", parts.len(), planned),
        ));
    }
    for (index, part) in parts.iter().enumerate() {
        if part.part_number != index as u32 + 1 || part.upload_url.is_empty() {
            return Err(StorageError::new(
                ErrorKind::PartialTransfer,
                format!("unexpected upload url for part {}", part.part_number),
            ));
        }
    }
    Ok(())
}

/// 未完成的上传以删除占位文件的方式中止
fn abort_guard(api: &Arc<AliyunClient>, file_id: &str, name: &str) -> AbortOnDrop {
    let api = api.clone();
    let file_id = file_id.to_string();
    AbortOnDrop::new(
        name.to_string(),
        Box::pin(async move {
            let body = json!({ "drive_id": api.drive_id, "file_id": file_id });
            api.post_raw("/v2/file/delete", &body).await?;
            Ok(())
        }),
    )
}
