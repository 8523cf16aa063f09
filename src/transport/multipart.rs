//! Multipart upload planning and bookkeeping / 分片上传规划

use std::path::Path;

use futures::future::BoxFuture;

use crate::error::{ErrorKind, Result, StorageError};
use crate::transport::{http, stream};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Default part size for drive-style providers / 网盘默认分片大小
pub const DRIVE_PART_SIZE: u64 = GIB;

/// Smallest configurable part size / 最小分片大小
pub const MIN_PART_SIZE: u64 = 4 * 1024;

/// Byte range of one part / 单个分片
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    /// 1-based / 从 1 开始
    pub number: u32,
    pub offset: u64,
    pub len: u64,
}

impl PartSpec {
    /// Inclusive last byte, for `Content-Range`
    pub fn last_byte(&self) -> u64 {
        (self.offset + self.len).saturating_sub(1)
    }
}

/// `partCount = ceil(size / partSize)`; a zero-length file is one empty part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    size: u64,
    part_size: u64,
}

impl PartPlan {
    pub fn new(size: u64, part_size: u64) -> Self {
        Self {
            size,
            part_size: part_size.max(1),
        }
    }

    /// Plan whose part numbers fit the `u32` wire field / 校验分片数量
    pub fn checked(size: u64, part_size: u64) -> Result<Self> {
        let plan = Self::new(size, part_size);
        if size.div_ceil(plan.part_size) > u64::from(u32::MAX) {
            return Err(StorageError::new(
                ErrorKind::SizeLimitExceeded,
                format!("part size {} is too small for a {}-byte file", plan.part_size, size),
            ));
        }
        Ok(plan)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn part_count(&self) -> u32 {
        if self.size == 0 {
            return 1;
        }
        u32::try_from(self.size.div_ceil(self.part_size)).unwrap_or(u32::MAX)
    }

    pub fn is_single(&self) -> bool {
        self.part_count() == 1
    }

    pub fn parts(&self) -> impl Iterator<Item = PartSpec> + '_ {
        (1..=self.part_count()).map(move |number| {
            let offset = (number as u64 - 1) * self.part_size;
            let len = self.part_size.min(self.size - offset);
            PartSpec { number, offset, len }
        })
    }
}

/// Transient upload aggregate: upload id, plan and the acknowledged parts
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub upload_id: String,
    plan: PartPlan,
    parts: Vec<(u32, String)>,
}

impl MultipartUpload {
    pub fn new(upload_id: impl Into<String>, plan: PartPlan) -> Self {
        Self {
            upload_id: upload_id.into(),
            plan,
            parts: Vec::with_capacity(plan.part_count() as usize),
        }
    }

    pub fn plan(&self) -> &PartPlan {
        &self.plan
    }

    /// Record an acknowledged part; numbers must arrive 1, 2, 3, ...
    pub fn record(&mut self, number: u32, tag: impl Into<String>) -> Result<()> {
        let expected = self.parts.len() as u32 + 1;
        if number != expected {
            return Err(StorageError::new(
                ErrorKind::PartialTransfer,
                format!("part {} acknowledged out of order, expected {}", number, expected),
            ));
        }
        self.parts.push((number, tag.into()));
        Ok(())
    }

    pub fn completed(&self) -> usize {
        self.parts.len()
    }

    /// Manifest for the complete call; fails when parts are missing
    pub fn manifest(&self) -> Result<&[(u32, String)]> {
        let planned = self.plan.part_count() as usize;
        if self.parts.len() != planned {
            return Err(StorageError::new(
                ErrorKind::PartialTransfer,
                format!("{} of {} parts transferred", self.parts.len(), planned),
            ));
        }
        Ok(&self.parts)
    }
}

/// Fires the backend abort primitive if dropped while armed / 未完成时自动中止
///
/// Covers both the error path and cancellation by the caller's deadline.
pub struct AbortOnDrop {
    label: String,
    abort: Option<BoxFuture<'static, Result<()>>>,
}

impl AbortOnDrop {
    pub fn new(label: impl Into<String>, abort: BoxFuture<'static, Result<()>>) -> Self {
        Self {
            label: label.into(),
            abort: Some(abort),
        }
    }

    /// Upload completed; nothing to abort
    pub fn disarm(mut self) {
        self.abort = None;
    }

    /// Abort now and wait for it; the outcome is only logged
    pub async fn abort(mut self) {
        if let Some(fut) = self.abort.take() {
            match fut.await {
                Ok(()) => tracing::info!("aborted multipart upload {}", self.label),
                Err(e) => tracing::warn!("abort multipart upload {} failed: {}", self.label, e),
            }
        }
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        let Some(fut) = self.abort.take() else {
            return;
        };
        let label = std::mem::take(&mut self.label);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = fut.await {
                        tracing::warn!("abort multipart upload {} failed: {}", label, e);
                    } else {
                        tracing::info!("aborted cancelled multipart upload {}", label);
                    }
                });
            }
            Err(_) => tracing::warn!("no runtime to abort multipart upload {}", label),
        }
    }
}

/// Stream every planned part to a resumable session URL with `Content-Range`
///
/// `interim` lists the non-2xx statuses the backend uses to acknowledge a
/// part that is not the last one (Google answers 308).
pub async fn put_ranges(
    client: &reqwest::Client,
    session_url: &str,
    src: &Path,
    upload: &mut MultipartUpload,
    interim: &[u16],
) -> Result<reqwest::Response> {
    let plan = *upload.plan();
    let mut last = None;
    for part in plan.parts() {
        let body = stream::file_part_body(src, part.offset, part.len).await?;
        let range = format!("bytes {}-{}/{}", part.offset, part.last_byte(), plan.size());
        tracing::debug!("PUT part {}/{} {}", part.number, plan.part_count(), range);
        let req = client
            .put(session_url)
            .header(reqwest::header::CONTENT_LENGTH, part.len)
            .header(reqwest::header::CONTENT_RANGE, range)
            .body(body);
        let resp = http::send_body(req)
            .await
            .map_err(|e| e.context(format!("upload part {}", part.number)))?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() && !interim.contains(&status) {
            let err = http::ensure_success(resp).await.err();
            return Err(err
                .unwrap_or_else(|| http::classify_status(status, ""))
                .context(format!("upload part {}", part.number)));
        }
        upload.record(part.number, status.to_string())?;
        last = Some(resp);
    }
    upload.manifest()?;
    last.ok_or_else(|| StorageError::new(ErrorKind::PartialTransfer, "no parts transferred"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_drive_plan_for_two_and_a_half_gib() {
        let plan = PartPlan::new(5 * GIB / 2, DRIVE_PART_SIZE);
        assert_eq!(plan.part_count(), 3);
        let parts: Vec<_> = plan.parts().collect();
        assert_eq!(parts[0], PartSpec { number: 1, offset: 0, len: GIB });
        assert_eq!(parts[2].offset, 2 * GIB);
        assert_eq!(parts[2].len, GIB / 2);
        assert_eq!(parts.iter().map(|p| p.len).sum::<u64>(), 5 * GIB / 2);
    }

    #[test]
    fn test_exact_multiple_and_empty() {
        assert_eq!(PartPlan::new(2 * MIB, MIB).part_count(), 2);
        let empty = PartPlan::new(0, MIB);
        assert_eq!(empty.part_count(), 1);
        assert_eq!(empty.parts().next(), Some(PartSpec { number: 1, offset: 0, len: 0 }));
        assert!(empty.is_single());
    }

    #[test]
    fn test_checked_plan_rejects_part_count_overflow() {
        let err = PartPlan::checked(8 * 1024 * GIB, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SizeLimitExceeded);
        assert_eq!(PartPlan::checked(8 * 1024 * GIB, MIN_PART_SIZE).unwrap().part_count(), 1 << 31);
    }

    #[test]
    fn test_part_numbers_contiguous_from_one() {
        let plan = PartPlan::new(17 * MIB, 5 * MIB);
        let numbers: Vec<u32> = plan.parts().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(plan.parts().last().unwrap().last_byte(), 17 * MIB - 1);
    }

    #[test]
    fn test_upload_records_in_order() {
        let mut upload = MultipartUpload::new("u1", PartPlan::new(3, 1));
        upload.record(1, "e1").unwrap();
        let err = upload.record(3, "e3").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PartialTransfer);
        assert_eq!(upload.manifest().unwrap_err().kind(), ErrorKind::PartialTransfer);
        upload.record(2, "e2").unwrap();
        upload.record(3, "e3").unwrap();
        assert_eq!(upload.manifest().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_abort_on_drop_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let guard = AbortOnDrop::new("disarmed", Box::pin(async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        guard.disarm();

        let h = hits.clone();
        let guard = AbortOnDrop::new("explicit", Box::pin(async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        guard.abort().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        let guard = AbortOnDrop::new("dropped", Box::pin(async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        drop(guard);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
