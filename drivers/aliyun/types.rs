//! 阿里云盘 API 数据类型定义

use serde::{Deserialize, Serialize};

use crate::transport::DriveItem;

// ============ API 常量 ============

pub const API_URL: &str = "https://api.aliyundrive.com";
/// 下载链接要求的 Referer
pub const WEB_REFERER: &str = "https://www.aliyundrive.com/";
pub const WEB_ORIGIN: &str = "https://www.aliyundrive.com";
/// 列表单页条数
pub const LIST_LIMIT: u32 = 100;

// ============ 文件相关 ============

#[derive(Debug, Clone, Deserialize)]
pub struct AliyunFile {
    pub file_id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub file_type: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl From<AliyunFile> for DriveItem {
    fn from(file: AliyunFile) -> Self {
        DriveItem {
            is_dir: file.file_type == "folder",
            size: file.size.unwrap_or(0),
            id: file.file_id,
            name: file.name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileList {
    #[serde(default)]
    pub items: Vec<AliyunFile>,
    #[serde(default)]
    pub next_marker: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListRequest<'a> {
    pub drive_id: &'a str,
    pub parent_file_id: &'a str,
    pub limit: u32,
    pub fields: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileIdResponse {
    pub file_id: String,
}

// ============ 上传相关 ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartInfo {
    pub part_number: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upload_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFileResponse {
    pub file_id: String,
    #[serde(default)]
    pub upload_id: String,
    #[serde(default)]
    pub part_info_list: Vec<PartInfo>,
}

// ============ 下载相关 ============

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadUrlResponse {
    pub url: String,
}

// ============ 令牌相关 ============

#[derive(Debug, Clone, Serialize)]
pub struct RefreshTokenRequest<'a> {
    pub grant_type: &'a str,
    pub refresh_token: &'a str,
}
