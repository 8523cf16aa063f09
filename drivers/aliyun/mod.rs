//! 阿里云盘驱动
//!
//! refresh_token 登录，按 drive_id 访问，文件以 file_id 寻址

mod client;
mod driver;
mod types;
mod upload;

pub use client::AliyunRefresher;
pub use driver::{AliyunConfig, AliyunDriver, MAX_DOWNLOAD_SIZE};
