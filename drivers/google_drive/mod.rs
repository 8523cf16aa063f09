//! Google Drive 存储驱动（OAuth refresh_token）

mod driver;

pub use driver::{GoogleDriveConfig, GoogleDriveDriver, GoogleRefresher};
