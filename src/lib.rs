//! Unified cloud storage client / 统一云存储客户端
//!
//! One handle contract over object stores, SFTP, WebDAV and OAuth drives.
//! Build a handle with [`new_cloud_storage_client`] from a provider tag and
//! the account's config map.

pub mod config;
pub mod error;
pub mod storage;
pub mod transport;
pub mod utils;

// Driver modules (point to project root drivers via path attribute) / 驱动模块
#[path = "../drivers/mod.rs"]
pub mod drivers;

pub use error::{ErrorKind, Result, StorageError};
pub use storage::{
    new_cloud_storage_client, new_cloud_storage_client_with, refresh_token, BackupAccount, Capability, Client,
    ClientOptions, ProviderConfig, ProviderTag, StorageManager,
};
pub use transport::{OperationTimeouts, TokenPhase, TokenStore};
