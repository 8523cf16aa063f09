//! Tagged dispatch from provider tag to driver / 存储工厂

use serde_json::{Map, Value};

use crate::drivers::aliyun::{AliyunDriver, AliyunRefresher};
use crate::drivers::google_drive::{GoogleDriveDriver, GoogleRefresher};
use crate::drivers::local::LocalDriver;
use crate::drivers::onedrive::{OneDriveDriver, OneDriveRefresher};
use crate::drivers::s3::S3Driver;
use crate::drivers::sftp::SftpDriver;
use crate::drivers::upyun::UpyunDriver;
use crate::drivers::webdav::WebDavDriver;
use crate::error::{ErrorKind, Result, StorageError};
use crate::transport::{http, TokenRefresher};

use super::{Client, ClientOptions, ProviderConfig, ProviderTag, StorageDriver};

/// Build a handle with default options / 创建存储句柄
pub async fn new_cloud_storage_client(tag: &str, vars: &Map<String, Value>) -> Result<Client> {
    new_cloud_storage_client_with(tag, vars, ClientOptions::default()).await
}

/// Build a handle; eager handshakes (token exchange, SSH) happen here, once
pub async fn new_cloud_storage_client_with(tag: &str, vars: &Map<String, Value>, options: ClientOptions) -> Result<Client> {
    let tag: ProviderTag = tag.parse()?;
    let config = ProviderConfig::parse(tag, vars)?;
    let deadline = options.timeouts.control;

    let connect = async {
        let driver: Box<dyn StorageDriver> = match config {
            ProviderConfig::Local(c) => Box::new(LocalDriver::connect(c).await?),
            ProviderConfig::S3(c) => Box::new(S3Driver::connect(c, &options).await?),
            ProviderConfig::Sftp(c) => Box::new(SftpDriver::connect(c, &options).await?),
            ProviderConfig::WebDav(c) => Box::new(WebDavDriver::connect(c, &options).await?),
            ProviderConfig::OneDrive(c) => Box::new(OneDriveDriver::connect(c, &options).await?),
            ProviderConfig::GoogleDrive(c) => Box::new(GoogleDriveDriver::connect(c, &options).await?),
            ProviderConfig::Aliyun(c) => Box::new(AliyunDriver::connect(c, &options).await?),
            ProviderConfig::Upyun(c) => Box::new(UpyunDriver::connect(c, &options).await?),
        };
        Ok::<_, StorageError>(driver)
    };

    let driver = match tokio::time::timeout(deadline, connect).await {
        Ok(driver) => driver.map_err(|e| e.context(format!("connect {}", tag)))?,
        Err(_) => {
            return Err(StorageError::new(
                ErrorKind::Timeout,
                format!("connect {} exceeded {:?}", tag, deadline),
            ))
        }
    };
    tracing::info!("storage client ready: {} ({})", options.account, driver.name());
    Ok(Client::new(tag, driver, options.timeouts))
}

/// Exchange the configured refresh token and return the one to keep / 刷新令牌
///
/// Providers that do not rotate hand back the token that was passed in.
pub async fn refresh_token(tag: &str, vars: &Map<String, Value>) -> Result<String> {
    let tag: ProviderTag = tag.parse()?;
    if !tag.is_oauth() {
        return Err(StorageError::new(
            ErrorKind::UnsupportedProvider,
            format!("{} does not use refresh tokens", tag),
        ));
    }
    let config = ProviderConfig::parse(tag, vars)?;
    let timeouts = ClientOptions::default().timeouts;

    let (refresher, current): (Box<dyn TokenRefresher>, String) = match config {
        ProviderConfig::OneDrive(c) => {
            let client = http::build_client(c.insecure_skip_verify, &timeouts)?;
            let token = c.refresh_token.clone();
            (Box::new(OneDriveRefresher::new(&c, client, timeouts.response_header)), token)
        }
        ProviderConfig::GoogleDrive(c) => {
            let client = http::build_client(c.insecure_skip_verify, &timeouts)?;
            let token = c.refresh_token.clone();
            (Box::new(GoogleRefresher::new(&c, client, timeouts.response_header)), token)
        }
        ProviderConfig::Aliyun(c) => {
            let client = http::build_client(c.insecure_skip_verify, &timeouts)?;
            let token = c.refresh_token.clone();
            (Box::new(AliyunRefresher::new(&c, client, timeouts.response_header)), token)
        }
        _ => return Err(StorageError::new(ErrorKind::UnsupportedProvider, tag.to_string())),
    };

    let grant = refresher.refresh(&current).await?;
    Ok(grant.refresh_token.filter(|t| !t.is_empty()).unwrap_or(current))
}
