//! SFTP 驱动实现（基于 russh，纯 Rust 异步实现）
//!
//! 每个句柄保持一条 SSH 会话，操作之间串行使用；会话断开后下次操作自动重连

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Handler};
use russh::keys::PublicKey;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::{ErrorKind, Result, StorageError};
use crate::storage::account::{lenient, require};
use crate::storage::{Capability, ClientOptions, ProviderTag, StorageDriver, UploadSource};
use crate::transport::stream::IO_BUFFER;
use crate::transport::PartialFile;
use crate::utils::{join_root, ObjectPath};

/// SFTP 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    /// 主机名或 IP
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_port", deserialize_with = "lenient::port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    /// 密码（与私钥二选一）
    #[serde(default)]
    pub password: Option<String>,
    /// 私钥内容（PEM）或路径
    #[serde(rename = "privateKey", default)]
    pub private_key: Option<String>,
    /// 私钥密码
    #[serde(default)]
    pub passphrase: Option<String>,
    /// 根目录
    #[serde(default = "default_root")]
    pub path: String,
    /// 预期主机指纹（SHA256），配置后强制校验
    #[serde(default)]
    pub host_fingerprint: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_root() -> String {
    "/".to_string()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

impl SftpConfig {
    pub fn validate(&self) -> Result<()> {
        require(ProviderTag::Sftp, "address", &self.address)?;
        require(ProviderTag::Sftp, "username", &self.username)?;
        if non_empty(&self.password).is_none() && non_empty(&self.private_key).is_none() {
            return Err(StorageError::invalid_config("SFTP config: missing password or privateKey"));
        }
        Ok(())
    }
}

/// SSH 客户端 Handler（校验主机指纹）
struct SshClientHandler {
    expected_fingerprint: Option<String>,
}

#[async_trait]
impl Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        use russh::keys::HashAlg;
        let fingerprint = format!("{}", server_public_key.fingerprint(HashAlg::Sha256));

        if let Some(expected) = &self.expected_fingerprint {
            let expected = expected.trim().trim_start_matches("SHA256:").replace(':', "");
            let actual = fingerprint.trim_start_matches("SHA256:").replace(':', "");
            if expected != actual {
                tracing::error!("SFTP 主机指纹不匹配，期望: {}，实际: {}", expected, fingerprint);
                return Ok(false);
            }
        }
        tracing::debug!("SSH 服务器指纹: {}", fingerprint);
        Ok(true)
    }
}

/// SSH 连接持有者（保持连接存活）
struct SshConnection {
    session: Handle<SshClientHandler>,
    sftp: SftpSession,
}

/// SFTP 驱动
pub struct SftpDriver {
    config: SftpConfig,
    dial_timeout: Duration,
    connection: Mutex<Option<SshConnection>>,
}

impl SftpDriver {
    /// 建立连接并完成认证，失败立即返回
    pub async fn connect(config: SftpConfig, options: &ClientOptions) -> Result<Self> {
        let driver = Self {
            config,
            dial_timeout: options.timeouts.dial,
            connection: Mutex::new(None),
        };
        let conn = driver.create_connection().await?;
        *driver.connection.lock().await = Some(conn);
        Ok(driver)
    }

    /// 计算完整路径（带根目录）
    fn full_path(&self, path: &ObjectPath) -> String {
        join_root(&self.config.path, &path.as_key())
    }

    /// 建立新的 SSH/SFTP 连接
    async fn create_connection(&self) -> Result<SshConnection> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        tracing::debug!("SFTP: 建立新连接到 {}", addr);

        let handler = SshClientHandler {
            expected_fingerprint: non_empty(&self.config.host_fingerprint).map(str::to_string),
        };
        let mut session = tokio::time::timeout(
            self.dial_timeout,
            client::connect(Arc::new(Config::default()), addr.as_str(), handler),
        )
        .await
        .map_err(|_| StorageError::new(ErrorKind::Timeout, format!("SFTP 连接超时: {}", addr)))?
        .map_err(|e| ssh_connect_error(&addr, e))?;

        self.authenticate(&mut session).await?;
        tracing::debug!("SFTP: 认证成功");

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| StorageError::provider(format!("打开 SSH 通道失败: {}", e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| StorageError::provider(format!("请求 SFTP 子系统失败: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| StorageError::provider(format!("创建 SFTP 会话失败: {}", e)))?;

        tracing::info!("SFTP: 连接建立成功 - {}", addr);
        Ok(SshConnection { session, sftp })
    }

    /// 执行认证：私钥优先，其次密码
    async fn authenticate(&self, session: &mut Handle<SshClientHandler>) -> Result<()> {
        let username = &self.config.username;
        let accepted = if let Some(key) = non_empty(&self.config.private_key) {
            let passphrase = non_empty(&self.config.passphrase);
            // 内联 PEM 或文件路径
            let key_pair = if key.contains("-----BEGIN") {
                russh_keys::decode_secret_key(key, passphrase)
            } else {
                russh_keys::load_secret_key(Path::new(key), passphrase)
            }
            .map_err(|e| StorageError::invalid_config(format!("加载私钥失败: {}", e)))?;

            session
                .authenticate_publickey(username, Arc::new(key_pair))
                .await
                .map_err(|e| StorageError::new(ErrorKind::AuthFailure, format!("私钥认证失败: {}", e)))?
        } else {
            let password = non_empty(&self.config.password).unwrap_or_default();
            session
                .authenticate_password(username, password)
                .await
                .map_err(|e| StorageError::new(ErrorKind::AuthFailure, format!("密码认证失败: {}", e)))?
        };

        if !accepted {
            return Err(StorageError::new(
                ErrorKind::AuthFailure,
                format!("SFTP 认证被服务器拒绝: {}", username),
            ));
        }
        Ok(())
    }

    /// 独占当前会话；连接已断开时重连
    async fn sftp(&self) -> Result<MappedMutexGuard<'_, SftpSession>> {
        let mut guard = self.connection.lock().await;
        let stale = guard.as_ref().map(|c| c.session.is_closed()).unwrap_or(true);
        if stale {
            tracing::info!("SFTP: 会话已断开，重新连接");
            *guard = Some(self.create_connection().await?);
        }
        MutexGuard::try_map(guard, |slot| slot.as_mut().map(|c| &mut c.sftp))
            .map_err(|_| StorageError::new(ErrorKind::Unreachable, "SFTP 会话不可用"))
    }

    /// 递归删除
    async fn remove_recursive(sftp: &SftpSession, path: &str) -> Result<()> {
        let metadata = sftp.metadata(path).await.map_err(|e| sftp_error(e, path))?;
        if metadata.is_dir() {
            let entries = sftp.read_dir(path).await.map_err(|e| sftp_error(e, path))?;
            for entry in entries {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let child = format!("{}/{}", path.trim_end_matches('/'), name);
                Box::pin(Self::remove_recursive(sftp, &child)).await?;
            }
            tracing::debug!("SFTP: 删除目录 {}", path);
            sftp.remove_dir(path).await.map_err(|e| sftp_error(e, path))
        } else {
            tracing::debug!("SFTP: 删除文件 {}", path);
            sftp.remove_file(path).await.map_err(|e| sftp_error(e, path))
        }
    }

    /// 删除写了一半的远端文件，失败只记录日志
    async fn remove_partial(sftp: &SftpSession, target: &str) {
        if let Err(e) = sftp.remove_file(target).await {
            tracing::warn!("SFTP: 清理不完整文件 {} 失败: {}", target, e);
        }
    }

    /// 逐级创建父目录（已存在则跳过）
    async fn ensure_parent_dirs(sftp: &SftpSession, path: &str) -> Result<()> {
        let Some(last_slash) = path.rfind('/') else {
            return Ok(());
        };
        let parent = &path[..last_slash];
        if parent.is_empty() || sftp.try_exists(parent).await.map_err(|e| sftp_error(e, parent))? {
            return Ok(());
        }
        Box::pin(Self::ensure_parent_dirs(sftp, parent)).await?;
        tracing::debug!("SFTP: 创建目录 {}", parent);
        if let Err(e) = sftp.create_dir(parent).await {
            // 并发创建时目录可能已存在
            if !sftp.try_exists(parent).await.unwrap_or(false) {
                return Err(sftp_error(e, parent));
            }
        }
        Ok(())
    }

    async fn write_remote(sftp: &SftpSession, src: &UploadSource, target: &str) -> Result<u64> {
        let mut remote = sftp.create(target).await.map_err(|e| sftp_error(e, target))?;
        let local = src.open_file().await?;
        let mut reader = BufReader::with_capacity(IO_BUFFER, local);
        let written = tokio::io::copy_buf(&mut reader, &mut remote)
            .await
            .map_err(|e| StorageError::provider(format!("SFTP 写入失败: {} - {}", target, e)))?;
        remote
            .shutdown()
            .await
            .map_err(|e| StorageError::provider(format!("SFTP 关闭文件失败: {} - {}", target, e)))?;
        Ok(written)
    }
}

fn ssh_connect_error(addr: &str, e: russh::Error) -> StorageError {
    let message = format!("SSH 连接/握手失败: {} - {}", addr, e);
    match e {
        russh::Error::IO(_) | russh::Error::Disconnect => StorageError::new(ErrorKind::Unreachable, message),
        _ => StorageError::provider(message),
    }
}

/// SFTP 状态码转换
fn sftp_error(e: SftpError, path: &str) -> StorageError {
    let message = format!("{}: {}", path, e);
    match e {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => StorageError::not_found(message),
            StatusCode::PermissionDenied => StorageError::new(ErrorKind::PermissionDenied, message),
            _ => StorageError::provider(message),
        },
        SftpError::Timeout => StorageError::new(ErrorKind::Timeout, message),
        _ => StorageError::provider(message),
    }
}

#[async_trait]
impl StorageDriver for SftpDriver {
    fn name(&self) -> &str {
        "sftp"
    }

    fn capabilities(&self) -> Capability {
        Capability::default()
    }

    async fn list_objects(&self, prefix: &ObjectPath) -> Result<Vec<String>> {
        let dir = self.full_path(prefix);
        let sftp = self.sftp().await?;
        let entries = sftp.read_dir(dir.as_str()).await.map_err(|e| sftp_error(e, &dir))?;
        Ok(entries
            .map(|entry| entry.file_name())
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    async fn exist(&self, path: &ObjectPath) -> Result<bool> {
        let full = self.full_path(path);
        let sftp = self.sftp().await?;
        sftp.try_exists(full.as_str()).await.map_err(|e| sftp_error(e, &full))
    }

    async fn size(&self, path: &ObjectPath) -> Result<u64> {
        let full = self.full_path(path);
        let sftp = self.sftp().await?;
        let metadata = sftp.metadata(full.as_str()).await.map_err(|e| sftp_error(e, &full))?;
        Ok(metadata.len())
    }

    async fn upload(&self, src: &UploadSource, dst: &ObjectPath) -> Result<()> {
        let target = self.full_path(dst);
        let sftp = self.sftp().await?;
        Self::ensure_parent_dirs(&sftp, &target).await?;

        tracing::debug!("SFTP: 上传 {:?} -> {}", src.path, target);
        let written = match Self::write_remote(&sftp, src, &target).await {
            Ok(written) => written,
            Err(e) => {
                // 清理不完整的远端文件
                Self::remove_partial(&sftp, &target).await;
                return Err(e);
            }
        };
        if written != src.size {
            Self::remove_partial(&sftp, &target).await;
            return Err(StorageError::new(
                ErrorKind::PartialTransfer,
                format!("SFTP 写入 {} / {} bytes: {}", written, src.size, target),
            ));
        }
        Ok(())
    }

    async fn download(&self, src: &ObjectPath, dst: &Path) -> Result<()> {
        let source = self.full_path(src);
        let sftp = self.sftp().await?;
        let mut remote = sftp.open(source.as_str()).await.map_err(|e| sftp_error(e, &source))?;
        let mut partial = PartialFile::create(dst).await?;
        partial.write_reader(&mut remote).await?;
        partial.commit().await
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        let full = self.full_path(path);
        let sftp = self.sftp().await?;
        Self::remove_recursive(&sftp, &full).await
    }
}
