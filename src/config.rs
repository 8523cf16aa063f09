//! Application configuration module / 应用配置模块
//!
//! Manages the account list and defaults loaded from config.json
//! Creates default config file on first run / 首次运行时创建默认配置文件

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ErrorKind, StorageError};
use crate::storage::{BackupAccount, ClientOptions};
use crate::transport::{OperationTimeouts, TokenStore};

/// Global configuration instance / 全局配置实例
static CONFIG: OnceCell<Arc<RwLock<AppConfig>>> = OnceCell::new();

/// Application configuration / 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log filter used when RUST_LOG is unset / 默认日志过滤
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Per-operation deadlines in seconds / 超时配置（秒）
    #[serde(default)]
    pub timeouts: OperationTimeouts,
    /// Backup accounts / 备份账户
    #[serde(default)]
    pub accounts: Vec<BackupAccount>,
}

fn default_log_filter() -> String {
    "cloud_storage=info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            timeouts: OperationTimeouts::default(),
            accounts: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Find an account by name / 按名称查找账户
    pub fn account(&self, name: &str) -> Option<&BackupAccount> {
        self.accounts.iter().find(|a| a.name == name)
    }

    /// Client options derived from this config / 生成句柄选项
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            timeouts: self.timeouts,
            ..ClientOptions::default()
        }
    }
}

/// Get the default config file path / 获取默认配置文件路径
pub fn get_config_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("config.json")
}

/// Load configuration from file, or create default if not exists / 加载配置文件，不存在则创建默认配置
pub fn load_config(config_path: &Path) -> Result<AppConfig, String> {
    if config_path.exists() {
        // Load existing config / 加载现有配置
        let content = std::fs::read_to_string(config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config file: {}", e))?;

        tracing::debug!("Loaded configuration from {:?}", config_path);
        Ok(config)
    } else {
        // Create default config / 创建默认配置
        let config = AppConfig::default();
        save_config(config_path, &config)?;
        tracing::info!("Created default configuration at {:?}", config_path);
        Ok(config)
    }
}

/// Save configuration to file / 保存配置到文件
pub fn save_config(config_path: &Path, config: &AppConfig) -> Result<(), String> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    std::fs::write(config_path, content)
        .map_err(|e| format!("Failed to write config file: {}", e))?;

    Ok(())
}

/// Initialize global configuration / 初始化全局配置
pub fn init_config(config_path: &Path) -> Result<Arc<RwLock<AppConfig>>, String> {
    let config = load_config(config_path)?;

    let config_arc = Arc::new(RwLock::new(config));

    CONFIG.set(config_arc.clone())
        .map_err(|_| "Config already initialized".to_string())?;

    Ok(config_arc)
}

/// Get global configuration instance / 获取全局配置实例
pub fn get_config() -> Arc<RwLock<AppConfig>> {
    CONFIG.get_or_init(|| {
        let config = load_config(&get_config_path()).unwrap_or_default();
        Arc::new(RwLock::new(config))
    }).clone()
}

/// Writes rotated refresh tokens back into config.json / 将轮换后的 refresh_token 写回配置文件
pub struct ConfigTokenStore {
    path: PathBuf,
    config: Arc<RwLock<AppConfig>>,
}

impl ConfigTokenStore {
    pub fn new(path: impl Into<PathBuf>, config: Arc<RwLock<AppConfig>>) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }
}

#[async_trait]
impl TokenStore for ConfigTokenStore {
    async fn persist(&self, account: &str, refresh_token: &str) -> crate::error::Result<()> {
        let snapshot = {
            let mut config = self.config.write();
            let entry = config
                .accounts
                .iter_mut()
                .find(|a| a.name == account)
                .ok_or_else(|| StorageError::invalid_config(format!("account {} not in config", account)))?;
            entry
                .vars
                .insert("refresh_token".to_string(), Value::String(refresh_token.to_string()));
            config.clone()
        };
        save_config(&self.path, &snapshot).map_err(|e| StorageError::new(ErrorKind::LocalIoError, e))?;
        tracing::info!("Refresh token rotated and saved for account {}", account);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config_created_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = load_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.log_filter, "cloud_storage=info");
        assert!(config.accounts.is_empty());
        assert_eq!(config.timeouts, OperationTimeouts::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"accounts":[{"name":"nas","type":"LOCAL","vars":{"path":"/srv/backup"}}]}"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.log_filter, "cloud_storage=info");
        assert_eq!(config.account("nas").unwrap().provider, "LOCAL");
        assert!(config.account("missing").is_none());
    }

    #[test]
    fn test_global_config_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let shared = init_config(&path).unwrap();
        assert!(Arc::ptr_eq(&shared, &get_config()));
        assert!(init_config(&path).is_err());
    }

    #[tokio::test]
    async fn test_token_store_rewrites_account() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.accounts.push(BackupAccount {
            name: "drive".into(),
            provider: "ALIYUN".into(),
            bucket: String::new(),
            vars: json!({"refresh_token": "r0", "drive_id": "d1"}).as_object().cloned().unwrap(),
        });
        save_config(&path, &config).unwrap();

        let shared = Arc::new(RwLock::new(config));
        let store = ConfigTokenStore::new(&path, shared.clone());
        store.persist("drive", "r1").await.unwrap();

        let reloaded = load_config(&path).unwrap();
        assert_eq!(reloaded.account("drive").unwrap().vars["refresh_token"], "r1");
        assert_eq!(reloaded.account("drive").unwrap().vars["drive_id"], "d1");

        let err = store.persist("other", "r2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}
