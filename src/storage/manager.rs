use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;

use super::{factory, BackupAccount, Client, ClientOptions};

/// Per-account handle registry / 存储管理器（每个账户一个句柄）
#[derive(Clone)]
pub struct StorageManager {
    clients: Arc<RwLock<HashMap<String, Arc<Client>>>>,
    options: ClientOptions,
}

impl StorageManager {
    /// `options` is the template; the account name is filled in per handle
    pub fn new(options: ClientOptions) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            options,
        }
    }

    /// Cached handle for `account`, built on first use / 获取或创建句柄
    pub async fn get_or_connect(&self, account: &BackupAccount) -> Result<Arc<Client>> {
        if let Some(client) = self.clients.read().await.get(&account.name) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;
        // another task may have connected while we waited for the write lock
        if let Some(client) = clients.get(&account.name) {
            return Ok(client.clone());
        }

        let options = ClientOptions {
            account: account.name.clone(),
            ..self.options.clone()
        };
        let client = match factory::new_cloud_storage_client_with(&account.provider, &account.client_vars(), options).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::error!("Storage client creation failed: {} ({}) - {}", account.name, account.provider, e);
                return Err(e);
            }
        };
        clients.insert(account.name.clone(), client.clone());
        tracing::info!("Storage client registered: {} ({})", account.name, account.provider);
        Ok(client)
    }

    /// Drop the handle after the account was edited or removed / 移除句柄
    pub async fn remove(&self, name: &str) -> bool {
        let removed = self.clients.write().await.remove(name).is_some();
        if removed {
            tracing::info!("Storage client removed: {}", name);
        }
        removed
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StorageManager {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}
