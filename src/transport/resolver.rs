//! Path to opaque-ID resolution for drive-style providers / 网盘路径解析
//!
//! Paths are walked segment by segment from the root; the first child with a
//! matching name wins. Resolved directory IDs are kept in a positive-only
//! cache with a TTL, invalidated on delete of any prefix.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::utils::ObjectPath;

/// Default cache TTL / 默认缓存有效期
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// One child entry as the provider reports it / 网盘条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

impl DriveItem {
    pub fn folder(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_dir: true,
            size: 0,
        }
    }
}

/// The three primitives path resolution needs from a drive / 网盘需要提供的原语
#[async_trait]
pub trait DriveTree: Send + Sync {
    fn root_id(&self) -> &str;

    /// Every child of `parent_id`, all pages / 完整分页后的子项
    async fn list_children(&self, parent_id: &str) -> Result<Vec<DriveItem>>;

    /// Create a folder and return its ID / 创建文件夹
    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String>;
}

pub struct PathResolver {
    ttl: Duration,
    dirs: Mutex<HashMap<String, (String, Instant)>>,
}

impl PathResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            dirs: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &str) -> Option<String> {
        let mut dirs = self.dirs.lock();
        match dirs.get(key) {
            Some((id, at)) if at.elapsed() < self.ttl => Some(id.clone()),
            Some(_) => {
                dirs.remove(key);
                None
            }
            None => None,
        }
    }

    fn remember(&self, key: String, id: &str) {
        if self.ttl.is_zero() {
            return;
        }
        self.dirs.lock().insert(key, (id.to_string(), Instant::now()));
    }

    /// Drop `path` and everything below it / 使前缀失效
    pub fn invalidate_prefix(&self, path: &ObjectPath) {
        let key = path.as_key();
        if key.is_empty() {
            self.dirs.lock().clear();
            return;
        }
        let nested = format!("{}/", key);
        self.dirs.lock().retain(|k, _| k != &key && !k.starts_with(&nested));
    }

    /// Longest cached directory prefix of the first `limit` segments
    fn cached_prefix(&self, path: &ObjectPath, limit: usize, root_id: &str) -> (usize, String) {
        for depth in (1..=limit).rev() {
            if let Some(id) = self.cached(&path.prefix(depth).as_key()) {
                return (depth, id);
            }
        }
        (0, root_id.to_string())
    }

    /// Resolve a directory path to its ID / 解析目录 ID
    pub async fn resolve_dir(&self, tree: &dyn DriveTree, path: &ObjectPath) -> Result<String> {
        if path.is_root() {
            return Ok(tree.root_id().to_string());
        }
        let item = self.resolve(tree, path).await?;
        if !item.is_dir {
            return Err(StorageError::not_found(format!("{} is not a directory", path)));
        }
        Ok(item.id)
    }

    /// Resolve any path to the drive item it names / 解析条目
    pub async fn resolve(&self, tree: &dyn DriveTree, path: &ObjectPath) -> Result<DriveItem> {
        if path.is_root() {
            return Ok(DriveItem::folder(tree.root_id(), ""));
        }
        match self.walk(tree, path, true).await {
            Err(e) if e.is_not_found() => {
                // a cached folder may have been removed out of band
                self.invalidate_prefix(&path.prefix(1));
                self.walk(tree, path, false).await
            }
            other => other,
        }
    }

    async fn walk(&self, tree: &dyn DriveTree, path: &ObjectPath, use_cache: bool) -> Result<DriveItem> {
        let segments = path.segments();
        let (start, mut parent) = if use_cache {
            self.cached_prefix(path, segments.len() - 1, tree.root_id())
        } else {
            (0, tree.root_id().to_string())
        };

        for (i, name) in segments.iter().enumerate().skip(start) {
            let children = tree.list_children(&parent).await?;
            let found = children
                .into_iter()
                .find(|c| &c.name == name)
                .ok_or_else(|| StorageError::not_found(path.to_string()))?;

            if i + 1 == segments.len() {
                if found.is_dir {
                    self.remember(path.as_key(), &found.id);
                }
                return Ok(found);
            }
            if !found.is_dir {
                return Err(StorageError::not_found(format!("{} is not a directory", path.prefix(i + 1))));
            }
            self.remember(path.prefix(i + 1).as_key(), &found.id);
            parent = found.id;
        }
        Err(StorageError::not_found(path.to_string()))
    }

    /// mkdir -p: reuse existing folders, create the missing tail / 逐级创建目录
    pub async fn mkdir_all(&self, tree: &dyn DriveTree, path: &ObjectPath) -> Result<String> {
        if path.is_root() {
            return Ok(tree.root_id().to_string());
        }
        let segments = path.segments();
        let (start, mut parent) = self.cached_prefix(path, segments.len(), tree.root_id());

        let mut creating = false;
        for (i, name) in segments.iter().enumerate().skip(start) {
            let existing = if creating {
                None
            } else {
                tree.list_children(&parent)
                    .await?
                    .into_iter()
                    .find(|c| c.is_dir && &c.name == name)
            };
            parent = match existing {
                Some(dir) => dir.id,
                None => {
                    creating = true;
                    tracing::debug!("creating folder {} under {}", name, parent);
                    tree.create_folder(&parent, name).await?
                }
            };
            self.remember(path.prefix(i + 1).as_key(), &parent);
        }
        Ok(parent)
    }
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
