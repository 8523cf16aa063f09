/// Path processing utility functions / 路径处理工具函数

use std::fmt;

use crate::error::{Result, StorageError};

/// Normalized object identifier relative to the account root / 规范化的对象路径
///
/// 1. Leading and duplicate `/` are collapsed / 折叠多余的 `/`
/// 2. `.` segments are dropped / 忽略 `.`
/// 3. `..` segments are rejected / 拒绝 `..`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ObjectPath {
    segments: Vec<String>,
}

impl ObjectPath {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.contains('\0') {
            return Err(StorageError::invalid_path(format!("path contains NUL byte: {:?}", raw)));
        }
        let mut segments = Vec::new();
        for part in raw.split('/') {
            match part {
                "" | "." => continue,
                ".." => {
                    return Err(StorageError::invalid_path(format!(
                        "parent segment not allowed: {}",
                        raw
                    )))
                }
                _ => segments.push(part.to_string()),
            }
        }
        Ok(Self { segments })
    }

    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment / 文件名
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    /// Parent directory, root for single-segment paths / 父目录
    pub fn parent(&self) -> ObjectPath {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// First `n` segments / 前 n 段
    pub fn prefix(&self, n: usize) -> ObjectPath {
        Self {
            segments: self.segments[..n.min(self.segments.len())].to_vec(),
        }
    }

    pub fn starts_with(&self, other: &ObjectPath) -> bool {
        self.segments.starts_with(&other.segments)
    }

    /// Relative key without leading slash: `a/b/c` / 不带前导斜杠的键
    pub fn as_key(&self) -> String {
        self.segments.join("/")
    }

    /// Key joined under a root prefix / 拼接根前缀
    pub fn key_under(&self, root: &str) -> String {
        let root = root.trim_matches('/');
        let key = self.as_key();
        match (root.is_empty(), key.is_empty()) {
            (true, _) => key,
            (false, true) => root.to_string(),
            (false, false) => format!("{}/{}", root, key),
        }
    }

    /// Per-segment URL encoding, joined by `/` / 逐段 URL 编码
    pub fn encoded(&self) -> String {
        self.segments
            .iter()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

/// Join a root directory and a relative path with exactly one `/` / 拼接根目录
pub fn join_root(root: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    let root = root.trim_end_matches('/');
    if rel.is_empty() {
        if root.is_empty() {
            "/".to_string()
        } else {
            root.to_string()
        }
    } else {
        format!("{}/{}", root, rel)
    }
}

/// Truncate provider text for error messages / 截断错误文本
pub fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_normalizes() {
        assert_eq!(ObjectPath::parse("/a/b").unwrap(), ObjectPath::parse("a/b").unwrap());
        assert_eq!(ObjectPath::parse("/a//b///c").unwrap().as_key(), "a/b/c");
        assert_eq!(ObjectPath::parse("./a/./b").unwrap().as_key(), "a/b");
        assert!(ObjectPath::parse("").unwrap().is_root());
        assert!(ObjectPath::parse("///").unwrap().is_root());
    }

    #[test]
    fn test_parse_rejects_parent_segments() {
        let err = ObjectPath::parse("a/../b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        assert_eq!(ObjectPath::parse("..").unwrap_err().kind(), ErrorKind::InvalidPath);
        // dots inside a name are fine
        assert_eq!(ObjectPath::parse("a/..b/c..").unwrap().len(), 3);
    }

    #[test]
    fn test_parent_and_name() {
        let p = ObjectPath::parse("dir/sub/a.bin").unwrap();
        assert_eq!(p.name(), Some("a.bin"));
        assert_eq!(p.parent().as_key(), "dir/sub");
        assert_eq!(p.prefix(1).as_key(), "dir");
        assert!(p.starts_with(&p.prefix(2)));
        assert!(ObjectPath::parse("a").unwrap().parent().is_root());
        assert_eq!(p.to_string(), "/dir/sub/a.bin");
    }

    #[test]
    fn test_key_under_root() {
        let p = ObjectPath::parse("x/y").unwrap();
        assert_eq!(p.key_under(""), "x/y");
        assert_eq!(p.key_under("/backup/"), "backup/x/y");
        assert_eq!(ObjectPath::root().key_under("backup"), "backup");
    }

    #[test]
    fn test_encoded_segments() {
        let p = ObjectPath::parse("备份/a b.txt").unwrap();
        assert_eq!(p.encoded(), "%E5%A4%87%E4%BB%BD/a%20b.txt");
    }

    #[test]
    fn test_join_root() {
        assert_eq!(join_root("/data/", "/a/b"), "/data/a/b");
        assert_eq!(join_root("", ""), "/");
        assert_eq!(join_root("/data", ""), "/data");
    }

    #[test]
    fn test_truncate_char_boundary() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("备份", 4), "备");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
