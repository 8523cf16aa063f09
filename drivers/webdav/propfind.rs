//! PROPFIND 响应解析

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Result, StorageError};

/// 请求体：只取类型和大小
pub const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:"><D:prop><D:resourcetype/><D:getcontentlength/></D:prop></D:propfind>"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEntry {
    /// 解码后的路径部分，不含结尾 `/`
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

impl DavEntry {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }
}

/// href 可能是绝对 URL 或路径，统一为解码后的路径
fn href_path(href: &str) -> String {
    let path = match url::Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    let decoded = urlencoding::decode(&path)
        .map(|s| s.into_owned())
        .unwrap_or(path);
    decoded.trim_end_matches('/').to_string()
}

/// 解析 multistatus，返回所有 response 条目（包括目录自身）
pub fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>> {
    let mut entries = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut href = String::new();
    let mut is_dir = false;
    let mut size: u64 = 0;
    let mut in_href = false;
    let mut in_length = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"response" => {
                    href.clear();
                    is_dir = false;
                    size = 0;
                }
                b"href" => in_href = true,
                b"collection" => is_dir = true,
                b"getcontentlength" => in_length = true,
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"collection" {
                    is_dir = true;
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"response" => {
                    if !href.is_empty() {
                        entries.push(DavEntry {
                            path: href_path(&href),
                            is_dir,
                            size,
                        });
                    }
                }
                b"href" => in_href = false,
                b"getcontentlength" => in_length = false,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if in_href {
                    href = text;
                } else if in_length {
                    size = text.trim().parse().unwrap_or(0);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(StorageError::provider(format!(
                    "解析WebDAV XML失败 at {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/backup/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/backup/db%20dump.sql</d:href>
    <d:propstat><d:prop><d:resourcetype/><d:getcontentlength>1024</d:getcontentlength></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>https://dav.example.com/dav/backup/%E5%A4%87%E4%BB%BD/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection></d:collection></d:resourcetype></d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_listing() {
        let entries = parse_multistatus(LISTING).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, "/dav/backup");
        assert!(entries[0].is_dir);

        assert_eq!(entries[1].name(), "db dump.sql");
        assert_eq!(entries[1].size, 1024);
        assert!(!entries[1].is_dir);

        assert_eq!(entries[2].path, "/dav/backup/备份");
        assert!(entries[2].is_dir);
    }

    #[test]
    fn test_malformed_xml() {
        assert!(parse_multistatus("<d:multistatus><d:response></d:multistatus>").is_err());
    }
}
