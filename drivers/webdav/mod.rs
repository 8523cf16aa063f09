//! WebDAV 网络存储驱动

mod driver;
mod propfind;

pub use driver::{WebDavConfig, WebDavDriver};
