//! SFTP 存储驱动（russh，纯 Rust）

mod driver;

pub use driver::{SftpConfig, SftpDriver};
