//! 本地文件系统驱动 / Local filesystem driver

mod driver;

pub use driver::{LocalConfig, LocalDriver};
