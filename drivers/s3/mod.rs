//! S3兼容对象存储驱动

mod config;
mod driver;

pub use config::{S3Config, S3Flavor};
pub use driver::S3Driver;
