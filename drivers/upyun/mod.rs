//! 又拍云对象存储驱动

mod driver;
mod sign;

pub use driver::{UpyunConfig, UpyunDriver};
