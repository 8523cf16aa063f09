// Driver package / 驱动包
//
// One module per backend family; the factory in `storage::factory` picks
// the driver for a provider tag / 每个存储一个模块，由工厂按标签分发
pub mod aliyun;
pub mod google_drive;
pub mod local;
pub mod onedrive;
pub mod s3;
pub mod sftp;
pub mod upyun;
pub mod webdav;
