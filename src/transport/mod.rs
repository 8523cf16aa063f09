//! Transport core shared by the drivers / 驱动共享的传输层

pub mod http;
pub mod multipart;
pub mod resolver;
pub mod stream;
pub mod token;

pub use http::OperationTimeouts;
pub use multipart::{AbortOnDrop, MultipartUpload, PartPlan, PartSpec};
pub use resolver::{DriveItem, DriveTree, PathResolver};
pub use stream::PartialFile;
pub use token::{TokenGrant, TokenManager, TokenPhase, TokenRefresher, TokenStore};
