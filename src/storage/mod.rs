// 对象存储接口模块

pub mod client;
pub mod types;

pub use client::{ProgressFn, StorageApi, StorageClient};
pub use types::*;
