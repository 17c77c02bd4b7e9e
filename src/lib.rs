// S3 Multipart Uploader
// 大文件分片上传核心库

// 命令行参数
pub mod cli;

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 对象存储客户端
pub mod storage;

// 分片上传模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, UploadSettings};
pub use storage::{ObjectStorage, S3Client, StorageError};
pub use uploader::{
    MultipartUploader, UploadError, UploadFailure, UploadPhase, UploadPlan, UploadReport,
    UploadRequest, UploaderOptions,
};
