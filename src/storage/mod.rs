// 对象存储模块
//
// 上传核心只依赖 ObjectStorage trait 描述的六个 S3 兼容操作，
// 具体实现见 s3.rs（reqwest + SigV4）；测试使用内存实现 mock.rs。

pub mod s3;
pub mod sign;

#[cfg(test)]
pub(crate) mod mock;

#[cfg(test)]
pub(crate) mod stub_server;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

pub use s3::S3Client;

/// HTTP 524：上游超时（代理/网关在合并或校验过程中断开连接）
pub const STATUS_UPSTREAM_TIMEOUT: u16 = 524;

/// HTTP 507：存储空间不足
pub const STATUS_INSUFFICIENT_STORAGE: u16 = 507;

/// 分片上传会话不存在（可能已被之前的请求完成）
pub const CODE_NO_SUCH_UPLOAD: &str = "NoSuchUpload";

/// 对象存储客户端错误
#[derive(Debug, Error)]
pub enum StorageError {
    /// 客户端侧超时，`timeout` 为实际生效的超时时间
    #[error("{operation} 请求超时 (timeout={timeout:?})")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// 服务端返回的错误响应
    #[error("{operation} 失败: HTTP {status}{}", service_detail(.code, .message))]
    Service {
        operation: &'static str,
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },

    /// 网络层错误（连接被重置、DNS 等）
    #[error("{operation} 网络错误: {source}")]
    Network {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// 响应体无法解析
    #[error("{operation} 响应解析失败: {message}")]
    InvalidResponse {
        operation: &'static str,
        message: String,
    },

    /// 请求构造失败（URL、签名等）
    #[error("请求构造失败: {0}")]
    InvalidRequest(String),
}

fn service_detail(code: &Option<String>, message: &Option<String>) -> String {
    let mut detail = String::new();
    if let Some(code) = code {
        detail.push_str(&format!(" [{}]", code));
    }
    if let Some(message) = message {
        detail.push_str(&format!(" {}", message));
    }
    detail
}

impl StorageError {
    /// HTTP 状态码（仅服务端错误）
    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 服务端错误码（如 NoSuchUpload）
    pub fn code(&self) -> Option<&str> {
        match self {
            StorageError::Service { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// 客户端侧连接/读取超时
    pub fn is_timeout(&self) -> bool {
        matches!(self, StorageError::Timeout { .. })
    }

    /// 524 上游超时
    pub fn is_gateway_timeout(&self) -> bool {
        self.status() == Some(STATUS_UPSTREAM_TIMEOUT)
    }

    /// 507 存储空间不足
    pub fn is_insufficient_storage(&self) -> bool {
        self.status() == Some(STATUS_INSUFFICIENT_STORAGE)
    }

    /// 分片上传会话不存在
    pub fn is_no_such_upload(&self) -> bool {
        self.code() == Some(CODE_NO_SUCH_UPLOAD)
    }
}

/// 服务端记录的分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSummary {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// 合并请求中的分片（必须按 part_number 升序提交）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// HeadObject 结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_length: u64,
}

/// S3 兼容的分片上传协议
///
/// `timeout` 为 None 时使用客户端默认请求超时。
/// 分片上传的超时由实现按分片大小放宽，慢速链路上只要数据仍在传输就不会被截断。
/// 实现可以自带传输层自动重试，上传核心的重试策略叠加在其之上。
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// CreateMultipartUpload，返回 upload id
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String, StorageError>;

    /// UploadPart，返回 ETag
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError>;

    /// ListParts（实现负责翻页，返回全部分片）
    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartSummary>, StorageError>;

    /// CompleteMultipartUpload
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        timeout: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// HeadObject
    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<ObjectMetadata, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(status: u16, code: Option<&str>) -> StorageError {
        StorageError::Service {
            operation: "upload_part",
            status,
            code: code.map(str::to_string),
            message: None,
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(service(524, None).is_gateway_timeout());
        assert!(!service(524, None).is_insufficient_storage());
        assert!(service(507, None).is_insufficient_storage());
        assert!(service(404, Some("NoSuchUpload")).is_no_such_upload());
        assert!(!service(404, Some("NoSuchKey")).is_no_such_upload());

        let timeout = StorageError::Timeout {
            operation: "head_object",
            timeout: Duration::from_secs(60),
        };
        assert!(timeout.is_timeout());
        assert_eq!(timeout.to_string(), "head_object 请求超时 (timeout=60s)");
        assert_eq!(timeout.status(), None);
    }

    #[test]
    fn test_service_error_display() {
        let err = StorageError::Service {
            operation: "complete_multipart_upload",
            status: 404,
            code: Some("NoSuchUpload".to_string()),
            message: Some("The specified upload does not exist".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "complete_multipart_upload 失败: HTTP 404 [NoSuchUpload] The specified upload does not exist"
        );
        assert_eq!(service(524, None).to_string(), "upload_part 失败: HTTP 524");
    }
}
