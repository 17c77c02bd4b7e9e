// 上传错误分类
//
// - Config: 参数/计划非法，不重试
// - TransientNetwork: 超时、524 等瞬时错误，重试耗尽后才会出现
// - StorageExhausted: 507 存储空间不足，立即终止，不重试
// - IncompleteUpload: 服务端记录的分片数不一致
// - Completion: 合并请求在多次尝试（含 HEAD 校验）后仍无法确认
// - Verification: 合并成功但对象大小与本地文件不一致

use crate::storage::StorageError;
use std::fmt;
use thiserror::Error;

/// 上传错误
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("{operation}: 网络不稳定，{attempts} 次尝试均失败: {source}")]
    TransientNetwork {
        operation: String,
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("{operation}: 服务端存储空间不足: {source}")]
    StorageExhausted {
        operation: String,
        #[source]
        source: StorageError,
    },

    #[error("{operation}: 请求失败（不可重试）: {source}")]
    Storage {
        operation: String,
        #[source]
        source: StorageError,
    },

    #[error("分片不完整: 期望 {expected} 个分片，服务端记录 {found} 个")]
    IncompleteUpload { expected: u32, found: usize },

    #[error("合并分片失败（{attempts} 次尝试，最后一次{}）: {source}", completion_outcome(.ambiguous))]
    Completion {
        attempts: u32,
        /// 最后一次失败是否为“结果未知”（超时 / NoSuchUpload）
        ambiguous: bool,
        #[source]
        source: StorageError,
    },

    #[error("上传校验失败: 远端对象 {actual} bytes，本地文件 {expected} bytes")]
    Verification { expected: u64, actual: u64 },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("内部错误: {0}")]
    Internal(String),
}

fn completion_outcome(ambiguous: &bool) -> &'static str {
    if *ambiguous {
        "结果未知"
    } else {
        "明确失败"
    }
}

impl UploadError {
    pub(crate) fn storage(operation: impl Into<String>, source: StorageError) -> Self {
        UploadError::Storage {
            operation: operation.into(),
            source,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        UploadError::Io {
            context: context.into(),
            source,
        }
    }

    /// 面向操作者的提示，区分“存储已满”“网络不稳定”“校验不一致”
    pub fn user_hint(&self) -> &'static str {
        match self {
            UploadError::Config(_) => "请检查参数或配置文件",
            UploadError::TransientNetwork { .. } => {
                "网络不稳定或服务端过载，可稍后重试或增大 --max-retries"
            }
            UploadError::StorageExhausted { .. } => "目标存储空间已满，请清理或扩容后再续传",
            UploadError::Storage { .. } => "服务端拒绝了请求，请检查凭证、bucket 与 key",
            UploadError::IncompleteUpload { .. } => "服务端缺少部分分片，请检查上传会话后手动续传",
            UploadError::Completion { .. } => {
                "合并分片未能确认完成，请稍后用 HeadObject 检查对象或手动完成上传"
            }
            UploadError::Verification { .. } => "远端对象大小与本地文件不一致，数据可能已损坏",
            UploadError::Io { .. } => "读取本地文件失败",
            UploadError::Internal(_) => "内部错误",
        }
    }
}

/// 上传阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    /// 计算分片计划
    Plan,
    /// 创建分片上传会话
    CreateSession,
    /// 并发上传分片
    UploadParts,
    /// 核对服务端分片
    VerifyParts,
    /// 合并分片
    Complete,
    /// 校验最终对象
    VerifyObject,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadPhase::Plan => "计算分片计划",
            UploadPhase::CreateSession => "创建上传会话",
            UploadPhase::UploadParts => "上传分片",
            UploadPhase::VerifyParts => "核对分片",
            UploadPhase::Complete => "合并分片",
            UploadPhase::VerifyObject => "校验对象",
        };
        write!(f, "{}", name)
    }
}

/// 上传失败（保留未中止的 upload id，便于手动续传）
#[derive(Debug, Error)]
#[error("{phase}阶段失败: {error}")]
pub struct UploadFailure {
    pub phase: UploadPhase,
    pub upload_id: Option<String>,
    #[source]
    pub error: UploadError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hints_distinguish_failure_classes() {
        let full = UploadError::StorageExhausted {
            operation: "upload_part".to_string(),
            source: StorageError::InvalidRequest("x".to_string()),
        };
        let flaky = UploadError::TransientNetwork {
            operation: "upload_part".to_string(),
            attempts: 5,
            source: StorageError::Timeout {
                operation: "upload_part",
                timeout: std::time::Duration::from_secs(60),
            },
        };
        let mismatch = UploadError::Verification {
            expected: 10,
            actual: 9,
        };

        assert_ne!(full.user_hint(), flaky.user_hint());
        assert_ne!(flaky.user_hint(), mismatch.user_hint());
        assert_ne!(full.user_hint(), mismatch.user_hint());
    }

    #[test]
    fn test_failure_display_includes_phase() {
        let failure = UploadFailure {
            phase: UploadPhase::VerifyParts,
            upload_id: Some("abc".to_string()),
            error: UploadError::IncompleteUpload {
                expected: 3,
                found: 2,
            },
        };
        assert_eq!(
            failure.to_string(),
            "核对分片阶段失败: 分片不完整: 期望 3 个分片，服务端记录 2 个"
        );
    }
}
