// 重试与指数退避
//
// 所有网络调用共用同一个重试过程，各调用点只提供自己的可重试判定：
// - 第 n 次失败且可重试时等待 base_delay * 2^n 后重试（默认 2s、4s、8s...）
// - 最后一次失败原样向上返回（包装为 TransientNetwork）
// - 507 存储空间不足无论判定器如何都立即终止，不消耗后续尝试次数

use super::UploadError;
use crate::storage::StorageError;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// 默认退避基数（秒级）
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// 失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 客户端连接/读取超时（可重试）
    Timeout,
    /// 网络层错误，如连接被重置（可重试）
    Network,
    /// 524 上游超时 / 服务端过载（可重试）
    Overloaded,
    /// 507 存储空间不足（致命，立即终止）
    StorageExhausted,
    /// 分片上传会话不存在
    NoSuchUpload,
    /// 其他错误（不可重试）
    Other,
}

impl FailureKind {
    /// 分类存储错误
    pub fn classify(error: &StorageError) -> Self {
        if error.is_insufficient_storage() {
            FailureKind::StorageExhausted
        } else if error.is_timeout() {
            FailureKind::Timeout
        } else if error.is_gateway_timeout() {
            FailureKind::Overloaded
        } else if error.is_no_such_upload() {
            FailureKind::NoSuchUpload
        } else if matches!(error, StorageError::Network { .. }) {
            FailureKind::Network
        } else {
            FailureKind::Other
        }
    }

    /// 是否为瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::Network | FailureKind::Overloaded
        )
    }
}

/// 可重试判定
pub trait RetryClassifier: Send + Sync {
    fn is_retryable(&self, error: &StorageError) -> bool;
}

impl<F> RetryClassifier for F
where
    F: Fn(&StorageError) -> bool + Send + Sync,
{
    fn is_retryable(&self, error: &StorageError) -> bool {
        self(error)
    }
}

/// 超时 / 524 / 网络层错误可重试
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientFailures;

impl RetryClassifier for TransientFailures {
    fn is_retryable(&self, error: &StorageError) -> bool {
        FailureKind::classify(error).is_transient()
    }
}

/// 重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    /// 退避基数，第 n 次失败后等待 base_delay * 2^n
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// 第 `attempt` 次（从 1 开始）失败后的等待时间
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// 带重试执行一个网络操作
///
/// `operation` 接收当前尝试序号（从 1 开始）。
/// 返回的 `UploadError::Storage` 会按 `classifier` 判定是否重试；
/// 其他错误（如本地文件读取失败）直接返回。
///
/// # 返回
/// - 成功结果
/// - `StorageExhausted`：507，立即返回
/// - `TransientNetwork`：可重试错误耗尽尝试次数
/// - `Storage`：不可重试的存储错误
pub async fn with_retry<T, F, Fut>(
    description: &str,
    policy: &RetryPolicy,
    classifier: &dyn RetryClassifier,
    mut operation: F,
) -> Result<T, UploadError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UploadError>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let source = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(UploadError::Storage { source, .. }) => source,
            Err(other) => return Err(other),
        };

        if FailureKind::classify(&source) == FailureKind::StorageExhausted {
            error!("{}: 服务端存储空间不足 (507)，终止上传", description);
            return Err(UploadError::StorageExhausted {
                operation: description.to_string(),
                source,
            });
        }

        if !classifier.is_retryable(&source) {
            return Err(UploadError::storage(description, source));
        }

        warn!(
            "{}: 第 {}/{} 次尝试失败: {}",
            description, attempt, max_attempts, source
        );

        if attempt == max_attempts {
            error!("{}: 已达最大尝试次数 ({})", description, max_attempts);
            return Err(UploadError::TransientNetwork {
                operation: description.to_string(),
                attempts: attempt,
                source,
            });
        }

        let backoff = policy.backoff(attempt);
        info!("{}: {}s 后重试...", description, backoff.as_secs_f64());
        tokio::time::sleep(backoff).await;
    }

    Err(UploadError::Internal(format!(
        "{}: 重试循环未返回结果",
        description
    )))
}
