// 合并分片与结果确认
//
// 合并请求失败不等于合并失败：服务端可能仍在校验/拼接分片。
// 每次失败后先用 HeadObject 查询对象大小，大小一致即视为成功；
// 否则超时时间翻倍后重新发起合并，直到尝试次数耗尽。
//
// 状态流转：
//   Attempting ──成功──> Reconciled
//       │失败
//       v
//   AwaitingServerState ──大小一致──> Reconciled
//       │大小不一致 / 查询失败
//       ├──仍有次数──> Attempting（超时翻倍）
//       └──次数耗尽──> Exhausted

use super::part::{PartReceipt, UploadSession};
use super::retry::{with_retry, FailureKind, RetryPolicy, TransientFailures};
use super::UploadError;
use crate::storage::{CompletedPart, ObjectStorage, StorageError};
use std::time::Duration;
use tracing::{error, info, warn};

/// 合并状态
#[derive(Debug)]
pub enum ReconcileState {
    /// 发起第 `attempt` 次合并请求
    Attempting { attempt: u32, timeout: Duration },
    /// 合并请求失败，等待并查询服务端对象状态
    AwaitingServerState {
        attempt: u32,
        timeout: Duration,
        /// 失败原因是否“结果未知”（超时 / NoSuchUpload），此时无需额外等待
        ambiguous: bool,
        last_error: StorageError,
    },
    /// 已确认合并完成
    Reconciled { attempts: u32, via_head_check: bool },
    /// 尝试次数耗尽
    Exhausted {
        attempts: u32,
        ambiguous: bool,
        last_error: StorageError,
    },
}

/// 合并结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// 实际发起的合并请求次数
    pub attempts: u32,
    /// 是否通过 HeadObject 确认（合并请求本身未返回成功）
    pub via_head_check: bool,
}

/// 合并协调器
pub struct CompletionReconciler<'a> {
    storage: &'a dyn ObjectStorage,
    session: &'a UploadSession,
    policy: RetryPolicy,
}

impl<'a> CompletionReconciler<'a> {
    pub fn new(storage: &'a dyn ObjectStorage, session: &'a UploadSession, policy: RetryPolicy) -> Self {
        Self {
            storage,
            session,
            policy,
        }
    }

    /// 合并分片
    ///
    /// # 参数
    /// * `parts` - 按分片序号升序排列的回执
    /// * `initial_timeout` - 第一次合并请求的超时时间，之后每次翻倍
    /// * `expected_size` - 本地文件大小，用于确认服务端是否已合并
    pub async fn complete(
        &self,
        parts: &[PartReceipt],
        initial_timeout: Duration,
        expected_size: u64,
    ) -> Result<ReconcileOutcome, UploadError> {
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();
        let max_attempts = self.policy.max_attempts.max(1);

        let mut state = ReconcileState::Attempting {
            attempt: 1,
            timeout: initial_timeout,
        };

        loop {
            state = match state {
                ReconcileState::Attempting { attempt, timeout } => {
                    info!(
                        "合并分片: 第 {}/{} 次尝试, {} 个分片, 超时 {}s",
                        attempt,
                        max_attempts,
                        completed_parts.len(),
                        timeout.as_secs()
                    );
                    match self
                        .storage
                        .complete_multipart_upload(
                            &self.session.bucket,
                            &self.session.key,
                            &self.session.upload_id,
                            &completed_parts,
                            Some(timeout),
                        )
                        .await
                    {
                        Ok(()) => ReconcileState::Reconciled {
                            attempts: attempt,
                            via_head_check: false,
                        },
                        Err(e) => match FailureKind::classify(&e) {
                            FailureKind::StorageExhausted => {
                                error!("合并分片: 服务端存储空间不足 (507)");
                                return Err(UploadError::StorageExhausted {
                                    operation: "complete_multipart_upload".to_string(),
                                    source: e,
                                });
                            }
                            kind => {
                                let ambiguous =
                                    matches!(kind, FailureKind::Timeout | FailureKind::NoSuchUpload);
                                warn!(
                                    "合并分片第 {} 次请求失败{}: {}",
                                    attempt,
                                    if ambiguous { "（结果未知）" } else { "" },
                                    e
                                );
                                ReconcileState::AwaitingServerState {
                                    attempt,
                                    timeout,
                                    ambiguous,
                                    last_error: e,
                                }
                            }
                        },
                    }
                }

                ReconcileState::AwaitingServerState {
                    attempt,
                    timeout,
                    ambiguous,
                    last_error,
                } => {
                    // 超时已经等待过一个完整的 timeout，其余错误需给服务端留出合并时间
                    if !ambiguous {
                        info!("等待 {}s 后查询对象状态", timeout.as_secs());
                        tokio::time::sleep(timeout).await;
                    }

                    if self.object_has_size(expected_size, timeout).await? {
                        ReconcileState::Reconciled {
                            attempts: attempt,
                            via_head_check: true,
                        }
                    } else if attempt >= max_attempts {
                        ReconcileState::Exhausted {
                            attempts: attempt,
                            ambiguous,
                            last_error,
                        }
                    } else {
                        ReconcileState::Attempting {
                            attempt: attempt + 1,
                            timeout: timeout.saturating_mul(2),
                        }
                    }
                }

                ReconcileState::Reconciled {
                    attempts,
                    via_head_check,
                } => {
                    if via_head_check {
                        info!("对象大小与本地一致，确认合并已完成");
                    }
                    return Ok(ReconcileOutcome {
                        attempts,
                        via_head_check,
                    });
                }

                ReconcileState::Exhausted {
                    attempts,
                    ambiguous,
                    last_error,
                } => {
                    error!("合并分片失败，已尝试 {} 次", attempts);
                    return Err(UploadError::Completion {
                        attempts,
                        ambiguous,
                        source: last_error,
                    });
                }
            };
        }
    }

    /// 查询远端对象大小是否与预期一致
    ///
    /// 查询失败视为尚未合并；507 存储空间不足直接返回错误。
    async fn object_has_size(&self, expected_size: u64, timeout: Duration) -> Result<bool, UploadError> {
        let result = with_retry("HeadObject", &self.policy, &TransientFailures, |_| async move {
            self.storage
                .head_object(&self.session.bucket, &self.session.key, Some(timeout))
                .await
                .map_err(|e| UploadError::storage("head_object", e))
        })
        .await;

        match result {
            Ok(meta) if meta.content_length == expected_size => Ok(true),
            Ok(meta) => {
                warn!(
                    "对象大小 {} bytes 与本地 {} bytes 不一致，合并可能尚未完成",
                    meta.content_length, expected_size
                );
                Ok(false)
            }
            Err(e @ UploadError::StorageExhausted { .. }) => {
                error!("查询对象状态: 服务端存储空间不足 (507)");
                Err(e)
            }
            Err(e) => {
                warn!("查询对象状态失败: {}", e);
                Ok(false)
            }
        }
    }
}
