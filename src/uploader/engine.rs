// 分片上传引擎
//
// 完整流程：
// 1. 计算分片计划
// 2. 创建分片上传会话（带重试）
// 3. 有界并发上传全部分片
// 4. ListParts 核对服务端分片数量
// 5. 按序号排序后合并分片（CompletionReconciler）
// 6. HeadObject 校验最终对象大小
//
// 任一阶段失败都不会中止上传会话，UploadId 随错误返回，便于人工检查或续传。

use super::complete::CompletionReconciler;
use super::error::{UploadFailure, UploadPhase};
use super::part::{upload_part, PartReceipt, UploadSession};
use super::plan::UploadPlan;
use super::progress::{format_duration, mb_per_sec, ProgressCounter};
use super::retry::{with_retry, RetryPolicy, TransientFailures, DEFAULT_BASE_DELAY};
use super::UploadError;
use crate::storage::ObjectStorage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// 默认并发上传数
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// 合并分片的最短超时时间
const MIN_COMPLETION_TIMEOUT_SECS: u64 = 60;

/// 每 GiB 增加的合并超时时间
const COMPLETION_SECS_PER_GIB: u64 = 5;

const GIB: u64 = 1024 * 1024 * 1024;

/// 合并分片的初始超时：max(60s, 5s * ceil(GiB))
pub fn completion_timeout(file_size: u64) -> Duration {
    let gib = file_size.div_ceil(GIB);
    Duration::from_secs(MIN_COMPLETION_TIMEOUT_SECS.max(COMPLETION_SECS_PER_GIB * gib))
}

/// 上传请求
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_path: PathBuf,
    pub bucket: String,
    pub key: String,
    /// 分片大小，None 时自动计算
    pub part_size: Option<u64>,
    pub content_type: Option<String>,
}

/// 上传引擎参数
#[derive(Debug, Clone, Copy)]
pub struct UploaderOptions {
    /// 每个网络操作的最大尝试次数
    pub max_retries: u32,
    /// 最大并发分片数
    pub max_workers: usize,
    /// 重试退避基数
    pub retry_base_delay: Duration,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            max_retries: super::retry::DEFAULT_MAX_ATTEMPTS,
            max_workers: DEFAULT_MAX_WORKERS,
            retry_base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

/// 上传结果
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub file_size: u64,
    pub total_parts: u32,
    pub elapsed: Duration,
}

impl UploadReport {
    /// 平均速度 (MiB/s)
    pub fn throughput_mb_per_s(&self) -> f64 {
        mb_per_sec(self.file_size, self.elapsed)
    }

    /// 耗时 "HHh MMm SSs"
    pub fn duration_display(&self) -> String {
        format_duration(self.elapsed)
    }
}

/// 分片上传引擎
///
/// 每次 `upload` 调用独占自己的会话、并发池和进度计数器，
/// 同一个引擎可以依次上传多个文件。
pub struct MultipartUploader {
    storage: Arc<dyn ObjectStorage>,
    options: UploaderOptions,
}

impl MultipartUploader {
    pub fn new(storage: Arc<dyn ObjectStorage>, options: UploaderOptions) -> Self {
        Self { storage, options }
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.options.max_retries.max(1),
            base_delay: self.options.retry_base_delay,
        }
    }

    /// 上传一个本地文件
    ///
    /// 失败时返回所在阶段和未中止的 UploadId（如果会话已创建）。
    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadReport, UploadFailure> {
        let result = self.run(request).await;

        if let Err(failure) = &result {
            error!("上传失败 [{}]: {}", failure.phase, failure.error);
            error!("提示: {}", failure.error.user_hint());
            if let Some(upload_id) = &failure.upload_id {
                error!(
                    "UploadId {} 保留未中止 (bucket={}, key={})，可用于手动续传或清理",
                    upload_id, request.bucket, request.key
                );
            }
        }

        result
    }

    async fn run(&self, request: &UploadRequest) -> Result<UploadReport, UploadFailure> {
        let started_at = Instant::now();
        let policy = self.policy();

        // 1. 分片计划
        let file_size = tokio::fs::metadata(&request.file_path)
            .await
            .map_err(|e| {
                UploadError::io(format!("读取文件信息失败: {:?}", request.file_path), e)
            })
            .map_err(fail(UploadPhase::Plan, None))?
            .len();
        let plan = UploadPlan::new(file_size, request.part_size)
            .map_err(fail(UploadPhase::Plan, None))?;

        info!(
            "开始上传: {:?} -> {}/{}, 大小 {} bytes, 分片大小 {} bytes, 共 {} 个分片, 并发 {}",
            request.file_path,
            request.bucket,
            request.key,
            plan.file_size,
            plan.part_size,
            plan.total_parts,
            self.options.max_workers
        );

        // 2. 创建会话
        let upload_id = with_retry("创建分片上传", &policy, &TransientFailures, |_| async move {
            self.storage
                .create_multipart_upload(
                    &request.bucket,
                    &request.key,
                    request.content_type.as_deref(),
                )
                .await
                .map_err(|e| UploadError::storage("create_multipart_upload", e))
        })
        .await
        .map_err(fail(UploadPhase::CreateSession, None))?;

        info!("分片上传会话已创建: UploadId={}", upload_id);

        let session = Arc::new(UploadSession {
            upload_id,
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            content_type: request.content_type.clone(),
        });
        let upload_id = Some(session.upload_id.as_str());

        // 3. 并发上传分片
        let mut receipts = self
            .upload_parts(&session, &request.file_path, &plan, &policy)
            .await
            .map_err(fail(UploadPhase::UploadParts, upload_id))?;

        // 4. 核对服务端分片
        self.verify_parts(&session, &plan, &policy)
            .await
            .map_err(fail(UploadPhase::VerifyParts, upload_id))?;

        // 5. 合并分片（必须按序号升序提交）
        receipts.sort_by_key(|r| r.part_number);
        let timeout = completion_timeout(file_size);
        let outcome = CompletionReconciler::new(self.storage.as_ref(), &session, policy)
            .complete(&receipts, timeout, file_size)
            .await
            .map_err(fail(UploadPhase::Complete, upload_id))?;

        info!(
            "合并分片完成 (尝试 {} 次{})",
            outcome.attempts,
            if outcome.via_head_check {
                "，经 HeadObject 确认"
            } else {
                ""
            }
        );

        // 6. 校验最终对象
        self.verify_object(&session, file_size, &policy)
            .await
            .map_err(fail(UploadPhase::VerifyObject, upload_id))?;

        let report = UploadReport {
            upload_id: session.upload_id.clone(),
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            file_size,
            total_parts: plan.total_parts,
            elapsed: started_at.elapsed(),
        };

        info!(
            "上传完成: {}/{}, {} bytes, 耗时 {}, 平均速度 {:.2} MB/s",
            report.bucket,
            report.key,
            report.file_size,
            report.duration_display(),
            report.throughput_mb_per_s()
        );

        Ok(report)
    }

    /// 有界并发上传全部分片
    ///
    /// 同时运行的分片数不超过 `max_workers`；任一分片失败（重试已在内部完成）
    /// 即停止提交新分片，中止仍在进行的分片并返回错误。
    async fn upload_parts(
        &self,
        session: &Arc<UploadSession>,
        file_path: &Path,
        plan: &UploadPlan,
        policy: &RetryPolicy,
    ) -> Result<Vec<PartReceipt>, UploadError> {
        let max_workers = self.options.max_workers.max(1);
        let progress = Arc::new(ProgressCounter::new(plan.total_parts));
        let mut pending = plan.tasks().into_iter();
        let mut join_set: JoinSet<Result<PartReceipt, UploadError>> = JoinSet::new();
        let mut receipts = Vec::with_capacity(plan.total_parts as usize);

        loop {
            while join_set.len() < max_workers {
                let Some(task) = pending.next() else {
                    break;
                };

                let storage = self.storage.clone();
                let session = session.clone();
                let file_path = file_path.to_path_buf();
                let progress = progress.clone();
                let policy = *policy;

                join_set.spawn(async move {
                    upload_part(
                        storage.as_ref(),
                        &session,
                        &file_path,
                        &task,
                        &progress,
                        &policy,
                    )
                    .await
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            let result = joined
                .map_err(|e| UploadError::Internal(format!("分片上传任务异常: {}", e)))
                .and_then(|r| r);

            match result {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => {
                    let in_flight = join_set.len();
                    if in_flight > 0 {
                        warn!("分片上传失败，中止其余 {} 个进行中的分片", in_flight);
                    }
                    join_set.shutdown().await;
                    return Err(e);
                }
            }
        }

        info!("所有 {} 个分片上传完成", receipts.len());
        Ok(receipts)
    }

    /// 核对服务端记录的分片数量
    async fn verify_parts(
        &self,
        session: &UploadSession,
        plan: &UploadPlan,
        policy: &RetryPolicy,
    ) -> Result<(), UploadError> {
        let parts = with_retry("ListParts", policy, &TransientFailures, |_| async move {
            self.storage
                .list_parts(&session.bucket, &session.key, &session.upload_id)
                .await
                .map_err(|e| UploadError::storage("list_parts", e))
        })
        .await?;

        if parts.len() != plan.total_parts as usize {
            return Err(UploadError::IncompleteUpload {
                expected: plan.total_parts,
                found: parts.len(),
            });
        }

        info!("服务端已记录全部 {} 个分片", parts.len());
        Ok(())
    }

    /// 校验最终对象大小
    async fn verify_object(
        &self,
        session: &UploadSession,
        file_size: u64,
        policy: &RetryPolicy,
    ) -> Result<(), UploadError> {
        let meta = with_retry("HeadObject", policy, &TransientFailures, |_| async move {
            self.storage
                .head_object(&session.bucket, &session.key, None)
                .await
                .map_err(|e| UploadError::storage("head_object", e))
        })
        .await?;

        if meta.content_length != file_size {
            return Err(UploadError::Verification {
                expected: file_size,
                actual: meta.content_length,
            });
        }

        info!("对象大小校验通过: {} bytes", meta.content_length);
        Ok(())
    }
}

/// 把阶段错误包装为 UploadFailure
fn fail(phase: UploadPhase, upload_id: Option<&str>) -> impl FnOnce(UploadError) -> UploadFailure + '_ {
    move |error| UploadFailure {
        phase,
        upload_id: upload_id.map(str::to_string),
        error,
    }
}
