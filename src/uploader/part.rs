// 单个分片上传
//
// 每次尝试都重新打开文件读取分片数据，失败后不保留缓冲区；
// 读取在阻塞线程池中进行，避免阻塞运行时。

use super::plan::PartTask;
use super::progress::{format_duration, ProgressCounter};
use super::retry::{with_retry, RetryPolicy, TransientFailures};
use super::UploadError;
use crate::storage::ObjectStorage;
use bytes::Bytes;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 已创建的分片上传会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
}

/// 分片上传回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub part_number: u32,
    pub etag: String,
}

/// 从文件读取一个分片
///
/// 返回 `Bytes`，传输层重试时克隆不复制数据。
pub async fn read_part(file_path: &Path, task: &PartTask) -> Result<Bytes, UploadError> {
    let path: PathBuf = file_path.to_path_buf();
    let offset = task.byte_offset;
    let length = task.byte_length as usize;
    let part_number = task.part_number;

    tokio::task::spawn_blocking(move || {
        let read = || -> std::io::Result<Bytes> {
            let mut file = std::fs::File::open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buffer = vec![0u8; length];
            file.read_exact(&mut buffer)?;
            Ok(Bytes::from(buffer))
        };
        read().map_err(|e| UploadError::io(format!("读取分片 #{} 失败: {:?}", part_number, path), e))
    })
    .await
    .map_err(|e| UploadError::Internal(format!("读取分片任务异常: {}", e)))?
}

/// 上传单个分片（含重试）
///
/// 超时与 524 会按 `policy` 退避重试，507 立即终止。
/// 成功后更新 `progress` 并输出进度日志。
pub async fn upload_part(
    storage: &dyn ObjectStorage,
    session: &UploadSession,
    file_path: &Path,
    task: &PartTask,
    progress: &ProgressCounter,
    policy: &RetryPolicy,
) -> Result<PartReceipt, UploadError> {
    let description = format!("上传分片 #{}", task.part_number);

    let etag = with_retry(&description, policy, &TransientFailures, |attempt| async move {
        let body = read_part(file_path, task).await?;
        debug!(
            "分片 #{} 第 {} 次尝试: offset={}, size={}",
            task.part_number,
            attempt,
            task.byte_offset,
            body.len()
        );
        storage
            .upload_part(
                &session.bucket,
                &session.key,
                &session.upload_id,
                task.part_number,
                body,
            )
            .await
            .map_err(|e| UploadError::storage("upload_part", e))
    })
    .await?;

    let snapshot = progress.record_completed();
    let eta = snapshot
        .eta
        .map(format_duration)
        .unwrap_or_else(|| "--".to_string());
    info!(
        "分片 #{} 上传完成 ({}/{}, {:.1}%), 预计剩余 {}",
        task.part_number,
        snapshot.completed,
        snapshot.total,
        snapshot.percent(),
        eta
    );

    Ok(PartReceipt {
        part_number: task.part_number,
        etag,
    })
}
