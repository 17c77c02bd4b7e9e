// 分片上传模块
//
// - plan: 分片计划
// - retry: 统一的重试与指数退避
// - part: 单个分片上传
// - complete: 合并分片与结果确认
// - engine: 上传流程编排

pub mod complete;
pub mod engine;
pub mod error;
pub mod part;
pub mod plan;
pub mod progress;
pub mod retry;

pub use complete::{CompletionReconciler, ReconcileOutcome, ReconcileState};
pub use engine::{
    completion_timeout, MultipartUploader, UploadReport, UploadRequest, UploaderOptions,
    DEFAULT_MAX_WORKERS,
};
pub use error::{UploadError, UploadFailure, UploadPhase};
pub use part::{PartReceipt, UploadSession};
pub use plan::{
    recommended_part_size, PartTask, UploadPlan, DEFAULT_PART_SIZE, MAX_PARTS, MAX_PART_SIZE,
    MIN_PART_SIZE,
};
pub use progress::{format_duration, ProgressCounter, ProgressSnapshot};
pub use retry::{with_retry, FailureKind, RetryClassifier, RetryPolicy, TransientFailures};
