// 内存对象存储（仅测试）
//
// 支持按操作注入失败、模拟“请求失败但服务端已合并”，并记录调用。

use super::{CompletedPart, ObjectMetadata, ObjectStorage, PartSummary, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

pub(crate) const MOCK_UPLOAD_ID: &str = "mock-upload-id";

#[derive(Default)]
pub(crate) struct MockState {
    /// 会话是否仍然打开
    pub session_open: bool,
    /// 已上传分片: part_number -> (etag, size)
    pub parts: BTreeMap<u32, (String, u64)>,
    /// 合并后的对象大小
    pub object_size: Option<u64>,

    pub create_failures: VecDeque<StorageError>,
    pub part_failures: HashMap<u32, VecDeque<StorageError>>,
    pub part_delays: HashMap<u32, Duration>,
    pub list_failures: VecDeque<StorageError>,
    /// ListParts 中隐藏的分片（模拟服务端丢失）
    pub hidden_parts: Vec<u32>,
    pub complete_failures: VecDeque<StorageError>,
    /// 合并请求返回错误时服务端是否仍完成了合并
    pub merge_despite_failure: bool,
    pub head_failures: VecDeque<StorageError>,
    /// 覆盖 HeadObject 返回的大小
    pub head_size_override: Option<u64>,

    pub create_calls: usize,
    pub upload_calls: Vec<u32>,
    /// 正在进行的 UploadPart 请求数
    pub uploads_in_flight: usize,
    /// 同时进行的 UploadPart 请求数峰值
    pub peak_uploads_in_flight: usize,
    pub list_calls: usize,
    pub complete_calls: Vec<(Vec<u32>, Option<Duration>)>,
    pub head_calls: Vec<Option<Duration>>,
}

#[derive(Default)]
pub(crate) struct MockStorage {
    state: Mutex<MockState>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 修改内部状态（注入失败等）
    pub fn configure(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.state.lock());
    }

    /// 读取内部状态
    pub fn inspect<T>(&self, f: impl FnOnce(&MockState) -> T) -> T {
        f(&self.state.lock())
    }

    fn merge(state: &mut MockState) {
        state.object_size = Some(state.parts.values().map(|(_, size)| size).sum());
        state.session_open = false;
    }
}

pub(crate) fn timeout_error(operation: &'static str) -> StorageError {
    StorageError::Timeout {
        operation,
        timeout: Duration::from_secs(60),
    }
}

pub(crate) fn status_error(operation: &'static str, status: u16, code: Option<&str>) -> StorageError {
    StorageError::Service {
        operation,
        status,
        code: code.map(str::to_string),
        message: None,
    }
}

#[async_trait]
impl ObjectStorage for MockStorage {
    async fn create_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        _content_type: Option<&str>,
    ) -> Result<String, StorageError> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        state.session_open = true;
        Ok(MOCK_UPLOAD_ID.to_string())
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        _upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError> {
        let delay = {
            let mut state = self.state.lock();
            state.upload_calls.push(part_number);
            state.uploads_in_flight += 1;
            state.peak_uploads_in_flight = state.peak_uploads_in_flight.max(state.uploads_in_flight);
            state.part_delays.get(&part_number).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.uploads_in_flight -= 1;
        if let Some(err) = state
            .part_failures
            .get_mut(&part_number)
            .and_then(|failures| failures.pop_front())
        {
            return Err(err);
        }
        let etag = format!("\"etag-{}\"", part_number);
        state
            .parts
            .insert(part_number, (etag.clone(), body.len() as u64));
        Ok(etag)
    }

    async fn list_parts(
        &self,
        _bucket: &str,
        _key: &str,
        _upload_id: &str,
    ) -> Result<Vec<PartSummary>, StorageError> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .parts
            .iter()
            .filter(|(n, _)| !state.hidden_parts.contains(*n))
            .map(|(n, (etag, size))| PartSummary {
                part_number: *n,
                etag: etag.clone(),
                size: *size,
            })
            .collect())
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        _upload_id: &str,
        parts: &[CompletedPart],
        timeout: Option<Duration>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state
            .complete_calls
            .push((parts.iter().map(|p| p.part_number).collect(), timeout));

        if let Some(err) = state.complete_failures.pop_front() {
            if state.merge_despite_failure && state.session_open {
                Self::merge(&mut state);
            }
            return Err(err);
        }
        if !state.session_open {
            return Err(status_error(
                "complete_multipart_upload",
                404,
                Some("NoSuchUpload"),
            ));
        }
        Self::merge(&mut state);
        Ok(())
    }

    async fn head_object(
        &self,
        _bucket: &str,
        _key: &str,
        timeout: Option<Duration>,
    ) -> Result<ObjectMetadata, StorageError> {
        let mut state = self.state.lock();
        state.head_calls.push(timeout);
        if let Some(err) = state.head_failures.pop_front() {
            return Err(err);
        }
        match state.head_size_override.or(state.object_size) {
            Some(content_length) => Ok(ObjectMetadata { content_length }),
            None => Err(status_error("head_object", 404, Some("NotFound"))),
        }
    }
}
