// S3 兼容对象存储客户端
//
// reqwest + AWS SigV4，只实现分片上传需要的六个操作。
// 传输层自带有限次自动重试（连接失败、500/502/503/504），
// 上传核心的重试/退避策略叠加在此之上。

use super::sign::{encode_path, encode_query, sha256_hex, CanonicalRequest, Credentials, SigV4Signer};
use super::{CompletedPart, ObjectMetadata, ObjectStorage, PartSummary, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// 传输层重试初始退避（毫秒）
const TRANSPORT_BACKOFF_MS: u64 = 200;

/// 传输层重试最大退避（毫秒）
const TRANSPORT_MAX_BACKOFF_MS: u64 = 5000;

/// 分片上传的默认最低速率（64 KiB/s）
pub const DEFAULT_MIN_UPLOAD_RATE: u64 = 64 * 1024;

/// S3 客户端参数
#[derive(Debug, Clone)]
pub struct S3ClientOptions {
    /// 服务地址，None 时使用 AWS 区域默认地址
    pub endpoint: Option<String>,
    pub region: String,
    pub credentials: Credentials,
    /// true: https://endpoint/bucket/key；false: https://bucket.endpoint/key
    pub path_style: bool,
    /// 默认请求超时（分片上传在此基础上按大小放宽）
    pub timeout: Duration,
    /// 连接超时
    pub connect_timeout: Duration,
    /// 分片上传的最低预期速率（字节/秒）
    pub min_upload_rate: u64,
    /// 传输层自动重试次数
    pub transport_retries: u32,
    /// 连接池大小（每个 host）
    pub max_idle_per_host: usize,
}

/// S3 兼容客户端
#[derive(Debug, Clone)]
pub struct S3Client {
    client: Client,
    options: S3ClientOptions,
    signer: SigV4Signer,
}

/// 一次已签名的请求描述
struct RequestSpec<'a> {
    operation: &'static str,
    method: Method,
    bucket: &'a str,
    key: &'a str,
    query: Vec<(&'a str, &'a str)>,
    headers: Vec<(String, String)>,
    body: Bytes,
    /// 本次请求实际生效的超时
    timeout: Duration,
}

impl S3Client {
    /// 创建客户端
    pub fn new(options: S3ClientOptions) -> Result<Self, StorageError> {
        let client = build_http_client(options.connect_timeout, options.max_idle_per_host)?;
        let signer = SigV4Signer::new(options.credentials.clone(), options.region.clone());

        debug!(
            "初始化 S3 客户端: endpoint={}, region={}, path_style={}, transport_retries={}",
            options.endpoint.as_deref().unwrap_or("<aws>"),
            options.region,
            options.path_style,
            options.transport_retries
        );

        Ok(Self {
            client,
            options,
            signer,
        })
    }

    fn endpoint(&self) -> String {
        match &self.options.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.options.region),
        }
    }

    /// 构造对象 URL（不含 query），返回 (url, 签名用 path, host)
    fn object_url(&self, bucket: &str, key: &str) -> Result<(Url, String, String), StorageError> {
        let mut url = Url::parse(&self.endpoint())
            .map_err(|e| StorageError::InvalidRequest(format!("无效的 endpoint: {}", e)))?;

        let encoded_key = encode_path(key.trim_start_matches('/'));
        let path = if self.options.path_style {
            format!("/{}/{}", encode_path(bucket), encoded_key)
        } else {
            let host = url
                .host_str()
                .ok_or_else(|| StorageError::InvalidRequest("endpoint 缺少 host".to_string()))?
                .to_string();
            url.set_host(Some(&format!("{}.{}", bucket, host)))
                .map_err(|e| StorageError::InvalidRequest(format!("无效的 bucket host: {}", e)))?;
            format!("/{}", encoded_key)
        };
        url.set_path(&path);

        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(StorageError::InvalidRequest("endpoint 缺少 host".to_string()))
            }
        };

        Ok((url, path, host))
    }

    /// 控制类请求的超时：调用方指定值，否则为默认请求超时
    fn call_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.options.timeout)
    }

    /// 发送签名请求，带传输层重试
    async fn send(&self, spec: RequestSpec<'_>) -> Result<Response, StorageError> {
        let RequestSpec {
            operation,
            method,
            bucket,
            key,
            query,
            headers,
            body,
            timeout,
        } = spec;

        let (mut url, path, host) = self.object_url(bucket, key)?;
        let query = encode_query(&query);
        url.set_query(if query.is_empty() { None } else { Some(&query) });
        let payload_hash = sha256_hex(&body);
        let retries = self.options.transport_retries;

        let mut attempt = 0u32;
        loop {
            let signed = self.signer.sign(
                &CanonicalRequest {
                    method: method.as_str(),
                    path: &path,
                    query: &query,
                    host: &host,
                    headers: headers.clone(),
                    payload_hash: &payload_hash,
                },
                Utc::now(),
            );

            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .timeout(timeout);
            for (name, value) in headers.iter().chain(signed.iter()) {
                request = request.header(name.as_str(), value.as_str());
            }
            if !body.is_empty() {
                request = request.body(body.clone());
            }

            let retry_reason = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if is_transport_retriable_status(status) && attempt < retries {
                        format!("HTTP {}", status.as_u16())
                    } else {
                        return Err(service_error(operation, response).await);
                    }
                }
                Err(e) if e.is_timeout() => {
                    return Err(StorageError::Timeout { operation, timeout });
                }
                Err(e) if e.is_connect() && attempt < retries => format!("连接失败: {}", e),
                Err(e) => return Err(StorageError::Network { operation, source: e }),
            };

            let backoff_ms = TRANSPORT_BACKOFF_MS
                .saturating_mul(2u64.saturating_pow(attempt))
                .min(TRANSPORT_MAX_BACKOFF_MS);
            attempt += 1;
            warn!(
                "{}: 传输层重试 ({}/{})，{}ms 后重试: {}",
                operation, attempt, retries, backoff_ms, retry_reason
            );
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }
}

#[async_trait]
impl ObjectStorage for S3Client {
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String, StorageError> {
        const OP: &str = "create_multipart_upload";

        let mut headers = Vec::new();
        if let Some(content_type) = content_type {
            headers.push(("content-type".to_string(), content_type.to_string()));
        }

        let timeout = self.call_timeout(None);
        let response = self
            .send(RequestSpec {
                operation: OP,
                method: Method::POST,
                bucket,
                key,
                query: vec![("uploads", "")],
                headers,
                body: Bytes::new(),
                timeout,
            })
            .await?;
        let body = read_body(OP, response, timeout).await?;

        let result: InitiateMultipartUploadResult =
            quick_xml::de::from_str(&body).map_err(|e| StorageError::InvalidResponse {
                operation: OP,
                message: format!("无法解析 UploadId: {}: {}", e, body),
            })?;
        Ok(result.upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError> {
        const OP: &str = "upload_part";

        let part_number_str = part_number.to_string();
        let timeout = transfer_timeout(
            self.options.timeout,
            body.len() as u64,
            self.options.min_upload_rate,
        );
        let response = self
            .send(RequestSpec {
                operation: OP,
                method: Method::PUT,
                bucket,
                key,
                query: vec![("partNumber", part_number_str.as_str()), ("uploadId", upload_id)],
                headers: Vec::new(),
                body,
                timeout,
            })
            .await?;

        response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| StorageError::InvalidResponse {
                operation: OP,
                message: format!("分片 {} 响应缺少 ETag", part_number),
            })
    }

    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartSummary>, StorageError> {
        const OP: &str = "list_parts";

        let timeout = self.call_timeout(None);
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![("uploadId", upload_id)];
            if let Some(marker) = marker.as_deref() {
                query.push(("part-number-marker", marker));
            }

            let response = self
                .send(RequestSpec {
                    operation: OP,
                    method: Method::GET,
                    bucket,
                    key,
                    query,
                    headers: Vec::new(),
                    body: Bytes::new(),
                    timeout,
                })
                .await?;
            let body = read_body(OP, response, timeout).await?;
            let page = parse_list_parts(&body).map_err(|message| StorageError::InvalidResponse {
                operation: OP,
                message,
            })?;

            debug!(
                "ListParts 页: {} 个分片, truncated={}",
                page.parts.len(),
                page.next_marker.is_some()
            );
            parts.extend(page.parts);

            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        Ok(parts)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        timeout: Option<Duration>,
    ) -> Result<(), StorageError> {
        const OP: &str = "complete_multipart_upload";

        let timeout = self.call_timeout(timeout);
        let response = self
            .send(RequestSpec {
                operation: OP,
                method: Method::POST,
                bucket,
                key,
                query: vec![("uploadId", upload_id)],
                headers: vec![("content-type".to_string(), "application/xml".to_string())],
                body: Bytes::from(build_complete_body(parts)?),
                timeout,
            })
            .await?;
        let status = response.status();
        let body = read_body(OP, response, timeout).await?;

        // 合并过程中出错时服务端可能返回 200 + <Error> 响应体
        if body.contains("<Error>") {
            let detail = parse_error_body(&body);
            return Err(StorageError::Service {
                operation: OP,
                status: status.as_u16(),
                code: detail.code,
                message: detail.message,
            });
        }

        Ok(())
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<ObjectMetadata, StorageError> {
        const OP: &str = "head_object";

        let response = self
            .send(RequestSpec {
                operation: OP,
                method: Method::HEAD,
                bucket,
                key,
                query: Vec::new(),
                headers: Vec::new(),
                body: Bytes::new(),
                timeout: self.call_timeout(timeout),
            })
            .await?;

        let content_length = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| StorageError::InvalidResponse {
                operation: OP,
                message: "响应缺少 Content-Length".to_string(),
            })?;

        Ok(ObjectMetadata { content_length })
    }
}

/// 共享 HTTP 客户端只限制连接时间，整体超时按请求设置
fn build_http_client(connect_timeout: Duration, max_idle_per_host: usize) -> Result<Client, StorageError> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(max_idle_per_host)
        .build()
        .map_err(|e| StorageError::InvalidRequest(format!("创建 HTTP 客户端失败: {}", e)))
}

/// 分片上传超时：基础超时 + 以最低速率传完分片所需的时间
fn transfer_timeout(base: Duration, body_len: u64, min_rate: u64) -> Duration {
    let transfer_secs = body_len.div_ceil(min_rate.max(1));
    base.saturating_add(Duration::from_secs(transfer_secs))
}

fn is_transport_retriable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 500 | 502 | 503 | 504)
}

async fn read_body(
    operation: &'static str,
    response: Response,
    timeout: Duration,
) -> Result<String, StorageError> {
    response.text().await.map_err(|e| {
        if e.is_timeout() {
            StorageError::Timeout { operation, timeout }
        } else {
            StorageError::Network {
                operation,
                source: e,
            }
        }
    })
}

/// 将错误响应转换为 StorageError（HEAD 没有响应体，按状态码补齐错误码）
async fn service_error(operation: &'static str, response: Response) -> StorageError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let detail = parse_error_body(&body);
    let code = detail.code.or_else(|| match status {
        StatusCode::NOT_FOUND => Some("NotFound".to_string()),
        _ => None,
    });

    debug!(
        "{} 错误响应: status={}, code={:?}, body={}",
        operation, status, code, body
    );

    StorageError::Service {
        operation,
        status: status.as_u16(),
        code,
        message: detail.message,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// 解析 `<Error>` 响应体，无法解析时返回空结果
fn parse_error_body(body: &str) -> ErrorResponse {
    let detail: ErrorResponse = quick_xml::de::from_str(body).unwrap_or_default();
    ErrorResponse {
        code: detail.code.filter(|s| !s.is_empty()),
        message: detail.message.filter(|s| !s.is_empty()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListPartsResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_part_number_marker: Option<String>,
    #[serde(default)]
    part: Vec<ListedPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedPart {
    part_number: u32,
    #[serde(rename = "ETag", default)]
    e_tag: String,
    #[serde(default)]
    size: u64,
}

/// ListParts 单页结果
#[derive(Debug, Default)]
struct ListPartsPage {
    parts: Vec<PartSummary>,
    /// 还有下一页时的 part-number-marker
    next_marker: Option<String>,
}

fn parse_list_parts(xml: &str) -> Result<ListPartsPage, String> {
    let result: ListPartsResult =
        quick_xml::de::from_str(xml).map_err(|e| format!("ListParts 响应格式错误: {}", e))?;

    let next_marker = if result.is_truncated {
        let marker = result
            .next_part_number_marker
            .filter(|m| !m.is_empty())
            .ok_or_else(|| "IsTruncated=true 但缺少 NextPartNumberMarker".to_string())?;
        Some(marker)
    } else {
        None
    };

    let parts = result
        .part
        .into_iter()
        .map(|p| PartSummary {
            part_number: p.part_number,
            etag: p.e_tag,
            size: p.size,
        })
        .collect();

    Ok(ListPartsPage { parts, next_marker })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CompleteMultipartUpload {
    part: Vec<CompletePart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CompletePart {
    part_number: u32,
    #[serde(rename = "ETag")]
    e_tag: String,
}

fn build_complete_body(parts: &[CompletedPart]) -> Result<String, StorageError> {
    let request = CompleteMultipartUpload {
        part: parts
            .iter()
            .map(|p| CompletePart {
                part_number: p.part_number,
                e_tag: p.etag.clone(),
            })
            .collect(),
    };
    quick_xml::se::to_string(&request)
        .map_err(|e| StorageError::InvalidRequest(format!("构造合并请求失败: {}", e)))
}
