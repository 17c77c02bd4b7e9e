// 配置管理
//
// 取值优先级：命令行参数 > 配置文件 > 环境变量 > 默认值
// 所有参数在发起任何网络请求前完成校验。

use crate::cli::Cli;
use crate::storage::s3::{S3ClientOptions, DEFAULT_MIN_UPLOAD_RATE};
use crate::storage::sign::Credentials;
use crate::uploader::engine::{UploadRequest, UploaderOptions, DEFAULT_MAX_WORKERS};
use crate::uploader::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/upload.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// S3 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    /// 路径风格寻址（大多数自建 S3 兼容服务需要）
    #[serde(default = "default_path_style")]
    pub path_style: bool,
    /// 请求超时（秒），分片上传按大小在此基础上放宽
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 分片上传最低预期速率（KiB/s），用于计算分片上传超时
    #[serde(default = "default_min_upload_rate_kib")]
    pub min_upload_rate_kib: u64,
    /// 连接超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 传输层自动重试次数，未设置时与 max_retries 相同
    #[serde(default)]
    pub transport_retries: Option<u32>,
}

fn default_path_style() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_min_upload_rate_kib() -> u64 {
    DEFAULT_MIN_UPLOAD_RATE / 1024
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: None,
            region: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            path_style: default_path_style(),
            request_timeout_secs: default_timeout_secs(),
            min_upload_rate_kib: default_min_upload_rate_kib(),
            connect_timeout_secs: default_timeout_secs(),
            transport_retries: None,
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default, alias = "file_path")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// 分片大小（字节）
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub workers: Option<usize>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否同时写入日志文件
    #[serde(default)]
    pub enabled: bool,
    /// 日志文件目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    ///
    /// 文件不存在时返回默认配置，格式错误时返回错误。
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: AppConfig =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;

        Ok(config)
    }
}

/// 合并命令行、配置文件与环境变量后的上传参数
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub storage: S3ClientOptions,
    pub request: UploadRequest,
    pub uploader: UploaderOptions,
}

impl UploadSettings {
    /// 按优先级合并参数并校验
    ///
    /// `lookup_env` 用于读取环境变量，测试时可传入固定映射。
    pub fn resolve(
        cli: &Cli,
        config: &AppConfig,
        lookup_env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env = |name: &str| lookup_env(name).filter(|v| !v.is_empty());

        let bucket = cli.bucket.clone().or_else(|| config.s3.bucket.clone());
        let key = cli.key.clone().or_else(|| config.upload.key.clone());
        let file = cli.file.clone().or_else(|| config.upload.file.clone());
        let region = cli
            .region
            .clone()
            .or_else(|| config.s3.region.clone())
            .or_else(|| env("S3_REGION"))
            .or_else(|| env("AWS_REGION"));
        let endpoint = cli
            .endpoint
            .clone()
            .or_else(|| config.s3.endpoint.clone())
            .or_else(|| env("S3_ENDPOINT"));
        let access_key = cli
            .access_key
            .clone()
            .or_else(|| config.s3.access_key.clone())
            .or_else(|| env("AWS_ACCESS_KEY_ID"));
        let secret_key = cli
            .secret_key
            .clone()
            .or_else(|| config.s3.secret_key.clone())
            .or_else(|| env("AWS_SECRET_ACCESS_KEY"));
        let content_type = cli
            .content_type
            .clone()
            .or_else(|| config.upload.content_type.clone());
        let chunk_size = cli.chunk_size.or(config.upload.chunk_size);

        let max_retries = match cli.max_retries.or(config.upload.max_retries) {
            Some(value) => value,
            None => match env("MAX_RETRIES") {
                Some(raw) => raw
                    .trim()
                    .parse::<u32>()
                    .with_context(|| format!("环境变量 MAX_RETRIES 不是有效数字: {}", raw))?,
                None => DEFAULT_MAX_ATTEMPTS,
            },
        };
        let workers = cli
            .workers
            .or(config.upload.workers)
            .unwrap_or(DEFAULT_MAX_WORKERS);

        let missing: Vec<&str> = [
            ("bucket", bucket.is_none()),
            ("key", key.is_none()),
            ("file", file.is_none()),
            ("region", region.is_none()),
        ]
        .into_iter()
        .filter(|(_, absent)| *absent)
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            bail!("缺少必要参数: {}", missing.join(", "));
        }

        let (Some(access_key), Some(secret_key)) = (access_key, secret_key) else {
            bail!("需要 access_key 和 secret_key（命令行、配置文件或 AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY）");
        };

        let (Some(bucket), Some(key), Some(file), Some(region)) = (bucket, key, file, region) else {
            bail!("缺少必要参数");
        };

        validate_source_file(&file)?;

        if max_retries < 1 {
            bail!("max_retries 必须 >= 1");
        }
        if workers < 1 {
            bail!("workers 必须 >= 1");
        }

        let storage = S3ClientOptions {
            endpoint,
            region,
            credentials: Credentials {
                access_key_id: access_key,
                secret_access_key: secret_key,
            },
            path_style: config.s3.path_style,
            timeout: Duration::from_secs(config.s3.request_timeout_secs),
            connect_timeout: Duration::from_secs(config.s3.connect_timeout_secs),
            min_upload_rate: config.s3.min_upload_rate_kib.max(1) * 1024,
            transport_retries: config.s3.transport_retries.unwrap_or(max_retries),
            max_idle_per_host: workers,
        };

        Ok(Self {
            storage,
            request: UploadRequest {
                file_path: file,
                bucket,
                key,
                part_size: chunk_size,
                content_type,
            },
            uploader: UploaderOptions {
                max_retries,
                max_workers: workers,
                retry_base_delay: DEFAULT_BASE_DELAY,
            },
        })
    }
}

/// 校验待上传文件：存在、是普通文件、非空
fn validate_source_file(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).with_context(|| format!("文件不存在: {:?}", path))?;
    if !metadata.is_file() {
        bail!("不是普通文件: {:?}", path);
    }
    if metadata.len() == 0 {
        bail!("文件为空，无需上传: {:?}", path);
    }
    Ok(())
}
