// 命令行参数

use clap::Parser;
use std::path::PathBuf;

/// 分片上传大文件到 S3 兼容存储（超时重试、合并结果确认、大小校验）
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "s3-multipart-upload", version, about)]
pub struct Cli {
    /// 配置文件路径（默认 config/upload.toml）
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 目标 bucket
    #[arg(short = 'b', long)]
    pub bucket: Option<String>,

    /// 分片大小（字节），默认 max(50MiB, ceil(文件大小 / 10000))
    #[arg(short = 'c', long)]
    pub chunk_size: Option<u64>,

    /// 待上传的本地文件
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// 对象 key
    #[arg(short = 'k', long)]
    pub key: Option<String>,

    /// Access Key ID（默认读取 AWS_ACCESS_KEY_ID）
    #[arg(short = 'a', long, alias = "access_key")]
    pub access_key: Option<String>,

    /// Secret Access Key（默认读取 AWS_SECRET_ACCESS_KEY）
    #[arg(short = 's', long, alias = "secret_key")]
    pub secret_key: Option<String>,

    /// S3 服务地址（默认读取 S3_ENDPOINT）
    #[arg(short = 'e', long)]
    pub endpoint: Option<String>,

    /// 区域（默认读取 S3_REGION / AWS_REGION）
    #[arg(short = 'r', long)]
    pub region: Option<String>,

    /// 对象的 Content-Type
    #[arg(long)]
    pub content_type: Option<String>,

    /// 只输出警告和错误
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// 每个请求的最大尝试次数（默认 5）
    #[arg(short = 'm', long)]
    pub max_retries: Option<u32>,

    /// 并发上传数（默认 4）
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,
}
