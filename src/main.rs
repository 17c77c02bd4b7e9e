use anyhow::Context;
use clap::Parser;
use s3_multipart_uploader::{
    cli::Cli,
    config::{AppConfig, UploadSettings, DEFAULT_CONFIG_PATH},
    logging,
    storage::S3Client,
    uploader::{MultipartUploader, UploadFailure},
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    // 日志依赖配置文件，配置加载失败时只能输出到标准错误
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置失败: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log, cli.quiet);

    match run(&cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !already_logged(&e) {
                error!("{:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, config: &AppConfig) -> anyhow::Result<()> {
    let settings = UploadSettings::resolve(cli, config, |name| std::env::var(name).ok())
        .context("参数校验失败")?;

    let client = S3Client::new(settings.storage).context("初始化 S3 客户端失败")?;
    let uploader = MultipartUploader::new(Arc::new(client), settings.uploader);

    let report = uploader.upload(&settings.request).await?;

    info!(
        "上传速度 {:.2} MB/s, 耗时 {}, UploadId {}",
        report.throughput_mb_per_s(),
        report.duration_display(),
        report.upload_id
    );

    Ok(())
}

/// 上传阶段的失败已由 `MultipartUploader::upload` 连同提示和 UploadId 记录
fn already_logged(error: &anyhow::Error) -> bool {
    error.downcast_ref::<UploadFailure>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use s3_multipart_uploader::{UploadError, UploadPhase};

    #[test]
    fn test_upload_failure_logged_once() {
        let failure = UploadFailure {
            phase: UploadPhase::Complete,
            upload_id: Some("upload-1".to_string()),
            error: UploadError::Internal("boom".to_string()),
        };
        assert!(already_logged(&anyhow::Error::from(failure)));

        let config_error = anyhow::anyhow!("缺少必要参数: bucket").context("参数校验失败");
        assert!(!already_logged(&config_error));
    }
}
