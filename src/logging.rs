//! 日志系统配置
//!
//! 控制台输出 + 可选的日志文件（每次启动一个文件），启动时清理过期日志

use crate::config::LogConfig;
use chrono::Local;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "multipart-upload.";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 过滤级别：RUST_LOG 优先，其次 `--quiet`（只输出警告和错误），最后为配置的级别
fn build_filter(config: &LogConfig, quiet: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if quiet {
            EnvFilter::new("warn")
        } else {
            EnvFilter::new(&config.level)
        }
    })
}

/// 本次启动的日志文件名：multipart-upload.YYYY-MM-DD-HHMMSS.log
fn log_file_name() -> String {
    format!(
        "{}{}.log",
        LOG_FILE_PREFIX,
        Local::now().format("%Y-%m-%d-%H%M%S")
    )
}

/// 初始化日志系统
///
/// # Arguments
/// * `config` - 日志配置
/// * `quiet` - 只输出警告和错误
///
/// # Returns
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig, quiet: bool) -> LogGuard {
    let env_filter = build_filter(config, quiet);

    let console_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return LogGuard { _file_guard: None };
    }

    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}，回退到仅控制台输出", config.log_dir, e);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return LogGuard { _file_guard: None };
    }

    let file_appender = tracing_appender::rolling::never(&config.log_dir, log_file_name());
    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志文件: 目录={:?}, 保留天数={}, 级别={}",
        config.log_dir, config.retention_days, config.level
    );

    cleanup_old_logs(&config.log_dir, config.retention_days);

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 清理过期日志文件，返回删除的文件数
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_date) = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(extract_date_from_filename)
        else {
            continue;
        };

        if today.signed_duration_since(file_date) <= retention {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                deleted += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }

    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }
    deleted
}

/// 从文件名中提取日期：multipart-upload.YYYY-MM-DD-HHMMSS.log -> YYYY-MM-DD
fn extract_date_from_filename(filename: &str) -> Option<chrono::NaiveDate> {
    let name = filename.strip_prefix(LOG_FILE_PREFIX)?.strip_suffix(".log")?;
    let date = name.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_date() {
        assert_eq!(
            extract_date_from_filename("multipart-upload.2024-03-09-142501.log"),
            chrono::NaiveDate::from_ymd_opt(2024, 3, 9)
        );
        assert_eq!(extract_date_from_filename("other.2024-03-09-142501.log"), None);
        assert_eq!(extract_date_from_filename("multipart-upload.latest.log"), None);
    }

    #[test]
    fn test_log_file_name_round_trips_date() {
        let name = log_file_name();
        assert_eq!(
            extract_date_from_filename(&name),
            Some(Local::now().date_naive())
        );
    }

    #[test]
    fn test_cleanup_removes_expired_only() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("multipart-upload.2000-01-01-000000.log");
        let fresh = dir.path().join(log_file_name());
        let unrelated = dir.path().join("notes.txt");
        for path in [&old, &fresh, &unrelated] {
            fs::write(path, b"x").unwrap();
        }

        assert_eq!(cleanup_old_logs(dir.path(), 7), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }
}
