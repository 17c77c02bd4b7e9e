// 上传进度统计

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// 进度快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub completed: u32,
    pub total: u32,
    pub elapsed: Duration,
    /// 预计剩余时间（还没有完成任何分片时为 None）
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 * 100.0 / self.total as f64
    }
}

/// 已完成分片计数器（多个 worker 共享）
#[derive(Debug)]
pub struct ProgressCounter {
    completed: Mutex<u32>,
    total: u32,
    started_at: Instant,
}

impl ProgressCounter {
    pub fn new(total: u32) -> Self {
        Self {
            completed: Mutex::new(0),
            total,
            started_at: Instant::now(),
        }
    }

    /// 记录一个分片完成，返回完成后的快照
    pub fn record_completed(&self) -> ProgressSnapshot {
        let completed = {
            let mut completed = self.completed.lock();
            *completed += 1;
            *completed
        };
        self.snapshot_for(completed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let completed = *self.completed.lock();
        self.snapshot_for(completed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn snapshot_for(&self, completed: u32) -> ProgressSnapshot {
        let elapsed = self.elapsed();
        // 按已完成分片的平均耗时估算剩余分片
        let eta = (completed > 0).then(|| {
            let remaining = self.total.saturating_sub(completed);
            elapsed.mul_f64(remaining as f64 / completed as f64)
        });
        ProgressSnapshot {
            completed,
            total: self.total,
            elapsed,
            eta,
        }
    }
}

/// 格式化时长为 "HHh MMm SSs"
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!(
        "{:02}h {:02}m {:02}s",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

/// 平均吞吐量 (MiB/s)，耗时为 0 时返回无穷大
pub fn mb_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return f64::INFINITY;
    }
    bytes as f64 / (1024.0 * 1024.0) / secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "00h 00m 00s");
        assert_eq!(format_duration(Duration::from_secs(61)), "00h 01m 01s");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 25 * 60 + 9)), "03h 25m 09s");
        assert_eq!(format_duration(Duration::from_millis(59_999)), "00h 00m 59s");
    }

    #[test]
    fn test_mb_per_sec() {
        assert_eq!(mb_per_sec(100 * 1024 * 1024, Duration::from_secs(10)), 10.0);
        assert!(mb_per_sec(1024, Duration::ZERO).is_infinite());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eta_from_average() {
        let counter = ProgressCounter::new(4);
        assert_eq!(counter.snapshot().eta, None);

        tokio::time::advance(Duration::from_secs(10)).await;
        let snapshot = counter.record_completed();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.percent(), 25.0);
        assert_eq!(snapshot.eta, Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(10)).await;
        counter.record_completed();
        counter.record_completed();
        let snapshot = counter.record_completed();
        assert_eq!(snapshot.completed, 4);
        assert_eq!(snapshot.percent(), 100.0);
        assert_eq!(snapshot.eta, Some(Duration::ZERO));
    }
}
