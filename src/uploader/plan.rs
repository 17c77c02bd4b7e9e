// 分片计划
//
// S3 分片上传协议限制：
// - 单个分片 5MiB ~ 5GiB（最后一个分片可以更小）
// - 分片数量最多 10000
//
// 未指定分片大小时，取默认 50MiB 与 ceil(file_size / 10000) 中的较大者，
// 保证分片数不超过上限。

use super::UploadError;
use tracing::debug;

/// 最小分片大小: 5MiB
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// 最大分片大小: 5GiB
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// 最大分片数量
pub const MAX_PARTS: u64 = 10_000;

/// 默认分片大小: 50MiB
pub const DEFAULT_PART_SIZE: u64 = 50 * 1024 * 1024;

/// 计算推荐的分片大小
pub fn recommended_part_size(file_size: u64) -> u64 {
    DEFAULT_PART_SIZE
        .max(MIN_PART_SIZE)
        .max(file_size.div_ceil(MAX_PARTS))
}

/// 分片计划（创建后不可变）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPlan {
    pub file_size: u64,
    pub part_size: u64,
    pub total_parts: u32,
}

/// 单个分片任务
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartTask {
    /// 分片序号（从 1 开始）
    pub part_number: u32,
    pub byte_offset: u64,
    pub byte_length: u64,
}

impl PartTask {
    /// 结束位置（不含）
    pub fn end(&self) -> u64 {
        self.byte_offset + self.byte_length
    }
}

impl UploadPlan {
    /// 计算分片计划
    ///
    /// # 参数
    /// * `file_size` - 文件大小，必须大于 0
    /// * `requested_part_size` - 指定的分片大小，None 时使用推荐值
    pub fn new(file_size: u64, requested_part_size: Option<u64>) -> Result<Self, UploadError> {
        if file_size == 0 {
            return Err(UploadError::Config("文件为空，无需上传".to_string()));
        }

        let part_size = requested_part_size.unwrap_or_else(|| recommended_part_size(file_size));

        if part_size < MIN_PART_SIZE {
            return Err(UploadError::Config(format!(
                "分片大小 {} bytes 小于下限 {} bytes (5MiB)",
                part_size, MIN_PART_SIZE
            )));
        }
        if part_size > MAX_PART_SIZE {
            return Err(UploadError::Config(format!(
                "分片大小 {} bytes 超过上限 {} bytes (5GiB)",
                part_size, MAX_PART_SIZE
            )));
        }

        let total_parts = file_size.div_ceil(part_size);
        if total_parts > MAX_PARTS {
            return Err(UploadError::Config(format!(
                "需要 {} 个分片，超过上限 {}，请增大分片大小",
                total_parts, MAX_PARTS
            )));
        }

        let plan = Self {
            file_size,
            part_size,
            total_parts: total_parts as u32,
        };
        debug!("分片计划: {:?}", plan);
        Ok(plan)
    }

    /// 指定分片的任务描述
    pub fn task(&self, part_number: u32) -> Option<PartTask> {
        if part_number == 0 || part_number > self.total_parts {
            return None;
        }
        let byte_offset = (part_number as u64 - 1) * self.part_size;
        let byte_length = self.part_size.min(self.file_size - byte_offset);
        Some(PartTask {
            part_number,
            byte_offset,
            byte_length,
        })
    }

    /// 全部分片任务（按序号排列）
    pub fn tasks(&self) -> Vec<PartTask> {
        (1..=self.total_parts).filter_map(|n| self.task(n)).collect()
    }

    /// 最后一个分片的大小
    pub fn last_part_size(&self) -> u64 {
        self.file_size - (self.total_parts as u64 - 1) * self.part_size
    }
}
