// 上传分片管理
//
// 分片规则（按文件大小分档，控制总分片数，兼顾单分片重试成本）：
// - 文件 < 100MB：分片 5MB
// - 文件 < 500MB：分片 15MB
// - 文件 < 1GB：分片 25MB
// - 其余：分片 50MB

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// 第一档分片大小: 5MB（文件 < 100MB）
pub const CHUNK_SIZE_SMALL: u64 = 5 * MB;

/// 第二档分片大小: 15MB（文件 < 500MB）
pub const CHUNK_SIZE_MEDIUM: u64 = 15 * MB;

/// 第三档分片大小: 25MB（文件 < 1GB）
pub const CHUNK_SIZE_LARGE: u64 = 25 * MB;

/// 第四档分片大小: 50MB（1GB 及以上）
pub const CHUNK_SIZE_HUGE: u64 = 50 * MB;

/// 根据文件大小选择分片大小
///
/// 纯函数，对所有输入返回确定结果；分档单调不减
pub fn select_chunk_size(file_size: u64) -> u64 {
    if file_size < 100 * MB {
        CHUNK_SIZE_SMALL
    } else if file_size < 500 * MB {
        CHUNK_SIZE_MEDIUM
    } else if file_size < GB {
        CHUNK_SIZE_LARGE
    } else {
        CHUNK_SIZE_HUGE
    }
}

/// 上传分片信息
#[derive(Debug, Clone)]
pub struct UploadPart {
    /// 分片序号（1 起始，complete 接口按此排序）
    pub part_number: u32,
    /// 字节范围
    pub range: Range<u64>,
    /// 是否已完成
    pub completed: bool,
    /// 是否正在上传（防止重复调度）
    pub uploading: bool,
    /// 重试次数
    pub retries: u32,
    /// 完整性标签（上传后由远端返回）
    pub etag: Option<String>,
}

impl UploadPart {
    pub fn new(part_number: u32, range: Range<u64>) -> Self {
        Self {
            part_number,
            range,
            completed: false,
            uploading: false,
            retries: 0,
            etag: None,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 读取分片数据
    pub async fn read_data(&self, file_path: &Path) -> Result<Vec<u8>> {
        let mut file = File::open(file_path).await.context("打开上传文件失败")?;

        // 定位到分片起始位置
        file.seek(std::io::SeekFrom::Start(self.range.start))
            .await
            .context("文件定位失败")?;

        let part_size = self.size() as usize;
        let mut buffer = vec![0u8; part_size];
        file.read_exact(&mut buffer)
            .await
            .context("读取分片数据失败")?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.part_number,
            self.range.start,
            self.range.end.saturating_sub(1),
            part_size
        );

        Ok(buffer)
    }
}

/// 上传分片管理器
///
/// 持有一个文件全部分片的静态划分与完成状态；
/// 字节级进度由 `ProgressState` 单独维护
#[derive(Debug)]
pub struct PartManager {
    /// 所有分片（按序号升序）
    parts: Vec<UploadPart>,
    /// 文件总大小
    total_size: u64,
    /// 分片大小
    chunk_size: u64,
}

impl PartManager {
    /// 创建新的分片管理器
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let parts = Self::calculate_parts(total_size, chunk_size);

        info!(
            "创建分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            parts.len()
        );

        Self {
            parts,
            total_size,
            chunk_size,
        }
    }

    /// 按分档规则自动选择分片大小
    pub fn with_selected_chunk_size(total_size: u64) -> Self {
        Self::new(total_size, select_chunk_size(total_size))
    }

    /// 计算分片划分
    ///
    /// 序号从 1 开始按字节偏移递增；零字节文件保留一个空分片，
    /// 保证 total_parts >= 1
    fn calculate_parts(total_size: u64, chunk_size: u64) -> Vec<UploadPart> {
        if total_size == 0 {
            return vec![UploadPart::new(1, 0..0)];
        }

        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1u32;

        while offset < total_size {
            let end = std::cmp::min(offset + chunk_size, total_size);
            parts.push(UploadPart::new(part_number, offset..end));
            offset = end;
            part_number += 1;
        }

        parts
    }

    /// 获取所有分片
    pub fn parts(&self) -> &[UploadPart] {
        &self.parts
    }

    /// 分片数量
    pub fn total_parts(&self) -> u32 {
        self.parts.len() as u32
    }

    /// 文件总大小
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 分片大小
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 指定分片的预期大小
    ///
    /// 末尾分片为 total_size - chunk_size * (total_parts - 1)，其余等于 chunk_size
    pub fn expected_part_size(&self, part_number: u32) -> u64 {
        let total_parts = self.total_parts();
        if part_number == total_parts {
            self.total_size - self.chunk_size * (total_parts as u64 - 1)
        } else {
            self.chunk_size
        }
    }

    /// 已完成的分片数量
    pub fn completed_count(&self) -> u32 {
        self.parts.iter().filter(|p| p.completed).count() as u32
    }

    /// 已完成分片的字节数
    pub fn completed_bytes(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| p.completed)
            .map(|p| p.size())
            .sum()
    }

    /// 是否全部完成
    pub fn is_completed(&self) -> bool {
        self.parts.iter().all(|p| p.completed)
    }

    /// 标记分片为已完成
    pub fn mark_completed(&mut self, part_number: u32, etag: Option<String>) {
        if let Some(part) = self.part_mut(part_number) {
            part.completed = true;
            part.uploading = false;
            part.etag = etag;
        }
    }

    /// 标记分片正在上传（防止重复调度）
    pub fn mark_uploading(&mut self, part_number: u32) {
        if let Some(part) = self.part_mut(part_number) {
            part.uploading = true;
        }
    }

    /// 取消上传标记（上传失败时调用）
    pub fn unmark_uploading(&mut self, part_number: u32) {
        if let Some(part) = self.part_mut(part_number) {
            part.uploading = false;
        }
    }

    /// 增加分片重试次数，返回累计值
    pub fn increment_retry(&mut self, part_number: u32) -> u32 {
        match self.part_mut(part_number) {
            Some(part) => {
                part.retries += 1;
                part.retries
            }
            None => 0,
        }
    }

    /// 重置所有分片状态（整文件重试前调用）
    pub fn reset(&mut self) {
        for part in &mut self.parts {
            part.completed = false;
            part.uploading = false;
            part.retries = 0;
            part.etag = None;
        }
    }

    /// 已收集到标签的分片列表（按序号升序）
    pub fn tagged_parts(&self) -> Vec<(u32, String)> {
        self.parts
            .iter()
            .filter_map(|p| p.etag.clone().map(|tag| (p.part_number, tag)))
            .collect()
    }

    fn part_mut(&mut self, part_number: u32) -> Option<&mut UploadPart> {
        // 序号即索引 + 1，分片向量始终按序号排列
        self.parts.get_mut(part_number.checked_sub(1)? as usize)
    }
}

/// 分片级字节进度
///
/// 每个在途分片只写自己的键，聚合进度随时可读；
/// 单分片重试时只清零该分片的进度，兄弟分片不受影响
#[derive(Debug)]
pub struct ProgressState {
    /// 文件总大小
    total_size: u64,
    /// 分片序号 -> 已发送字节数
    parts: DashMap<u32, u64>,
}

impl ProgressState {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            parts: DashMap::new(),
        }
    }

    /// 记录指定分片的累计已发送字节数
    pub fn set(&self, part_number: u32, bytes: u64) {
        self.parts.insert(part_number, bytes);
    }

    /// 清零指定分片的进度（该分片重试前调用）
    pub fn reset_part(&self, part_number: u32) {
        self.parts.insert(part_number, 0);
    }

    /// 清空全部进度（整文件重试前调用）
    pub fn clear(&self) {
        self.parts.clear();
    }

    /// 所有分片累计已发送字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.parts.iter().map(|entry| *entry.value()).sum()
    }

    /// 聚合进度百分比，钳制在 [0, 100]
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        let ratio = self.uploaded_bytes() as f64 / self.total_size as f64;
        (ratio * 100.0).clamp(0.0, 100.0)
    }

    /// 文件总大小
    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn test_part_creation() {
        let part = UploadPart::new(1, 0..1024);
        assert_eq!(part.part_number, 1);
        assert_eq!(part.range, 0..1024);
        assert_eq!(part.size(), 1024);
        assert!(!part.completed);
        assert!(!part.uploading);
        assert!(part.etag.is_none());
    }

    #[test]
    fn test_select_chunk_size_tiers() {
        assert_eq!(select_chunk_size(0), CHUNK_SIZE_SMALL);
        assert_eq!(select_chunk_size(7 * MB), CHUNK_SIZE_SMALL);
        assert_eq!(select_chunk_size(100 * MB - 1), CHUNK_SIZE_SMALL);
        assert_eq!(select_chunk_size(100 * MB), CHUNK_SIZE_MEDIUM);
        assert_eq!(select_chunk_size(499 * MB), CHUNK_SIZE_MEDIUM);
        assert_eq!(select_chunk_size(500 * MB), CHUNK_SIZE_LARGE);
        assert_eq!(select_chunk_size(GB - 1), CHUNK_SIZE_LARGE);
        assert_eq!(select_chunk_size(GB), CHUNK_SIZE_HUGE);
        assert_eq!(select_chunk_size(100 * GB), CHUNK_SIZE_HUGE);
    }

    #[test]
    fn test_partition_120mb_example() {
        // 120MB 命中 15MB 档，恰好 8 个整分片
        let manager = PartManager::with_selected_chunk_size(120 * MB);
        assert_eq!(manager.chunk_size(), CHUNK_SIZE_MEDIUM);
        assert_eq!(manager.total_parts(), 8);
        assert_eq!(manager.parts()[7].size(), 15 * MB);
        assert_eq!(manager.expected_part_size(8), 15 * MB);
    }

    #[test]
    fn test_partition_uneven_7mb() {
        // 7MB 命中 5MB 档：两个分片 5MB + 2MB
        let manager = PartManager::with_selected_chunk_size(7 * MB);
        assert_eq!(manager.total_parts(), 2);
        assert_eq!(manager.parts()[0].range, 0..(5 * MB));
        assert_eq!(manager.parts()[1].range, (5 * MB)..(7 * MB));
        assert_eq!(manager.parts()[1].size(), 2 * MB);
        // 末尾分片公式: total - chunk * (n - 1)
        assert_eq!(manager.expected_part_size(2), 7 * MB - 5 * MB);
    }

    #[test]
    fn test_part_numbers_start_at_one() {
        let manager = PartManager::new(16 * MB, 4 * MB);
        let numbers: Vec<u32> = manager.parts().iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_size_file_keeps_one_part() {
        let manager = PartManager::new(0, CHUNK_SIZE_SMALL);
        assert_eq!(manager.total_parts(), 1);
        assert_eq!(manager.parts()[0].range, 0..0);
    }

    #[test]
    fn test_completion_bookkeeping() {
        let mut manager = PartManager::new(16 * MB, 4 * MB);
        assert_eq!(manager.completed_count(), 0);

        manager.mark_completed(1, Some("tag-1".to_string()));
        manager.mark_completed(2, Some("tag-2".to_string()));
        assert_eq!(manager.completed_count(), 2);
        assert_eq!(manager.completed_bytes(), 8 * MB);
        assert!(!manager.is_completed());

        manager.mark_completed(3, Some("tag-3".to_string()));
        manager.mark_completed(4, Some("tag-4".to_string()));
        assert!(manager.is_completed());

        let tagged = manager.tagged_parts();
        assert_eq!(tagged.len(), 4);
        assert_eq!(tagged[0], (1, "tag-1".to_string()));
        assert_eq!(tagged[3], (4, "tag-4".to_string()));
    }

    #[test]
    fn test_uploading_mark_and_retry_counter() {
        let mut manager = PartManager::new(16 * MB, 4 * MB);

        manager.mark_uploading(1);
        assert!(manager.parts()[0].uploading);

        manager.unmark_uploading(1);
        assert!(!manager.parts()[0].uploading);

        assert_eq!(manager.increment_retry(1), 1);
        assert_eq!(manager.increment_retry(1), 2);
        // 越界序号不计数
        assert_eq!(manager.increment_retry(99), 0);
    }

    #[test]
    fn test_reset() {
        let mut manager = PartManager::new(16 * MB, 4 * MB);
        for n in 1..=4 {
            manager.mark_completed(n, Some(format!("tag-{}", n)));
        }
        assert!(manager.is_completed());

        manager.reset();
        assert_eq!(manager.completed_count(), 0);
        assert!(!manager.is_completed());
        assert!(manager.tagged_parts().is_empty());
    }

    #[test]
    fn test_progress_state_partial_and_clamp() {
        let progress = ProgressState::new(10 * MB);
        assert_eq!(progress.progress(), 0.0);

        progress.set(1, 5 * MB);
        progress.set(2, 3 * MB);
        assert_eq!(progress.uploaded_bytes(), 8 * MB);
        assert_eq!(progress.progress(), 80.0);

        // 超出总大小时钳制在 100
        progress.set(2, 6 * MB);
        assert_eq!(progress.progress(), 100.0);
    }

    #[test]
    fn test_progress_reset_keeps_siblings() {
        let progress = ProgressState::new(10 * MB);
        progress.set(1, 5 * MB);
        progress.set(2, 3 * MB);

        // 只清零重试分片，兄弟分片进度保留
        progress.reset_part(2);
        assert_eq!(progress.uploaded_bytes(), 5 * MB);
        assert_eq!(progress.progress(), 50.0);
    }

    #[test]
    fn test_zero_size_progress() {
        let progress = ProgressState::new(0);
        assert_eq!(progress.progress(), 0.0);
    }

    #[test]
    fn test_aggregate_full_only_when_all_parts_reported() {
        // 120MB / 8 x 15MB：最后一个分片上报前聚合进度不得到 100
        let progress = ProgressState::new(120 * MB);
        for n in 1..=7u32 {
            progress.set(n, 15 * MB);
            assert!(progress.progress() < 100.0);
        }
        progress.set(8, 15 * MB);
        assert_eq!(progress.progress(), 100.0);
    }

    #[tokio::test]
    async fn test_read_part_data() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let part = UploadPart::new(2, 300..700);
        let read = part.read_data(file.path()).await.unwrap();
        assert_eq!(read.len(), 400);
        assert_eq!(read, data[300..700].to_vec());
    }

    proptest! {
        #[test]
        fn prop_chunk_size_monotonic(a in 0u64..400 * GB, b in 0u64..400 * GB) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(select_chunk_size(lo) <= select_chunk_size(hi));
        }

        #[test]
        fn prop_part_count_bounded(file_size in 1u64..256 * GB) {
            let chunk_size = select_chunk_size(file_size);
            let total_parts = file_size.div_ceil(chunk_size);
            prop_assert!(total_parts <= 10_000);
        }

        #[test]
        fn prop_partition_sums_to_file_size(file_size in 1u64..8 * GB) {
            let manager = PartManager::with_selected_chunk_size(file_size);
            let sum: u64 = manager.parts().iter().map(|p| p.size()).sum();
            prop_assert_eq!(sum, file_size);

            let chunk_size = manager.chunk_size();
            for part in manager.parts() {
                prop_assert!(part.size() > 0);
                prop_assert!(part.size() <= chunk_size);
            }

            // 末尾分片公式与实际划分一致
            let last = manager.parts().last().unwrap();
            prop_assert_eq!(last.size(), manager.expected_part_size(manager.total_parts()));
        }

        #[test]
        fn prop_part_ranges_contiguous(file_size in 1u64..8 * GB) {
            let manager = PartManager::with_selected_chunk_size(file_size);
            let mut expected_start = 0u64;
            for (idx, part) in manager.parts().iter().enumerate() {
                prop_assert_eq!(part.part_number as usize, idx + 1);
                prop_assert_eq!(part.range.start, expected_start);
                expected_start = part.range.end;
            }
            prop_assert_eq!(expected_start, file_size);
        }
    }
}
