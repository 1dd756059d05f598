//! 字节区间追踪
//!
//! 把 `[0, size)` 切分成首尾相接、互不重叠的片段，每个片段标记为
//! 待下载 / 已预留 / 已完成。相邻同状态片段始终合并。
//! 大小未知时最后一个片段的结束位置是 `u64::MAX`，对外不可见。

use crate::downloader::error::{DownloadError, DownloadResult};
use serde::{Deserialize, Serialize};

/// 大小未知时尾片段的结束位置
pub const INFINITE_END: u64 = u64::MAX;

/// 片段状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentStatus {
    Pending,
    Reserved,
    Finished,
}

/// 片段（闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub start: u64,
    pub end: u64,
    pub status: FragmentStatus,
}

impl Fragment {
    pub fn new(start: u64, end: u64, status: FragmentStatus) -> Self {
        Self { start, end, status }
    }

    /// 片段字节数
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    fn is_unbounded(&self) -> bool {
        self.end == INFINITE_END
    }
}

/// 序列化后的区间状态，用于断点续传
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangesSaveData {
    /// 文件总大小（None 表示未知）
    pub size: Option<u64>,
    pub fragments: Vec<Fragment>,
}

/// 区间追踪器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranges {
    fragments: Vec<Fragment>,
    size: Option<u64>,
}

impl Ranges {
    /// 创建追踪器，全部区间初始为待下载
    pub fn new(size: Option<u64>) -> Self {
        let fragments = match size {
            Some(0) => Vec::new(),
            Some(n) => vec![Fragment::new(0, n - 1, FragmentStatus::Pending)],
            None => vec![Fragment::new(0, INFINITE_END, FragmentStatus::Pending)],
        };
        Self { fragments, size }
    }

    pub fn is_finite(&self) -> bool {
        self.size.is_some()
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// 调整大小，只允许扩大；有限与无限之间切换只影响尾片段
    pub fn set_size(&mut self, new_size: Option<u64>) -> DownloadResult<()> {
        match (self.size, new_size) {
            (Some(current), Some(n)) => {
                if n < current {
                    return Err(DownloadError::Range {
                        start: 0,
                        end: n,
                        message: format!("不支持缩小区间: {} -> {}", current, n),
                    });
                }
                if n > current {
                    self.fragments
                        .push(Fragment::new(current, n - 1, FragmentStatus::Pending));
                }
            }
            (Some(current), None) => {
                self.fragments
                    .push(Fragment::new(current, INFINITE_END, FragmentStatus::Pending));
            }
            (None, Some(n)) => {
                let tail_start = self.fragments.last().map(|f| f.start).unwrap_or(0);
                if tail_start > n {
                    return Err(DownloadError::Range {
                        start: tail_start,
                        end: n,
                        message: "已追踪的区间超出新的文件大小".to_string(),
                    });
                }
                if tail_start == n {
                    self.fragments.pop();
                } else if let Some(tail) = self.fragments.last_mut() {
                    tail.end = n - 1;
                }
            }
            (None, None) => {}
        }
        self.size = new_size;
        self.merge();
        Ok(())
    }

    /// 将 `[start, end]` 标记为指定状态
    pub fn mark_as(&mut self, start: u64, end: u64, status: FragmentStatus) -> DownloadResult<()> {
        if start > end {
            return Err(DownloadError::Range {
                start,
                end,
                message: "起始位置大于结束位置".to_string(),
            });
        }
        if let Some(size) = self.size {
            if end >= size {
                return Err(DownloadError::Range {
                    start,
                    end,
                    message: format!("超出文件大小 {}", size),
                });
            }
        }

        let marked = Fragment::new(start, end, status);
        let mut result = Vec::with_capacity(self.fragments.len() + 2);
        let mut inserted = false;

        for frag in &self.fragments {
            if frag.end < start || frag.start > end {
                if frag.start > end && !inserted {
                    result.push(marked);
                    inserted = true;
                }
                result.push(*frag);
                continue;
            }
            if frag.start < start {
                result.push(Fragment::new(frag.start, start - 1, frag.status));
            }
            if !inserted {
                result.push(marked);
                inserted = true;
            }
            if frag.end > end {
                result.push(Fragment::new(end + 1, frag.end, frag.status));
            }
        }
        if !inserted {
            result.push(marked);
        }

        self.fragments = result;
        self.merge();
        Ok(())
    }

    /// 查找至少 `min_size` 字节的指定状态区间
    ///
    /// 优先返回第一个足够大的片段（截断为恰好 `min_size`），
    /// 否则返回最大的那个片段，保证只要有可用区间调用方就能拿到工作
    pub fn find_sequence_of_at_least(&self, min_size: u64, status: FragmentStatus) -> Option<Fragment> {
        let min_size = min_size.max(1);
        let mut largest: Option<Fragment> = None;

        for frag in self.fragments.iter().filter(|f| f.status == status) {
            if frag.len() >= min_size {
                return Some(Fragment::new(frag.start, frag.start + min_size - 1, status));
            }
            if largest.map_or(true, |l| frag.len() > l.len()) {
                largest = Some(*frag);
            }
        }
        largest
    }

    pub fn find_first(&self, status: FragmentStatus) -> Option<Fragment> {
        self.fragments.iter().find(|f| f.status == status).copied()
    }

    /// 指定状态的字节数（不含大小未知时的尾片段）
    pub fn count(&self, status: FragmentStatus) -> u64 {
        self.fragments
            .iter()
            .filter(|f| f.status == status && !f.is_unbounded())
            .map(|f| f.len())
            .sum()
    }

    /// 全部已追踪字节数
    pub fn total_tracked(&self) -> u64 {
        self.count(FragmentStatus::Pending)
            + self.count(FragmentStatus::Reserved)
            + self.count(FragmentStatus::Finished)
    }

    /// 批量改写状态（工作池重启后把已预留区间放回待下载）
    pub fn change_all(&mut self, from: FragmentStatus, to: FragmentStatus) {
        for frag in self.fragments.iter_mut().filter(|f| f.status == from) {
            frag.status = to;
        }
        self.merge();
    }

    pub fn is_complete(&self) -> bool {
        self.is_finite() && self.count(FragmentStatus::Finished) == self.total_tracked()
    }

    /// 对外可见的片段列表（不含无限尾片段）
    pub fn fragments(&self) -> Vec<Fragment> {
        self.fragments
            .iter()
            .filter(|f| !f.is_unbounded())
            .copied()
            .collect()
    }

    pub fn to_save_data(&self) -> RangesSaveData {
        RangesSaveData {
            size: self.size,
            fragments: self.fragments.clone(),
        }
    }

    /// 从保存数据恢复，校验片段首尾相接并覆盖整个区间
    pub fn from_save_data(data: RangesSaveData) -> DownloadResult<Self> {
        let mut expected_start = 0u64;
        let last_index = data.fragments.len().saturating_sub(1);

        for (i, frag) in data.fragments.iter().enumerate() {
            if frag.start != expected_start || frag.start > frag.end {
                return Err(DownloadError::Range {
                    start: frag.start,
                    end: frag.end,
                    message: format!("保存数据中的片段不连续，期望起始位置 {}", expected_start),
                });
            }
            if frag.is_unbounded() && (i != last_index || data.size.is_some()) {
                return Err(DownloadError::Range {
                    start: frag.start,
                    end: frag.end,
                    message: "无限片段只能出现在大小未知的末尾".to_string(),
                });
            }
            expected_start = frag.end.saturating_add(1);
        }

        match data.size {
            Some(size) => {
                let covered = data.fragments.last().map(|f| f.end + 1).unwrap_or(0);
                if covered != size {
                    return Err(DownloadError::validation(format!(
                        "保存数据覆盖 {} 字节，与文件大小 {} 不符",
                        covered, size
                    )));
                }
            }
            None => {
                if !data.fragments.last().map_or(false, |f| f.is_unbounded()) {
                    return Err(DownloadError::validation("大小未知的保存数据缺少无限尾片段"));
                }
            }
        }

        let mut ranges = Self {
            fragments: data.fragments,
            size: data.size,
        };
        ranges.merge();
        Ok(ranges)
    }

    fn merge(&mut self) {
        let mut merged: Vec<Fragment> = Vec::with_capacity(self.fragments.len());
        for frag in self.fragments.drain(..) {
            match merged.last_mut() {
                Some(prev) if prev.status == frag.status && prev.end.saturating_add(1) == frag.start => {
                    prev.end = frag.end;
                }
                _ => merged.push(frag),
            }
        }
        self.fragments = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use FragmentStatus::*;

    fn sample() -> Ranges {
        let mut ranges = Ranges::new(Some(100));
        ranges.mark_as(10, 20, Finished).unwrap();
        ranges
    }

    #[test]
    fn test_new_ranges() {
        let ranges = Ranges::new(Some(1000));
        assert_eq!(ranges.fragments(), vec![Fragment::new(0, 999, Pending)]);
        assert_eq!(ranges.count(Pending), 1000);
        assert!(ranges.is_finite());

        let empty = Ranges::new(Some(0));
        assert!(empty.fragments().is_empty());
        assert!(empty.is_complete());
    }

    #[test]
    fn test_mark_as_splits_and_merges() {
        let mut ranges = sample();
        assert_eq!(
            ranges.fragments(),
            vec![
                Fragment::new(0, 9, Pending),
                Fragment::new(10, 20, Finished),
                Fragment::new(21, 99, Pending),
            ]
        );

        ranges.mark_as(0, 9, Finished).unwrap();
        assert_eq!(
            ranges.fragments(),
            vec![Fragment::new(0, 20, Finished), Fragment::new(21, 99, Pending)]
        );
    }

    #[test]
    fn test_mark_as_out_of_bounds() {
        let mut ranges = Ranges::new(Some(100));
        assert!(matches!(
            ranges.mark_as(50, 100, Finished),
            Err(DownloadError::Range { .. })
        ));
        assert!(matches!(
            ranges.mark_as(20, 10, Finished),
            Err(DownloadError::Range { .. })
        ));
    }

    #[test]
    fn test_find_sequence_best_fit() {
        let ranges = sample();
        assert_eq!(
            ranges.find_sequence_of_at_least(20, Pending),
            Some(Fragment::new(21, 40, Pending))
        );
        // 没有足够大的区间时返回最大的那个
        assert_eq!(
            ranges.find_sequence_of_at_least(500, Pending),
            Some(Fragment::new(21, 99, Pending))
        );
        assert_eq!(ranges.find_sequence_of_at_least(5, Reserved), None);
    }

    #[test]
    fn test_find_first_and_count() {
        let ranges = sample();
        assert_eq!(ranges.find_first(Finished), Some(Fragment::new(10, 20, Finished)));
        assert_eq!(ranges.count(Finished), 11);
        assert_eq!(ranges.count(Pending), 89);
        assert_eq!(ranges.total_tracked(), 100);
    }

    #[test]
    fn test_change_all_releases_reserved() {
        let mut ranges = sample();
        ranges.mark_as(30, 39, Reserved).unwrap();
        ranges.mark_as(60, 69, Reserved).unwrap();
        ranges.change_all(Reserved, Pending);
        assert_eq!(ranges.count(Reserved), 0);
        assert_eq!(
            ranges.fragments(),
            vec![
                Fragment::new(0, 9, Pending),
                Fragment::new(10, 20, Finished),
                Fragment::new(21, 99, Pending),
            ]
        );
    }

    #[test]
    fn test_completion() {
        let mut ranges = Ranges::new(Some(50));
        assert!(!ranges.is_complete());
        ranges.mark_as(0, 24, Finished).unwrap();
        ranges.mark_as(25, 49, Reserved).unwrap();
        assert!(!ranges.is_complete());
        ranges.mark_as(25, 49, Finished).unwrap();
        assert!(ranges.is_complete());
    }

    #[test]
    fn test_unbounded_size() {
        let mut ranges = Ranges::new(None);
        assert!(!ranges.is_finite());
        assert!(ranges.fragments().is_empty());
        ranges.mark_as(0, 99, Finished).unwrap();
        assert_eq!(ranges.fragments(), vec![Fragment::new(0, 99, Finished)]);
        assert!(!ranges.is_complete());

        ranges.set_size(Some(200)).unwrap();
        assert_eq!(
            ranges.fragments(),
            vec![Fragment::new(0, 99, Finished), Fragment::new(100, 199, Pending)]
        );
    }

    #[test]
    fn test_set_size_only_extends() {
        let mut ranges = Ranges::new(Some(100));
        ranges.set_size(Some(150)).unwrap();
        assert_eq!(ranges.fragments(), vec![Fragment::new(0, 149, Pending)]);
        assert!(ranges.set_size(Some(10)).is_err());

        ranges.set_size(None).unwrap();
        assert!(!ranges.is_finite());
        assert!(ranges.fragments().is_empty());
    }

    #[test]
    fn test_save_data_round_trip() {
        let mut ranges = sample();
        ranges.mark_as(50, 59, Reserved).unwrap();
        let data = ranges.to_save_data();
        let json = serde_json::to_string(&data).unwrap();
        let restored = Ranges::from_save_data(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.fragments(), ranges.fragments());
        assert_eq!(restored, ranges);
    }

    #[test]
    fn test_from_save_data_rejects_gaps() {
        let data = RangesSaveData {
            size: Some(100),
            fragments: vec![
                Fragment::new(0, 9, Pending),
                Fragment::new(20, 99, Finished),
            ],
        };
        assert!(Ranges::from_save_data(data).is_err());

        let short = RangesSaveData {
            size: Some(100),
            fragments: vec![Fragment::new(0, 49, Pending)],
        };
        assert!(Ranges::from_save_data(short).is_err());
    }

    fn status_strategy() -> impl Strategy<Value = FragmentStatus> {
        prop_oneof![Just(Pending), Just(Reserved), Just(Finished)]
    }

    proptest! {
        #[test]
        fn prop_partition_invariant(
            size in 1u64..2000,
            ops in proptest::collection::vec((0u64..2000, 0u64..2000, status_strategy()), 0..40)
        ) {
            let mut ranges = Ranges::new(Some(size));
            for (a, b, status) in ops {
                let start = a.min(b) % size;
                let end = a.max(b) % size;
                let (start, end) = (start.min(end), start.max(end));
                ranges.mark_as(start, end, status).unwrap();

                let fragments = ranges.fragments();
                prop_assert_eq!(fragments.first().map(|f| f.start), Some(0));
                prop_assert_eq!(fragments.last().map(|f| f.end), Some(size - 1));
                for pair in fragments.windows(2) {
                    prop_assert_eq!(pair[0].end + 1, pair[1].start);
                    prop_assert_ne!(pair[0].status, pair[1].status);
                }
                prop_assert_eq!(ranges.total_tracked(), size);
            }
        }
    }
}
