//! 进度追踪
//!
//! 统计已交付字节、最近 10 秒平均速度和最近一小时的分钟级速度直方图，
//! 并把进度上报节流到每秒一次

use crate::downloader::ranges::{Fragment, FragmentStatus, Ranges};
use crate::downloader::worker_pool::WorkerStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 进度上报最小间隔
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(1000);
/// 速度计算窗口
const SPEED_WINDOW: Duration = Duration::from_secs(10);
/// 直方图桶数（每桶一分钟）
pub const HISTOGRAM_BUCKETS: usize = 60;

/// 速度统计器
#[derive(Debug)]
pub struct SpeedTracker {
    /// 直方图分钟序号的起点，重置窗口时保持不变
    started: Instant,
    /// 速度窗口起点
    window_started: Instant,
    /// (时间, 字节数) 采样，只保留最近 10 秒
    samples: VecDeque<(Instant, u64)>,
    /// (分钟序号, 字节数)，只保留最近 60 分钟
    minutes: VecDeque<(u64, u64)>,
}

impl SpeedTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            window_started: now,
            samples: VecDeque::new(),
            minutes: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.evict(now);

        let minute = now.duration_since(self.started).as_secs() / 60;
        match self.minutes.back_mut() {
            Some((m, total)) if *m == minute => *total += bytes,
            _ => self.minutes.push_back((minute, bytes)),
        }
        while let Some((m, _)) = self.minutes.front() {
            if minute.saturating_sub(*m) >= HISTOGRAM_BUCKETS as u64 {
                self.minutes.pop_front();
            } else {
                break;
            }
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some((t, _)) = self.samples.front() {
            if now.duration_since(*t) > SPEED_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// 最近 10 秒平均速度（字节/秒）
    ///
    /// 重置后不足 10 秒时按实际经过时间计算
    pub fn speed(&mut self) -> f64 {
        let now = Instant::now();
        self.evict(now);
        let window = now.duration_since(self.window_started).min(SPEED_WINDOW);
        let secs = window.as_secs_f64().max(1.0);
        let bytes: u64 = self.samples.iter().map(|(_, b)| b).sum();
        bytes as f64 / secs
    }

    /// 清空 10 秒速度窗口，分钟直方图保留
    pub fn reset_window(&mut self) {
        self.samples.clear();
        self.window_started = Instant::now();
    }

    /// 最近 60 分钟每分钟的平均速度（字节/秒），最旧的在前
    pub fn histogram(&self) -> Vec<f64> {
        let current = Instant::now().duration_since(self.started).as_secs() / 60;
        let mut buckets = vec![0.0; HISTOGRAM_BUCKETS];
        for (minute, bytes) in &self.minutes {
            let age = current.saturating_sub(*minute) as usize;
            if age < HISTOGRAM_BUCKETS {
                buckets[HISTOGRAM_BUCKETS - 1 - age] = *bytes as f64 / 60.0;
            }
        }
        buckets
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个工作线程的进度摘要
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: u64,
    pub bytes_downloaded: u64,
    pub retry_count: u32,
    pub speed: f64,
    pub started_at: DateTime<Utc>,
}

/// 进度快照，每次获取都是新的副本
#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
    pub timestamp: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub workers_restarted_at: Option<DateTime<Utc>>,
    pub downloaded_bytes: u64,
    /// 大小未知时为 None
    pub total_bytes: Option<u64>,
    /// 字节/秒
    pub speed: f64,
    pub speed_histogram: Vec<f64>,
    pub workers: Vec<WorkerSummary>,
    pub fragments: Vec<Fragment>,
}

impl DownloadProgress {
    pub fn percentage(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some(self.downloaded_bytes as f64 * 100.0 / total as f64),
            None => None,
        }
    }
}

/// 进度追踪器
#[derive(Debug)]
pub struct ProgressTracker {
    speed_tracker: SpeedTracker,
    bytes_since_last_progress: u64,
    last_progress_at: Instant,
    start_time: DateTime<Utc>,
    workers_restarted_at: Option<DateTime<Utc>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            speed_tracker: SpeedTracker::new(),
            bytes_since_last_progress: 0,
            last_progress_at: Instant::now(),
            start_time: Utc::now(),
            workers_restarted_at: None,
        }
    }

    pub fn update(&mut self, bytes: u64) {
        self.speed_tracker.record(bytes);
        self.bytes_since_last_progress += bytes;
    }

    /// 距上次上报是否已超过 1 秒
    pub fn should_update_progress(&self) -> bool {
        self.last_progress_at.elapsed() >= PROGRESS_INTERVAL
    }

    /// 取出并清零累积字节数，同时重置 1 秒计时
    pub fn take_bytes_since_last_progress(&mut self) -> u64 {
        self.last_progress_at = Instant::now();
        std::mem::take(&mut self.bytes_since_last_progress)
    }

    pub fn get_progress(&mut self, ranges: &Ranges, workers: &[WorkerStats]) -> DownloadProgress {
        let total_bytes = if ranges.is_finite() {
            Some(ranges.total_tracked())
        } else {
            None
        };

        DownloadProgress {
            timestamp: Utc::now(),
            start_time: self.start_time,
            workers_restarted_at: self.workers_restarted_at,
            downloaded_bytes: ranges.count(FragmentStatus::Finished),
            total_bytes,
            speed: self.speed_tracker.speed(),
            speed_histogram: self.speed_tracker.histogram(),
            workers: workers
                .iter()
                .map(|w| WorkerSummary {
                    id: w.id,
                    bytes_downloaded: w.bytes_downloaded,
                    retry_count: w.retry_count,
                    speed: w.speed,
                    started_at: w.start_time,
                })
                .collect(),
            fragments: ranges.fragments(),
        }
    }

    pub fn speed(&mut self) -> f64 {
        self.speed_tracker.speed()
    }

    /// 暂停或重启后调用，避免空闲时间拉低平均速度
    pub fn reset_speed_tracker(&mut self) {
        self.speed_tracker.reset_window();
    }

    pub fn mark_workers_restarted(&mut self) {
        self.workers_restarted_at = Some(Utc::now());
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
