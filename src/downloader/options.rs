//! 传输构造参数

use crate::common::SpeedAnomalyConfig;
use crate::config::DownloadConfig;
use crate::downloader::error::DownloadError;
use crate::downloader::progress::DownloadProgress;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub type ProgressCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&DownloadError) + Send + Sync>;

/// 可选回调
#[derive(Clone, Default)]
pub struct DownloadCallbacks {
    pub on_progress: Option<ProgressCallback>,
    pub on_complete: Option<CompleteCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl fmt::Debug for DownloadCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// 单个传输的不可变配置
#[derive(Debug, Clone)]
pub struct DownloaderOptions {
    pub url: String,
    pub save_as: PathBuf,
    /// 文件大小，未知时由工厂探测
    pub file_size: Option<u64>,
    pub workers_count: usize,
    /// 每个工作线程领取的区间大小（字节）
    pub chunk_size: u64,
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub max_consecutive_range_failures: u32,
    pub idle_poll_interval: Duration,
    pub offline_wait: Duration,
    pub restart_timeout: Duration,
    pub auto_restart: SpeedAnomalyConfig,
    pub callbacks: DownloadCallbacks,
}

impl DownloaderOptions {
    /// 以配置文件中的下载配置为默认值构造
    pub fn from_config(url: impl Into<String>, save_as: impl Into<PathBuf>, config: &DownloadConfig) -> Self {
        Self {
            url: url.into(),
            save_as: save_as.into(),
            file_size: None,
            workers_count: config.workers_count.max(1),
            chunk_size: config.chunk_size_bytes().max(1),
            max_retries: config.max_retries,
            initial_retry_delay: Duration::from_millis(config.initial_retry_delay_ms),
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms),
            max_consecutive_range_failures: config.max_consecutive_range_failures.max(1),
            idle_poll_interval: Duration::from_millis(config.idle_poll_interval_ms.max(10)),
            offline_wait: Duration::from_secs(config.offline_wait_secs),
            restart_timeout: Duration::from_secs(config.restart_timeout_secs),
            auto_restart: config.auto_restart.to_speed_anomaly_config(),
            callbacks: DownloadCallbacks::default(),
        }
    }
}
