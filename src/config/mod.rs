// 配置管理模块

use crate::common::SpeedAnomalyConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 网络配置
    #[serde(default)]
    pub network: NetworkConfig,
    /// 调度配置
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
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

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 单个传输的下载配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadConfig {
    /// 每个传输的并发工作线程数
    #[serde(default = "default_workers_count")]
    pub workers_count: usize,
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 单个区间的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 首次重试等待（毫秒）
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    /// 重试等待上限（毫秒）
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// 连续多少个区间永久失败后终止传输
    #[serde(default = "default_max_consecutive_range_failures")]
    pub max_consecutive_range_failures: u32,
    /// 没有活跃工作线程时的轮询间隔（毫秒）
    #[serde(default = "default_idle_poll_interval_ms")]
    pub idle_poll_interval_ms: u64,
    /// 网络不可达时的等待间隔（秒）
    #[serde(default = "default_offline_wait_secs")]
    pub offline_wait_secs: u64,
    /// 工作线程池重启时等待排空的超时（秒）
    #[serde(default = "default_restart_timeout_secs")]
    pub restart_timeout_secs: u64,
    /// 自动重启配置
    #[serde(default)]
    pub auto_restart: AutoRestartConfig,
}

fn default_workers_count() -> usize {
    4
}
fn default_chunk_size_mb() -> u64 {
    8
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_retry_delay_ms() -> u64 {
    1000
}
fn default_max_retry_delay_ms() -> u64 {
    30_000
}
fn default_max_consecutive_range_failures() -> u32 {
    5
}
fn default_idle_poll_interval_ms() -> u64 {
    500
}
fn default_offline_wait_secs() -> u64 {
    5
}
fn default_restart_timeout_secs() -> u64 {
    30
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers_count: default_workers_count(),
            chunk_size_mb: default_chunk_size_mb(),
            max_retries: default_max_retries(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            max_consecutive_range_failures: default_max_consecutive_range_failures(),
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
            offline_wait_secs: default_offline_wait_secs(),
            restart_timeout_secs: default_restart_timeout_secs(),
            auto_restart: AutoRestartConfig::default(),
        }
    }
}

impl DownloadConfig {
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers_count == 0 {
            anyhow::bail!("workers_count 必须大于 0");
        }
        if self.chunk_size_mb == 0 {
            anyhow::bail!("chunk_size_mb 必须大于 0");
        }
        if self.initial_retry_delay_ms > self.max_retry_delay_ms {
            anyhow::bail!(
                "initial_retry_delay_ms ({}) 不能大于 max_retry_delay_ms ({})",
                self.initial_retry_delay_ms,
                self.max_retry_delay_ms
            );
        }
        Ok(())
    }
}

/// 自动重启配置
///
/// 传输速度相对基线持续下降（或低于绝对下限）时，取消并重启所有工作线程
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoRestartConfig {
    #[serde(default = "default_auto_restart_enabled")]
    pub enabled: bool,
    /// 基线建立时间（秒）
    #[serde(default = "default_baseline_establish_secs")]
    pub baseline_establish_secs: u64,
    /// 速度下降阈值（百分比）
    #[serde(default = "default_speed_drop_threshold_percent")]
    pub speed_drop_threshold_percent: u64,
    /// 速度下降持续时长（秒）
    #[serde(default = "default_speed_drop_duration_secs")]
    pub speed_drop_duration_secs: u64,
    /// 绝对速度下限（KB/s），0 表示不设下限
    #[serde(default)]
    pub min_speed_kbps: u64,
    /// 检查间隔（秒）
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_auto_restart_enabled() -> bool {
    true
}
fn default_baseline_establish_secs() -> u64 {
    30
}
fn default_speed_drop_threshold_percent() -> u64 {
    70
}
fn default_speed_drop_duration_secs() -> u64 {
    20
}
fn default_check_interval_secs() -> u64 {
    5
}

impl Default for AutoRestartConfig {
    fn default() -> Self {
        Self {
            enabled: default_auto_restart_enabled(),
            baseline_establish_secs: default_baseline_establish_secs(),
            speed_drop_threshold_percent: default_speed_drop_threshold_percent(),
            speed_drop_duration_secs: default_speed_drop_duration_secs(),
            min_speed_kbps: 0,
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl AutoRestartConfig {
    /// 转换为速度异常检测器配置
    pub fn to_speed_anomaly_config(&self) -> SpeedAnomalyConfig {
        SpeedAnomalyConfig {
            enabled: self.enabled,
            baseline_establish_secs: self.baseline_establish_secs,
            speed_drop_threshold: self.speed_drop_threshold_percent.min(100) as f64 / 100.0,
            duration_threshold_secs: self.speed_drop_duration_secs,
            check_interval_secs: self.check_interval_secs,
            min_speed: self.min_speed_kbps * 1024,
        }
    }
}

/// 网络配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// 连通性探测地址，未设置时视为始终连通
    #[serde(default)]
    pub probe_url: Option<String>,
    /// 连通性探测超时（秒）
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 读取超时（秒），超过此时间未收到数据视为超时
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    /// 实际字节数与期望值的允许偏差（百分比）
    #[serde(default)]
    pub size_tolerance_percent: f64,
    /// 重试等待的随机抖动上限（毫秒）
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
}

fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_read_timeout_secs() -> u64 {
    60
}
fn default_user_agent() -> String {
    format!("volume-downloader/{}", env!("CARGO_PKG_VERSION"))
}
fn default_pool_max_idle_per_host() -> usize {
    32
}
fn default_retry_jitter_ms() -> u64 {
    1000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_timeout_secs: default_probe_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            user_agent: default_user_agent(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            size_tolerance_percent: 0.0,
            retry_jitter_ms: default_retry_jitter_ms(),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.size_tolerance_percent) {
            anyhow::bail!(
                "size_tolerance_percent 必须在 0-100 之间: {}",
                self.size_tolerance_percent
            );
        }
        if matches!(&self.probe_url, Some(url) if url.trim().is_empty()) {
            anyhow::bail!("probe_url 不能为空字符串");
        }
        Ok(())
    }
}

/// 调度器并发设置（运行时可修改）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSettings {
    /// 同时下载的组数，<= 0 表示不限
    #[serde(default = "default_concurrent_groups")]
    pub concurrent_groups: i64,
    /// 同时下载的小文件数
    #[serde(default = "default_concurrent_small_files")]
    pub concurrent_small_files: usize,
    /// 同时下载的大文件数
    #[serde(default = "default_concurrent_large_files")]
    pub concurrent_large_files: usize,
    /// 小文件阈值（字节），小于等于此值视为小文件
    #[serde(default = "default_small_file_threshold")]
    pub small_file_threshold: u64,
}

fn default_concurrent_groups() -> i64 {
    1
}
fn default_concurrent_small_files() -> usize {
    4
}
fn default_concurrent_large_files() -> usize {
    2
}
fn default_small_file_threshold() -> u64 {
    50 * 1024 * 1024
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            concurrent_groups: default_concurrent_groups(),
            concurrent_small_files: default_concurrent_small_files(),
            concurrent_large_files: default_concurrent_large_files(),
            small_file_threshold: default_small_file_threshold(),
        }
    }
}

/// 远端 API 限流重试策略
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_rate_limit_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_rate_limit_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_rate_limit_max_attempts() -> u32 {
    5
}
fn default_rate_limit_initial_delay_ms() -> u64 {
    2000
}
fn default_rate_limit_max_delay_ms() -> u64 {
    60_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_rate_limit_max_attempts(),
            initial_delay_ms: default_rate_limit_initial_delay_ms(),
            max_delay_ms: default_rate_limit_max_delay_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// 调度配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub settings: SchedulerSettings,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.download.validate().context("下载配置无效")?;
        self.network.validate().context("网络配置无效")?;
        if self.scheduler.rate_limit.max_attempts == 0 {
            anyhow::bail!("rate_limit.max_attempts 必须大于 0");
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("创建配置目录失败")?;
            }
        }

        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;

        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {:#}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.download.workers_count = 8;
        config.scheduler.settings.concurrent_groups = 0;
        config.save_to_file(&path).await.unwrap();

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [download]
            workers_count = 2

            [scheduler.settings]
            concurrent_small_files = 6
            "#,
        )
        .unwrap();

        assert_eq!(config.download.workers_count, 2);
        assert_eq!(config.download.chunk_size_mb, 8);
        assert_eq!(config.scheduler.settings.concurrent_small_files, 6);
        assert_eq!(config.scheduler.settings.concurrent_groups, 1);
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.download.workers_count = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.network.size_tolerance_percent = 150.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.download.initial_retry_delay_ms = 10_000;
        config.download.max_retry_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auto_restart_to_speed_anomaly() {
        let auto = AutoRestartConfig {
            speed_drop_threshold_percent: 60,
            min_speed_kbps: 100,
            ..Default::default()
        };
        let detector = auto.to_speed_anomaly_config();
        assert!((detector.speed_drop_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(detector.min_speed, 100 * 1024);
        assert_eq!(detector.duration_threshold_secs, 20);
    }

    #[tokio::test]
    async fn test_load_or_default_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");

        let config = AppConfig::load_or_default(&path).await;
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
    }
}
