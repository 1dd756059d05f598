//! 速度异常检测器
//!
//! 协调器的自动重启判定：
//! 1. 传输开始（或重启）一段时间后以实测速度建立基线
//! 2. 之后若速度持续低于 `max(基线 * (1 - 下降比例), 最低速度)`
//! 3. 且累计时长超过阈值，则判定需要重启工作线程并重新建立基线

use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 速度异常检测配置
#[derive(Clone, Debug, PartialEq)]
pub struct SpeedAnomalyConfig {
    /// 是否启用自动重启
    pub enabled: bool,
    /// 基线建立时间（秒）
    pub baseline_establish_secs: u64,
    /// 速度下降阈值（比例，如 0.5 表示下降50%）
    pub speed_drop_threshold: f64,
    /// 持续时长阈值（秒）
    pub duration_threshold_secs: u64,
    /// 检查间隔（秒）
    pub check_interval_secs: u64,
    /// 绝对速度下限（字节/秒），0 表示不设下限
    pub min_speed: u64,
}

impl Default for SpeedAnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            baseline_establish_secs: 30,
            speed_drop_threshold: 0.5,
            duration_threshold_secs: 20,
            check_interval_secs: 5,
            min_speed: 0,
        }
    }
}

/// 触发重启时的速度报告
#[derive(Debug, Clone, PartialEq)]
pub struct SlowdownReport {
    pub speed: u64,
    pub threshold: u64,
    pub slow_for: Duration,
}

/// 速度异常检测器（每个传输一个，由协调器独占）
#[derive(Debug)]
pub struct SpeedAnomalyDetector {
    config: SpeedAnomalyConfig,
    /// 计时起点（传输开始或上次重启）
    window_start: Instant,
    baseline: Option<u64>,
    /// 速度首次低于阈值的时间
    slow_since: Option<Instant>,
}

impl SpeedAnomalyDetector {
    pub fn new(config: SpeedAnomalyConfig) -> Self {
        Self {
            config,
            window_start: Instant::now(),
            baseline: None,
            slow_since: None,
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.config.check_interval_secs.max(1))
    }

    /// 检查当前速度（字节/秒），需要重启时返回报告
    pub fn check(&mut self, current_speed: u64) -> Option<SlowdownReport> {
        self.check_at(Instant::now(), current_speed)
    }

    fn check_at(&mut self, now: Instant, current_speed: u64) -> Option<SlowdownReport> {
        if !self.config.enabled {
            return None;
        }

        let baseline = match self.baseline {
            Some(baseline) => baseline,
            None => {
                let elapsed = now.saturating_duration_since(self.window_start);
                if elapsed.as_secs() < self.config.baseline_establish_secs {
                    return None;
                }
                info!("📊 基线速度已建立: {:.2} KB/s", current_speed as f64 / 1024.0);
                self.baseline = Some(current_speed);
                return None;
            }
        };

        let threshold = self.threshold_for(baseline);
        if current_speed >= threshold {
            self.slow_since = None;
            if current_speed > baseline {
                debug!("基线速度更新: {:.2} KB/s", current_speed as f64 / 1024.0);
                self.baseline = Some(current_speed);
            }
            return None;
        }

        let since = *self.slow_since.get_or_insert(now);
        let slow_for = now.saturating_duration_since(since);
        debug!(
            "速度低于阈值: 当前 {:.2} KB/s, 阈值 {:.2} KB/s, 持续 {}秒",
            current_speed as f64 / 1024.0,
            threshold as f64 / 1024.0,
            slow_for.as_secs()
        );

        if slow_for.as_secs() < self.config.duration_threshold_secs {
            return None;
        }

        info!(
            "⚠️ 速度持续过低: 当前 {:.2} KB/s, 阈值 {:.2} KB/s, 持续 {}秒，需要重启工作线程",
            current_speed as f64 / 1024.0,
            threshold as f64 / 1024.0,
            slow_for.as_secs()
        );
        self.reset_at(now);
        Some(SlowdownReport {
            speed: current_speed,
            threshold,
            slow_for,
        })
    }

    fn threshold_for(&self, baseline: u64) -> u64 {
        let dropped = baseline as f64 * (1.0 - self.config.speed_drop_threshold);
        (dropped.max(0.0) as u64).max(self.config.min_speed)
    }

    /// 重新开始计时并丢弃基线（暂停恢复或重启后调用）
    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    fn reset_at(&mut self, now: Instant) {
        self.window_start = now;
        self.baseline = None;
        self.slow_since = None;
    }

    pub fn baseline_speed(&self) -> Option<u64> {
        self.baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn immediate() -> SpeedAnomalyConfig {
        SpeedAnomalyConfig {
            baseline_establish_secs: 0,
            speed_drop_threshold: 0.5,
            duration_threshold_secs: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_baseline_establishment() {
        let mut detector = SpeedAnomalyDetector::new(immediate());
        assert!(detector.check(1_000_000).is_none());
        assert_eq!(detector.baseline_speed(), Some(1_000_000));
    }

    #[test]
    fn test_baseline_waits_for_window() {
        let config = SpeedAnomalyConfig {
            baseline_establish_secs: 30,
            ..immediate()
        };
        let mut detector = SpeedAnomalyDetector::new(config);
        assert!(detector.check(1_000_000).is_none());
        assert_eq!(detector.baseline_speed(), None);
    }

    #[test]
    fn test_small_drop_ignored() {
        let mut detector = SpeedAnomalyDetector::new(immediate());
        let t0 = Instant::now();
        detector.check_at(t0, 1_000_000);
        assert!(detector.check_at(t0 + Duration::from_secs(5), 600_000).is_none());
        assert!(detector.check_at(t0 + Duration::from_secs(60), 600_000).is_none());
    }

    #[test]
    fn test_sustained_drop_triggers_once() {
        let mut detector = SpeedAnomalyDetector::new(immediate());
        let t0 = Instant::now();
        detector.check_at(t0, 1_000_000);

        assert!(detector.check_at(t0 + Duration::from_secs(5), 100_000).is_none());
        let report = detector
            .check_at(t0 + Duration::from_secs(15), 100_000)
            .unwrap();
        assert_eq!(report.speed, 100_000);
        assert_eq!(report.threshold, 500_000);
        assert_eq!(detector.baseline_speed(), None);
    }

    #[test]
    fn test_recovery_resets_slow_window() {
        let mut detector = SpeedAnomalyDetector::new(immediate());
        let t0 = Instant::now();
        detector.check_at(t0, 1_000_000);
        detector.check_at(t0 + Duration::from_secs(5), 100_000);
        detector.check_at(t0 + Duration::from_secs(8), 2_000_000);
        assert_eq!(detector.baseline_speed(), Some(2_000_000));
        assert!(detector.check_at(t0 + Duration::from_secs(16), 100_000).is_none());
    }

    #[test]
    fn test_absolute_floor() {
        let config = SpeedAnomalyConfig {
            min_speed: 50_000,
            ..immediate()
        };
        let mut detector = SpeedAnomalyDetector::new(config);
        let t0 = Instant::now();
        detector.check_at(t0, 60_000);
        detector.check_at(t0 + Duration::from_secs(1), 40_000);
        assert!(detector.check_at(t0 + Duration::from_secs(12), 40_000).is_some());
    }

    #[test]
    fn test_disabled() {
        let config = SpeedAnomalyConfig {
            enabled: false,
            ..immediate()
        };
        let mut detector = SpeedAnomalyDetector::new(config);
        assert!(detector.check(0).is_none());
        assert_eq!(detector.baseline_speed(), None);
    }
}
