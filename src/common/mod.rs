//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod speed_anomaly_detector;

pub use speed_anomaly_detector::{SlowdownReport, SpeedAnomalyConfig, SpeedAnomalyDetector};
