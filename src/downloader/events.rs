//! 传输生命周期事件
//!
//! 每个协调器通过自己的通道发出事件，工厂再把它们转发到进程级事件总线

use crate::downloader::progress::DownloadProgress;
use serde::Serialize;
use tokio::sync::broadcast;

/// 事件总线默认容量
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// 事件内容
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEventKind {
    Started,
    Progress {
        progress: DownloadProgress,
        /// 自上次进度事件以来新交付的字节
        bytes_since_last: u64,
    },
    Completed {
        total_bytes: u64,
        duration_ms: u64,
        /// 字节/秒
        average_speed: f64,
    },
    Paused {
        progress: DownloadProgress,
    },
    Cancelled {
        progress: DownloadProgress,
    },
    Error {
        message: String,
        retryable: bool,
        /// 是否导致整个传输终止
        fatal: bool,
    },
    WorkerStarted {
        worker_id: u64,
        start: u64,
        end: u64,
    },
    WorkerCompleted {
        worker_id: u64,
        bytes: u64,
    },
    WorkerFailed {
        worker_id: u64,
        message: String,
    },
    WorkerRestarted {
        reason: String,
    },
}

/// 带实例 ID 和时间戳的事件
#[derive(Debug, Clone, Serialize)]
pub struct DownloadEvent {
    pub instance_id: String,
    /// 毫秒时间戳
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: DownloadEventKind,
}

impl DownloadEvent {
    pub fn new(instance_id: impl Into<String>, kind: DownloadEventKind) -> Self {
        Self {
            instance_id: instance_id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
        }
    }

    /// 事件名称
    pub fn name(&self) -> &'static str {
        match &self.kind {
            DownloadEventKind::Started => "started",
            DownloadEventKind::Progress { .. } => "progress",
            DownloadEventKind::Completed { .. } => "completed",
            DownloadEventKind::Paused { .. } => "paused",
            DownloadEventKind::Cancelled { .. } => "cancelled",
            DownloadEventKind::Error { .. } => "error",
            DownloadEventKind::WorkerStarted { .. } => "worker.started",
            DownloadEventKind::WorkerCompleted { .. } => "worker.completed",
            DownloadEventKind::WorkerFailed { .. } => "worker.failed",
            DownloadEventKind::WorkerRestarted { .. } => "worker.restarted",
        }
    }
}

/// 总线上的事件，`scope` 为 None 表示不区分实例的全局订阅
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub scope: Option<String>,
    pub event: DownloadEvent,
}

/// 进程级事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// 以实例作用域和全局作用域各发布一次
    pub fn publish(&self, event: DownloadEvent) {
        let scoped = BusEvent {
            scope: Some(event.instance_id.clone()),
            event: event.clone(),
        };
        // 没有订阅者时发送失败，忽略即可
        let _ = self.tx.send(scoped);
        let _ = self.tx.send(BusEvent { scope: None, event });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_and_serialization() {
        let event = DownloadEvent::new(
            "abc",
            DownloadEventKind::WorkerStarted {
                worker_id: 3,
                start: 0,
                end: 99,
            },
        );
        assert_eq!(event.name(), "worker.started");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "worker_started");
        assert_eq!(json["instance_id"], "abc");
        assert_eq!(json["worker_id"], 3);
    }

    #[tokio::test]
    async fn test_bus_publishes_scoped_and_unscoped() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(DownloadEvent::new("job-1", DownloadEventKind::Started));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.scope.as_deref(), Some("job-1"));
        assert_eq!(second.scope, None);
        assert_eq!(second.event.name(), "started");
    }
}
