//! 调度层通知发布

use crate::manager::types::{FleetStats, Group, GroupState, GroupStatus, ItemStats, ItemStatus};
use anyhow::{bail, Result};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// 调度层通知
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    GroupAdded { group: Group },
    GroupStateChanged { group_id: String, state: GroupState },
    GroupStatusChanged { group_id: String, status: GroupStatus },
    ItemStatusChanged {
        item_id: String,
        group_id: String,
        status: ItemStatus,
    },
    ItemStatsUpdated { stats: ItemStats },
    FleetStats { stats: FleetStats },
}

impl Notification {
    /// 空负载直接拒绝
    pub fn validate(&self) -> Result<()> {
        let empty = match self {
            Notification::GroupAdded { group } => group.id.is_empty(),
            Notification::GroupStateChanged { group_id, .. }
            | Notification::GroupStatusChanged { group_id, .. } => group_id.is_empty(),
            Notification::ItemStatusChanged {
                item_id, group_id, ..
            } => item_id.is_empty() || group_id.is_empty(),
            Notification::ItemStatsUpdated { stats } => stats.item_id.is_empty(),
            Notification::FleetStats { .. } => false,
        };
        if empty {
            bail!("通知负载为空: {:?}", self);
        }
        Ok(())
    }
}

/// 通知发布接口，发布即返回，不等待订阅方处理
pub trait Publisher: Send + Sync {
    fn publish(&self, notification: Notification) -> Result<()>;
}

/// 基于 broadcast channel 的发布者
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(&self, notification: Notification) -> Result<()> {
        notification.validate()?;
        trace!("发布通知: {:?}", notification);
        // 没有订阅者不算错误
        let _ = self.tx.send(notification);
        Ok(())
    }
}
