//! 下载调度层
//!
//! 组和条目的入队、并发准入控制，以及与远端存储、通知发布的接口。

pub mod provider;
pub mod publisher;
pub mod repository;
pub mod service;
pub mod types;

pub use provider::{rate_limit_safe_call, ManifestProvider, ProviderError, RemoteProvider};
pub use publisher::{BroadcastPublisher, Notification, Publisher};
pub use repository::{Entity, InMemoryRepository, Repository};
pub use service::DownloadManagerService;
pub use types::{
    FleetStats, Group, GroupState, GroupStatus, Item, ItemStats, ItemStatus, NodeKind, SchedulerSettings,
    VolumeNode,
};
