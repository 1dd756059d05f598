//! 调度层数据结构

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use crate::config::SchedulerSettings;

/// 组的下载状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    /// 等待调度
    Pending,
    /// 至少有一个条目正在下载
    Downloading,
    /// 所有条目都已结束（可能部分失败）
    Completed,
    /// 入队失败，条目不完整
    Error,
    /// 用户暂停
    Paused,
}

/// 组的就绪状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    /// 条目尚未全部写入，不参与调度
    Initializing,
    Ready,
}

/// 条目状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Downloading,
    Completed,
    Error,
}

impl ItemStatus {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Error)
    }
}

/// 下载组，对应远端的一个根文件或根文件夹
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    /// 远端根节点 id（同时用于重复检测）
    pub id: String,
    pub name: String,
    /// 本地保存根目录
    pub save_root: PathBuf,
    pub status: GroupStatus,
    pub state: GroupState,
    pub total_size: u64,
    pub item_count: usize,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl Group {
    pub fn new(id: impl Into<String>, name: impl Into<String>, save_root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            save_root: save_root.into(),
            status: GroupStatus::Pending,
            state: GroupState::Initializing,
            total_size: 0,
            item_count: 0,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
        }
    }

    /// 可参与调度：条目已全部入库，且处于等待或下载中
    pub fn is_schedulable(&self) -> bool {
        self.state == GroupState::Ready
            && matches!(self.status, GroupStatus::Pending | GroupStatus::Downloading)
    }
}

/// 组内的一个待下载文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    /// 远端文件 id
    pub id: String,
    pub group_id: String,
    pub name: String,
    /// 相对组根目录的父路径，用 `/` 分隔
    pub relative_path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub status: ItemStatus,
    #[serde(default)]
    pub downloaded_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 入队顺序，组内按文件大小升序
    pub order: u64,
}

impl Item {
    pub fn is_small(&self, threshold: u64) -> bool {
        self.size <= threshold
    }
}

/// 远端节点类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Folder,
    /// 文件夹元数据占位文件，不下载
    FolderMarker,
}

/// 远端文件夹树快照中的一个节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// 下载地址（仅清单文件中的文件节点携带）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<VolumeNode>,
}

impl VolumeNode {
    pub fn file(id: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::File,
            size,
            checksum: None,
            url: None,
            children: Vec::new(),
        }
    }

    pub fn folder(id: impl Into<String>, name: impl Into<String>, children: Vec<VolumeNode>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::Folder,
            size: 0,
            checksum: None,
            url: None,
            children,
        }
    }

    /// 深度优先遍历所有文件节点，回调参数为（父路径, 节点）
    pub fn walk_files<'a>(&'a self, parent: &str, visit: &mut dyn FnMut(&str, &'a VolumeNode)) {
        match self.kind {
            NodeKind::File => visit(parent, self),
            NodeKind::FolderMarker => {}
            NodeKind::Folder => {
                let path = if parent.is_empty() {
                    self.name.clone()
                } else {
                    format!("{}/{}", parent, self.name)
                };
                for child in &self.children {
                    child.walk_files(&path, visit);
                }
            }
        }
    }
}

/// 单个条目的实时统计
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemStats {
    pub item_id: String,
    pub group_id: String,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    /// 字节/秒
    pub speed: f64,
}

/// 全局统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FleetStats {
    pub total_groups: usize,
    pub downloading_groups: usize,
    pub completed_groups: usize,
    pub paused_groups: usize,
    pub error_groups: usize,
    pub pending_items: usize,
    pub downloading_items: usize,
    pub completed_items: usize,
    pub error_items: usize,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// 所有活跃传输的速度之和
    pub speed: f64,
}
