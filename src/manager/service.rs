//! 下载调度服务
//!
//! 负责把远端文件夹快照拆成组和条目，并在组并发、小文件并发、大文件并发
//! 三个限制下决定哪些条目可以开始下载。每个条目由一个传输协调器负责，
//! 条目结束后立即触发下一轮调度以补充空出的名额。

use crate::config::{RateLimitConfig, SchedulerConfig};
use crate::downloader::{CreateDownloadParams, DownloadProgress, DownloaderFactory, TransferOutcome};
use crate::downloader::DownloadCoordinator;
use crate::manager::provider::{rate_limit_safe_call, RemoteProvider};
use crate::manager::publisher::{Notification, Publisher};
use crate::manager::repository::{InMemoryRepository, Repository};
use crate::manager::types::{
    FleetStats, Group, GroupState, GroupStatus, Item, ItemStats, ItemStatus, SchedulerSettings, VolumeNode,
};
use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 下载调度服务
pub struct DownloadManagerService {
    groups: Arc<dyn Repository<Group>>,
    items: Arc<dyn Repository<Item>>,
    provider: Arc<dyn RemoteProvider>,
    factory: Arc<DownloaderFactory>,
    publisher: Arc<dyn Publisher>,
    settings: RwLock<SchedulerSettings>,
    rate_limit: RateLimitConfig,
    /// 同一时间只允许一轮调度
    schedule_lock: Mutex<()>,
    /// 正在下载的条目 -> 协调器
    active: DashMap<String, DownloadCoordinator>,
    item_stats: DashMap<String, ItemStats>,
}

impl DownloadManagerService {
    pub fn new(
        provider: Arc<dyn RemoteProvider>,
        factory: Arc<DownloaderFactory>,
        publisher: Arc<dyn Publisher>,
        config: &SchedulerConfig,
    ) -> Self {
        Self::with_repositories(
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryRepository::new()),
            provider,
            factory,
            publisher,
            config,
        )
    }

    pub fn with_repositories(
        groups: Arc<dyn Repository<Group>>,
        items: Arc<dyn Repository<Item>>,
        provider: Arc<dyn RemoteProvider>,
        factory: Arc<DownloaderFactory>,
        publisher: Arc<dyn Publisher>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            groups,
            items,
            provider,
            factory,
            publisher,
            settings: RwLock::new(config.settings),
            rate_limit: config.rate_limit.clone(),
            schedule_lock: Mutex::new(()),
            active: DashMap::new(),
            item_stats: DashMap::new(),
        }
    }

    pub fn get_settings(&self) -> SchedulerSettings {
        *self.settings.read()
    }

    pub fn set_settings(&self, settings: SchedulerSettings) {
        info!("更新调度配置: {:?}", settings);
        *self.settings.write() = settings;
    }

    pub fn group_exists(&self, group_id: &str) -> bool {
        self.groups.find(group_id).is_some()
    }

    pub fn get_group(&self, group_id: &str) -> Option<Group> {
        self.groups.find(group_id)
    }

    pub fn get_groups(&self) -> Vec<Group> {
        self.groups.get_all()
    }

    /// 组内条目，按入队顺序
    pub fn get_items(&self, group_id: &str) -> Vec<Item> {
        let mut items = self.items.filter(&|i: &Item| i.group_id == group_id);
        items.sort_by_key(|i| i.order);
        items
    }

    /// 所有组都已结束（完成或入队失败）
    pub fn all_groups_completed(&self) -> bool {
        self.groups
            .get_all()
            .iter()
            .all(|g| matches!(g.status, GroupStatus::Completed | GroupStatus::Error))
    }

    // =====================================================
    // 入队
    // =====================================================

    /// 把一个远端文件夹快照加入下载队列
    ///
    /// 根节点生成一个组，每个叶子文件生成一个条目（跳过文件夹占位文件），
    /// 条目按文件大小升序排列。同一个根节点不能重复加入。
    pub fn add_volume(&self, tree: VolumeNode, save_root: impl Into<PathBuf>) -> Result<Group> {
        if self.group_exists(&tree.id) {
            bail!("组已存在: {} ({})", tree.name, tree.id);
        }

        let mut files: Vec<(String, &VolumeNode)> = Vec::new();
        tree.walk_files("", &mut |parent: &str, node: &VolumeNode| {
            files.push((parent.to_string(), node))
        });
        // 稳定排序，同样大小保持遍历顺序
        files.sort_by_key(|(_, node)| node.size);

        if let Some((_, dup)) = files.iter().find(|(_, node)| self.items.find(&node.id).is_some()) {
            bail!("文件已在其它组中: {} ({})", dup.name, dup.id);
        }

        // 条目全部写入之前组保持 Initializing，调度不会看到不完整的条目集合
        let mut group = Group::new(&tree.id, &tree.name, save_root);
        group.total_size = files.iter().map(|(_, node)| node.size).sum();
        group.item_count = files.len();
        self.groups.add(group.clone())?;
        self.publish(Notification::GroupAdded {
            group: group.clone(),
        });

        for (order, (parent, node)) in files.iter().enumerate() {
            let added = self.items.add(Item {
                id: node.id.clone(),
                group_id: group.id.clone(),
                name: node.name.clone(),
                relative_path: parent.clone(),
                size: node.size,
                checksum: node.checksum.clone(),
                status: ItemStatus::Pending,
                downloaded_bytes: 0,
                error: None,
                order: order as u64,
            });
            if let Err(e) = added {
                error!("写入条目失败: {} ({}), 错误: {:#}", node.name, node.id, e);
                group.status = GroupStatus::Error;
                self.groups.update(group.clone())?;
                self.publish(Notification::GroupStatusChanged {
                    group_id: group.id.clone(),
                    status: GroupStatus::Error,
                });
                return Err(e.context(format!("加入下载组失败: {}", group.id)));
            }
        }

        // 入队期间可能已被暂停，以仓库中的最新状态为准
        let mut group = self.groups.find(&group.id).unwrap_or(group);
        group.state = GroupState::Ready;
        if files.is_empty() {
            group.status = GroupStatus::Completed;
            group.completed_at = Some(chrono::Utc::now().timestamp());
        }
        self.groups.update(group.clone())?;
        self.publish(Notification::GroupStateChanged {
            group_id: group.id.clone(),
            state: GroupState::Ready,
        });

        info!(
            "新增下载组: {} ({}), {} 个文件, 共 {} 字节",
            group.name, group.id, group.item_count, group.total_size
        );
        Ok(group)
    }

    /// 通过远端根节点 id 获取快照并加入队列
    pub async fn add_volume_by_id(&self, root_id: &str, save_root: impl Into<PathBuf>) -> Result<Group> {
        if self.group_exists(root_id) {
            bail!("组已存在: {}", root_id);
        }
        let tree = rate_limit_safe_call(&self.rate_limit, "get_volume", || self.provider.get_volume(root_id))
            .await
            .with_context(|| format!("获取远端文件夹失败: {}", root_id))?
            .ok_or_else(|| anyhow!("远端文件夹不存在: {}", root_id))?;
        self.add_volume(tree, save_root)
    }

    // =====================================================
    // 候选计算
    // =====================================================

    /// 本轮可下载的组
    ///
    /// 组并发 <= 0 时返回全部可调度的组；否则保留所有正在下载的组，
    /// 再用等待中的组补足到上限。正在下载的组不会为等待中的组让位。
    pub fn get_download_group_candidates(&self) -> Vec<Group> {
        let limit = self.settings.read().concurrent_groups;
        let schedulable = self.groups.filter(&|g: &Group| g.is_schedulable());
        if limit <= 0 {
            return schedulable;
        }

        let (mut candidates, pending): (Vec<Group>, Vec<Group>) = schedulable
            .into_iter()
            .partition(|g| g.status == GroupStatus::Downloading);
        let room = (limit as usize).saturating_sub(candidates.len());
        candidates.extend(pending.into_iter().take(room));
        candidates
    }

    /// 本轮可开始下载的条目
    ///
    /// 小文件和大文件的名额在全局共享：先扣除已经在下载的条目，再按组顺序
    /// 依次从每个组的待下载条目中领取。放不进大文件名额的大文件归入小文件桶。
    pub fn get_download_item_candidates(&self, groups: &[Group]) -> Vec<Item> {
        let settings = *self.settings.read();
        let threshold = settings.small_file_threshold;

        let downloading = self
            .items
            .filter(&|i: &Item| i.status == ItemStatus::Downloading);
        let small_active = downloading.iter().filter(|i| i.is_small(threshold)).count();
        let large_active = downloading.len() - small_active;

        let mut small_budget = settings.concurrent_small_files.saturating_sub(small_active);
        let mut large_budget = settings.concurrent_large_files.saturating_sub(large_active);
        if small_budget == 0 && large_budget == 0 {
            return Vec::new();
        }

        let mut chosen = Vec::new();
        for group in groups {
            if small_budget == 0 && large_budget == 0 {
                break;
            }

            let mut pending = self.items.filter(&|i: &Item| {
                i.group_id == group.id && i.status == ItemStatus::Pending
            });
            pending.sort_by_key(|i| i.order);

            let mut large = Vec::new();
            let mut small = Vec::new();
            for item in pending {
                if !item.is_small(threshold) && large.len() < large_budget {
                    large.push(item);
                } else {
                    small.push(item);
                }
            }

            let take_large = large.len().min(large_budget);
            large_budget -= take_large;
            chosen.extend(large.into_iter().take(take_large));

            let take_small = small.len().min(small_budget);
            small_budget -= take_small;
            chosen.extend(small.into_iter().take(take_small));
        }
        chosen
    }

    /// 保存路径：组根目录/相对路径/文件名，多余的分隔符会被忽略
    pub fn compute_download_save_path(&self, item: &Item, group: &Group) -> PathBuf {
        let mut path = group.save_root.clone();
        for part in item
            .relative_path
            .split(|c| c == '/' || c == '\\')
            .filter(|p| !p.is_empty())
        {
            path.push(part);
        }
        path.push(item.name.trim_matches(|c| c == '/' || c == '\\'));
        path
    }

    // =====================================================
    // 调度
    // =====================================================

    /// 执行一轮调度
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _guard = self.schedule_lock.lock().await;

        let groups = self.get_download_group_candidates();
        if groups.is_empty() {
            return Ok(());
        }
        let candidates = self.get_download_item_candidates(&groups);
        if candidates.is_empty() {
            return Ok(());
        }

        let (empty, items): (Vec<Item>, Vec<Item>) = candidates.into_iter().partition(|i| i.size == 0);
        let finished_empty = !empty.is_empty();
        for item in empty {
            self.complete_empty_item(&item, &groups).await;
        }

        if !items.is_empty() {
            let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
            let links = rate_limit_safe_call(&self.rate_limit, "get_download_links", || {
                self.provider.get_download_links(&ids)
            })
            .await
            .with_context(|| format!("获取下载地址失败: {} 个文件", ids.len()))?;
            if links.len() != items.len() {
                bail!("下载地址数量不匹配: 请求 {} 个, 返回 {} 个", items.len(), links.len());
            }

            info!("本轮调度: {} 个组, {} 个文件开始下载", groups.len(), items.len());
            for (item, url) in items.into_iter().zip(links) {
                let Some(group) = groups.iter().find(|g| g.id == item.group_id) else {
                    continue;
                };
                let save_path = self.compute_download_save_path(&item, group);
                self.mark_group_downloading(&group.id);
                self.update_item_status(&item.id, ItemStatus::Downloading, None)?;

                tokio::spawn(self.clone().run_item(item, url, save_path));
            }
        }

        if finished_empty {
            // 空文件立即完成，释放出的名额交给下一轮
            self.schedule();
        }
        Ok(())
    }

    /// 在后台执行一轮调度
    pub fn schedule(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.start().await {
                error!("调度失败: {:#}", e);
            }
        });
    }

    async fn run_item(self: Arc<Self>, item: Item, url: String, save_path: PathBuf) {
        let mut params = CreateDownloadParams::new(url, &save_path, &item.id);
        params.file_size = Some(item.size);
        params.resume = true;
        params.callbacks.on_progress = Some(self.progress_forwarder(&item));

        let outcome = match self.factory.create(params).await {
            Ok(coordinator) => {
                self.active.insert(item.id.clone(), coordinator.clone());
                let result = coordinator.start().await;
                self.active.remove(&item.id);
                self.factory.remove(coordinator.id()).await;
                result
            }
            Err(e) => Err(e),
        };
        self.item_stats.remove(&item.id);

        let updated = match outcome {
            Ok(TransferOutcome::Completed) => {
                info!("文件下载完成: {:?}", save_path);
                self.update_item_status(&item.id, ItemStatus::Completed, None)
            }
            Ok(TransferOutcome::Paused) | Ok(TransferOutcome::Cancelled) => {
                debug!("文件下载已停止: {:?}", save_path);
                match self.items.find(&item.id) {
                    Some(current) if current.status == ItemStatus::Downloading => {
                        self.update_item_status(&item.id, ItemStatus::Pending, None)
                    }
                    _ => Ok(()),
                }
            }
            Err(e) => {
                error!("文件下载失败: {:?}, 错误: {}", save_path, e);
                self.update_item_status(&item.id, ItemStatus::Error, Some(e.to_string()))
            }
        };
        if let Err(e) = updated {
            warn!("更新条目状态失败: {}: {:#}", item.id, e);
        }

        self.schedule();
    }

    fn progress_forwarder(self: &Arc<Self>, item: &Item) -> crate::downloader::ProgressCallback {
        let weak: Weak<Self> = Arc::downgrade(self);
        let item_id = item.id.clone();
        let group_id = item.group_id.clone();
        let total = item.size;
        Arc::new(move |progress: &DownloadProgress| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let stats = ItemStats {
                item_id: item_id.clone(),
                group_id: group_id.clone(),
                downloaded_bytes: progress.downloaded_bytes,
                total_bytes: progress.total_bytes.unwrap_or(total),
                speed: progress.speed,
            };
            this.item_stats.insert(item_id.clone(), stats.clone());
            this.publish(Notification::ItemStatsUpdated { stats });
        })
    }

    async fn complete_empty_item(&self, item: &Item, groups: &[Group]) {
        let Some(group) = groups.iter().find(|g| g.id == item.group_id) else {
            return;
        };
        let path = self.compute_download_save_path(item, group);
        let result = create_empty_file(&path).await;

        let updated = match result {
            Ok(()) => {
                debug!("空文件已创建: {:?}", path);
                self.update_item_status(&item.id, ItemStatus::Completed, None)
            }
            Err(e) => {
                error!("创建空文件失败: {:?}, 错误: {:#}", path, e);
                self.update_item_status(&item.id, ItemStatus::Error, Some(format!("{:#}", e)))
            }
        };
        if let Err(e) = updated {
            warn!("更新条目状态失败: {}: {:#}", item.id, e);
        }
    }

    // =====================================================
    // 状态更新
    // =====================================================

    /// 更新条目状态；组内所有条目都结束时把组标记为完成
    pub fn update_item_status(&self, item_id: &str, status: ItemStatus, error: Option<String>) -> Result<()> {
        let mut item = self
            .items
            .find(item_id)
            .ok_or_else(|| anyhow!("条目不存在: {}", item_id))?;

        item.status = status;
        item.error = error;
        if status == ItemStatus::Completed {
            item.downloaded_bytes = item.size;
        }
        self.items.update(item.clone())?;
        self.publish(Notification::ItemStatusChanged {
            item_id: item.id.clone(),
            group_id: item.group_id.clone(),
            status,
        });

        if status.is_terminal() {
            self.complete_group_if_done(&item.group_id)?;
        }
        Ok(())
    }

    fn complete_group_if_done(&self, group_id: &str) -> Result<()> {
        let unfinished = self
            .items
            .filter(&|i: &Item| i.group_id == group_id && !i.status.is_terminal());
        if !unfinished.is_empty() {
            return Ok(());
        }

        let mut group = self
            .groups
            .find(group_id)
            .ok_or_else(|| anyhow!("组不存在: {}", group_id))?;
        if group.state != GroupState::Ready
            || matches!(group.status, GroupStatus::Completed | GroupStatus::Error)
        {
            return Ok(());
        }

        let errors = self
            .items
            .filter(&|i: &Item| i.group_id == group_id && i.status == ItemStatus::Error)
            .len();
        group.status = GroupStatus::Completed;
        group.completed_at = Some(chrono::Utc::now().timestamp());
        self.groups.update(group.clone())?;

        if errors > 0 {
            warn!("下载组完成: {} ({} 个文件失败)", group.name, errors);
        } else {
            info!("✅ 下载组完成: {}", group.name);
        }
        self.publish(Notification::GroupStatusChanged {
            group_id: group.id.clone(),
            status: group.status,
        });
        self.publish(Notification::FleetStats {
            stats: self.get_stats(),
        });
        Ok(())
    }

    fn mark_group_downloading(&self, group_id: &str) {
        let Some(mut group) = self.groups.find(group_id) else {
            return;
        };
        if group.status != GroupStatus::Pending {
            return;
        }
        group.status = GroupStatus::Downloading;
        if self.groups.update(group).is_ok() {
            self.publish(Notification::GroupStatusChanged {
                group_id: group_id.to_string(),
                status: GroupStatus::Downloading,
            });
        }
    }

    fn set_group_status(&self, group_id: &str, status: GroupStatus) -> Result<()> {
        let mut group = self
            .groups
            .find(group_id)
            .ok_or_else(|| anyhow!("组不存在: {}", group_id))?;
        group.status = status;
        self.groups.update(group)?;
        self.publish(Notification::GroupStatusChanged {
            group_id: group_id.to_string(),
            status,
        });
        Ok(())
    }

    // =====================================================
    // 组控制
    // =====================================================

    /// 暂停组：停止组内所有传输，条目回到待下载（续传数据保留）
    pub async fn pause_group(&self, group_id: &str) -> Result<()> {
        let group = self
            .groups
            .find(group_id)
            .ok_or_else(|| anyhow!("组不存在: {}", group_id))?;
        match group.status {
            GroupStatus::Paused => return Ok(()),
            GroupStatus::Completed | GroupStatus::Error => {
                bail!("组已结束，无法暂停: {} ({:?})", group_id, group.status)
            }
            GroupStatus::Pending | GroupStatus::Downloading => {}
        }
        // 先切换状态，传输停止后触发的调度不会再选中本组
        self.set_group_status(group_id, GroupStatus::Paused)?;

        for item in self.items.filter(&|i: &Item| {
            i.group_id == group_id && i.status == ItemStatus::Downloading
        }) {
            self.update_item_status(&item.id, ItemStatus::Pending, None)?;
            let coordinator = self.active.get(&item.id).map(|c| c.value().clone());
            if let Some(coordinator) = coordinator {
                if let Err(e) = coordinator.pause().await {
                    warn!("暂停传输失败: {}: {}", item.id, e);
                }
            }
        }

        info!("下载组已暂停: {}", group_id);
        Ok(())
    }

    /// 恢复组并触发调度
    pub fn resume_group(self: &Arc<Self>, group_id: &str) -> Result<()> {
        let group = self
            .groups
            .find(group_id)
            .ok_or_else(|| anyhow!("组不存在: {}", group_id))?;
        if group.status != GroupStatus::Paused {
            debug!("下载组未暂停，忽略恢复: {} ({:?})", group_id, group.status);
            return Ok(());
        }
        self.set_group_status(group_id, GroupStatus::Pending)?;
        info!("下载组已恢复: {}", group_id);
        self.schedule();
        Ok(())
    }

    /// 删除组，可选同时删除远端对象
    pub async fn remove_group(&self, group_id: &str, delete_remote: bool) -> Result<()> {
        let group = self
            .groups
            .remove(group_id)
            .ok_or_else(|| anyhow!("组不存在: {}", group_id))?;

        for item in self.items.filter(&|i: &Item| i.group_id == group_id) {
            self.items.remove(&item.id);
            self.item_stats.remove(&item.id);
            let coordinator = self.active.get(&item.id).map(|c| c.value().clone());
            if let Some(coordinator) = coordinator {
                if let Err(e) = coordinator.cancel().await {
                    warn!("取消传输失败: {}: {}", item.id, e);
                }
            }
        }

        if delete_remote {
            rate_limit_safe_call(&self.rate_limit, "delete_item", || self.provider.delete_item(group_id))
                .await
                .with_context(|| format!("删除远端对象失败: {}", group_id))?;
        }
        info!("下载组已删除: {} ({})", group.name, group_id);
        Ok(())
    }

    /// 全局统计
    pub fn get_stats(&self) -> FleetStats {
        let mut stats = FleetStats::default();
        for group in self.groups.get_all() {
            stats.total_groups += 1;
            match group.status {
                GroupStatus::Downloading => stats.downloading_groups += 1,
                GroupStatus::Completed => stats.completed_groups += 1,
                GroupStatus::Paused => stats.paused_groups += 1,
                GroupStatus::Error => stats.error_groups += 1,
                GroupStatus::Pending => {}
            }
        }

        for item in self.items.get_all() {
            stats.total_bytes += item.size;
            match item.status {
                ItemStatus::Pending => stats.pending_items += 1,
                ItemStatus::Downloading => stats.downloading_items += 1,
                ItemStatus::Completed => stats.completed_items += 1,
                ItemStatus::Error => stats.error_items += 1,
            }
            match self.item_stats.get(&item.id) {
                Some(live) if item.status == ItemStatus::Downloading => {
                    stats.downloaded_bytes += live.downloaded_bytes;
                    stats.speed += live.speed;
                }
                _ => stats.downloaded_bytes += item.downloaded_bytes,
            }
        }
        stats
    }

    fn publish(&self, notification: Notification) {
        if let Err(e) = self.publisher.publish(notification) {
            warn!("发布通知失败: {:#}", e);
        }
    }
}

async fn create_empty_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("创建目录失败: {:?}", parent))?;
    }
    tokio::fs::File::create(path)
        .await
        .with_context(|| format!("创建文件失败: {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use crate::downloader::test_support::{sample_body, MockTransport};
    use crate::manager::provider::ManifestProvider;
    use crate::manager::publisher::BroadcastPublisher;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// 写入指定条目时阻塞，直到测试放行
    struct GatedItems {
        inner: InMemoryRepository<Item>,
        gate_id: String,
        reached: parking_lot::Mutex<Option<mpsc::Sender<()>>>,
        release: parking_lot::Mutex<mpsc::Receiver<()>>,
    }

    impl Repository<Item> for GatedItems {
        fn add(&self, entity: Item) -> Result<()> {
            if entity.id == self.gate_id {
                if let Some(tx) = self.reached.lock().take() {
                    tx.send(()).unwrap();
                }
                self.release.lock().recv().unwrap();
            }
            self.inner.add(entity)
        }
        fn update(&self, entity: Item) -> Result<()> {
            self.inner.update(entity)
        }
        fn remove(&self, key: &str) -> Option<Item> {
            self.inner.remove(key)
        }
        fn find(&self, key: &str) -> Option<Item> {
            self.inner.find(key)
        }
        fn filter(&self, predicate: &dyn Fn(&Item) -> bool) -> Vec<Item> {
            self.inner.filter(predicate)
        }
        fn get_all(&self) -> Vec<Item> {
            self.inner.get_all()
        }
    }

    fn service_with(roots: Vec<VolumeNode>, settings: SchedulerSettings) -> Arc<DownloadManagerService> {
        let transport = Arc::new(MockTransport::new(sample_body(256)));
        let factory = Arc::new(DownloaderFactory::new(transport, DownloadConfig::default()));
        let config = SchedulerConfig {
            settings,
            rate_limit: RateLimitConfig::default(),
        };
        Arc::new(DownloadManagerService::new(
            Arc::new(ManifestProvider::new(roots)),
            factory,
            Arc::new(BroadcastPublisher::default()),
            &config,
        ))
    }

    fn settings(groups: i64, small: usize, large: usize, threshold: u64) -> SchedulerSettings {
        SchedulerSettings {
            concurrent_groups: groups,
            concurrent_small_files: small,
            concurrent_large_files: large,
            small_file_threshold: threshold,
        }
    }

    fn with_url(mut node: VolumeNode) -> VolumeNode {
        node.url = Some(format!("http://mock/{}", node.id));
        node
    }

    #[test]
    fn test_add_volume_sorts_and_rejects_duplicates() {
        let service = service_with(Vec::new(), SchedulerSettings::default());
        let tree = VolumeNode::folder(
            "root",
            "Show",
            vec![
                VolumeNode::file("big", "big.mkv", 300),
                VolumeNode::file("small", "small.nfo", 3),
                VolumeNode::folder("s1", "Extras", vec![VolumeNode::file("mid", "mid.mkv", 30)]),
            ],
        );

        let group = service.add_volume(tree.clone(), "/data").unwrap();
        assert_eq!(group.item_count, 3);
        assert_eq!(group.total_size, 333);

        let ids: Vec<String> = service.get_items("root").into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["small", "mid", "big"]);

        assert!(service.add_volume(tree, "/data").is_err());
        assert_eq!(service.get_groups().len(), 1);
    }

    #[test]
    fn test_cross_group_fairness() {
        let service = service_with(Vec::new(), settings(0, 2, 2, 100));
        service
            .add_volume(
                VolumeNode::folder(
                    "a",
                    "A",
                    vec![
                        VolumeNode::file("a1", "1", 10),
                        VolumeNode::file("a2", "2", 10),
                        VolumeNode::file("a3", "3", 10),
                    ],
                ),
                "/data",
            )
            .unwrap();
        service
            .add_volume(
                VolumeNode::folder(
                    "b",
                    "B",
                    vec![VolumeNode::file("b1", "1", 500), VolumeNode::file("b2", "2", 500)],
                ),
                "/data",
            )
            .unwrap();

        let groups = service.get_download_group_candidates();
        assert_eq!(groups.len(), 2);

        let items = service.get_download_item_candidates(&groups);
        let small: Vec<_> = items.iter().filter(|i| i.group_id == "a").collect();
        let large: Vec<_> = items.iter().filter(|i| i.group_id == "b").collect();
        assert_eq!(small.len(), 2);
        assert_eq!(large.len(), 2);
    }

    #[test]
    fn test_large_overflow_uses_small_budget() {
        let service = service_with(Vec::new(), settings(0, 1, 1, 100));
        service
            .add_volume(
                VolumeNode::folder(
                    "g",
                    "G",
                    vec![VolumeNode::file("l1", "1", 500), VolumeNode::file("l2", "2", 600)],
                ),
                "/data",
            )
            .unwrap();

        let groups = service.get_download_group_candidates();
        let items = service.get_download_item_candidates(&groups);
        assert_eq!(items.len(), 2);

        service
            .update_item_status("l1", ItemStatus::Downloading, None)
            .unwrap();
        service
            .update_item_status("l2", ItemStatus::Downloading, None)
            .unwrap();
        assert!(service.get_download_item_candidates(&groups).is_empty());
    }

    #[test]
    fn test_group_admission_cap() {
        let service = service_with(Vec::new(), settings(1, 4, 2, 100));
        service
            .add_volume(VolumeNode::folder("g1", "One", vec![VolumeNode::file("x", "x", 1)]), "/data")
            .unwrap();
        service
            .add_volume(VolumeNode::folder("g2", "Two", vec![VolumeNode::file("y", "y", 1)]), "/data")
            .unwrap();

        let first = service.get_download_group_candidates();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "g1");

        service.mark_group_downloading("g1");
        assert_eq!(service.get_download_group_candidates()[0].id, "g1");

        service.update_item_status("x", ItemStatus::Completed, None).unwrap();
        assert_eq!(service.get_group("g1").unwrap().status, GroupStatus::Completed);

        let next = service.get_download_group_candidates();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "g2");
    }

    #[test]
    fn test_errored_items_still_complete_group() {
        let service = service_with(Vec::new(), SchedulerSettings::default());
        service
            .add_volume(
                VolumeNode::folder(
                    "g",
                    "G",
                    vec![VolumeNode::file("ok", "ok", 1), VolumeNode::file("bad", "bad", 2)],
                ),
                "/data",
            )
            .unwrap();

        service.update_item_status("ok", ItemStatus::Completed, None).unwrap();
        assert_eq!(service.get_group("g").unwrap().status, GroupStatus::Pending);
        service
            .update_item_status("bad", ItemStatus::Error, Some("404".into()))
            .unwrap();
        assert_eq!(service.get_group("g").unwrap().status, GroupStatus::Completed);

        let stats = service.get_stats();
        assert_eq!(stats.completed_items, 1);
        assert_eq!(stats.error_items, 1);
        assert_eq!(stats.completed_groups, 1);
    }

    #[test]
    fn test_save_path_normalized() {
        let service = service_with(Vec::new(), SchedulerSettings::default());
        let group = Group::new("g", "Show", "/data/media");
        let item = Item {
            id: "i".into(),
            group_id: "g".into(),
            name: "/ep1.mkv".into(),
            relative_path: "Show//Season 1/".into(),
            size: 1,
            checksum: None,
            status: ItemStatus::Pending,
            downloaded_bytes: 0,
            error: None,
            order: 0,
        };
        assert_eq!(
            service.compute_download_save_path(&item, &group),
            PathBuf::from("/data/media/Show/Season 1/ep1.mkv")
        );
    }

    #[tokio::test]
    async fn test_pause_excludes_group() {
        let service = service_with(Vec::new(), settings(0, 4, 2, 100));
        service
            .add_volume(VolumeNode::folder("g", "G", vec![VolumeNode::file("x", "x", 1)]), "/data")
            .unwrap();

        service.pause_group("g").await.unwrap();
        assert_eq!(service.get_group("g").unwrap().status, GroupStatus::Paused);
        assert!(service.get_download_group_candidates().is_empty());

        service.resume_group("g").unwrap();
        assert_eq!(service.get_group("g").unwrap().status, GroupStatus::Pending);
        assert_eq!(service.get_download_group_candidates().len(), 1);
    }

    #[test]
    fn test_failed_ingest_marks_group_error() {
        let service = service_with(Vec::new(), SchedulerSettings::default());
        let tree = VolumeNode::folder(
            "g",
            "G",
            vec![VolumeNode::file("x", "one", 1), VolumeNode::file("x", "two", 2)],
        );

        assert!(service.add_volume(tree, "/data").is_err());
        let group = service.get_group("g").unwrap();
        assert_eq!(group.status, GroupStatus::Error);
        assert_eq!(group.state, GroupState::Initializing);
        assert!(service.get_download_group_candidates().is_empty());
        assert!(service.all_groups_completed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_during_ingest_waits_for_all_items() {
        let dir = TempDir::new().unwrap();
        let tree = VolumeNode::folder(
            "root",
            "Show",
            vec![
                with_url(VolumeNode::file("empty", "empty.txt", 0)),
                with_url(VolumeNode::file("a", "a.bin", 100)),
            ],
        );

        let (reached_tx, reached_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let items = Arc::new(GatedItems {
            inner: InMemoryRepository::new(),
            gate_id: "a".to_string(),
            reached: parking_lot::Mutex::new(Some(reached_tx)),
            release: parking_lot::Mutex::new(release_rx),
        });
        let transport = Arc::new(MockTransport::new(sample_body(256)));
        let service = Arc::new(DownloadManagerService::with_repositories(
            Arc::new(InMemoryRepository::new()),
            items,
            Arc::new(ManifestProvider::new(vec![tree.clone()])),
            Arc::new(DownloaderFactory::new(transport, DownloadConfig::default())),
            Arc::new(BroadcastPublisher::default()),
            &SchedulerConfig::default(),
        ));

        let ingest = {
            let service = service.clone();
            let save_root = dir.path().to_path_buf();
            tokio::task::spawn_blocking(move || service.add_volume(tree, save_root))
        };
        tokio::task::spawn_blocking(move || reached_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // 空文件已入库，a.bin 还在写入
        service.start().await.unwrap();
        let group = service.get_group("root").unwrap();
        assert_eq!(group.state, GroupState::Initializing);
        assert_eq!(group.status, GroupStatus::Pending);
        assert_eq!(
            service.get_items("root")[0].status,
            ItemStatus::Pending
        );

        release_tx.send(()).unwrap();
        let group = ingest.await.unwrap().unwrap();
        assert_eq!(group.state, GroupState::Ready);
        service.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while !service.all_groups_completed() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert!(service
            .get_items("root")
            .iter()
            .all(|i| i.status == ItemStatus::Completed));
        let root = dir.path().join("Show");
        assert_eq!(std::fs::read(root.join("a.bin")).unwrap(), sample_body(256)[..100].to_vec());
        assert_eq!(std::fs::metadata(root.join("empty.txt")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_volume_downloads_to_completion() {
        let dir = TempDir::new().unwrap();
        let tree = VolumeNode::folder(
            "root",
            "Show",
            vec![
                with_url(VolumeNode::file("a", "a.bin", 100)),
                with_url(VolumeNode::file("empty", "empty.txt", 0)),
                VolumeNode::folder(
                    "s1",
                    "Season 1",
                    vec![with_url(VolumeNode::file("b", "b.bin", 200))],
                ),
            ],
        );
        let service = service_with(vec![tree], settings(1, 1, 1, 150));

        service.add_volume_by_id("root", dir.path()).await.unwrap();
        service.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while !service.all_groups_completed() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let body = sample_body(256);
        let root = dir.path().join("Show");
        assert_eq!(std::fs::read(root.join("a.bin")).unwrap(), body[..100].to_vec());
        assert_eq!(std::fs::read(root.join("Season 1/b.bin")).unwrap(), body[..200].to_vec());
        assert_eq!(std::fs::metadata(root.join("empty.txt")).unwrap().len(), 0);

        let stats = service.get_stats();
        assert_eq!(stats.completed_items, 3);
        assert_eq!(stats.downloaded_bytes, 300);
    }
}
