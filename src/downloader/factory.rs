//! 传输工厂
//!
//! 校验参数、确定文件大小、预分配文件，并把新的工作线程池和进度追踪器装配进协调器。
//! 创建出的协调器按实例 id 登记，便于统一销毁。

use crate::config::DownloadConfig;
use crate::downloader::coordinator::DownloadCoordinator;
use crate::downloader::error::{DownloadError, DownloadResult};
use crate::downloader::events::EventBus;
use crate::downloader::file_manager::FileManager;
use crate::downloader::network::Transport;
use crate::downloader::options::{DownloadCallbacks, DownloaderOptions};
use crate::downloader::progress::ProgressTracker;
use crate::downloader::ranges::{FragmentStatus, Ranges};
use crate::downloader::worker_pool::WorkerManager;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 创建传输的参数
#[derive(Debug, Clone, Default)]
pub struct CreateDownloadParams {
    pub url: String,
    pub save_as: PathBuf,
    /// 来源对象 id（例如条目 id），用于日志和关联
    pub source_id: String,
    /// 已知的文件大小，None 时通过 HEAD 探测
    pub file_size: Option<u64>,
    /// 续传时由调用方提供的区间
    pub ranges: Option<Ranges>,
    /// 为 true 且未提供区间时尝试读取续传文件
    pub resume: bool,
    pub workers_count: Option<usize>,
    pub callbacks: DownloadCallbacks,
}

impl CreateDownloadParams {
    pub fn new(url: impl Into<String>, save_as: impl Into<PathBuf>, source_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            save_as: save_as.into(),
            source_id: source_id.into(),
            ..Default::default()
        }
    }
}

/// 传输工厂
pub struct DownloaderFactory {
    transport: Arc<dyn Transport>,
    defaults: DownloadConfig,
    coordinators: Arc<DashMap<String, DownloadCoordinator>>,
    bus: Option<EventBus>,
}

impl DownloaderFactory {
    pub fn new(transport: Arc<dyn Transport>, defaults: DownloadConfig) -> Self {
        Self {
            transport,
            defaults,
            coordinators: Arc::new(DashMap::new()),
            bus: None,
        }
    }

    /// 把所有协调器的事件转发到进程级总线
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn event_bus(&self) -> Option<&EventBus> {
        self.bus.as_ref()
    }

    pub fn defaults(&self) -> &DownloadConfig {
        &self.defaults
    }

    /// 创建并配置一个传输，返回的协调器尚未启动
    pub async fn create(&self, params: CreateDownloadParams) -> DownloadResult<DownloadCoordinator> {
        if params.url.trim().is_empty() {
            return Err(DownloadError::validation("缺少下载地址"));
        }
        if params.save_as.as_os_str().is_empty() {
            return Err(DownloadError::validation("缺少保存路径"));
        }
        if params.source_id.trim().is_empty() {
            return Err(DownloadError::validation("缺少来源对象"));
        }

        let file_manager = FileManager::new(&params.save_as);
        let explicit_ranges = match params.ranges {
            Some(ranges) => Some(ranges),
            None if params.resume => file_manager.load_resume_data().await,
            None => None,
        };

        let (ranges, total) = match explicit_ranges {
            Some(mut ranges) => {
                ranges.change_all(FragmentStatus::Reserved, FragmentStatus::Pending);
                let total = ranges.total_tracked();
                if !ranges.is_finite() || total == 0 {
                    return Err(DownloadError::validation("续传区间的总大小必须大于 0"));
                }
                info!(
                    "[{}] 续传: 已完成 {}/{} 字节",
                    params.source_id,
                    ranges.count(FragmentStatus::Finished),
                    total
                );
                (ranges, total)
            }
            None => {
                let total = self.resolve_size(&params.url, params.file_size).await?;
                (Ranges::new(Some(total)), total)
            }
        };

        file_manager.initialize_file(total).await?;

        let mut options = DownloaderOptions::from_config(&params.url, &params.save_as, &self.defaults);
        options.file_size = Some(total);
        if let Some(workers) = params.workers_count {
            options.workers_count = workers.max(1);
        }
        options.callbacks = params.callbacks;
        let restart_timeout = options.restart_timeout;

        let coordinator = DownloadCoordinator::new(
            self.transport.clone(),
            WorkerManager::new(restart_timeout),
            ProgressTracker::new(),
        );
        coordinator.configure(options, ranges)?;

        if let Some(bus) = &self.bus {
            self.forward_events(&coordinator, bus.clone());
        }

        info!(
            "创建传输: id={}, 来源={}, 大小={} 字节, 保存到 {:?}",
            coordinator.id(),
            params.source_id,
            total,
            params.save_as
        );
        self.coordinators
            .insert(coordinator.id().to_string(), coordinator.clone());
        Ok(coordinator)
    }

    async fn resolve_size(&self, url: &str, given: Option<u64>) -> DownloadResult<u64> {
        if let Some(size) = given {
            if size == 0 {
                return Err(DownloadError::validation("文件大小必须大于 0"));
            }
            return Ok(size);
        }

        match self.transport.get_file_size(url).await? {
            Some(size) if size > 0 => Ok(size),
            Some(_) => Err(DownloadError::validation(format!("服务器返回的文件大小为 0: {}", url))),
            None => Err(DownloadError::validation(format!("无法获取文件大小: {}", url))),
        }
    }

    fn forward_events(&self, coordinator: &DownloadCoordinator, bus: EventBus) {
        let mut rx = coordinator.subscribe();
        let id = coordinator.id().to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                bus.publish(event);
            }
            debug!("[传输{}] 事件转发结束", id);
        });
    }

    pub fn get(&self, id: &str) -> Option<DownloadCoordinator> {
        self.coordinators.get(id).map(|c| c.value().clone())
    }

    /// 注销并销毁一个协调器
    pub async fn remove(&self, id: &str) -> Option<DownloadCoordinator> {
        let (_, coordinator) = self.coordinators.remove(id)?;
        coordinator.dispose().await;
        Some(coordinator)
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }

    /// 销毁所有登记的协调器
    pub async fn dispose_all(&self) {
        let ids: Vec<String> = self.coordinators.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }
        info!("销毁全部传输: {} 个", ids.len());
        for id in ids {
            if let Some((_, coordinator)) = self.coordinators.remove(&id) {
                coordinator.dispose().await;
            } else {
                warn!("传输 {} 已被移除", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::coordinator::{CoordinatorState, TransferOutcome};
    use crate::downloader::test_support::{sample_body, MockTransport};
    use tempfile::TempDir;

    fn factory(transport: MockTransport) -> DownloaderFactory {
        DownloaderFactory::new(Arc::new(transport), DownloadConfig::default())
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let factory = factory(MockTransport::new(sample_body(10)));
        let dir = TempDir::new().unwrap();

        let err = factory
            .create(CreateDownloadParams::new("", dir.path().join("a"), "item"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Validation(_)));

        let err = factory
            .create(CreateDownloadParams::new("http://x/a", dir.path().join("a"), ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Validation(_)));
        assert!(factory.is_empty());
    }

    #[tokio::test]
    async fn test_size_resolution() {
        let dir = TempDir::new().unwrap();

        let mut unknown = MockTransport::new(sample_body(10));
        unknown.size_probe = None;
        let err = factory(unknown)
            .create(CreateDownloadParams::new("http://x/a", dir.path().join("a"), "item"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Validation(_)));

        let mut params = CreateDownloadParams::new("http://x/a", dir.path().join("a"), "item");
        params.file_size = Some(0);
        let err = factory(MockTransport::new(sample_body(10)))
            .create(params)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Validation(_)));

        let factory = factory(MockTransport::new(sample_body(64)));
        let coordinator = factory
            .create(CreateDownloadParams::new("http://x/a", dir.path().join("a"), "item"))
            .await
            .unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Configured);
        assert_eq!(std::fs::metadata(dir.path().join("a")).unwrap().len(), 64);
        assert!(factory.get(coordinator.id()).is_some());
    }

    #[tokio::test]
    async fn test_resume_resets_reserved_ranges() {
        let dir = TempDir::new().unwrap();
        let body = sample_body(200);
        let factory = factory(MockTransport::new(body.clone()));

        let mut ranges = Ranges::new(Some(200));
        ranges.mark_as(0, 99, FragmentStatus::Finished).unwrap();
        ranges.mark_as(100, 149, FragmentStatus::Reserved).unwrap();

        let path = dir.path().join("resume.bin");
        std::fs::write(&path, &body[..100]).unwrap();

        let mut params = CreateDownloadParams::new("http://x/a", &path, "item");
        params.ranges = Some(ranges);
        let coordinator = factory.create(params).await.unwrap();

        let data = coordinator.save_data();
        assert_eq!(data.size, Some(200));
        assert_eq!(data.fragments.len(), 2);
        assert_eq!(data.fragments[1].status, FragmentStatus::Pending);

        assert_eq!(coordinator.start().await.unwrap(), TransferOutcome::Completed);
        assert_eq!(std::fs::read(&path).unwrap(), body);
    }

    #[tokio::test]
    async fn test_events_forwarded_to_bus() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let factory = factory(MockTransport::new(sample_body(32))).with_event_bus(bus);

        let coordinator = factory
            .create(CreateDownloadParams::new("http://x/a", dir.path().join("a"), "item"))
            .await
            .unwrap();
        coordinator.start().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.scope.as_deref(), Some(coordinator.id()));
        assert_eq!(first.event.name(), "started");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.scope, None);
        assert_eq!(second.event.instance_id, coordinator.id());

        factory.dispose_all().await;
        assert!(factory.is_empty());
        assert_eq!(coordinator.state(), CoordinatorState::Disposed);
    }
}
