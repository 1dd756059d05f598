//! 工作线程池
//!
//! 记录活跃工作线程的统计信息，持有共享取消令牌，
//! 并支持"取消 -> 等待排空 -> 换新令牌"的重启流程

use crate::downloader::error::{DownloadError, DownloadResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 重启时等待排空的默认超时
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(30);

/// 工作线程统计
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: u64,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub bytes_downloaded: u64,
    pub retry_count: u32,
    /// 字节/秒（自启动以来的平均值）
    pub speed: f64,
}

/// 工作线程管理器
#[derive(Debug)]
pub struct WorkerManager {
    workers: RwLock<HashMap<u64, (Instant, WorkerStats)>>,
    next_id: AtomicU64,
    cancel_token: Mutex<CancellationToken>,
    drained: Notify,
    restart_timeout: Duration,
}

impl WorkerManager {
    pub fn new(restart_timeout: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cancel_token: Mutex::new(CancellationToken::new()),
            drained: Notify::new(),
            restart_timeout,
        }
    }

    /// 登记一个新的工作线程
    pub fn create_worker(&self) -> WorkerStats {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let stats = WorkerStats {
            id,
            start_time: now,
            last_update: now,
            bytes_downloaded: 0,
            retry_count: 0,
            speed: 0.0,
        };
        self.workers
            .write()
            .insert(id, (Instant::now(), stats.clone()));
        debug!("[工作线程#{}] 已登记", id);
        stats
    }

    pub fn update_worker_stats(&self, id: u64, bytes: u64) -> DownloadResult<()> {
        let mut workers = self.workers.write();
        let (started, stats) = workers
            .get_mut(&id)
            .ok_or_else(|| DownloadError::validation(format!("工作线程 #{} 不存在", id)))?;

        stats.bytes_downloaded += bytes;
        stats.last_update = Utc::now();
        let secs = started.elapsed().as_secs_f64().max(0.001);
        stats.speed = stats.bytes_downloaded as f64 / secs;
        Ok(())
    }

    pub fn record_retry(&self, id: u64) -> u32 {
        let mut workers = self.workers.write();
        match workers.get_mut(&id) {
            Some((_, stats)) => {
                stats.retry_count += 1;
                stats.retry_count
            }
            None => 0,
        }
    }

    /// 注销工作线程，池变空时唤醒等待者
    pub fn remove_worker(&self, id: u64) -> Option<WorkerStats> {
        let (removed, now_empty) = {
            let mut workers = self.workers.write();
            let removed = workers.remove(&id).map(|(_, stats)| stats);
            (removed, workers.is_empty())
        };
        if now_empty {
            self.drained.notify_waiters();
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.workers.read().len()
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        let mut stats: Vec<WorkerStats> = self
            .workers
            .read()
            .values()
            .map(|(_, s)| s.clone())
            .collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// 当前取消令牌（网络请求监听它）
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.lock().clone()
    }

    /// 取消当前令牌，不换新
    pub fn abort(&self) {
        self.cancel_token.lock().cancel();
    }

    /// 令牌已取消时换发新令牌
    pub fn ensure_fresh_token(&self) {
        let mut token = self.cancel_token.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// 等待所有工作线程退出
    pub async fn wait_until_stopped(&self, timeout: Duration) -> DownloadResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = self.active_count();
            if remaining == 0 {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let remaining = self.active_count();
                if remaining == 0 {
                    return Ok(());
                }
                warn!("等待工作线程退出超时: 仍有 {} 个活跃", remaining);
                return Err(DownloadError::Timeout {
                    message: format!("{} 秒内仍有 {} 个工作线程未退出", timeout.as_secs(), remaining),
                    url: None,
                });
            }
        }
    }

    /// 取消所有在途请求，等待排空后换发新令牌
    pub async fn restart(&self) -> DownloadResult<()> {
        let active = self.active_count();
        info!("重启工作线程池: {} 个活跃工作线程", active);

        self.abort();
        self.wait_until_stopped(self.restart_timeout).await?;
        *self.cancel_token.lock() = CancellationToken::new();
        Ok(())
    }
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_worker_lifecycle() {
        let pool = WorkerManager::default();
        let a = pool.create_worker();
        let b = pool.create_worker();
        assert_ne!(a.id, b.id);
        assert_eq!(pool.active_count(), 2);

        pool.update_worker_stats(a.id, 1024).unwrap();
        pool.update_worker_stats(a.id, 1024).unwrap();
        assert_eq!(pool.record_retry(a.id), 1);

        let stats = pool.stats();
        assert_eq!(stats[0].bytes_downloaded, 2048);
        assert_eq!(stats[0].retry_count, 1);

        assert!(pool.remove_worker(a.id).is_some());
        assert!(pool.update_worker_stats(a.id, 1).is_err());
        assert_eq!(pool.active_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_waits_for_drain() {
        let pool = Arc::new(WorkerManager::default());
        let worker = pool.create_worker();
        let token = pool.cancellation_token();

        let pool_clone = pool.clone();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            pool_clone.remove_worker(worker.id);
        });

        pool.restart().await.unwrap();
        assert_eq!(pool.active_count(), 0);
        assert!(!pool.cancellation_token().is_cancelled());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_times_out() {
        let pool = WorkerManager::new(Duration::from_millis(50));
        pool.create_worker();

        let err = pool.restart().await.unwrap_err();
        assert!(matches!(err, DownloadError::Timeout { .. }));
    }

    #[test]
    fn test_abort_and_refresh_token() {
        let pool = WorkerManager::default();
        let old = pool.cancellation_token();
        pool.abort();
        assert!(old.is_cancelled());

        pool.ensure_fresh_token();
        assert!(!pool.cancellation_token().is_cancelled());
    }
}
