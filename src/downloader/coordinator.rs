//! 单文件传输协调器
//!
//! 状态机：Unconfigured -> Configured -> Running <-> Paused -> Completed / Error，任何状态 -> Disposed
//!
//! 运行循环是区间追踪器的唯一写入者：
//! 1. 有活跃工作线程时按间隔检查速度，异常则重启工作线程池并把预留区间放回待下载
//! 2. 没有活跃工作线程时先探测连通性，不通则等待
//! 3. 按 `find_sequence_of_at_least(chunk_size)` 领取区间并补足工作线程
//! 4. 等待任一工作线程结束（或定时器 / 暂停唤醒）

use crate::common::{SlowdownReport, SpeedAnomalyDetector};
use crate::downloader::error::{DownloadError, DownloadResult};
use crate::downloader::events::{DownloadEvent, DownloadEventKind};
use crate::downloader::file_manager::{FileManager, WritableFile};
use crate::downloader::network::Transport;
use crate::downloader::options::DownloaderOptions;
use crate::downloader::progress::{DownloadProgress, ProgressTracker, PROGRESS_INTERVAL};
use crate::downloader::ranges::{Fragment, FragmentStatus, Ranges, RangesSaveData};
use crate::downloader::worker_pool::WorkerManager;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 协调器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Unconfigured,
    Configured,
    Running,
    Paused,
    Completed,
    Error,
    Disposed,
}

/// `start()` 的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Paused,
    Cancelled,
}

enum LoopExit {
    Complete,
    Stopped,
}

/// 工作线程的执行结果
struct WorkerOutcome {
    worker_id: u64,
    fragment: Fragment,
    result: DownloadResult<u64>,
}

struct Setup {
    options: Arc<DownloaderOptions>,
    file_manager: FileManager,
}

struct Inner {
    id: String,
    state: Mutex<CoordinatorState>,
    setup: RwLock<Option<Arc<Setup>>>,
    ranges: Mutex<Ranges>,
    progress: Mutex<ProgressTracker>,
    workers: WorkerManager,
    transport: Arc<dyn Transport>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<DownloadEvent>>>,
    paused: AtomicBool,
    cancelled: AtomicBool,
    wake: Notify,
    /// 累计运行时长（不含暂停）
    active_time: Mutex<Duration>,
}

/// 传输协调器，克隆后共享同一个传输
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl DownloadCoordinator {
    pub fn new(transport: Arc<dyn Transport>, workers: WorkerManager, progress: ProgressTracker) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().to_string(),
                state: Mutex::new(CoordinatorState::Unconfigured),
                setup: RwLock::new(None),
                ranges: Mutex::new(Ranges::new(Some(0))),
                progress: Mutex::new(progress),
                workers,
                transport,
                listeners: Mutex::new(Vec::new()),
                paused: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                wake: Notify::new(),
                active_time: Mutex::new(Duration::ZERO),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> CoordinatorState {
        *self.inner.state.lock()
    }

    pub fn options(&self) -> Option<Arc<DownloaderOptions>> {
        self.inner.setup.read().as_ref().map(|s| s.options.clone())
    }

    /// 设置传输参数和区间追踪器，必须在 `start()` 之前调用
    pub fn configure(&self, options: DownloaderOptions, ranges: Ranges) -> DownloadResult<()> {
        let mut state = self.inner.state.lock();
        if !matches!(
            *state,
            CoordinatorState::Unconfigured | CoordinatorState::Configured
        ) {
            return Err(DownloadError::validation(format!(
                "当前状态 {:?} 不允许重新配置",
                *state
            )));
        }
        if options.workers_count == 0 || options.chunk_size == 0 {
            return Err(DownloadError::validation("工作线程数和分片大小必须大于 0"));
        }

        let file_manager = FileManager::new(&options.save_as);
        *self.inner.ranges.lock() = ranges;
        *self.inner.setup.write() = Some(Arc::new(Setup {
            options: Arc::new(options),
            file_manager,
        }));
        *state = CoordinatorState::Configured;
        Ok(())
    }

    /// 订阅本实例的生命周期事件
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.state() != CoordinatorState::Disposed {
            self.inner.listeners.lock().push(tx);
        }
        rx
    }

    pub fn is_complete(&self) -> bool {
        self.inner.ranges.lock().is_complete()
    }

    pub fn save_data(&self) -> RangesSaveData {
        self.inner.ranges.lock().to_save_data()
    }

    /// 当前进度快照
    pub fn get_progress(&self) -> DownloadProgress {
        self.inner.snapshot()
    }

    /// 运行传输直到完成、暂停、取消或出错
    pub async fn start(&self) -> DownloadResult<TransferOutcome> {
        let setup = self.begin_run()?;
        let options = setup.options.clone();
        let run_started = Instant::now();

        self.inner.workers.ensure_fresh_token();
        self.inner.progress.lock().reset_speed_tracker();

        let file = match setup.file_manager.open_file_for_writing().await {
            Ok(file) => Arc::new(file),
            Err(e) => return Err(self.fail(e, &setup).await),
        };

        info!(
            "[传输{}] 开始下载: url={}, 保存到 {:?}, 工作线程 {}",
            self.inner.id, options.url, options.save_as, options.workers_count
        );
        self.inner.emit(DownloadEventKind::Started);

        let result = self.run_loop(&options, file.clone()).await;
        *self.inner.active_time.lock() += run_started.elapsed();

        match result {
            Ok(LoopExit::Complete) => {
                if let Err(e) = file.sync_all().await {
                    return Err(self.fail(e, &setup).await);
                }
                setup.file_manager.clear_resume_data().await;
                self.finish_completed(&options);
                Ok(TransferOutcome::Completed)
            }
            Ok(LoopExit::Stopped) => {
                if let Err(e) = file.flush().await {
                    warn!("[传输{}] 暂停时刷新文件失败: {}", self.inner.id, e);
                }
                self.persist_resume_data(&setup).await;

                let cancelled = self.inner.cancelled.load(Ordering::SeqCst);
                self.set_state_unless_disposed(CoordinatorState::Paused);
                if cancelled {
                    info!("[传输{}] 已取消", self.inner.id);
                    Ok(TransferOutcome::Cancelled)
                } else {
                    info!("[传输{}] 已暂停", self.inner.id);
                    Ok(TransferOutcome::Paused)
                }
            }
            Err(e) => Err(self.fail(e, &setup).await),
        }
    }

    /// 暂停：停止所有工作线程，可再次 `start()` 继续
    pub async fn pause(&self) -> DownloadResult<()> {
        self.stop(false).await
    }

    /// 取消：停止所有工作线程并结束运行循环
    pub async fn cancel(&self) -> DownloadResult<()> {
        self.stop(true).await
    }

    /// 释放全部资源，可重复调用
    pub async fn dispose(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == CoordinatorState::Disposed {
                return;
            }
            *state = CoordinatorState::Disposed;
        }

        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        self.inner.workers.abort();

        let timeout = self
            .options()
            .map(|o| o.restart_timeout)
            .unwrap_or(crate::downloader::worker_pool::DEFAULT_RESTART_TIMEOUT);
        if let Err(e) = self.inner.workers.wait_until_stopped(timeout).await {
            warn!("[传输{}] 销毁时工作线程未全部退出: {}", self.inner.id, e);
        }

        self.inner.listeners.lock().clear();
        debug!("[传输{}] 已销毁", self.inner.id);
    }

    fn begin_run(&self) -> DownloadResult<Arc<Setup>> {
        let mut state = self.inner.state.lock();
        match *state {
            CoordinatorState::Configured | CoordinatorState::Paused | CoordinatorState::Error => {}
            CoordinatorState::Running => return Err(DownloadError::validation("传输已在运行")),
            CoordinatorState::Disposed => return Err(DownloadError::validation("传输已销毁")),
            CoordinatorState::Unconfigured => return Err(DownloadError::validation("传输尚未配置")),
            CoordinatorState::Completed => return Err(DownloadError::validation("传输已完成")),
        }

        let setup = self
            .inner
            .setup
            .read()
            .clone()
            .ok_or_else(|| DownloadError::validation("传输尚未配置"))?;

        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.cancelled.store(false, Ordering::SeqCst);
        *state = CoordinatorState::Running;
        Ok(setup)
    }

    async fn stop(&self, cancel: bool) -> DownloadResult<()> {
        match self.state() {
            CoordinatorState::Running => {}
            CoordinatorState::Paused => {
                // 已暂停的传输被取消时只需补发取消事件
                if cancel && !self.inner.cancelled.swap(true, Ordering::SeqCst) {
                    info!("[传输{}] 已暂停的传输被取消", self.inner.id);
                    let progress = self.inner.snapshot();
                    self.inner.emit(DownloadEventKind::Cancelled { progress });
                }
                return Ok(());
            }
            other => {
                return Err(DownloadError::validation(format!(
                    "当前状态 {:?} 无法暂停或取消",
                    other
                )))
            }
        }

        if cancel {
            self.inner.cancelled.store(true, Ordering::SeqCst);
        } else {
            self.inner.paused.store(true, Ordering::SeqCst);
        }
        self.inner.wake.notify_one();

        self.inner.workers.restart().await?;
        self.inner.progress.lock().reset_speed_tracker();

        let progress = self.inner.snapshot();
        if let Some(setup) = self.inner.setup.read().as_ref() {
            if let Some(cb) = &setup.options.callbacks.on_progress {
                cb(&progress);
            }
        }
        let kind = if cancel {
            DownloadEventKind::Cancelled { progress }
        } else {
            DownloadEventKind::Paused { progress }
        };
        self.inner.emit(kind);
        Ok(())
    }

    async fn run_loop(&self, options: &Arc<DownloaderOptions>, file: Arc<WritableFile>) -> DownloadResult<LoopExit> {
        let mut join_set: JoinSet<WorkerOutcome> = JoinSet::new();
        let mut detector = SpeedAnomalyDetector::new(options.auto_restart.clone());
        let check_interval = detector.check_interval();
        let mut next_check = Instant::now() + check_interval;
        let mut consecutive_failures = 0u32;

        let result = loop {
            if self.inner.stop_requested() {
                break Ok(LoopExit::Stopped);
            }
            if self.is_complete() {
                break Ok(LoopExit::Complete);
            }

            if !join_set.is_empty() {
                if Instant::now() >= next_check {
                    next_check = Instant::now() + check_interval;
                    let speed = self.inner.progress.lock().speed() as u64;
                    if let Some(report) = detector.check(speed) {
                        if let Err(e) = self
                            .restart_workers(&mut join_set, &mut consecutive_failures, options, report)
                            .await
                        {
                            break Err(e);
                        }
                        continue;
                    }
                }
            } else if !self.inner.transport.check_connectivity().await {
                warn!(
                    "[传输{}] 网络不可达，{} 秒后重试",
                    self.inner.id,
                    options.offline_wait.as_secs()
                );
                self.inner.sleep_or_wake(options.offline_wait).await;
                continue;
            }

            if let Err(e) = self.top_up_workers(&mut join_set, options, &file) {
                break Err(e);
            }

            if join_set.is_empty() {
                // 没有活跃工作线程时不应存在预留区间
                self.inner
                    .ranges
                    .lock()
                    .change_all(FragmentStatus::Reserved, FragmentStatus::Pending);
                self.inner.sleep_or_wake(options.idle_poll_interval).await;
                continue;
            }

            let wait = next_check
                .saturating_duration_since(Instant::now())
                .min(PROGRESS_INTERVAL);
            tokio::select! {
                joined = join_set.join_next() => {
                    if let Some(joined) = joined {
                        if let Err(e) = self.handle_worker_result(joined, &mut consecutive_failures, options) {
                            break Err(e);
                        }
                    }
                }
                _ = tokio::time::sleep(wait) => {}
                _ = self.inner.wake.notified() => {}
            }

            self.report_progress_if_due(options);
        };

        // 退出前回收全部工作线程，未完成的区间回到待下载
        self.inner.workers.abort();
        while let Some(joined) = join_set.join_next().await {
            let _ = self.handle_worker_result(joined, &mut consecutive_failures, options);
        }
        self.inner
            .ranges
            .lock()
            .change_all(FragmentStatus::Reserved, FragmentStatus::Pending);

        result
    }

    /// 领取待下载区间直到工作线程数达到上限
    fn top_up_workers(
        &self,
        join_set: &mut JoinSet<WorkerOutcome>,
        options: &Arc<DownloaderOptions>,
        file: &Arc<WritableFile>,
    ) -> DownloadResult<()> {
        while join_set.len() < options.workers_count {
            let claimed = {
                let mut ranges = self.inner.ranges.lock();
                match ranges.find_sequence_of_at_least(options.chunk_size, FragmentStatus::Pending) {
                    Some(fragment) => {
                        ranges.mark_as(fragment.start, fragment.end, FragmentStatus::Reserved)?;
                        fragment
                    }
                    None => break,
                }
            };
            self.spawn_worker(join_set, options.clone(), claimed, file.clone());
        }
        Ok(())
    }

    fn spawn_worker(
        &self,
        join_set: &mut JoinSet<WorkerOutcome>,
        options: Arc<DownloaderOptions>,
        fragment: Fragment,
        file: Arc<WritableFile>,
    ) {
        let worker = self.inner.workers.create_worker();
        let token = self.inner.workers.cancellation_token();
        debug!(
            "[传输{}][工作线程#{}] 领取区间 bytes={}-{}",
            self.inner.id, worker.id, fragment.start, fragment.end
        );
        self.inner.emit(DownloadEventKind::WorkerStarted {
            worker_id: worker.id,
            start: fragment.start,
            end: fragment.end,
        });

        let inner = self.inner.clone();
        join_set.spawn(async move {
            let result = inner
                .download_with_retry(worker.id, fragment, &options, &file, &token)
                .await;
            inner.workers.remove_worker(worker.id);
            WorkerOutcome {
                worker_id: worker.id,
                fragment,
                result,
            }
        });
    }

    /// 处理工作线程结果，只有需要终止整个传输时返回错误
    fn handle_worker_result(
        &self,
        joined: Result<WorkerOutcome, JoinError>,
        consecutive_failures: &mut u32,
        options: &DownloaderOptions,
    ) -> DownloadResult<()> {
        let WorkerOutcome {
            worker_id,
            fragment,
            result,
        } = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("[传输{}] 工作线程异常退出: {}", self.inner.id, e);
                return Ok(());
            }
        };

        match result {
            Ok(bytes) => {
                self.inner
                    .ranges
                    .lock()
                    .mark_as(fragment.start, fragment.end, FragmentStatus::Finished)?;
                *consecutive_failures = 0;
                self.inner
                    .emit(DownloadEventKind::WorkerCompleted { worker_id, bytes });
                Ok(())
            }
            Err(DownloadError::Cancelled) => {
                self.inner
                    .ranges
                    .lock()
                    .mark_as(fragment.start, fragment.end, FragmentStatus::Pending)?;
                debug!(
                    "[传输{}][工作线程#{}] 已取消，区间 {}-{} 放回待下载",
                    self.inner.id, worker_id, fragment.start, fragment.end
                );
                Ok(())
            }
            Err(e) => {
                self.inner
                    .ranges
                    .lock()
                    .mark_as(fragment.start, fragment.end, FragmentStatus::Pending)?;
                error!(
                    "[传输{}][工作线程#{}] 区间 {}-{} 失败: {}",
                    self.inner.id, worker_id, fragment.start, fragment.end, e
                );
                self.inner.emit(DownloadEventKind::WorkerFailed {
                    worker_id,
                    message: e.to_string(),
                });

                if e.aborts_transfer() {
                    return Err(e);
                }

                *consecutive_failures += 1;
                if *consecutive_failures >= options.max_consecutive_range_failures {
                    error!(
                        "[传输{}] 连续 {} 个区间失败，终止传输",
                        self.inner.id, consecutive_failures
                    );
                    return Err(e);
                }

                self.inner.emit(DownloadEventKind::Error {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                    fatal: false,
                });
                if let Some(cb) = &options.callbacks.on_error {
                    cb(&e);
                }
                Ok(())
            }
        }
    }

    async fn restart_workers(
        &self,
        join_set: &mut JoinSet<WorkerOutcome>,
        consecutive_failures: &mut u32,
        options: &DownloaderOptions,
        report: SlowdownReport,
    ) -> DownloadResult<()> {
        let reason = DownloadError::SpeedThreshold {
            speed: report.speed,
            threshold: report.threshold,
        }
        .to_string();
        warn!("[传输{}] 自动重启工作线程: {}", self.inner.id, reason);

        self.inner.workers.restart().await?;
        while let Some(joined) = join_set.join_next().await {
            self.handle_worker_result(joined, consecutive_failures, options)?;
        }
        self.inner
            .ranges
            .lock()
            .change_all(FragmentStatus::Reserved, FragmentStatus::Pending);

        {
            let mut progress = self.inner.progress.lock();
            progress.reset_speed_tracker();
            progress.mark_workers_restarted();
        }
        self.inner
            .emit(DownloadEventKind::WorkerRestarted { reason });
        Ok(())
    }

    fn report_progress_if_due(&self, options: &DownloaderOptions) {
        let bytes_since_last = {
            let mut progress = self.inner.progress.lock();
            if !progress.should_update_progress() {
                return;
            }
            progress.take_bytes_since_last_progress()
        };

        let progress = self.inner.snapshot();
        if let Some(cb) = &options.callbacks.on_progress {
            cb(&progress);
        }
        self.inner.emit(DownloadEventKind::Progress {
            progress,
            bytes_since_last,
        });
    }

    fn finish_completed(&self, options: &DownloaderOptions) {
        let total_bytes = self.inner.ranges.lock().total_tracked();
        let active = *self.inner.active_time.lock();
        let secs = active.as_secs_f64().max(0.001);
        let average_speed = total_bytes as f64 / secs;

        self.set_state_unless_disposed(CoordinatorState::Completed);
        info!(
            "[传输{}] 下载完成: {:?}, {} 字节, 用时 {:.1}s, 平均 {:.2} KB/s",
            self.inner.id,
            options.save_as,
            total_bytes,
            active.as_secs_f64(),
            average_speed / 1024.0
        );

        let progress = self.inner.snapshot();
        if let Some(cb) = &options.callbacks.on_complete {
            cb(&progress);
        }
        self.inner.emit(DownloadEventKind::Completed {
            total_bytes,
            duration_ms: active.as_millis() as u64,
            average_speed,
        });
    }

    async fn fail(&self, err: DownloadError, setup: &Setup) -> DownloadError {
        error!("[传输{}] 传输失败: {}", self.inner.id, err);
        self.set_state_unless_disposed(CoordinatorState::Error);
        self.persist_resume_data(setup).await;

        self.inner.emit(DownloadEventKind::Error {
            message: err.to_string(),
            retryable: err.is_retryable(),
            fatal: true,
        });
        if let Some(cb) = &setup.options.callbacks.on_error {
            cb(&err);
        }
        err
    }

    async fn persist_resume_data(&self, setup: &Setup) {
        let data = {
            let mut ranges = self.inner.ranges.lock().clone();
            ranges.change_all(FragmentStatus::Reserved, FragmentStatus::Pending);
            ranges.to_save_data()
        };
        if let Err(e) = setup.file_manager.save_resume_data(&data).await {
            warn!("[传输{}] 保存续传数据失败: {}", self.inner.id, e);
        }
    }

    fn set_state_unless_disposed(&self, next: CoordinatorState) {
        let mut state = self.inner.state.lock();
        if *state != CoordinatorState::Disposed {
            *state = next;
        }
    }
}

impl Inner {
    fn stop_requested(&self) -> bool {
        self.paused.load(Ordering::SeqCst) || self.cancelled.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> DownloadProgress {
        let workers = self.workers.stats();
        let ranges = self.ranges.lock();
        self.progress.lock().get_progress(&ranges, &workers)
    }

    fn emit(&self, kind: DownloadEventKind) {
        let event = DownloadEvent::new(self.id.clone(), kind);
        self.listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    async fn sleep_or_wake(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }

    /// 下载单个区间，可重试错误在本地退避重试，最多尝试 `max_retries + 1` 次
    async fn download_with_retry(
        &self,
        worker_id: u64,
        fragment: Fragment,
        options: &DownloaderOptions,
        file: &WritableFile,
        token: &CancellationToken,
    ) -> DownloadResult<u64> {
        let on_progress = |bytes: u64| {
            let _ = self.workers.update_worker_stats(worker_id, bytes);
            self.progress.lock().update(bytes);
        };

        let mut retry_count = 0u32;
        loop {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let err = match self
                .transport
                .download_range(fragment, &options.url, file, token, &on_progress)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(e) => e,
            };

            if err.is_cancelled() || !err.is_retryable() {
                return Err(err);
            }
            if retry_count >= options.max_retries {
                return Err(DownloadError::Worker {
                    worker_id,
                    retry_count,
                    message: err.to_string(),
                });
            }

            self.workers.record_retry(worker_id);
            let delay = self.transport.calculate_retry_delay(
                retry_count,
                options.initial_retry_delay,
                options.max_retry_delay,
            );
            retry_count += 1;
            warn!(
                "[传输{}][工作线程#{}] 区间 {}-{} 第 {}/{} 次重试，{}ms 后开始: {}",
                self.id,
                worker_id,
                fragment.start,
                fragment.end,
                retry_count,
                options.max_retries,
                delay.as_millis(),
                err
            );

            if err.is_network_related() {
                self.wait_for_connectivity(options, token).await?;
            }
            tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn wait_for_connectivity(&self, options: &DownloaderOptions, token: &CancellationToken) -> DownloadResult<()> {
        while !self.transport.check_connectivity().await {
            debug!("[传输{}] 等待网络恢复", self.id);
            tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(options.offline_wait) => {}
            }
        }
        Ok(())
    }
}
