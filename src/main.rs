use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use volume_downloader::{
    config::AppConfig,
    downloader::{BusEvent, DownloadEventKind},
    logging,
    manager::{BroadcastPublisher, Notification},
    CreateDownloadParams, DownloadManagerService, DownloaderFactory, EventBus, ManifestProvider,
    NetworkManager, TransferOutcome,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "分段并行 HTTP 下载器", long_about = None)]
struct Args {
    /// 配置文件路径，不存在时写入默认配置
    #[arg(short, long, default_value = "config/app.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 下载单个文件
    Get {
        url: String,
        save_as: PathBuf,
        /// 工作线程数，默认使用配置文件中的值
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// 按清单下载整个文件夹树
    Volume {
        /// JSON 清单文件
        manifest: PathBuf,
        save_root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load_or_default(&args.config).await;
    let _log_guard = logging::init_logging(&config.log);
    config.validate().context("配置无效")?;

    info!("🚀 volume-downloader v{} 启动", env!("CARGO_PKG_VERSION"));

    let transport = Arc::new(NetworkManager::new(config.network.clone())?);
    let bus = EventBus::default();
    let factory = Arc::new(DownloaderFactory::new(transport, config.download.clone()).with_event_bus(bus.clone()));

    match args.command {
        Command::Get { url, save_as, workers } => run_get(&factory, bus, url, save_as, workers).await,
        Command::Volume { manifest, save_root } => run_volume(&config, factory, manifest, save_root).await,
    }
}

async fn run_get(
    factory: &DownloaderFactory,
    bus: EventBus,
    url: String,
    save_as: PathBuf,
    workers: Option<usize>,
) -> Result<()> {
    let mut params = CreateDownloadParams::new(&url, &save_as, &url);
    params.resume = true;
    params.workers_count = workers;

    let coordinator = factory.create(params).await?;
    spawn_progress_logger(bus);

    let runner = coordinator.clone();
    let mut transfer = tokio::spawn(async move { runner.start().await });

    let joined = tokio::select! {
        joined = &mut transfer => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("收到中断信号，暂停下载并保存进度");
            coordinator.pause().await?;
            // 等待运行循环退出并写入续传数据
            transfer.await
        }
    };
    match joined.context("下载任务异常退出")?? {
        TransferOutcome::Completed => info!("✅ 已保存到 {:?}", save_as),
        outcome => info!("下载已停止 ({:?})，再次执行同一命令即可续传", outcome),
    }

    factory.dispose_all().await;
    Ok(())
}

async fn run_volume(
    config: &AppConfig,
    factory: Arc<DownloaderFactory>,
    manifest: PathBuf,
    save_root: PathBuf,
) -> Result<()> {
    let provider = Arc::new(ManifestProvider::load(&manifest).await?);
    let root_ids = provider.root_ids();

    let publisher = BroadcastPublisher::default();
    spawn_notification_logger(&publisher);

    let service = Arc::new(DownloadManagerService::new(
        provider,
        factory.clone(),
        Arc::new(publisher),
        &config.scheduler,
    ));
    for root_id in &root_ids {
        if let Err(e) = service.add_volume_by_id(root_id, &save_root).await {
            error!("加入下载队列失败: {}: {:#}", root_id, e);
        }
    }
    service.start().await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if service.all_groups_completed() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，暂停所有下载组");
                for group in service.get_groups() {
                    if let Err(e) = service.pause_group(&group.id).await {
                        warn!("暂停失败: {}: {:#}", group.id, e);
                    }
                }
                break;
            }
        }
    }

    let stats = service.get_stats();
    info!(
        "下载结束: 完成 {} 个文件, 失败 {} 个, 共 {} 字节",
        stats.completed_items, stats.error_items, stats.downloaded_bytes
    );
    factory.dispose_all().await;
    Ok(())
}

/// 只订阅全局作用域，避免同一事件打印两次
fn spawn_progress_logger(bus: EventBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let BusEvent { scope, event } = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if scope.is_some() {
                continue;
            }
            match &event.kind {
                DownloadEventKind::Progress { progress, .. } => info!(
                    "进度 {:.1}%  {}/{} 字节  {:.2} MB/s  {} 个工作线程",
                    progress.percentage().unwrap_or(0.0),
                    progress.downloaded_bytes,
                    progress.total_bytes.unwrap_or(0),
                    progress.speed / 1024.0 / 1024.0,
                    progress.workers.len()
                ),
                DownloadEventKind::Error { message, fatal, .. } => {
                    warn!("下载出错 (fatal={}): {}", fatal, message)
                }
                DownloadEventKind::WorkerRestarted { reason } => warn!("工作线程已重启: {}", reason),
                _ => {}
            }
        }
    });
}

fn spawn_notification_logger(publisher: &BroadcastPublisher) {
    let mut rx = publisher.subscribe();
    tokio::spawn(async move {
        loop {
            let notification = match rx.recv().await {
                Ok(notification) => notification,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match notification {
                Notification::ItemStatusChanged { item_id, status, .. } => {
                    info!("文件 {} -> {:?}", item_id, status)
                }
                Notification::GroupStatusChanged { group_id, status } => {
                    info!("下载组 {} -> {:?}", group_id, status)
                }
                _ => {}
            }
        }
    });
}
