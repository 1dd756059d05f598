// Volume Downloader Library
// 分段并行 HTTP 下载引擎与多组下载调度

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 下载引擎模块
pub mod downloader;

// 下载调度模块
pub mod manager;

// 公共模块（速度异常检测）
pub mod common;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{
    CreateDownloadParams, DownloadCoordinator, DownloadError, DownloadEvent, DownloaderFactory, EventBus,
    NetworkManager, Ranges, TransferOutcome,
};
pub use manager::{DownloadManagerService, Group, Item, ManifestProvider, VolumeNode};
