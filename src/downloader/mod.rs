//! 下载引擎
//!
//! 区间追踪、工作线程池、单文件传输协调器以及它们依赖的网络和文件抽象。

pub mod coordinator;
pub mod error;
pub mod events;
pub mod factory;
pub mod file_manager;
pub mod network;
pub mod options;
pub mod progress;
pub mod ranges;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{CoordinatorState, DownloadCoordinator, TransferOutcome};
pub use error::{DownloadError, DownloadResult, ResourceKind};
pub use events::{BusEvent, DownloadEvent, DownloadEventKind, EventBus};
pub use factory::{CreateDownloadParams, DownloaderFactory};
pub use file_manager::{FileManager, WritableFile};
pub use network::{NetworkManager, Transport};
pub use options::{CompleteCallback, DownloadCallbacks, DownloaderOptions, ErrorCallback, ProgressCallback};
pub use progress::{DownloadProgress, ProgressTracker, SpeedTracker};
pub use ranges::{Fragment, FragmentStatus, Ranges, RangesSaveData};
pub use worker_pool::{WorkerManager, WorkerStats};
