//! 下载引擎错误类型
//!
//! 每种错误都标记是否可重试，协调器据此决定本地重试还是终止整个传输

use std::path::PathBuf;
use thiserror::Error;

/// 下载引擎结果类型
pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// 资源耗尽的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Memory,
    Disk,
    FileHandles,
    WorkerSlots,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::FileHandles => "file_handles",
            ResourceKind::WorkerSlots => "worker_slots",
        };
        f.write_str(name)
    }
}

/// 下载引擎错误
#[derive(Debug, Error)]
pub enum DownloadError {
    /// 网络错误（连接重置、中断、DNS 失败、HTTP 状态异常等）
    #[error("网络错误: {message} (status={status:?}, url={url:?})")]
    Network {
        message: String,
        status: Option<u16>,
        url: Option<String>,
    },

    /// 请求超时（网络错误的子类）
    #[error("请求超时: {message} (url={url:?})")]
    Timeout { message: String, url: Option<String> },

    /// 文件系统错误
    #[error("文件系统错误: {message} ({path:?}): {source}")]
    FileSystem {
        message: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 参数或状态校验失败
    #[error("校验失败: {0}")]
    Validation(String),

    /// 工作线程在耗尽重试次数后失败
    #[error("工作线程 #{worker_id} 失败（已重试 {retry_count} 次）: {message}")]
    Worker {
        worker_id: u64,
        retry_count: u32,
        message: String,
    },

    /// 字节范围非法
    #[error("非法字节范围 {start}-{end}: {message}")]
    Range { start: u64, end: u64, message: String },

    /// 速度低于下限
    #[error("速度低于阈值: 当前 {speed} B/s, 阈值 {threshold} B/s")]
    SpeedThreshold { speed: u64, threshold: u64 },

    /// 资源耗尽（内存、磁盘、文件句柄、工作槽位）
    #[error("资源耗尽 ({resource}): {message}")]
    ResourceExhausted {
        resource: ResourceKind,
        message: String,
    },

    /// 被取消信号中断
    #[error("下载已取消")]
    Cancelled,
}

impl DownloadError {
    pub fn network(message: impl Into<String>) -> Self {
        DownloadError::Network {
            message: message.into(),
            status: None,
            url: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        DownloadError::Validation(message.into())
    }

    pub fn file_system(
        message: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        DownloadError::FileSystem {
            message: message.into(),
            path: path.into(),
            source,
        }
    }

    /// 从 reqwest 错误转换，超时单独归类
    pub fn from_reqwest(err: reqwest::Error, url: &str) -> Self {
        if err.is_timeout() {
            return DownloadError::Timeout {
                message: err.to_string(),
                url: Some(url.to_string()),
            };
        }
        DownloadError::Network {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
            url: Some(url.to_string()),
        }
    }

    /// 是否可重试
    ///
    /// 明确的 4xx 客户端错误（408/429 除外）重试也不会成功
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Network { status, .. } => match status {
                Some(code) if (400..500).contains(code) => *code == 408 || *code == 429,
                _ => true,
            },
            DownloadError::Timeout { .. }
            | DownloadError::Worker { .. }
            | DownloadError::Range { .. }
            | DownloadError::SpeedThreshold { .. } => true,
            DownloadError::FileSystem { .. }
            | DownloadError::Validation(_)
            | DownloadError::ResourceExhausted { .. }
            | DownloadError::Cancelled => false,
        }
    }

    /// 失败是否像是网络中断（重试前需要等待连通性恢复）
    pub fn is_network_related(&self) -> bool {
        matches!(
            self,
            DownloadError::Network { .. } | DownloadError::Timeout { .. }
        )
    }

    /// 是否必须立即终止整个传输
    pub fn aborts_transfer(&self) -> bool {
        matches!(
            self,
            DownloadError::FileSystem { .. }
                | DownloadError::Validation(_)
                | DownloadError::ResourceExhausted { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}
