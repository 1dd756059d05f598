//! 测试用的内存传输实现

use crate::downloader::error::{DownloadError, DownloadResult};
use crate::downloader::file_manager::WritableFile;
use crate::downloader::network::{ProgressFn, Transport};
use crate::downloader::ranges::Fragment;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 从内存 body 提供区间数据的传输
pub struct MockTransport {
    pub body: Vec<u8>,
    /// 前 N 次下载尝试失败
    pub fail_first: u32,
    /// 失败时返回的 HTTP 状态（None 表示连接错误）
    pub fail_status: Option<u16>,
    /// 为 true 时下载一直挂起直到被取消
    pub block: AtomicBool,
    pub attempts: AtomicU32,
    pub size_probe: Option<u64>,
    /// 连通性探测结果
    pub online: AtomicBool,
    /// 下载失败时同时把网络置为离线
    pub offline_on_failure: AtomicBool,
}

impl MockTransport {
    pub fn new(body: Vec<u8>) -> Self {
        let size = body.len() as u64;
        Self {
            body,
            fail_first: 0,
            fail_status: None,
            block: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            size_probe: Some(size),
            online: AtomicBool::new(true),
            offline_on_failure: AtomicBool::new(false),
        }
    }

    pub fn failing(body: Vec<u8>, fail_first: u32, fail_status: Option<u16>) -> Self {
        Self {
            fail_first,
            fail_status,
            ..Self::new(body)
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get_file_size(&self, _url: &str) -> DownloadResult<Option<u64>> {
        Ok(self.size_probe)
    }

    async fn check_connectivity(&self) -> bool {
        self.is_online()
    }

    async fn download_range(
        &self,
        range: Fragment,
        url: &str,
        file: &WritableFile,
        cancel: &CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> DownloadResult<u64> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if self.block.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(DownloadError::Cancelled);
        }
        if attempt <= self.fail_first {
            if self.offline_on_failure.load(Ordering::SeqCst) {
                self.set_online(false);
            }
            return Err(DownloadError::Network {
                message: format!("模拟失败 #{}", attempt),
                status: self.fail_status,
                url: Some(url.to_string()),
            });
        }

        let start = range.start as usize;
        let end = range.end as usize;
        file.write_at(range.start, &self.body[start..=end]).await?;
        on_progress(range.len());
        Ok(range.len())
    }

    fn calculate_retry_delay(&self, _retry_count: u32, _initial: Duration, _max: Duration) -> Duration {
        Duration::from_millis(1)
    }
}

pub fn sample_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
