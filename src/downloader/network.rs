//! 网络传输
//!
//! 单次 Range 请求下载、连通性探测、文件大小探测和重试延迟计算。
//! `Transport` trait 是协调器与 HTTP 实现之间的接缝。

use crate::config::NetworkConfig;
use crate::downloader::error::{DownloadError, DownloadResult};
use crate::downloader::file_manager::WritableFile;
use crate::downloader::ranges::Fragment;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use rand::Rng;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 每累积多少字节回调一次进度
const PROGRESS_REPORT_THRESHOLD: u64 = 256 * 1024;

/// 进度回调，参数为新写入的字节数
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// 网络传输接口
#[async_trait]
pub trait Transport: Send + Sync {
    /// HEAD 请求获取文件大小，未知时返回 None
    async fn get_file_size(&self, url: &str) -> DownloadResult<Option<u64>>;

    /// 连通性探测，从不返回错误
    async fn check_connectivity(&self) -> bool;

    /// 下载一个区间并写入文件对应偏移，返回写入的字节数
    async fn download_range(
        &self,
        range: Fragment,
        url: &str,
        file: &WritableFile,
        cancel: &CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> DownloadResult<u64>;

    /// 第 `retry_count` 次重试前的等待时间
    fn calculate_retry_delay(
        &self,
        retry_count: u32,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Duration;
}

/// 指数退避 + 抖动：`min(initial * 2^n, max) + [0, jitter_ms]`
pub fn exponential_backoff(
    retry_count: u32,
    initial_delay: Duration,
    max_delay: Duration,
    jitter_ms: u64,
) -> Duration {
    let factor = 2u32.saturating_pow(retry_count);
    let base = initial_delay.saturating_mul(factor).min(max_delay);
    let jitter = if jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=jitter_ms)
    } else {
        0
    };
    base + Duration::from_millis(jitter)
}

/// 基于 reqwest 的网络管理器
#[derive(Debug)]
pub struct NetworkManager {
    client: Client,
    config: NetworkConfig,
    /// 最近一次 HEAD 响应是否声明支持 Range
    accept_ranges: RwLock<Option<bool>>,
}

impl NetworkManager {
    pub fn new(config: NetworkConfig) -> DownloadResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| DownloadError::validation(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            config,
            accept_ranges: RwLock::new(None),
        })
    }

    /// 服务器是否支持 Range（未探测时为 None）
    pub fn supports_ranges(&self) -> Option<bool> {
        *self.accept_ranges.read()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// 校验实际字节数与期望值的偏差是否在容差内
    fn within_tolerance(&self, expected: u64, actual: u64) -> bool {
        let diff = expected.abs_diff(actual) as f64;
        diff <= expected as f64 * self.config.size_tolerance_percent / 100.0
    }

    async fn next_chunk<S, B>(
        &self,
        stream: &mut S,
        cancel: &CancellationToken,
        url: &str,
    ) -> DownloadResult<Option<B>>
    where
        S: futures::Stream<Item = reqwest::Result<B>> + Unpin,
    {
        let read_timeout = Duration::from_secs(self.config.read_timeout_secs);
        tokio::select! {
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            next = tokio::time::timeout(read_timeout, stream.next()) => match next {
                Err(_) => Err(DownloadError::Timeout {
                    message: format!("{} 秒内未收到数据", read_timeout.as_secs()),
                    url: Some(url.to_string()),
                }),
                Ok(None) => Ok(None),
                Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
                Ok(Some(Err(e))) => Err(DownloadError::from_reqwest(e, url)),
            },
        }
    }
}

#[async_trait]
impl Transport for NetworkManager {
    async fn get_file_size(&self, url: &str) -> DownloadResult<Option<u64>> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(e, url))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::Network {
                message: format!("HEAD 请求失败: {}", status),
                status: Some(status.as_u16()),
                url: Some(url.to_string()),
            });
        }

        let headers = resp.headers();
        if let Some(value) = headers.get(ACCEPT_RANGES).and_then(|v| v.to_str().ok()) {
            *self.accept_ranges.write() = Some(value.eq_ignore_ascii_case("bytes"));
        }

        // HEAD 响应没有 body，content_length() 为 0，需直接读取头部
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        debug!("文件大小探测: url={}, size={:?}", url, size);
        Ok(size)
    }

    async fn check_connectivity(&self) -> bool {
        let Some(probe_url) = self.config.probe_url.as_deref() else {
            return true;
        };
        let probe = self
            .client
            .head(probe_url)
            .timeout(Duration::from_secs(self.config.probe_timeout_secs))
            .send()
            .await;

        match probe {
            Ok(_) => true,
            Err(e) => {
                debug!("连通性探测失败: {}, 错误: {}", probe_url, e);
                false
            }
        }
    }

    async fn download_range(
        &self,
        range: Fragment,
        url: &str,
        file: &WritableFile,
        cancel: &CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> DownloadResult<u64> {
        let expected = range.len();
        let request = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={}-{}", range.start, range.end));

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            resp = request.send() => resp.map_err(|e| DownloadError::from_reqwest(e, url))?,
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::Network {
                message: format!("HTTP错误: {}", status),
                status: Some(status.as_u16()),
                url: Some(url.to_string()),
            });
        }
        if status != StatusCode::PARTIAL_CONTENT && range.start > 0 {
            return Err(DownloadError::Range {
                start: range.start,
                end: range.end,
                message: format!("服务器忽略了 Range 请求，返回 {}", status),
            });
        }

        let stream = resp.bytes_stream();
        futures::pin_mut!(stream);
        let mut written = 0u64;
        let mut pending_progress = 0u64;

        while let Some(chunk) = self.next_chunk(&mut stream, cancel, url).await? {
            // 服务器返回整个文件时只写入请求的区间
            let chunk: &[u8] = chunk.as_ref();
            let remaining = expected - written;
            let take = (chunk.len() as u64).min(remaining) as usize;
            if take == 0 {
                break;
            }

            file.write_at(range.start + written, &chunk[..take]).await?;
            written += take as u64;
            pending_progress += take as u64;

            if pending_progress >= PROGRESS_REPORT_THRESHOLD {
                on_progress(pending_progress);
                pending_progress = 0;
            }
            if written >= expected {
                break;
            }
        }

        if pending_progress > 0 {
            on_progress(pending_progress);
        }
        file.flush().await?;

        if !self.within_tolerance(expected, written) {
            warn!(
                "字节数不匹配: bytes={}-{}, 期望 {}, 实际 {}, url={}",
                range.start, range.end, expected, written, url
            );
            return Err(DownloadError::Network {
                message: format!("字节数不匹配: 期望 {}, 实际 {}", expected, written),
                status: Some(status.as_u16()),
                url: Some(url.to_string()),
            });
        }

        debug!(
            "区间下载完成: bytes={}-{}, 写入 {} 字节",
            range.start, range.end, written
        );
        Ok(written)
    }

    fn calculate_retry_delay(
        &self,
        retry_count: u32,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Duration {
        exponential_backoff(
            retry_count,
            initial_delay,
            max_delay,
            self.config.retry_jitter_ms,
        )
    }
}
