//! 远端存储提供方
//!
//! 调度器只依赖 `RemoteProvider`；限流重试由 `rate_limit_safe_call` 统一包装。

use crate::config::RateLimitConfig;
use crate::manager::types::{NodeKind, VolumeNode};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// 提供方错误
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 触发远端限流
    #[error("请求被限流: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// 远端 API 返回错误
    #[error("API 错误 (status={status:?}, code={code:?}): {message}")]
    Api {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("网络错误: {0}")]
    Network(String),

    #[error("对象不存在: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}

/// 远端存储接口
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// 获取文件夹树快照，根节点不存在时返回 None
    async fn get_volume(&self, root_id: &str) -> Result<Option<VolumeNode>, ProviderError>;

    /// 批量获取下载地址，顺序与 `ids` 一致
    async fn get_download_links(&self, ids: &[String]) -> Result<Vec<String>, ProviderError>;

    async fn delete_item(&self, id: &str) -> Result<(), ProviderError>;
}

/// 限流重试
///
/// 只有 `RateLimited` 会重试，其它错误立即返回。等待时间取服务端给出的
/// `retry_after` 和指数退避中的较大值，最多尝试 `max_attempts` 次。
pub async fn rate_limit_safe_call<T, F, Fut>(
    policy: &RateLimitConfig,
    operation: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(ProviderError::RateLimited {
                retry_after,
                message,
            }) if attempt < max_attempts => {
                let backoff = policy
                    .initial_delay()
                    .saturating_mul(1u32 << (attempt - 1).min(16))
                    .min(policy.max_delay());
                let delay = retry_after.map_or(backoff, |ra| ra.max(backoff));
                warn!(
                    "{} 被限流 (第 {}/{} 次): {}，{}ms 后重试",
                    operation,
                    attempt,
                    max_attempts,
                    message,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_rate_limited() {
                    warn!("{} 限流重试次数耗尽: {}", operation, e);
                }
                return Err(e);
            }
        }
    }
}

/// 基于本地 JSON 清单的提供方
///
/// 清单是一个或多个 `VolumeNode` 根节点，文件节点通过 `url` 字段给出下载地址。
pub struct ManifestProvider {
    roots: RwLock<Vec<VolumeNode>>,
    links: RwLock<HashMap<String, String>>,
}

impl ManifestProvider {
    pub fn new(roots: Vec<VolumeNode>) -> Self {
        let mut links = HashMap::new();
        for root in &roots {
            root.walk_files("", &mut |_: &str, node: &VolumeNode| {
                if let Some(url) = &node.url {
                    links.insert(node.id.clone(), url.clone());
                }
            });
        }
        Self {
            roots: RwLock::new(roots),
            links: RwLock::new(links),
        }
    }

    /// 从 JSON 文件加载，支持单个根节点或根节点数组
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("读取清单文件失败: {:?}", path))?;

        let roots: Vec<VolumeNode> = match serde_json::from_str::<Vec<VolumeNode>>(&content) {
            Ok(roots) => roots,
            Err(_) => vec![serde_json::from_str::<VolumeNode>(&content)
                .with_context(|| format!("解析清单文件失败: {:?}", path))?],
        };

        info!("已加载清单: {:?}, {} 个根节点", path, roots.len());
        Ok(Self::new(roots))
    }

    pub fn root_ids(&self) -> Vec<String> {
        self.roots.read().iter().map(|r| r.id.clone()).collect()
    }
}

fn remove_node(nodes: &mut Vec<VolumeNode>, id: &str) -> bool {
    if let Some(pos) = nodes.iter().position(|n| n.id == id) {
        nodes.remove(pos);
        return true;
    }
    nodes
        .iter_mut()
        .filter(|n| n.kind == NodeKind::Folder)
        .any(|n| remove_node(&mut n.children, id))
}

#[async_trait]
impl RemoteProvider for ManifestProvider {
    async fn get_volume(&self, root_id: &str) -> Result<Option<VolumeNode>, ProviderError> {
        Ok(self.roots.read().iter().find(|r| r.id == root_id).cloned())
    }

    async fn get_download_links(&self, ids: &[String]) -> Result<Vec<String>, ProviderError> {
        let links = self.links.read();
        ids.iter()
            .map(|id| {
                links
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ProviderError::NotFound(format!("清单中没有 {} 的下载地址", id)))
            })
            .collect()
    }

    async fn delete_item(&self, id: &str) -> Result<(), ProviderError> {
        // 清单是只读来源，这里只从内存中移除
        if !remove_node(&mut self.roots.write(), id) {
            return Err(ProviderError::NotFound(id.to_string()));
        }
        self.links.write().remove(id);
        info!("已从清单中移除: {}", id);
        Ok(())
    }
}
