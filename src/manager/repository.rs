//! 实体仓库
//!
//! 所有读操作返回副本，调用方修改后需通过 `update` 写回。

use crate::manager::types::{Group, Item};
use anyhow::{bail, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// 可存入仓库的实体
pub trait Entity: Clone + Send + Sync + 'static {
    fn key(&self) -> &str;
}

impl Entity for Group {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Entity for Item {
    fn key(&self) -> &str {
        &self.id
    }
}

/// 按唯一 key 存取实体
pub trait Repository<T: Entity>: Send + Sync {
    /// 新增，key 已存在时报错
    fn add(&self, entity: T) -> Result<()>;
    /// 覆盖已有实体，不存在时报错
    fn update(&self, entity: T) -> Result<()>;
    fn remove(&self, key: &str) -> Option<T>;
    fn find(&self, key: &str) -> Option<T>;
    fn filter(&self, predicate: &dyn Fn(&T) -> bool) -> Vec<T>;
    fn get_all(&self) -> Vec<T>;
}

/// 内存仓库，结果按插入顺序返回
pub struct InMemoryRepository<T: Entity> {
    entries: DashMap<String, (u64, T)>,
    next_seq: AtomicU64,
}

impl<T: Entity> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn collect(&self, predicate: &dyn Fn(&T) -> bool) -> Vec<T> {
        let mut found: Vec<(u64, T)> = self
            .entries
            .iter()
            .filter(|e| predicate(&e.value().1))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, entity)| entity).collect()
    }
}

impl<T: Entity> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Repository<T> for InMemoryRepository<T> {
    fn add(&self, entity: T) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(entity.key().to_string()) {
            Entry::Occupied(e) => bail!("实体已存在: {}", e.key()),
            Entry::Vacant(e) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                e.insert((seq, entity));
                Ok(())
            }
        }
    }

    fn update(&self, entity: T) -> Result<()> {
        match self.entries.get_mut(entity.key()) {
            Some(mut entry) => {
                entry.value_mut().1 = entity;
                Ok(())
            }
            None => bail!("实体不存在: {}", entity.key()),
        }
    }

    fn remove(&self, key: &str) -> Option<T> {
        self.entries.remove(key).map(|(_, (_, entity))| entity)
    }

    fn find(&self, key: &str) -> Option<T> {
        self.entries.get(key).map(|e| e.value().1.clone())
    }

    fn filter(&self, predicate: &dyn Fn(&T) -> bool) -> Vec<T> {
        self.collect(predicate)
    }

    fn get_all(&self) -> Vec<T> {
        self.collect(&|_| true)
    }
}
