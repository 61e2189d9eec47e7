use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::core::{ResourceId, ResourceRepr, ShardId};
use crate::engine::{IndexEngine, IndexEngineConnector, ShardConfig, ShardStats};

const NO_STALL: usize = usize::MAX;

/// 进程内索引引擎：单机部署与测试使用。
///
/// 带两个故障注入开关：`fail_creates` 让 create_shard 失败；
/// `stall_index_after(n)` 让第 n 次之后的 index_resource 永远挂起（模拟进程在索引中途被杀）。
pub struct MemoryEngine {
    address: String,
    shards: DashMap<ShardId, BTreeMap<ResourceId, ResourceRepr>>,
    next_shard: AtomicU64,
    index_calls: AtomicUsize,
    fail_creates: AtomicBool,
    stall_after: AtomicUsize,
}

impl MemoryEngine {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            shards: DashMap::new(),
            next_shard: AtomicU64::new(1),
            index_calls: AtomicUsize::new(0),
            fail_creates: AtomicBool::new(false),
            stall_after: AtomicUsize::new(NO_STALL),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.shards.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn resource_count(&self, shard: &str) -> Option<usize> {
        self.shards.get(shard).map(|s| s.len())
    }

    pub fn contains(&self, shard: &str, rid: &str) -> bool {
        self.shards.get(shard).map_or(false, |s| s.contains_key(rid))
    }

    pub fn index_calls(&self) -> usize {
        self.index_calls.load(Ordering::Relaxed)
    }

    pub fn fail_creates(&self, on: bool) {
        self.fail_creates.store(on, Ordering::Relaxed);
    }

    /// 之后的第 `n + 1` 次 index_resource 起永久挂起
    pub fn stall_index_after(&self, n: usize) {
        let base = self.index_calls();
        self.stall_after.store(base + n, Ordering::Relaxed);
    }

    pub fn clear_faults(&self) {
        self.fail_creates.store(false, Ordering::Relaxed);
        self.stall_after.store(NO_STALL, Ordering::Relaxed);
    }
}

#[async_trait]
impl IndexEngine for MemoryEngine {
    async fn create_shard(&self, config: &ShardConfig) -> anyhow::Result<ShardId> {
        if self.fail_creates.load(Ordering::Relaxed) {
            anyhow::bail!("node {} refused shard creation", self.address);
        }
        let n = self.next_shard.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}-{}-{}", self.address, config.kbid, config.kind, n);
        self.shards.insert(id.clone(), BTreeMap::new());
        tracing::debug!("Shard created: {} (replica {})", id, config.replica);
        Ok(id)
    }

    async fn index_resource(&self, shard: &ShardId, resource: &ResourceRepr) -> anyhow::Result<()> {
        let calls = self.index_calls.load(Ordering::Relaxed);
        if calls >= self.stall_after.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        self.index_calls.fetch_add(1, Ordering::Relaxed);
        let mut entry = self
            .shards
            .get_mut(shard)
            .ok_or_else(|| anyhow::anyhow!("shard {} not found on {}", shard, self.address))?;
        entry.insert(resource.rid.clone(), resource.clone());
        Ok(())
    }

    async fn delete_resource(&self, shard: &ShardId, rid: &str) -> anyhow::Result<()> {
        let mut entry = self
            .shards
            .get_mut(shard)
            .ok_or_else(|| anyhow::anyhow!("shard {} not found on {}", shard, self.address))?;
        entry.remove(rid);
        Ok(())
    }

    async fn delete_shard(&self, shard: &ShardId) -> anyhow::Result<()> {
        // 删除不存在的 shard 视为成功，清理可重放
        self.shards.remove(shard);
        Ok(())
    }

    async fn shard_stats(&self, shard: &ShardId) -> anyhow::Result<ShardStats> {
        let entry = self
            .shards
            .get(shard)
            .ok_or_else(|| anyhow::anyhow!("shard {} not found on {}", shard, self.address))?;
        Ok(ShardStats {
            resource_count: entry.len() as u64,
        })
    }
}

/// 每个地址一个 `MemoryEngine`；测试可通过 `engine(address)` 直接检查节点内容
#[derive(Default)]
pub struct MemoryConnector {
    engines: DashMap<String, Arc<MemoryEngine>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(&self, address: &str) -> Arc<MemoryEngine> {
        self.engines
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(MemoryEngine::new(address)))
            .clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl IndexEngineConnector for MemoryConnector {
    async fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn IndexEngine>> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let engine: Arc<dyn IndexEngine> = self.engine(address);
        Ok(engine)
    }
}
