//! 索引引擎边界：控制面只通过这些 trait 与索引节点交互。

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{IndexKind, KbId, ResourceRepr, ShardId};

/// 新建 shard 时下发给索引节点的参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub kbid: KbId,
    pub kind: IndexKind,
    pub replica: u32,
    pub format_version: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardStats {
    pub resource_count: u64,
}

/// 单个索引节点的客户端
#[async_trait]
pub trait IndexEngine: Send + Sync {
    async fn create_shard(&self, config: &ShardConfig) -> anyhow::Result<ShardId>;
    /// 同一资源重复索引是覆盖（幂等）
    async fn index_resource(&self, shard: &ShardId, resource: &ResourceRepr) -> anyhow::Result<()>;
    async fn delete_resource(&self, shard: &ShardId, rid: &str) -> anyhow::Result<()>;
    async fn delete_shard(&self, shard: &ShardId) -> anyhow::Result<()>;
    async fn shard_stats(&self, shard: &ShardId) -> anyhow::Result<ShardStats>;
}

/// 按节点地址建立引擎客户端
#[async_trait]
pub trait IndexEngineConnector: Send + Sync {
    async fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn IndexEngine>>;
}
