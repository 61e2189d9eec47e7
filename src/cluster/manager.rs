use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cluster::{ConnectionCache, IndexNode, NodeRegistry, PendingOps};
use crate::config::ClusterSettings;
use crate::core::{IndexKind, NodeId, ResourceRepr, ShardGroup, ShardReplica};
use crate::engine::{IndexEngine, IndexEngineConnector, ShardConfig, ShardStats};
use crate::error::ClusterError;

/// 新建 shard 的索引格式版本
pub const SHARD_FORMAT_VERSION: u32 = 2;

/// 分片组的创建、删除与写入。
///
/// 节点登记表由外部注入（可与其他组件共享）；连接缓存与在途限流属于本管理器。
pub struct ClusterManager {
    registry: Arc<NodeRegistry>,
    connections: ConnectionCache,
    pending: PendingOps,
    settings: ClusterSettings,
}

impl ClusterManager {
    pub fn new(
        registry: Arc<NodeRegistry>,
        connector: Arc<dyn IndexEngineConnector>,
        settings: ClusterSettings,
    ) -> Self {
        Self {
            registry,
            connections: ConnectionCache::new(connector),
            pending: PendingOps::new(settings.max_pending_per_node),
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn pending(&self) -> &PendingOps {
        &self.pending
    }

    /// 负载最低的 `replicas` 个不同节点
    pub fn select_replica_nodes(&self, replicas: usize) -> Result<Vec<NodeId>, ClusterError> {
        self.select_replica_nodes_avoiding(replicas, &HashSet::new())
    }

    /// 同上，但排除 `avoid` 中的节点。节点不足时整体失败，不返回部分结果。
    pub fn select_replica_nodes_avoiding(
        &self,
        replicas: usize,
        avoid: &HashSet<NodeId>,
    ) -> Result<Vec<NodeId>, ClusterError> {
        let mut candidates: Vec<IndexNode> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|n| !avoid.contains(&n.id))
            .collect();
        if candidates.len() < replicas {
            return Err(ClusterError::TooSmall {
                required: replicas,
                available: candidates.len(),
            });
        }
        candidates.sort_by(|a, b| {
            a.load_score
                .total_cmp(&b.load_score)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(candidates.into_iter().take(replicas).map(|n| n.id).collect())
    }

    pub async fn engine(&self, node: &str) -> Result<Arc<dyn IndexEngine>, ClusterError> {
        let info = self
            .registry
            .get(node)
            .ok_or_else(|| ClusterError::UnknownNode(node.to_string()))?;
        Ok(self.connections.get(&info.address).await?)
    }

    /// 在 `replicas` 个节点上各建一个 shard，返回新的分片组（尚未持久化）。
    /// 任一副本失败时删除已建好的 shard 并返回错误。
    pub async fn create_shard_group(
        &self,
        kbid: &str,
        kind: IndexKind,
        avoid: &HashSet<NodeId>,
    ) -> Result<ShardGroup, ClusterError> {
        let nodes = self.select_replica_nodes_avoiding(self.settings.replicas, avoid)?;
        let mut created: Vec<ShardReplica> = Vec::with_capacity(nodes.len());
        for (replica, node) in nodes.into_iter().enumerate() {
            let config = ShardConfig {
                kbid: kbid.to_string(),
                kind,
                replica: replica as u32,
                format_version: SHARD_FORMAT_VERSION,
            };
            let res = async {
                let engine = self.engine(&node).await?;
                Ok::<_, ClusterError>(engine.create_shard(&config).await?)
            }
            .await;
            match res {
                Ok(shard) => {
                    self.registry.bump_shard_count(&node, 1);
                    created.push(ShardReplica {
                        replica: replica as u32,
                        node,
                        shard,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Shard creation failed on node {} for kb={} kind={}: {}",
                        node,
                        kbid,
                        kind,
                        e
                    );
                    let partial = ShardGroup::new(kbid, kind, created);
                    self.delete_shard_group(&partial).await;
                    return Err(e);
                }
            }
        }
        let group = ShardGroup::new(kbid, kind, created);
        tracing::info!(
            "Shard group created: kb={} kind={} group={} nodes={:?}",
            kbid,
            kind,
            group.id,
            group.nodes()
        );
        Ok(group)
    }

    /// 尽力删除组内所有 shard；返回删除失败（遗留在节点上）的 shard id
    pub async fn delete_shard_group(&self, group: &ShardGroup) -> Vec<String> {
        let mut orphans = Vec::new();
        for r in &group.replicas {
            let res = async {
                let engine = self.engine(&r.node).await?;
                Ok::<_, ClusterError>(engine.delete_shard(&r.shard).await?)
            }
            .await;
            match res {
                Ok(()) => self.registry.bump_shard_count(&r.node, -1),
                Err(e) => {
                    tracing::error!(
                        "Orphaned shard {} on node {} (kb={} kind={}): {}",
                        r.shard,
                        r.node,
                        group.kbid,
                        group.kind,
                        e
                    );
                    orphans.push(r.shard.clone());
                }
            }
        }
        orphans
    }

    /// 写入组内每个副本；每次请求持有对应节点的在途 permit
    pub async fn index_resource(
        &self,
        group: &ShardGroup,
        resource: &ResourceRepr,
    ) -> Result<(), ClusterError> {
        for r in &group.replicas {
            let _permit = self.pending.acquire(&r.node).await?;
            let engine = self.engine(&r.node).await?;
            engine.index_resource(&r.shard, resource).await?;
        }
        Ok(())
    }

    pub async fn delete_resource(&self, group: &ShardGroup, rid: &str) -> Result<(), ClusterError> {
        for r in &group.replicas {
            let _permit = self.pending.acquire(&r.node).await?;
            let engine = self.engine(&r.node).await?;
            engine.delete_resource(&r.shard, rid).await?;
        }
        Ok(())
    }

    pub async fn shard_stats(&self, replica: &ShardReplica) -> Result<ShardStats, ClusterError> {
        let engine = self.engine(&replica.node).await?;
        Ok(engine.shard_stats(&replica.shard).await?)
    }

    /// 按配置的超时移除失联节点，并丢弃它们的缓存连接
    pub fn expire_nodes(&self) -> Vec<IndexNode> {
        let expired = self
            .registry
            .expire(Instant::now(), self.settings.node_timeout());
        for n in &expired {
            self.connections.evict(&n.address);
        }
        expired
    }

    /// 后台每隔节点超时的一半执行一次 `expire_nodes`；管理器释放后任务自行退出
    pub fn spawn_expiry(self: &Arc<Self>) -> JoinHandle<()> {
        let every = (self.settings.node_timeout() / 2).max(Duration::from_millis(100));
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let expired = manager.expire_nodes();
                if !expired.is_empty() {
                    tracing::info!(
                        "Node expiry removed {} nodes, {} online",
                        expired.len(),
                        manager.registry.len()
                    );
                }
            }
        })
    }

    pub fn clear_connections(&self) {
        self.connections.clear();
    }

    pub fn cached_connections(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryConnector;

    fn cluster(loads: &[(&str, f64)], replicas: usize) -> (ClusterManager, Arc<MemoryConnector>) {
        let registry = Arc::new(NodeRegistry::new());
        for (id, load) in loads {
            registry.announce(IndexNode::new(id, &format!("addr-{id}")).with_load(*load));
        }
        let connector = Arc::new(MemoryConnector::new());
        let settings = ClusterSettings {
            replicas,
            ..ClusterSettings::default()
        };
        (ClusterManager::new(registry, connector.clone(), settings), connector)
    }

    #[test]
    fn placement_prefers_lowest_load() {
        let (c, _) = cluster(&[("a", 3.0), ("b", 1.0), ("c", 2.0), ("d", 1.0)], 2);
        assert_eq!(c.select_replica_nodes(3).unwrap(), vec!["b", "d", "c"]);

        let avoid: HashSet<NodeId> = ["b".to_string()].into_iter().collect();
        assert_eq!(c.select_replica_nodes_avoiding(2, &avoid).unwrap(), vec!["d", "c"]);
    }

    #[test]
    fn placement_fails_without_partial_result() {
        let (c, _) = cluster(&[("a", 0.0), ("b", 0.0)], 2);
        match c.select_replica_nodes(3) {
            Err(ClusterError::TooSmall { required, available }) => {
                assert_eq!((required, available), (3, 2));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_replica_rolls_back_created_shards() {
        let (c, connector) = cluster(&[("a", 0.0), ("b", 1.0)], 2);
        connector.engine("addr-b").fail_creates(true);

        let res = c.create_shard_group("kb", IndexKind::Texts, &HashSet::new()).await;
        assert!(res.is_err());
        assert!(connector.engine("addr-a").shard_ids().is_empty());
        assert_eq!(c.registry().get("a").unwrap().shard_count, 0);
    }

    #[tokio::test]
    async fn index_writes_every_replica() {
        let (c, connector) = cluster(&[("a", 0.0), ("b", 1.0)], 2);
        let group = c
            .create_shard_group("kb", IndexKind::Paragraphs, &HashSet::new())
            .await
            .unwrap();
        let r = ResourceRepr { rid: "r1".into(), body: serde_json::json!({}) };
        c.index_resource(&group, &r).await.unwrap();

        for rep in &group.replicas {
            let engine = connector.engine(&format!("addr-{}", rep.node));
            assert_eq!(engine.resource_count(&rep.shard), Some(1));
        }
        assert_eq!(c.pending().in_flight("a"), 0);
    }

    #[tokio::test]
    async fn expired_node_loses_cached_connection() {
        let registry = Arc::new(NodeRegistry::new());
        registry.announce(IndexNode::new("a", "addr-a"));
        let settings = ClusterSettings {
            node_timeout_secs: 0,
            ..ClusterSettings::default()
        };
        let c = ClusterManager::new(registry, Arc::new(MemoryConnector::new()), settings);
        c.engine("a").await.unwrap();
        assert_eq!(c.cached_connections(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = c.expire_nodes();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "a");
        assert!(c.registry().get("a").is_none());
        assert_eq!(c.cached_connections(), 0);
        assert!(matches!(c.engine("a").await, Err(ClusterError::UnknownNode(_))));
    }

    #[tokio::test]
    async fn expiry_task_removes_silent_nodes() {
        let registry = Arc::new(NodeRegistry::new());
        registry.announce(IndexNode::new("a", "addr-a"));
        let settings = ClusterSettings {
            node_timeout_secs: 1,
            ..ClusterSettings::default()
        };
        let c = Arc::new(ClusterManager::new(
            registry.clone(),
            Arc::new(MemoryConnector::new()),
            settings,
        ));
        let task = c.spawn_expiry();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(registry.get("a").is_some());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(registry.is_empty());

        // 管理器释放后任务退出
        drop(c);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_node_is_reported_as_orphan() {
        let (c, _) = cluster(&[("a", 0.0)], 1);
        let group = ShardGroup::new(
            "kb",
            IndexKind::Vectors,
            vec![ShardReplica { replica: 0, node: "gone".into(), shard: "s".into() }],
        );
        assert_eq!(c.delete_shard_group(&group).await, vec!["s".to_string()]);
    }
}
