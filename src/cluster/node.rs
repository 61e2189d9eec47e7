use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::core::NodeId;

#[derive(Clone, Debug)]
pub struct IndexNode {
    pub id: NodeId,
    pub address: String,
    pub shard_count: u64,
    pub load_score: f64,
    pub last_seen: Instant,
}

impl IndexNode {
    pub fn new(id: &str, address: &str) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            shard_count: 0,
            load_score: 0.0,
            last_seen: Instant::now(),
        }
    }

    pub fn with_load(mut self, load_score: f64) -> Self {
        self.load_score = load_score;
        self
    }
}

/// 在线索引节点登记表（临时成员关系，不持久化）。
///
/// 显式构造并注入 `ClusterManager`；放置逻辑只读取 `snapshot()`，
/// 因此 announce/expire 可以与放置并发进行。
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<NodeId, IndexNode>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增或刷新节点，并更新 last_seen
    pub fn announce(&self, mut node: IndexNode) {
        node.last_seen = Instant::now();
        match self.nodes.insert(node.id.clone(), node) {
            Some(_) => {}
            None => tracing::info!("Index node joined: {} nodes online", self.nodes.len()),
        }
    }

    pub fn remove(&self, id: &str) -> Option<IndexNode> {
        let removed = self.nodes.remove(id).map(|(_, n)| n);
        if removed.is_some() {
            tracing::info!("Index node removed: {}", id);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<IndexNode> {
        self.nodes.get(id).map(|n| n.clone())
    }

    /// 移除 `timeout` 内未再 announce 的节点，返回被移除的节点
    pub fn expire(&self, now: Instant, timeout: Duration) -> Vec<IndexNode> {
        let stale: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| now.saturating_duration_since(n.last_seen) > timeout)
            .map(|n| n.id.clone())
            .collect();
        let expired: Vec<IndexNode> = stale
            .iter()
            .filter_map(|id| self.nodes.remove(id).map(|(_, n)| n))
            .collect();
        for n in &expired {
            tracing::warn!("Index node expired: {} ({})", n.id, n.address);
        }
        expired
    }

    pub fn snapshot(&self) -> Vec<IndexNode> {
        self.nodes.iter().map(|n| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 放置成功后本地累加 shard 数；下一次 announce 会以节点上报为准
    pub fn bump_shard_count(&self, id: &str, delta: i64) {
        if let Some(mut n) = self.nodes.get_mut(id) {
            n.shard_count = n.shard_count.saturating_add_signed(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expire_drops_silent_nodes() {
        let reg = NodeRegistry::new();
        reg.announce(IndexNode::new("a", "addr-a"));
        reg.announce(IndexNode::new("b", "addr-b"));

        let later = Instant::now() + Duration::from_secs(31);
        let expired = reg.expire(later, Duration::from_secs(30));
        assert_eq!(expired.len(), 2);
        assert!(reg.is_empty());
    }

    #[test]
    fn announce_refreshes_existing_node() {
        let reg = NodeRegistry::new();
        reg.announce(IndexNode::new("a", "addr-a"));
        reg.announce(IndexNode::new("a", "addr-a").with_load(5.0));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("a").unwrap().load_score, 5.0);

        reg.bump_shard_count("a", 2);
        reg.bump_shard_count("a", -5);
        assert_eq!(reg.get("a").unwrap().shard_count, 0);
    }
}
