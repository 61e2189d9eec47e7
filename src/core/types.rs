use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type KbId = String;
pub type NodeId = String;
pub type ShardId = String;
pub type ResourceId = String;

/// 逻辑索引种类：同一个 KB 每种索引各有一个活跃 ShardGroup
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Paragraphs,
    Vectors,
    Texts,
    Relations,
}

impl IndexKind {
    pub const ALL: [IndexKind; 4] = [
        IndexKind::Paragraphs,
        IndexKind::Vectors,
        IndexKind::Texts,
        IndexKind::Relations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Paragraphs => "paragraphs",
            IndexKind::Vectors => "vectors",
            IndexKind::Texts => "texts",
            IndexKind::Relations => "relations",
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IndexKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown index kind: {s}"))
    }
}

/// 单个副本：replica 序号 -> 所在节点 -> 远端 shard
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReplica {
    pub replica: u32,
    pub node: NodeId,
    pub shard: ShardId,
}

/// 服务某个 (KB, kind) 的完整副本集
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardGroup {
    pub id: String,
    pub kbid: KbId,
    pub kind: IndexKind,
    pub replicas: Vec<ShardReplica>,
    pub created_at: DateTime<Utc>,
}

impl ShardGroup {
    pub fn new(kbid: &str, kind: IndexKind, mut replicas: Vec<ShardReplica>) -> Self {
        replicas.sort_by_key(|r| r.replica);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kbid: kbid.to_string(),
            kind,
            replicas,
            created_at: Utc::now(),
        }
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.replicas.iter().map(|r| r.node.clone()).collect()
    }
}

/// 送往索引引擎的可索引表示（由资源存储产出，内容对控制面不透明）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceRepr {
    pub rid: ResourceId,
    pub body: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_kind_parses_its_display_form() {
        for kind in IndexKind::ALL {
            assert_eq!(kind.to_string().parse::<IndexKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<IndexKind>().is_err());
    }

    #[test]
    fn shard_group_orders_replicas() {
        let g = ShardGroup::new(
            "kb",
            IndexKind::Texts,
            vec![
                ShardReplica { replica: 1, node: "b".into(), shard: "s1".into() },
                ShardReplica { replica: 0, node: "a".into(), shard: "s0".into() },
            ],
        );
        assert_eq!(g.nodes(), vec!["a".to_string(), "b".to_string()]);
    }
}
