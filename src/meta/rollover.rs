use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{IndexKind, KbId, ResourceId, ShardGroup};
use crate::error::KvError;
use crate::meta::{get_json, keys, scan_json, set_json};
use crate::storage::Txn;

/// 分片迁移状态机
///
/// ```text
/// NotStarted -> CreatingShards -> Indexing -> Cutover -> Cleanup -> Done
///                                                    \-> Failed
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloverState {
    NotStarted,
    CreatingShards,
    Indexing,
    Cutover,
    Cleanup,
    Done,
    Failed,
}

impl RolloverState {
    pub fn in_progress(self) -> bool {
        matches!(
            self,
            RolloverState::CreatingShards
                | RolloverState::Indexing
                | RolloverState::Cutover
                | RolloverState::Cleanup
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RolloverState::Done | RolloverState::Failed)
    }
}

impl fmt::Display for RolloverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RolloverState::NotStarted => "not_started",
            RolloverState::CreatingShards => "creating_shards",
            RolloverState::Indexing => "indexing",
            RolloverState::Cutover => "cutover",
            RolloverState::Cleanup => "cleanup",
            RolloverState::Done => "done",
            RolloverState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// `/kbs/{kbid}/rollover/{kind}` 上持久化的迁移进度
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RolloverStatus {
    pub kbid: KbId,
    pub kind: IndexKind,
    pub state: RolloverState,
    /// 最后一个已重建索引的资源 id
    pub cursor: Option<ResourceId>,
    pub indexed: u64,
    pub target_group: Option<ShardGroup>,
    pub previous_group: Option<ShardGroup>,
    /// 清理阶段删除失败、遗留在节点上的 shard
    #[serde(default)]
    pub orphaned_shards: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl RolloverStatus {
    pub fn new(kbid: &str, kind: IndexKind) -> Self {
        let now = Utc::now();
        Self {
            kbid: kbid.to_string(),
            kind,
            state: RolloverState::CreatingShards,
            cursor: None,
            indexed: 0,
            target_group: None,
            previous_group: None,
            orphaned_shards: Vec::new(),
            started_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn advance(&mut self, state: RolloverState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

pub async fn get(
    txn: &mut Txn,
    kbid: &str,
    kind: IndexKind,
) -> Result<Option<RolloverStatus>, KvError> {
    get_json(txn, &keys::rollover(kbid, kind)).await
}

pub async fn set(txn: &mut Txn, status: &RolloverStatus) -> Result<(), KvError> {
    set_json(txn, &keys::rollover(&status.kbid, status.kind), status).await
}

pub async fn list(txn: &mut Txn, kbid: &str) -> Result<Vec<RolloverStatus>, KvError> {
    Ok(scan_json(txn, &keys::rollover_prefix(kbid))
        .await?
        .into_iter()
        .map(|(_, s)| s)
        .collect())
}
