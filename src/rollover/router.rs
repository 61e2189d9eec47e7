use std::sync::Arc;

use crate::cluster::ClusterManager;
use crate::core::{IndexKind, ResourceRepr, ShardGroup};
use crate::error::{KvError, RolloverError};
use crate::meta;
use crate::meta::rollover::RolloverState;
use crate::storage::{Driver, Txn};

/// 写路径应写入的分片组：活跃组，加上迁移中（Indexing/Cutover）的目标组
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteTargets {
    pub active: Option<ShardGroup>,
    pub rollover: Option<ShardGroup>,
}

impl WriteTargets {
    pub fn groups(&self) -> impl Iterator<Item = &ShardGroup> {
        self.active.iter().chain(self.rollover.iter())
    }

    pub fn is_dual_write(&self) -> bool {
        self.rollover.is_some()
    }
}

pub async fn write_targets(
    txn: &mut Txn,
    kbid: &str,
    kind: IndexKind,
) -> Result<WriteTargets, KvError> {
    let active = meta::shards::get_active(txn, kbid, kind).await?;
    let rollover = meta::rollover::get(txn, kbid, kind)
        .await?
        .filter(|s| matches!(s.state, RolloverState::Indexing | RolloverState::Cutover))
        .and_then(|s| s.target_group);
    Ok(WriteTargets { active, rollover })
}

/// 外部写路径的入口：按当前拓扑把资源写入（或删出）所有目标组
pub struct ShardRouter {
    driver: Arc<dyn Driver>,
    cluster: Arc<ClusterManager>,
}

impl ShardRouter {
    pub fn new(driver: Arc<dyn Driver>, cluster: Arc<ClusterManager>) -> Self {
        Self { driver, cluster }
    }

    pub async fn targets(&self, kbid: &str, kind: IndexKind) -> Result<WriteTargets, KvError> {
        let mut txn = self.driver.begin(true).await?;
        let targets = write_targets(&mut txn, kbid, kind).await?;
        txn.commit().await?;
        Ok(targets)
    }

    /// 返回写入的分片组数
    pub async fn index_resource(
        &self,
        kbid: &str,
        kind: IndexKind,
        resource: &ResourceRepr,
    ) -> Result<usize, RolloverError> {
        let targets = self.targets(kbid, kind).await?;
        let mut written = 0;
        for group in targets.groups() {
            self.cluster.index_resource(group, resource).await?;
            written += 1;
        }
        if written == 0 {
            tracing::debug!("No shard group for kb={} kind={}, write dropped", kbid, kind);
        }
        Ok(written)
    }

    pub async fn delete_resource(
        &self,
        kbid: &str,
        kind: IndexKind,
        rid: &str,
    ) -> Result<usize, RolloverError> {
        let targets = self.targets(kbid, kind).await?;
        let mut written = 0;
        for group in targets.groups() {
            self.cluster.delete_resource(group, rid).await?;
            written += 1;
        }
        Ok(written)
    }
}
