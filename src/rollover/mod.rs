//! KB 分片迁移（rollover）编排。
//!
//! 状态机每推进一步都先落盘再继续，进程重启后 `resume` 从记录的步骤接着做，
//! 不会从头重放。同一 (kbid, kind) 的并发由持久化状态的读-检查-写事务串行化。

pub mod router;

use std::collections::HashSet;
use std::sync::Arc;

use crate::cluster::ClusterManager;
use crate::config::RolloverSettings;
use crate::core::{IndexKind, NodeId, ShardGroup};
use crate::error::{KvError, RolloverError};
use crate::meta;
use crate::meta::rollover::{RolloverState, RolloverStatus};
use crate::resources::ResourceStore;
use crate::storage::Driver;

pub use router::{ShardRouter, WriteTargets};

pub struct RolloverOrchestrator {
    driver: Arc<dyn Driver>,
    cluster: Arc<ClusterManager>,
    resources: Arc<dyn ResourceStore>,
    settings: RolloverSettings,
}

impl RolloverOrchestrator {
    pub fn new(
        driver: Arc<dyn Driver>,
        cluster: Arc<ClusterManager>,
        resources: Arc<dyn ResourceStore>,
        settings: RolloverSettings,
    ) -> Self {
        Self {
            driver,
            cluster,
            resources,
            settings,
        }
    }

    pub async fn status(
        &self,
        kbid: &str,
        kind: IndexKind,
    ) -> Result<Option<RolloverStatus>, RolloverError> {
        let mut txn = self.driver.begin(true).await?;
        let status = meta::rollover::get(&mut txn, kbid, kind).await?;
        txn.commit().await?;
        Ok(status)
    }

    /// 登记一次新的 rollover（CreatingShards）。已有未结束的 rollover，
    /// 或并发启动时提交冲突落败，均返回 `InProgress`。
    pub async fn start(&self, kbid: &str, kind: IndexKind) -> Result<RolloverStatus, RolloverError> {
        let mut txn = self.driver.begin(false).await?;
        if !meta::kb::exists(&mut txn, kbid).await? {
            return Err(RolloverError::KbNotFound(kbid.to_string()));
        }
        if let Some(current) = meta::rollover::get(&mut txn, kbid, kind).await? {
            if current.state.in_progress() {
                tracing::warn!(
                    "Rollover rejected, already {}: kb={} kind={}",
                    current.state,
                    kbid,
                    kind
                );
                return Err(RolloverError::InProgress {
                    kbid: kbid.to_string(),
                    kind,
                });
            }
        }
        let status = RolloverStatus::new(kbid, kind);
        meta::rollover::set(&mut txn, &status).await?;
        match txn.commit().await {
            Ok(()) => {}
            Err(KvError::Conflict(_)) => {
                tracing::warn!("Rollover start lost a concurrent race: kb={} kind={}", kbid, kind);
                return Err(RolloverError::InProgress {
                    kbid: kbid.to_string(),
                    kind,
                });
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!("Rollover started: kb={} kind={}", kbid, kind);
        Ok(status)
    }

    /// start + 推进到终态
    pub async fn run(&self, kbid: &str, kind: IndexKind) -> Result<RolloverStatus, RolloverError> {
        let status = self.start(kbid, kind).await?;
        self.drive(status).await
    }

    /// 从持久化的步骤继续；已处于终态时直接返回该状态
    pub async fn resume(
        &self,
        kbid: &str,
        kind: IndexKind,
    ) -> Result<RolloverStatus, RolloverError> {
        let status = self
            .status(kbid, kind)
            .await?
            .ok_or_else(|| RolloverError::NotStarted {
                kbid: kbid.to_string(),
                kind,
            })?;
        if status.state.in_progress() {
            tracing::info!(
                "Resuming rollover: kb={} kind={} state={} indexed={}",
                kbid,
                kind,
                status.state,
                status.indexed
            );
        }
        self.drive(status).await
    }

    async fn drive(&self, mut status: RolloverStatus) -> Result<RolloverStatus, RolloverError> {
        while status.state.in_progress() {
            match self.step(&status).await {
                Ok(next) => status = next,
                Err(e @ RolloverError::Superseded { .. }) => {
                    tracing::warn!("{}", e);
                    return Err(e);
                }
                Err(e) => {
                    self.fail(&status, &e).await;
                    return Err(e);
                }
            }
        }
        Ok(status)
    }

    async fn step(&self, status: &RolloverStatus) -> Result<RolloverStatus, RolloverError> {
        match status.state {
            RolloverState::CreatingShards => self.create_shards(status).await,
            RolloverState::Indexing => self.index_batch(status).await,
            RolloverState::Cutover => self.cutover(status).await,
            RolloverState::Cleanup => self.cleanup(status).await,
            other => Err(RolloverError::Validation(format!(
                "no step for state {other}"
            ))),
        }
    }

    async fn create_shards(&self, status: &RolloverStatus) -> Result<RolloverStatus, RolloverError> {
        let avoid: HashSet<NodeId> = if self.settings.avoid_current_nodes {
            let mut txn = self.driver.begin(true).await?;
            let active = meta::shards::get_active(&mut txn, &status.kbid, status.kind).await?;
            txn.commit().await?;
            active.map(|g| g.nodes().into_iter().collect()).unwrap_or_default()
        } else {
            HashSet::new()
        };

        let group = self
            .cluster
            .create_shard_group(&status.kbid, status.kind, &avoid)
            .await?;

        let mut next = status.clone();
        next.target_group = Some(group.clone());
        next.advance(RolloverState::Indexing);
        match self.persist(status, next, None).await {
            Ok(next) => Ok(next),
            Err(e @ RolloverError::Superseded { .. }) => {
                // 新组没有落盘，没有任何记录指向它
                self.cluster.delete_shard_group(&group).await;
                Err(e)
            }
            Err(e) => {
                // 提交结果未知，记录里可能已经指向新组
                tracing::error!(
                    "Rollover target group {} may be orphaned: kb={} kind={} shards={:?}",
                    group.id,
                    status.kbid,
                    status.kind,
                    group.replicas.iter().map(|r| r.shard.as_str()).collect::<Vec<_>>()
                );
                Err(e)
            }
        }
    }

    async fn index_batch(&self, status: &RolloverStatus) -> Result<RolloverStatus, RolloverError> {
        let target = target_of(status)?;
        let ids = self
            .resources
            .list_resources(&status.kbid, status.cursor.as_deref(), self.settings.batch_size)
            .await
            .map_err(RolloverError::Resources)?;

        let mut next = status.clone();
        let Some(last) = ids.last().cloned() else {
            tracing::info!(
                "Rollover indexing complete: kb={} kind={} indexed={}",
                status.kbid,
                status.kind,
                status.indexed
            );
            next.advance(RolloverState::Cutover);
            return self.persist(status, next, None).await;
        };

        let mut indexed = 0u64;
        for rid in &ids {
            let repr = self
                .resources
                .indexable(&status.kbid, rid)
                .await
                .map_err(RolloverError::Resources)?;
            // 读取期间被删除的资源直接跳过
            if let Some(repr) = repr {
                self.cluster.index_resource(target, &repr).await?;
                indexed += 1;
            }
        }

        next.cursor = Some(last);
        next.indexed += indexed;
        next.advance(RolloverState::Indexing);
        let next = self.persist(status, next, None).await?;
        tracing::debug!(
            "Rollover batch checkpointed: kb={} kind={} cursor={:?} indexed={}",
            next.kbid,
            next.kind,
            next.cursor,
            next.indexed
        );
        Ok(next)
    }

    async fn cutover(&self, status: &RolloverStatus) -> Result<RolloverStatus, RolloverError> {
        let target = target_of(status)?;
        let expected = self.expected_count(status).await?;
        for replica in &target.replicas {
            let stats = self.cluster.shard_stats(replica).await?;
            if stats.resource_count < expected {
                return Err(RolloverError::Validation(format!(
                    "shard {} on {} holds {} resources, expected at least {}",
                    replica.shard, replica.node, stats.resource_count, expected
                )));
            }
        }

        let mut next = status.clone();
        next.advance(RolloverState::Cleanup);
        let next = self.persist(status, next, Some(target)).await?;
        tracing::info!(
            "Rollover cutover: kb={} kind={} active group now {} on {:?}",
            next.kbid,
            next.kind,
            target.id,
            target.nodes()
        );
        Ok(next)
    }

    /// 新组每个副本至少要有的资源数：取当前活跃组副本计数的最大值。
    /// 迁移期间的删除会双写到两组，所以两边计数可比。
    /// 没有活跃组或其副本都不可达时退回 `indexed`。
    async fn expected_count(&self, status: &RolloverStatus) -> Result<u64, RolloverError> {
        let mut txn = self.driver.begin(true).await?;
        let active = meta::shards::get_active(&mut txn, &status.kbid, status.kind).await?;
        txn.commit().await?;

        let mut best: Option<u64> = None;
        for replica in active.iter().flat_map(|g| g.replicas.iter()) {
            match self.cluster.shard_stats(replica).await {
                Ok(stats) => best = best.max(Some(stats.resource_count)),
                Err(e) => tracing::warn!(
                    "Could not count shard {} on {}: {}",
                    replica.shard,
                    replica.node,
                    e
                ),
            }
        }
        Ok(best.unwrap_or(status.indexed))
    }

    async fn cleanup(&self, status: &RolloverStatus) -> Result<RolloverStatus, RolloverError> {
        let mut next = status.clone();
        if let Some(previous) = &status.previous_group {
            let orphans = self.cluster.delete_shard_group(previous).await;
            if !orphans.is_empty() {
                tracing::error!(
                    "Rollover cleanup left {} orphaned shards: kb={} kind={}",
                    orphans.len(),
                    status.kbid,
                    status.kind
                );
            }
            next.orphaned_shards.extend(orphans);
        }
        next.advance(RolloverState::Done);
        let next = self.persist(status, next, None).await?;
        tracing::info!(
            "Rollover done: kb={} kind={} indexed={} orphaned={}",
            next.kbid,
            next.kind,
            next.indexed,
            next.orphaned_shards.len()
        );
        Ok(next)
    }

    /// 以 `expected` 为前提写入 `next`；`activate` 非空时在同一事务内切换活跃分片组，
    /// 并把原活跃组记到 `previous_group`。
    async fn persist(
        &self,
        expected: &RolloverStatus,
        mut next: RolloverStatus,
        activate: Option<&ShardGroup>,
    ) -> Result<RolloverStatus, RolloverError> {
        let superseded = || RolloverError::Superseded {
            kbid: expected.kbid.clone(),
            kind: expected.kind,
        };
        let mut txn = self.driver.begin(false).await?;
        let current = meta::rollover::get(&mut txn, &expected.kbid, expected.kind).await?;
        if current.as_ref() != Some(expected) {
            return Err(superseded());
        }
        if let Some(group) = activate {
            next.previous_group =
                meta::shards::get_active(&mut txn, &expected.kbid, expected.kind).await?;
            meta::shards::set_active(&mut txn, group).await?;
        }
        meta::rollover::set(&mut txn, &next).await?;
        match txn.commit().await {
            Ok(()) => Ok(next),
            Err(KvError::Conflict(_)) => Err(superseded()),
            Err(e) => Err(e.into()),
        }
    }

    /// 先把 Failed 写入，写入成功才丢弃正在构建的目标组。
    /// 写入失败说明持久化状态可能已经前进（例如切换已生效），目标组原样保留。
    async fn fail(&self, status: &RolloverStatus, err: &RolloverError) {
        tracing::error!(
            "Rollover failed in {}: kb={} kind={}: {}",
            status.state,
            status.kbid,
            status.kind,
            err
        );
        let mut failed = status.clone();
        failed.error = Some(err.to_string());
        failed.advance(RolloverState::Failed);
        let failed = match self.persist(status, failed, None).await {
            Ok(failed) => failed,
            Err(e) => {
                tracing::error!(
                    "Could not record rollover failure, leaving target group in place: kb={} kind={}: {}",
                    status.kbid,
                    status.kind,
                    e
                );
                return;
            }
        };

        let discard = matches!(
            status.state,
            RolloverState::CreatingShards | RolloverState::Indexing | RolloverState::Cutover
        );
        let Some(target) = status.target_group.as_ref().filter(|_| discard) else {
            return;
        };
        let orphans = self.cluster.delete_shard_group(target).await;
        if orphans.is_empty() {
            return;
        }
        let mut next = failed.clone();
        next.orphaned_shards.extend(orphans);
        if let Err(e) = self.persist(&failed, next, None).await {
            tracing::error!(
                "Could not record orphaned shards: kb={} kind={}: {}",
                status.kbid,
                status.kind,
                e
            );
        }
    }
}

fn target_of(status: &RolloverStatus) -> Result<&ShardGroup, RolloverError> {
    status.target_group.as_ref().ok_or_else(|| {
        RolloverError::Validation(format!(
            "rollover in {} without a target group (kb={} kind={})",
            status.state, status.kbid, status.kind
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{IndexNode, NodeRegistry};
    use crate::config::ClusterSettings;
    use crate::core::ResourceRepr;
    use crate::engine::memory::MemoryConnector;
    use crate::meta::kb::KbRecord;
    use crate::resources::KvResourceStore;
    use crate::storage::LocalDriver;

    struct Fixture {
        driver: Arc<dyn Driver>,
        connector: Arc<MemoryConnector>,
        store: Arc<KvResourceStore>,
        orchestrator: RolloverOrchestrator,
        kbid: String,
    }

    async fn fixture(nodes: &[&str], replicas: usize) -> Fixture {
        let driver: Arc<dyn Driver> = Arc::new(LocalDriver::in_memory());
        let registry = Arc::new(NodeRegistry::new());
        for n in nodes {
            registry.announce(IndexNode::new(n, n));
        }
        let connector = Arc::new(MemoryConnector::new());
        let cluster = Arc::new(ClusterManager::new(
            registry,
            connector.clone(),
            ClusterSettings {
                replicas,
                ..ClusterSettings::default()
            },
        ));
        let store = Arc::new(KvResourceStore::new(driver.clone()));
        let orchestrator = RolloverOrchestrator::new(
            driver.clone(),
            cluster,
            store.clone(),
            RolloverSettings {
                batch_size: 3,
                avoid_current_nodes: false,
            },
        );

        let kb = KbRecord::new("test");
        let mut txn = driver.begin(false).await.unwrap();
        meta::kb::put(&mut txn, &kb).await.unwrap();
        txn.commit().await.unwrap();

        Fixture {
            driver,
            connector,
            store,
            orchestrator,
            kbid: kb.kbid,
        }
    }

    #[tokio::test]
    async fn start_requires_existing_kb() {
        let f = fixture(&["a"], 1).await;
        let err = f.orchestrator.start("missing", IndexKind::Texts).await.unwrap_err();
        assert!(matches!(err, RolloverError::KbNotFound(_)));
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_in_progress() {
        let f = fixture(&["a"], 1).await;
        f.orchestrator.start(&f.kbid, IndexKind::Texts).await.unwrap();
        let err = f.orchestrator.start(&f.kbid, IndexKind::Texts).await.unwrap_err();
        assert!(matches!(err, RolloverError::InProgress { .. }));
        // 另一种 kind 不受影响
        f.orchestrator.start(&f.kbid, IndexKind::Vectors).await.unwrap();
    }

    #[tokio::test]
    async fn run_without_previous_group_activates_target() {
        let f = fixture(&["a"], 1).await;
        for i in 0..7 {
            let r = ResourceRepr { rid: format!("r{i}"), body: serde_json::json!({}) };
            f.store.put(&f.kbid, &r).await.unwrap();
        }

        let done = f.orchestrator.run(&f.kbid, IndexKind::Paragraphs).await.unwrap();
        assert_eq!(done.state, RolloverState::Done);
        assert_eq!(done.indexed, 7);
        assert_eq!(done.cursor.as_deref(), Some("r6"));
        assert!(done.previous_group.is_none());

        let mut txn = f.driver.begin(true).await.unwrap();
        let active = meta::shards::get_active(&mut txn, &f.kbid, IndexKind::Paragraphs)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some(&active), done.target_group.as_ref());
        let shard = &active.replicas[0].shard;
        assert_eq!(f.connector.engine("a").resource_count(shard), Some(7));

        // 终态后可以再次发起
        f.orchestrator.start(&f.kbid, IndexKind::Paragraphs).await.unwrap();
    }

    #[tokio::test]
    async fn cluster_too_small_fails_cleanly() {
        let f = fixture(&["a"], 2).await;
        let err = f.orchestrator.run(&f.kbid, IndexKind::Texts).await.unwrap_err();
        assert!(matches!(err, RolloverError::Cluster(_)));

        let status = f.orchestrator.status(&f.kbid, IndexKind::Texts).await.unwrap().unwrap();
        assert_eq!(status.state, RolloverState::Failed);
        assert!(status.error.is_some());
        assert!(f.connector.engine("a").shard_ids().is_empty());
    }

    #[tokio::test]
    async fn resume_of_unknown_rollover_is_not_started() {
        let f = fixture(&["a"], 1).await;
        let err = f.orchestrator.resume(&f.kbid, IndexKind::Texts).await.unwrap_err();
        assert!(matches!(err, RolloverError::NotStarted { .. }));
    }
}
