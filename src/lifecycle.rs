//! KB 的创建与级联删除

use std::collections::HashSet;

use crate::cluster::ClusterManager;
use crate::core::{IndexKind, ShardGroup};
use crate::error::{KbError, KvError};
use crate::meta;
use crate::meta::kb::KbRecord;
use crate::storage::Driver;

/// 建 KB：先在集群上为每种索引建分片组，再在一个事务里写入 KB 标记、slug 与活跃分片组。
/// 任何一步失败都会删除已建的分片组。
pub async fn create_kb(
    driver: &dyn Driver,
    cluster: &ClusterManager,
    slug: &str,
    kinds: &[IndexKind],
) -> Result<KbRecord, KbError> {
    let mut txn = driver.begin(true).await?;
    let taken = meta::kb::get_slug(&mut txn, slug).await?.is_some();
    txn.commit().await?;
    if taken {
        return Err(KbError::SlugTaken(slug.to_string()));
    }

    let record = KbRecord::new(slug);
    let mut groups: Vec<ShardGroup> = Vec::with_capacity(kinds.len());
    for kind in kinds {
        match cluster
            .create_shard_group(&record.kbid, *kind, &HashSet::new())
            .await
        {
            Ok(g) => groups.push(g),
            Err(e) => {
                discard(cluster, &groups).await;
                return Err(e.into());
            }
        }
    }

    match persist_new(driver, &record, &groups).await {
        Ok(()) => {
            tracing::info!(
                "Knowledge box created: kb={} slug={} kinds={:?}",
                record.kbid,
                slug,
                kinds
            );
            Ok(record)
        }
        Err(e) => {
            discard(cluster, &groups).await;
            Err(e)
        }
    }
}

async fn persist_new(
    driver: &dyn Driver,
    record: &KbRecord,
    groups: &[ShardGroup],
) -> Result<(), KbError> {
    let mut txn = driver.begin(false).await?;
    if meta::kb::get_slug(&mut txn, &record.slug).await?.is_some() {
        return Err(KbError::SlugTaken(record.slug.clone()));
    }
    meta::kb::put(&mut txn, record).await?;
    meta::kb::set_slug(&mut txn, &record.slug, &record.kbid).await?;
    for g in groups {
        meta::shards::set_active(&mut txn, g).await?;
    }
    match txn.commit().await {
        Ok(()) => Ok(()),
        // 并发建同名 KB 时的提交冲突
        Err(KvError::Conflict(_)) => Err(KbError::SlugTaken(record.slug.clone())),
        Err(e) => Err(e.into()),
    }
}

async fn discard(cluster: &ClusterManager, groups: &[ShardGroup]) {
    for g in groups {
        cluster.delete_shard_group(g).await;
    }
}

/// 级联删除：活跃分片组与迁移中的目标组的远端 shard，然后一次性删除 KB 的全部元数据。
/// 返回删除失败、遗留在节点上的 shard。
pub async fn delete_kb(
    driver: &dyn Driver,
    cluster: &ClusterManager,
    kbid: &str,
) -> Result<Vec<String>, KbError> {
    let mut txn = driver.begin(true).await?;
    let record = meta::kb::get(&mut txn, kbid)
        .await?
        .ok_or_else(|| KbError::NotFound(kbid.to_string()))?;
    let mut groups = meta::shards::list_active(&mut txn, kbid).await?;
    groups.extend(
        meta::rollover::list(&mut txn, kbid)
            .await?
            .into_iter()
            .filter(|s| !s.state.is_terminal())
            .filter_map(|s| s.target_group),
    );
    txn.commit().await?;

    let mut orphans = Vec::new();
    for g in &groups {
        orphans.extend(cluster.delete_shard_group(g).await);
    }

    let mut txn = driver.begin(false).await?;
    let deleted = meta::kb::delete_tree(&mut txn, kbid).await?;
    meta::migrations::delete_kb(&mut txn, kbid).await?;
    if meta::kb::get_slug(&mut txn, &record.slug).await?.as_deref() == Some(kbid) {
        meta::kb::delete_slug(&mut txn, &record.slug).await?;
    }
    txn.commit().await?;

    tracing::info!(
        "Knowledge box deleted: kb={} keys={} shard_groups={} orphaned={}",
        kbid,
        deleted,
        groups.len(),
        orphans.len()
    );
    Ok(orphans)
}
