use crate::core::{IndexKind, ShardGroup};
use crate::error::KvError;
use crate::meta::{get_json, keys, scan_json, set_json};
use crate::storage::Txn;

/// (KB, kind) 当前的活跃分片组
pub async fn get_active(
    txn: &mut Txn,
    kbid: &str,
    kind: IndexKind,
) -> Result<Option<ShardGroup>, KvError> {
    get_json(txn, &keys::shards(kbid, kind)).await
}

pub async fn set_active(txn: &mut Txn, group: &ShardGroup) -> Result<(), KvError> {
    set_json(txn, &keys::shards(&group.kbid, group.kind), group).await
}

/// KB 的所有活跃分片组，按 kind 排序
pub async fn list_active(txn: &mut Txn, kbid: &str) -> Result<Vec<ShardGroup>, KvError> {
    let mut groups: Vec<ShardGroup> = scan_json(txn, &keys::shards_prefix(kbid))
        .await?
        .into_iter()
        .map(|(_, g)| g)
        .collect();
    groups.sort_by_key(|g| g.kind);
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ShardReplica;
    use crate::storage::{Driver, LocalDriver};

    #[tokio::test]
    async fn set_then_list() {
        let driver = LocalDriver::in_memory();
        let replicas = vec![ShardReplica { replica: 0, node: "n1".into(), shard: "s1".into() }];
        let vectors = ShardGroup::new("kb", IndexKind::Vectors, replicas.clone());
        let paragraphs = ShardGroup::new("kb", IndexKind::Paragraphs, replicas);

        let mut txn = driver.begin(false).await.unwrap();
        set_active(&mut txn, &vectors).await.unwrap();
        set_active(&mut txn, &paragraphs).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = driver.begin(true).await.unwrap();
        let all = list_active(&mut txn, "kb").await.unwrap();
        assert_eq!(all, vec![paragraphs, vectors.clone()]);
        assert_eq!(
            get_active(&mut txn, "kb", IndexKind::Vectors).await.unwrap(),
            Some(vectors)
        );
        assert_eq!(get_active(&mut txn, "kb", IndexKind::Texts).await.unwrap(), None);
    }
}
