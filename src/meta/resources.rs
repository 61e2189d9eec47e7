use crate::core::{ResourceId, ResourceRepr};
use crate::error::KvError;
use crate::meta::{get_json, keys, set_json};
use crate::storage::Txn;

pub async fn get(txn: &mut Txn, kbid: &str, rid: &str) -> Result<Option<ResourceRepr>, KvError> {
    get_json(txn, &keys::resource(kbid, rid)).await
}

pub async fn put(txn: &mut Txn, kbid: &str, resource: &ResourceRepr) -> Result<(), KvError> {
    set_json(txn, &keys::resource(kbid, &resource.rid), resource).await
}

pub async fn delete(txn: &mut Txn, kbid: &str, rid: &str) -> Result<(), KvError> {
    txn.delete(&keys::resource(kbid, rid)).await
}

/// 按 id 升序分页：严格大于 `after` 的前 `limit` 个资源 id
pub async fn list_ids(
    txn: &mut Txn,
    kbid: &str,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<ResourceId>, KvError> {
    let prefix = keys::resources_prefix(kbid);
    let start_after = after.map(|a| format!("{prefix}{a}"));
    let found = txn.scan_keys(&prefix, start_after.as_deref(), limit).await?;
    Ok(found
        .into_iter()
        .filter_map(|k| k.strip_prefix(prefix.as_str()).map(str::to_string))
        .collect())
}
