use crate::error::KvError;
use crate::meta::{get_json, keys, scan_json, set_json};
use crate::storage::Txn;

pub async fn get_offset(
    txn: &mut Txn,
    worker: &str,
    partition: &str,
) -> Result<Option<u64>, KvError> {
    get_json(txn, &keys::worker_offset(worker, partition)).await
}

/// 原样写入；单调性检查在 `SequenceManager::set_last`
pub async fn set_offset(
    txn: &mut Txn,
    worker: &str,
    partition: &str,
    seqid: u64,
) -> Result<(), KvError> {
    set_json(txn, &keys::worker_offset(worker, partition), &seqid).await
}

/// worker 的全部 (partition, offset)
pub async fn list_offsets(txn: &mut Txn, worker: &str) -> Result<Vec<(String, u64)>, KvError> {
    scan_json(txn, &keys::worker_prefix(worker)).await
}
