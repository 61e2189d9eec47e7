//! 元数据管理：KV 之上的类型化访问层。
//!
//! 每个子模块持有自己的 key 规则（见 [`keys`]）；所有读写函数都接收 `&mut Txn`，
//! 调用方可以把跨领域的更新组合进同一个事务。原始 key 字符串不离开本模块。

pub mod kb;
pub mod keys;
pub mod locks;
pub mod migrations;
pub mod resources;
pub mod rollover;
pub mod shards;
pub mod workers;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::KvError;
use crate::storage::Txn;

pub(crate) async fn get_json<T: DeserializeOwned>(
    txn: &mut Txn,
    key: &str,
) -> Result<Option<T>, KvError> {
    match txn.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) async fn set_json<T: Serialize>(
    txn: &mut Txn,
    key: &str,
    value: &T,
) -> Result<(), KvError> {
    let bytes = serde_json::to_vec(value)?;
    txn.set(key, bytes).await
}

/// 扫描前缀并解码；返回 (key 去掉前缀后的部分, 值)，按 key 升序
pub(crate) async fn scan_json<T: DeserializeOwned>(
    txn: &mut Txn,
    prefix: &str,
) -> Result<Vec<(String, T)>, KvError> {
    txn.scan(prefix)
        .await?
        .into_iter()
        .map(|(k, v)| {
            let suffix = k.strip_prefix(prefix).unwrap_or(&k).to_string();
            Ok((suffix, serde_json::from_slice(&v)?))
        })
        .collect()
}
