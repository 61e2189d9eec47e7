use async_trait::async_trait;
use tikv_client::{CheckLevel, Snapshot, TransactionClient, TransactionOptions};

use crate::error::KvError;
use crate::storage::{Driver, Retrying, Transaction};

/// 单次 scan RPC 的条数上限；前缀扫描按这个大小翻页直到取完
const SCAN_PAGE: u32 = 10_000;

/// deadline / 连接类错误归为 Transient（读操作会被 `Retrying` 重试），其余为后端错误
fn classify(e: tikv_client::Error) -> KvError {
    let msg = e.to_string();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("deadline") || lower.contains("timeout") || lower.contains("unavailable") {
        KvError::Transient(msg)
    } else if lower.contains("write conflict") || lower.contains("writeconflict") {
        KvError::Conflict(msg)
    } else {
        KvError::Backend(msg)
    }
}

/// 前缀的右开上界：最后一个非 0xFF 字节加一
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// 严格大于 `key` 的最小 key
fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// `prefix` 下严格大于 `start_after` 的半开区间 [start, end)
fn key_range(prefix: &str, start_after: Option<&str>) -> (Vec<u8>, Vec<u8>) {
    let start = match start_after {
        Some(after) if after >= prefix => successor(after.as_bytes()),
        _ => prefix.as_bytes().to_vec(),
    };
    let end = prefix_end(prefix.as_bytes()).unwrap_or_else(|| vec![0xFF; prefix.len() + 1]);
    (start, end)
}

fn key_string(key: tikv_client::Key) -> Result<String, KvError> {
    let bytes: Vec<u8> = key.into();
    String::from_utf8(bytes).map_err(|e| KvError::Codec(format!("non utf-8 key: {e}")))
}

/// TiKV 后端：读写事务用乐观事务，只读事务用快照读
pub struct TikvDriver {
    client: TransactionClient,
}

impl TikvDriver {
    pub async fn connect(pd_endpoints: Vec<String>) -> anyhow::Result<Self> {
        anyhow::ensure!(!pd_endpoints.is_empty(), "tikv backend requires driver.pd_endpoints");
        let client = TransactionClient::new(pd_endpoints).await?;
        Ok(Self { client })
    }

    fn options() -> TransactionOptions {
        TransactionOptions::new_optimistic().drop_check(CheckLevel::Warn)
    }
}

#[async_trait]
impl Driver for TikvDriver {
    fn name(&self) -> &'static str {
        "tikv"
    }

    async fn open(&self, read_only: bool) -> Result<Box<dyn Transaction>, KvError> {
        let inner = if read_only {
            let ts = self.client.current_timestamp().await.map_err(classify)?;
            Inner::Snapshot(self.client.snapshot(ts, Self::options()))
        } else {
            let txn = self
                .client
                .begin_with_options(Self::options())
                .await
                .map_err(classify)?;
            Inner::Txn(txn)
        };
        Ok(Box::new(Retrying::new(TikvTransaction { inner })))
    }
}

enum Inner {
    Snapshot(Snapshot),
    Txn(tikv_client::Transaction),
}

struct TikvTransaction {
    inner: Inner,
}

#[async_trait]
impl Transaction for TikvTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let key = key.as_bytes().to_vec();
        match &mut self.inner {
            Inner::Snapshot(s) => s.get(key).await.map_err(classify),
            Inner::Txn(t) => t.get(key).await.map_err(classify),
        }
    }

    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        match &mut self.inner {
            Inner::Snapshot(_) => Err(KvError::ReadOnly("set")),
            Inner::Txn(t) => t.put(key.as_bytes().to_vec(), value).await.map_err(classify),
        }
    }

    async fn delete(&mut self, key: &str) -> Result<(), KvError> {
        match &mut self.inner {
            Inner::Snapshot(_) => Err(KvError::ReadOnly("delete")),
            Inner::Txn(t) => t.delete(key.as_bytes().to_vec()).await.map_err(classify),
        }
    }

    async fn scan(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let (mut start, end) = key_range(prefix, None);
        let mut out = Vec::new();
        loop {
            let range = start.clone()..end.clone();
            let page: Vec<tikv_client::KvPair> = match &mut self.inner {
                Inner::Snapshot(s) => s.scan(range, SCAN_PAGE).await.map_err(classify)?.collect(),
                Inner::Txn(t) => t.scan(range, SCAN_PAGE).await.map_err(classify)?.collect(),
            };
            let full = page.len() >= SCAN_PAGE as usize;
            for kv in page {
                let key: Vec<u8> = kv.0.into();
                start = successor(&key);
                out.push((key_string(key.into())?, kv.1));
            }
            if !full {
                return Ok(out);
            }
        }
    }

    async fn scan_keys(
        &mut self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        let (start, end) = key_range(prefix, start_after);
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        let keys: Vec<tikv_client::Key> = match &mut self.inner {
            Inner::Snapshot(s) => s.scan_keys(start..end, limit).await.map_err(classify)?.collect(),
            Inner::Txn(t) => t.scan_keys(start..end, limit).await.map_err(classify)?.collect(),
        };
        keys.into_iter().map(key_string).collect()
    }

    async fn commit(&mut self) -> Result<(), KvError> {
        match &mut self.inner {
            Inner::Snapshot(_) => Ok(()),
            Inner::Txn(t) => t.commit().await.map(|_| ()).map_err(classify),
        }
    }

    async fn abort(&mut self) -> Result<(), KvError> {
        match &mut self.inner {
            Inner::Snapshot(_) => Ok(()),
            Inner::Txn(t) => t.rollback().await.map_err(classify),
        }
    }
}
