use std::collections::BTreeMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use crate::error::KvError;
use crate::storage::{in_key_range, overlay_keys, pending_deletes, Driver, Retrying, Transaction};

const SCAN_COUNT: usize = 1000;

fn classify(e: redis::RedisError) -> KvError {
    if e.is_timeout() || e.is_connection_dropped() || e.is_io_error() || e.is_connection_refusal()
    {
        KvError::Transient(e.to_string())
    } else {
        KvError::Backend(e.to_string())
    }
}

/// glob 元字符转义，保证 SCAN MATCH 只做前缀匹配
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

/// Redis 后端。
///
/// 每个事务独占一条连接：读直接走 GET/SCAN（读写事务先 WATCH 读到的 key），
/// 写缓存在本地，commit 时以 MULTI/EXEC 一次性提交；被 WATCH 的 key 改动会使 EXEC 失败，
/// 对外表现为 `KvError::Conflict`。
pub struct RedisDriver {
    client: redis::Client,
}

impl RedisDriver {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl Driver for RedisDriver {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn open(&self, read_only: bool) -> Result<Box<dyn Transaction>, KvError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;
        Ok(Box::new(Retrying::new(RedisTransaction {
            conn,
            read_only,
            writes: BTreeMap::new(),
            watching: false,
        })))
    }
}

struct RedisTransaction {
    conn: MultiplexedConnection,
    read_only: bool,
    writes: BTreeMap<String, Option<Vec<u8>>>,
    watching: bool,
}

impl RedisTransaction {
    async fn watch(&mut self, keys: &[String]) -> Result<(), KvError> {
        if self.read_only || keys.is_empty() {
            return Ok(());
        }
        redis::cmd("WATCH")
            .arg(keys)
            .query_async::<_, ()>(&mut self.conn)
            .await
            .map_err(classify)?;
        self.watching = true;
        Ok(())
    }

    /// SCAN MATCH 列出前缀下的全部 key，排序去重
    async fn match_keys(&mut self, prefix: &str) -> Result<Vec<String>, KvError> {
        let pattern = escape_glob(prefix);
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut self.conn)
                .await
                .map_err(classify)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl Transaction for RedisTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        if let Some(w) = self.writes.get(key) {
            return Ok(w.clone());
        }
        self.watch(&[key.to_string()]).await?;
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<Vec<u8>>>(&mut self.conn)
            .await
            .map_err(classify)
    }

    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), KvError> {
        self.writes.insert(key.to_string(), None);
        Ok(())
    }

    async fn scan(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let keys = self.match_keys(prefix).await?;
        self.watch(&keys).await?;

        let mut merged = BTreeMap::new();
        for chunk in keys.chunks(SCAN_COUNT) {
            let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
                .arg(chunk)
                .query_async(&mut self.conn)
                .await
                .map_err(classify)?;
            for (k, v) in chunk.iter().zip(values) {
                if let Some(v) = v {
                    merged.insert(k.clone(), v);
                }
            }
        }
        for (k, w) in self.writes.iter().filter(|(k, _)| k.starts_with(prefix)) {
            match w {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    async fn scan_keys(
        &mut self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        let extra = pending_deletes(&self.writes, prefix, start_after);
        let keys: Vec<String> = self
            .match_keys(prefix)
            .await?
            .into_iter()
            .filter(|k| in_key_range(k, prefix, start_after))
            .take(limit.saturating_add(extra))
            .collect();
        self.watch(&keys).await?;
        Ok(overlay_keys(keys, &self.writes, prefix, start_after, limit))
    }

    async fn commit(&mut self) -> Result<(), KvError> {
        if self.writes.is_empty() {
            return self.abort().await;
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (k, w) in std::mem::take(&mut self.writes) {
            match w {
                Some(v) => {
                    pipe.cmd("SET").arg(k).arg(v).ignore();
                }
                None => {
                    pipe.cmd("DEL").arg(k).ignore();
                }
            }
        }
        let res: Option<redis::Value> = pipe
            .query_async(&mut self.conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        self.watching = false;
        match res {
            Some(_) => Ok(()),
            None => Err(KvError::Conflict("watched keys changed before EXEC".into())),
        }
    }

    async fn abort(&mut self) -> Result<(), KvError> {
        self.writes.clear();
        if self.watching {
            self.watching = false;
            redis::cmd("UNWATCH")
                .query_async::<_, ()>(&mut self.conn)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }
}
