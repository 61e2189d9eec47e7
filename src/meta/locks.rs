//! KV 上的租约锁：同一时刻只有一个持有者，过期后可被接管。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KvError;
use crate::meta::{get_json, keys, set_json};
use crate::storage::Driver;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// 已持有的锁。不会在 Drop 时自动释放（释放需要一次 KV 事务），由持有者显式 `release`；
/// 进程崩溃时锁在 TTL 到期后自然失效。
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    holder: String,
    ttl: Duration,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

/// 尝试获取锁；被他人持有（或并发获取输掉提交冲突）时返回 None
pub async fn acquire(
    driver: &dyn Driver,
    name: &str,
    ttl: Duration,
) -> Result<Option<LockGuard>, KvError> {
    let key = keys::lock(name);
    let mut txn = driver.begin(false).await?;
    if let Some(current) = get_json::<LockRecord>(&mut txn, &key).await? {
        if current.expires_at > Utc::now() {
            tracing::debug!("Lock {} held by {} until {}", name, current.holder, current.expires_at);
            txn.abort().await?;
            return Ok(None);
        }
        tracing::warn!("Taking over expired lock {} from {}", name, current.holder);
    }

    let holder = uuid::Uuid::new_v4().to_string();
    let record = LockRecord {
        holder: holder.clone(),
        expires_at: expiry(ttl),
    };
    set_json(&mut txn, &key, &record).await?;
    match txn.commit().await {
        Ok(()) => Ok(Some(LockGuard {
            name: name.to_string(),
            holder,
            ttl,
        })),
        Err(KvError::Conflict(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// 续租；返回 false 表示锁已丢失（过期后被接管）
pub async fn refresh(driver: &dyn Driver, guard: &LockGuard) -> Result<bool, KvError> {
    let key = keys::lock(&guard.name);
    let mut txn = driver.begin(false).await?;
    match get_json::<LockRecord>(&mut txn, &key).await? {
        Some(current) if current.holder == guard.holder => {
            let record = LockRecord {
                holder: guard.holder.clone(),
                expires_at: expiry(guard.ttl),
            };
            set_json(&mut txn, &key, &record).await?;
            txn.commit().await?;
            Ok(true)
        }
        _ => {
            txn.abort().await?;
            tracing::warn!("Lock {} lost by holder {}", guard.name, guard.holder);
            Ok(false)
        }
    }
}

/// 释放锁；只删除仍属于自己的记录
pub async fn release(driver: &dyn Driver, guard: LockGuard) -> Result<(), KvError> {
    let key = keys::lock(&guard.name);
    let mut txn = driver.begin(false).await?;
    match get_json::<LockRecord>(&mut txn, &key).await? {
        Some(current) if current.holder == guard.holder => {
            txn.delete(&key).await?;
            txn.commit().await
        }
        _ => txn.abort().await,
    }
}
