use async_trait::async_trait;

use crate::error::KvError;
use crate::storage::Transaction;

/// 单次可重试读操作的尝试次数（含首次）
pub const READ_ATTEMPTS: u32 = 2;

/// 网络后端的读重试包装。
///
/// - `get` / `scan` / `scan_keys` 遇到 `KvError::Transient` 时在同一事务上下文内重试，
///   预算耗尽后统一返回 `KvError::Timeout`，绝不透出后端原始错误。
/// - 写操作与 commit 原样透传：非幂等操作不在驱动内部重试。
pub struct Retrying<T> {
    inner: T,
    attempts: u32,
}

impl<T> Retrying<T> {
    pub fn new(inner: T) -> Self {
        Self::with_attempts(inner, READ_ATTEMPTS)
    }

    pub fn with_attempts(inner: T, attempts: u32) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
        }
    }
}

fn exhausted(op: &'static str, attempts: u32, last: &str) -> KvError {
    tracing::warn!("KV {} exhausted {} attempts, last error: {}", op, attempts, last);
    KvError::Timeout { op, attempts }
}

#[async_trait]
impl<T: Transaction> Transaction for Retrying<T> {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut last = String::new();
        for attempt in 1..=self.attempts {
            match self.inner.get(key).await {
                Err(KvError::Transient(msg)) => {
                    tracing::debug!("KV get {} attempt {} failed: {}", key, attempt, msg);
                    last = msg;
                }
                other => return other,
            }
        }
        Err(exhausted("get", self.attempts, &last))
    }

    async fn scan(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let mut last = String::new();
        for attempt in 1..=self.attempts {
            match self.inner.scan(prefix).await {
                Err(KvError::Transient(msg)) => {
                    tracing::debug!("KV scan {} attempt {} failed: {}", prefix, attempt, msg);
                    last = msg;
                }
                other => return other,
            }
        }
        Err(exhausted("scan", self.attempts, &last))
    }

    async fn scan_keys(
        &mut self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        let mut last = String::new();
        for attempt in 1..=self.attempts {
            match self.inner.scan_keys(prefix, start_after, limit).await {
                Err(KvError::Transient(msg)) => {
                    tracing::debug!("KV scan_keys {} attempt {} failed: {}", prefix, attempt, msg);
                    last = msg;
                }
                other => return other,
            }
        }
        Err(exhausted("scan_keys", self.attempts, &last))
    }

    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.inner.set(key, value).await
    }

    async fn delete(&mut self, key: &str) -> Result<(), KvError> {
        self.inner.delete(key).await
    }

    async fn commit(&mut self) -> Result<(), KvError> {
        self.inner.commit().await
    }

    async fn abort(&mut self) -> Result<(), KvError> {
        self.inner.abort().await
    }
}
