pub mod local;
pub mod retry;
mod snapshot;
mod wal;

#[cfg(feature = "postgres")]
pub mod pg;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "tikv")]
pub mod tikv;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Backend, DriverSettings};
use crate::error::KvError;

pub use local::LocalDriver;
pub use retry::{Retrying, READ_ATTEMPTS};

/// 后端事务契约。
///
/// ## 契约（重要）
/// - 同一事务内的所有读写观察同一个一致快照；`commit` 要么全部生效要么全部不生效。
/// - `scan` 按 key 升序返回前缀下的全部 key，并合并本事务尚未提交的写入；不得静默截断。
/// - `scan_keys` 是只取 key 的有界范围扫描，分页读取大前缀时使用。
/// - 写操作（set/delete/commit）失败时不得在驱动内部重试，由调用方整体重开事务。
/// - 只读/读写的区分由 `Txn` 统一把关，后端实现无需重复检查。
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), KvError>;
    async fn delete(&mut self, key: &str) -> Result<(), KvError>;
    async fn scan(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError>;
    /// `prefix` 下严格大于 `start_after` 的前 `limit` 个 key，升序
    async fn scan_keys(
        &mut self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, KvError>;
    async fn commit(&mut self) -> Result<(), KvError>;
    async fn abort(&mut self) -> Result<(), KvError>;
}

/// 可插拔 KV 驱动：编排层只依赖这个接口，从不接触具体后端类型
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// 打开一个裸后端事务。调用方应使用 `begin`，它返回带作用域保证的 `Txn`。
    async fn open(&self, read_only: bool) -> Result<Box<dyn Transaction>, KvError>;

    async fn initialize(&self) -> Result<(), KvError> {
        Ok(())
    }

    async fn finalize(&self) -> Result<(), KvError> {
        Ok(())
    }

    async fn begin(&self, read_only: bool) -> Result<Txn, KvError> {
        let inner = self.open(read_only).await?;
        Ok(Txn::new(inner, read_only))
    }
}

/// 作用域事务句柄。
///
/// 任何没有走到成功 `commit()` 的退出路径（`?` 提前返回、panic 展开、显式丢弃）
/// 都会触发后端 `abort()`：Drop 时把裸事务移交给当前 tokio runtime 执行回滚。
pub struct Txn {
    inner: Option<Box<dyn Transaction>>,
    read_only: bool,
}

impl Txn {
    pub fn new(inner: Box<dyn Transaction>, read_only: bool) -> Self {
        Self {
            inner: Some(inner),
            read_only,
        }
    }

    fn live(&mut self) -> Result<&mut Box<dyn Transaction>, KvError> {
        self.inner.as_mut().ok_or(KvError::Closed)
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.live()?.get(key).await
    }

    pub async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        if self.read_only {
            return Err(KvError::ReadOnly("set"));
        }
        self.live()?.set(key, value).await
    }

    pub async fn delete(&mut self, key: &str) -> Result<(), KvError> {
        if self.read_only {
            return Err(KvError::ReadOnly("delete"));
        }
        self.live()?.delete(key).await
    }

    pub async fn scan(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        self.live()?.scan(prefix).await
    }

    pub async fn scan_keys(
        &mut self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.live()?.scan_keys(prefix, start_after, limit).await
    }

    pub async fn commit(mut self) -> Result<(), KvError> {
        let mut inner = self.inner.take().ok_or(KvError::Closed)?;
        match inner.commit().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(abort_err) = inner.abort().await {
                    tracing::debug!("Abort after failed commit also failed: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    pub async fn abort(mut self) -> Result<(), KvError> {
        match self.inner.take() {
            Some(mut inner) => inner.abort().await,
            None => Ok(()),
        }
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        let Some(mut inner) = self.inner.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.abort().await {
                        tracing::warn!("Abort of dropped transaction failed: {}", e);
                    }
                });
            }
            Err(_) => {
                // runtime 已关闭：后端句柄随 drop 释放，服务端按连接断开回滚。
                tracing::warn!("Transaction dropped outside a runtime, releasing without abort");
            }
        }
    }
}

pub(crate) fn in_key_range(key: &str, prefix: &str, start_after: Option<&str>) -> bool {
    key.starts_with(prefix) && start_after.map_or(true, |a| key > a)
}

/// 范围内待删除的 key 数：后端据此多取几个已提交 key，叠加删除后仍能凑满一页
pub(crate) fn pending_deletes(
    writes: &BTreeMap<String, Option<Vec<u8>>>,
    prefix: &str,
    start_after: Option<&str>,
) -> usize {
    writes
        .iter()
        .filter(|(k, w)| w.is_none() && in_key_range(k, prefix, start_after))
        .count()
}

/// 在已提交 key 页上叠加事务内的写入，返回范围内前 `limit` 个 key。
/// `committed` 须是范围内已提交 key 的升序前缀，且至少有 `limit + pending_deletes` 个
/// （不足时即为范围内全部 key）。
pub(crate) fn overlay_keys(
    committed: impl IntoIterator<Item = String>,
    writes: &BTreeMap<String, Option<Vec<u8>>>,
    prefix: &str,
    start_after: Option<&str>,
    limit: usize,
) -> Vec<String> {
    let mut keys: BTreeSet<String> = committed.into_iter().collect();
    for (k, w) in writes
        .iter()
        .filter(|(k, _)| in_key_range(k, prefix, start_after))
    {
        match w {
            Some(_) => {
                keys.insert(k.clone());
            }
            None => {
                keys.remove(k);
            }
        }
    }
    keys.into_iter().take(limit).collect()
}

/// 按配置打开驱动（运行时选择后端）
pub async fn open_driver(settings: &DriverSettings) -> anyhow::Result<Arc<dyn Driver>> {
    let driver: Arc<dyn Driver> = match settings.backend {
        Backend::Local => match &settings.path {
            Some(dir) => Arc::new(LocalDriver::open_dir(dir.clone(), settings.compact_every)?),
            None => Arc::new(LocalDriver::in_memory()),
        },
        #[cfg(feature = "redis")]
        Backend::Redis => {
            let url = settings
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("redis backend requires driver.url"))?;
            Arc::new(self::redis::RedisDriver::new(url)?)
        }
        #[cfg(feature = "tikv")]
        Backend::Tikv => {
            Arc::new(self::tikv::TikvDriver::connect(settings.pd_endpoints.clone()).await?)
        }
        #[cfg(feature = "postgres")]
        Backend::Postgres => {
            let dsn = settings
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("postgres backend requires driver.url"))?;
            Arc::new(self::pg::PgDriver::new(dsn, settings.pool_size))
        }
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("backend {:?} not compiled in (enable the cargo feature)", other),
    };
    driver.initialize().await?;
    tracing::info!("KV driver ready: {}", driver.name());
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_applies_pending_writes_within_range() {
        let mut writes = BTreeMap::new();
        writes.insert("/p/b".to_string(), None);
        writes.insert("/p/bb".to_string(), Some(vec![1]));
        writes.insert("/q/a".to_string(), Some(vec![1]));
        writes.insert("/p/0".to_string(), Some(vec![1]));
        assert_eq!(pending_deletes(&writes, "/p/", Some("/p/a")), 1);

        let committed = ["/p/b", "/p/c", "/p/d"].map(String::from);
        let keys = overlay_keys(committed, &writes, "/p/", Some("/p/a"), 2);
        assert_eq!(keys, vec!["/p/bb".to_string(), "/p/c".to_string()]);
    }

    #[tokio::test]
    async fn read_only_transaction_rejects_writes() {
        let driver = LocalDriver::in_memory();
        let mut txn = driver.begin(true).await.unwrap();
        assert!(matches!(
            txn.set("/a", b"1".to_vec()).await,
            Err(KvError::ReadOnly("set"))
        ));
        assert!(matches!(
            txn.delete("/a").await,
            Err(KvError::ReadOnly("delete"))
        ));
        txn.abort().await.unwrap();
    }

    #[tokio::test]
    async fn aborted_writes_are_invisible() {
        let driver = LocalDriver::in_memory();

        let mut txn = driver.begin(false).await.unwrap();
        txn.set("/a", b"1".to_vec()).await.unwrap();
        txn.abort().await.unwrap();

        let mut txn = driver.begin(true).await.unwrap();
        assert_eq!(txn.get("/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn error_inside_scope_discards_writes() {
        async fn failing(driver: &LocalDriver) -> Result<(), KvError> {
            let mut txn = driver.begin(false).await?;
            txn.set("/b", b"1".to_vec()).await?;
            txn.set("/c", b"2".to_vec()).await?;
            Err(KvError::Backend("boom".into()))
        }

        let driver = LocalDriver::in_memory();
        assert!(failing(&driver).await.is_err());

        let mut txn = driver.begin(true).await.unwrap();
        assert!(txn.scan("/").await.unwrap().is_empty());
    }
}
