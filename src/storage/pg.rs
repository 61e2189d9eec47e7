use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};

use crate::error::KvError;
use crate::storage::{Driver, Retrying, Transaction};

// key 按字节序比较；已有表的排序规则可能不同，查询里再显式指定一次
const CREATE_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS resources (key TEXT COLLATE \"C\" PRIMARY KEY, value BYTEA NOT NULL)";

const SCAN: &str =
    "SELECT key, value FROM resources WHERE key LIKE $1 ORDER BY key COLLATE \"C\"";

const SCAN_KEYS: &str = "SELECT key FROM resources WHERE key LIKE $1 \
     AND ($2::TEXT IS NULL OR key > $2 COLLATE \"C\") \
     ORDER BY key COLLATE \"C\" LIMIT $3";

fn classify(e: tokio_postgres::Error) -> KvError {
    if e.code() == Some(&SqlState::T_R_SERIALIZATION_FAILURE)
        || e.code() == Some(&SqlState::T_R_DEADLOCK_DETECTED)
    {
        KvError::Conflict(e.to_string())
    } else if e.is_closed() || e.code().is_none() {
        // 没有 SQLSTATE 的错误来自连接层（断连、IO）
        KvError::Transient(e.to_string())
    } else {
        KvError::Backend(e.to_string())
    }
}

/// LIKE 通配符转义（默认转义符为反斜杠）
fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// PostgreSQL 后端：`resources(key, value)` 单表，事务隔离级别 REPEATABLE READ。
///
/// 连接池上限由信号量控制；事务持有 permit 直到 commit/abort 归还连接。
pub struct PgDriver {
    dsn: String,
    idle: Arc<Mutex<Vec<Client>>>,
    permits: Arc<Semaphore>,
}

impl PgDriver {
    pub fn new(dsn: &str, pool_size: usize) -> Self {
        Self {
            dsn: dsn.to_string(),
            idle: Arc::new(Mutex::new(Vec::new())),
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    async fn connect(&self) -> Result<Client, KvError> {
        let (client, connection) = tokio_postgres::connect(&self.dsn, NoTls)
            .await
            .map_err(classify)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("Postgres connection closed: {}", e);
            }
        });
        Ok(client)
    }

    async fn checkout(&self) -> Result<(Client, OwnedSemaphorePermit), KvError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| KvError::Backend("connection pool closed".into()))?;
        let reused = {
            let mut idle = self.idle.lock();
            loop {
                match idle.pop() {
                    Some(c) if c.is_closed() => continue,
                    other => break other,
                }
            }
        };
        let client = match reused {
            Some(c) => c,
            None => self.connect().await?,
        };
        Ok((client, permit))
    }
}

#[async_trait]
impl Driver for PgDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn open(&self, read_only: bool) -> Result<Box<dyn Transaction>, KvError> {
        let (client, permit) = self.checkout().await?;
        let begin = if read_only {
            "BEGIN READ ONLY ISOLATION LEVEL REPEATABLE READ"
        } else {
            "BEGIN ISOLATION LEVEL REPEATABLE READ"
        };
        client.batch_execute(begin).await.map_err(classify)?;
        Ok(Box::new(Retrying::new(PgTransaction {
            client: Some(client),
            idle: self.idle.clone(),
            _permit: permit,
        })))
    }

    async fn initialize(&self) -> Result<(), KvError> {
        let (client, _permit) = self.checkout().await?;
        client.batch_execute(CREATE_TABLE).await.map_err(classify)?;
        self.idle.lock().push(client);
        Ok(())
    }

    async fn finalize(&self) -> Result<(), KvError> {
        self.idle.lock().clear();
        Ok(())
    }
}

struct PgTransaction {
    client: Option<Client>,
    idle: Arc<Mutex<Vec<Client>>>,
    _permit: OwnedSemaphorePermit,
}

impl PgTransaction {
    fn client(&self) -> Result<&Client, KvError> {
        self.client.as_ref().ok_or(KvError::Closed)
    }

    async fn finish(&mut self, stmt: &str) -> Result<(), KvError> {
        let client = self.client.take().ok_or(KvError::Closed)?;
        let res = client.batch_execute(stmt).await.map_err(classify);
        if !client.is_closed() {
            self.idle.lock().push(client);
        }
        res
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let row = self
            .client()?
            .query_opt("SELECT value FROM resources WHERE key = $1", &[&key])
            .await
            .map_err(classify)?;
        Ok(row.map(|r| r.get::<_, Vec<u8>>(0)))
    }

    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.client()?
            .execute(
                "INSERT INTO resources (key, value) VALUES ($1, $2) \
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                &[&key, &value],
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), KvError> {
        self.client()?
            .execute("DELETE FROM resources WHERE key = $1", &[&key])
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn scan(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let pattern = like_prefix(prefix);
        let rows = self
            .client()?
            .query(SCAN, &[&pattern])
            .await
            .map_err(classify)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, Vec<u8>>(1)))
            .collect())
    }

    async fn scan_keys(
        &mut self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        let pattern = like_prefix(prefix);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client()?
            .query(SCAN_KEYS, &[&pattern, &start_after, &limit])
            .await
            .map_err(classify)?;
        Ok(rows.into_iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn commit(&mut self) -> Result<(), KvError> {
        self.finish("COMMIT").await
    }

    async fn abort(&mut self) -> Result<(), KvError> {
        if self.client.is_none() {
            return Ok(());
        }
        self.finish("ROLLBACK").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("/kbs/a_b%/"), "/kbs/a\\_b\\%/%");
    }

    #[test]
    fn key_order_is_bytewise() {
        assert!(CREATE_TABLE.contains("key TEXT COLLATE \"C\""));
        for sql in [SCAN, SCAN_KEYS] {
            assert!(sql.contains("ORDER BY key COLLATE \"C\""), "{sql}");
        }
        assert!(SCAN_KEYS.contains("key > $2 COLLATE \"C\""));
    }
}
