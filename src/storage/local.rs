use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::KvError;
use crate::storage::snapshot::SnapshotStore;
use crate::storage::wal::{CommitLog, CommitRecord};
use crate::storage::{overlay_keys, pending_deletes, Driver, Transaction};

/// 默认每多少次提交把日志压实成快照
pub const DEFAULT_COMPACT_EVERY: u64 = 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Entry {
    value: Vec<u8>,
    /// 最后一次写入该 key 的提交序号（用于乐观冲突检测）
    version: u64,
}

/// 已提交状态：copy-on-write，经 ArcSwap 原子发布
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct KvState {
    data: BTreeMap<String, Entry>,
    version: u64,
}

impl KvState {
    fn version_of(&self, key: &str) -> u64 {
        self.data.get(key).map(|e| e.version).unwrap_or(0)
    }

    fn apply(&mut self, rec: &CommitRecord) {
        for (key, value) in &rec.writes {
            match value {
                Some(v) => {
                    self.data.insert(
                        key.clone(),
                        Entry {
                            value: v.clone(),
                            version: rec.version,
                        },
                    );
                }
                None => {
                    self.data.remove(key);
                }
            }
        }
        self.version = rec.version;
    }

    fn prefix_range<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        self.data
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
    }
}

struct Persistence {
    log: CommitLog,
    snapshot: SnapshotStore,
    since_snapshot: AtomicU64,
    compact_every: u64,
}

impl Persistence {
    /// 提交日志先行落盘；达到阈值时把已发布状态压实为快照并清空日志。
    /// 日志落盘即提交持久：压实失败只告警，计数不清零，下一次提交再试。
    fn record(&self, rec: &CommitRecord, next: &KvState) -> anyhow::Result<()> {
        self.log.append(rec)?;
        let n = self.since_snapshot.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= self.compact_every {
            if let Err(e) = self.compact(next) {
                tracing::warn!(
                    "Local KV compaction failed at version {}, keeping the commit log: {:#}",
                    next.version,
                    e
                );
            }
        }
        Ok(())
    }

    fn compact(&self, state: &KvState) -> anyhow::Result<()> {
        let bytes = self.snapshot.write_atomic(state)?;
        self.log.reset()?;
        self.since_snapshot.store(0, Ordering::Relaxed);
        tracing::info!(
            "Local KV compacted: {} keys, version {}, {} bytes",
            state.data.len(),
            state.version,
            bytes
        );
        Ok(())
    }
}

struct Shared {
    state: ArcSwap<KvState>,
    commit_lock: Mutex<()>,
    persist: Option<Persistence>,
}

/// 内存 / 本地文件 KV 后端。
///
/// 事务在 begin 时拿到已发布状态的 Arc 快照，写入缓存在事务内；
/// commit 在提交锁内校验读写集合的版本未被其他提交改动（first-committer-wins），
/// 然后生成新状态并原子发布。带数据目录时，每次提交先写提交日志再发布。
#[derive(Clone)]
pub struct LocalDriver {
    shared: Arc<Shared>,
}

impl LocalDriver {
    pub fn in_memory() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: ArcSwap::from_pointee(KvState::default()),
                commit_lock: Mutex::new(()),
                persist: None,
            }),
        }
    }

    /// 打开本地目录：加载快照 + 回放提交日志，然后立即压实（丢弃可能的截断尾部）
    pub fn open_dir(dir: PathBuf, compact_every: u64) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let snapshot = SnapshotStore::new(dir.join("kv.snap"));
        let log = CommitLog::open(dir.join("commits.log"))?;

        let mut state: KvState = snapshot.load_if_valid()?.unwrap_or_default();
        let base_version = state.version;
        let replay = log.replay()?;
        let mut replayed = 0usize;
        for rec in &replay.records {
            if rec.version <= state.version {
                continue;
            }
            state.apply(rec);
            replayed += 1;
        }
        tracing::info!(
            "Local KV opened at {:?}: snapshot version {}, replayed {} commits, dropped {} torn records",
            dir,
            base_version,
            replayed,
            replay.truncated_tail_records
        );

        let persist = Persistence {
            log,
            snapshot,
            since_snapshot: AtomicU64::new(0),
            compact_every: compact_every.max(1),
        };
        if !replay.records.is_empty() || replay.truncated_tail_records > 0 {
            persist.compact(&state)?;
        }

        Ok(Self {
            shared: Arc::new(Shared {
                state: ArcSwap::from_pointee(state),
                commit_lock: Mutex::new(()),
                persist: Some(persist),
            }),
        })
    }
}

#[async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        if self.shared.persist.is_some() {
            "local-file"
        } else {
            "memory"
        }
    }

    async fn open(&self, _read_only: bool) -> Result<Box<dyn Transaction>, KvError> {
        Ok(Box::new(LocalTransaction {
            snapshot: self.shared.state.load_full(),
            writes: BTreeMap::new(),
            reads: HashMap::new(),
            scanned: Vec::new(),
            shared: self.shared.clone(),
            finished: false,
        }))
    }

    async fn finalize(&self) -> Result<(), KvError> {
        if let Some(p) = &self.shared.persist {
            let _g = self.shared.commit_lock.lock();
            p.compact(&self.shared.state.load())
                .map_err(|e| KvError::Backend(format!("compaction failed: {e:#}")))?;
        }
        Ok(())
    }
}

struct LocalTransaction {
    snapshot: Arc<KvState>,
    /// None = 删除
    writes: BTreeMap<String, Option<Vec<u8>>>,
    /// 读到的 key -> 快照中的版本（0 表示不存在）
    reads: HashMap<String, u64>,
    scanned: Vec<String>,
    shared: Arc<Shared>,
    finished: bool,
}

impl LocalTransaction {
    fn ensure_open(&self) -> Result<(), KvError> {
        if self.finished {
            return Err(KvError::Closed);
        }
        Ok(())
    }

    fn validate(&self, current: &KvState) -> Result<(), KvError> {
        for key in self.reads.keys().chain(self.writes.keys()) {
            if current.version_of(key) != self.snapshot.version_of(key) {
                return Err(KvError::Conflict(format!("key {key} changed concurrently")));
            }
        }
        for prefix in &self.scanned {
            let before = self.snapshot.prefix_range(prefix).map(|(k, e)| (k, e.version));
            let after = current.prefix_range(prefix).map(|(k, e)| (k, e.version));
            if !before.eq(after) {
                return Err(KvError::Conflict(format!(
                    "range {prefix} changed concurrently"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for LocalTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.ensure_open()?;
        if let Some(w) = self.writes.get(key) {
            return Ok(w.clone());
        }
        let entry = self.snapshot.data.get(key);
        self.reads
            .insert(key.to_string(), entry.map(|e| e.version).unwrap_or(0));
        Ok(entry.map(|e| e.value.clone()))
    }

    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.ensure_open()?;
        self.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), KvError> {
        self.ensure_open()?;
        self.writes.insert(key.to_string(), None);
        Ok(())
    }

    async fn scan(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        self.ensure_open()?;
        let mut merged: BTreeMap<String, Vec<u8>> = self
            .snapshot
            .prefix_range(prefix)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        for (k, w) in self
            .writes
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match w {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        self.scanned.push(prefix.to_string());
        Ok(merged.into_iter().collect())
    }

    async fn scan_keys(
        &mut self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        self.ensure_open()?;
        let lower = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after),
            _ => Bound::Included(prefix),
        };
        let fetch = limit.saturating_add(pending_deletes(&self.writes, prefix, start_after));
        let committed: Vec<String> = self
            .snapshot
            .data
            .range::<str, _>((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(fetch)
            .map(|(k, _)| k.clone())
            .collect();
        self.scanned.push(prefix.to_string());
        Ok(overlay_keys(committed, &self.writes, prefix, start_after, limit))
    }

    async fn commit(&mut self) -> Result<(), KvError> {
        self.ensure_open()?;
        self.finished = true;
        if self.writes.is_empty() {
            return Ok(());
        }

        let _g = self.shared.commit_lock.lock();
        let current = self.shared.state.load_full();
        self.validate(&current)?;

        let rec = CommitRecord {
            version: current.version + 1,
            writes: std::mem::take(&mut self.writes).into_iter().collect(),
        };
        let mut next = (*current).clone();
        next.apply(&rec);

        if let Some(p) = &self.shared.persist {
            p.record(&rec, &next)
                .map_err(|e| KvError::Backend(format!("commit log write failed: {e:#}")))?;
        }
        self.shared.state.store(Arc::new(next));
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), KvError> {
        self.finished = true;
        self.writes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("kb-control-local-{}-{}", tag, nanos))
    }

    #[tokio::test]
    async fn snapshot_isolation_and_conflict() {
        let driver = LocalDriver::in_memory();

        let mut seed = driver.begin(false).await.unwrap();
        seed.set("/k", b"0".to_vec()).await.unwrap();
        seed.commit().await.unwrap();

        let mut a = driver.begin(false).await.unwrap();
        let mut b = driver.begin(false).await.unwrap();
        assert_eq!(a.get("/k").await.unwrap(), Some(b"0".to_vec()));
        assert_eq!(b.get("/k").await.unwrap(), Some(b"0".to_vec()));
        a.set("/k", b"a".to_vec()).await.unwrap();
        b.set("/k", b"b".to_vec()).await.unwrap();

        a.commit().await.unwrap();
        assert!(matches!(b.commit().await, Err(KvError::Conflict(_))));

        let mut r = driver.begin(true).await.unwrap();
        assert_eq!(r.get("/k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn reader_keeps_its_snapshot() {
        let driver = LocalDriver::in_memory();
        let mut reader = driver.begin(true).await.unwrap();

        let mut w = driver.begin(false).await.unwrap();
        w.set("/x", b"1".to_vec()).await.unwrap();
        w.commit().await.unwrap();

        assert_eq!(reader.get("/x").await.unwrap(), None);
        assert!(reader.scan("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_merges_own_writes_in_key_order() {
        let driver = LocalDriver::in_memory();
        let mut seed = driver.begin(false).await.unwrap();
        seed.set("/p/b", b"b".to_vec()).await.unwrap();
        seed.set("/p/c", b"c".to_vec()).await.unwrap();
        seed.set("/q/a", b"x".to_vec()).await.unwrap();
        seed.commit().await.unwrap();

        let mut t = driver.begin(false).await.unwrap();
        t.set("/p/a", b"a".to_vec()).await.unwrap();
        t.delete("/p/c").await.unwrap();
        let keys: Vec<String> = t.scan("/p/").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["/p/a".to_string(), "/p/b".to_string()]);
    }

    #[tokio::test]
    async fn phantom_insert_into_scanned_range_conflicts() {
        let driver = LocalDriver::in_memory();
        let mut a = driver.begin(false).await.unwrap();
        assert!(a.scan("/locks/").await.unwrap().is_empty());
        a.set("/count", b"0".to_vec()).await.unwrap();

        let mut b = driver.begin(false).await.unwrap();
        b.set("/locks/x", b"1".to_vec()).await.unwrap();
        b.commit().await.unwrap();

        assert!(matches!(a.commit().await, Err(KvError::Conflict(_))));
    }

    #[tokio::test]
    async fn reopen_recovers_commits() {
        let dir = unique_tmp_dir("reopen");
        {
            let driver = LocalDriver::open_dir(dir.clone(), 2).unwrap();
            for i in 0..5u8 {
                let mut t = driver.begin(false).await.unwrap();
                t.set(&format!("/k/{i}"), vec![i]).await.unwrap();
                t.commit().await.unwrap();
            }
            let mut t = driver.begin(false).await.unwrap();
            t.delete("/k/0").await.unwrap();
            t.commit().await.unwrap();
        }

        let driver = LocalDriver::open_dir(dir, 2).unwrap();
        let mut r = driver.begin(true).await.unwrap();
        let rows = r.scan("/k/").await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], ("/k/1".to_string(), vec![1u8]));
        assert_eq!(r.scan("/").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn commit_survives_failed_compaction() {
        let dir = unique_tmp_dir("compact-fail");
        let driver = LocalDriver::open_dir(dir.clone(), 1).unwrap();
        // 临时快照路径被目录占住，压实必然失败
        let blocker = dir.join("kv.snap.tmp");
        std::fs::create_dir_all(&blocker).unwrap();

        let mut t = driver.begin(false).await.unwrap();
        t.set("/a", b"1".to_vec()).await.unwrap();
        t.commit().await.unwrap();
        let mut r = driver.begin(true).await.unwrap();
        assert_eq!(r.get("/a").await.unwrap(), Some(b"1".to_vec()));
        drop(r);
        drop(driver);

        std::fs::remove_dir_all(&blocker).unwrap();
        let reopened = LocalDriver::open_dir(dir, 1).unwrap();
        let mut r = reopened.begin(true).await.unwrap();
        assert_eq!(r.get("/a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn scan_keys_pages_past_cursor() {
        let driver = LocalDriver::in_memory();
        let mut seed = driver.begin(false).await.unwrap();
        for k in ["/p/a", "/p/b", "/p/c", "/p/d", "/pz", "/q/a"] {
            seed.set(k, b"v".to_vec()).await.unwrap();
        }
        seed.commit().await.unwrap();

        let mut t = driver.begin(false).await.unwrap();
        t.delete("/p/b").await.unwrap();
        t.set("/p/bb", b"v".to_vec()).await.unwrap();
        assert_eq!(t.scan_keys("/p/", None, 2).await.unwrap(), vec!["/p/a", "/p/bb"]);
        assert_eq!(
            t.scan_keys("/p/", Some("/p/bb"), 10).await.unwrap(),
            vec!["/p/c", "/p/d"]
        );
        assert!(t.scan_keys("/p/", Some("/p/d"), 10).await.unwrap().is_empty());
        // 游标小于前缀时从前缀起点开始
        assert_eq!(t.scan_keys("/p/", Some("/a"), 1).await.unwrap(), vec!["/p/a"]);
    }
}
