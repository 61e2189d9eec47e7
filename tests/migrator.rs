use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kb_control::cluster::{ClusterManager, IndexNode, NodeRegistry};
use kb_control::config::{ClusterSettings, MigratorSettings, RolloverSettings};
use kb_control::core::{IndexKind, ResourceRepr};
use kb_control::engine::memory::MemoryConnector;
use kb_control::error::MigrationError;
use kb_control::lifecycle;
use kb_control::meta;
use kb_control::meta::kb::KbRecord;
use kb_control::migrator::{
    builtin_registry, Migration, MigrationContext, MigrationRegistry, Migrator, LOCK_NAME,
};
use kb_control::resources::KvResourceStore;
use kb_control::rollover::RolloverOrchestrator;
use kb_control::storage::{Driver, LocalDriver};

#[derive(Default)]
struct Calls {
    global: AtomicUsize,
    kb: AtomicUsize,
}

/// 计数迁移；`fail_kb` 命中时该 KB 的迁移失败，`fail_global` 打开时全局迁移失败
struct Counting {
    version: u32,
    calls: Arc<Calls>,
    fail_kb: Option<String>,
    fail_global: Arc<AtomicBool>,
}

#[async_trait]
impl Migration for Counting {
    fn version(&self) -> u32 {
        self.version
    }

    fn name(&self) -> &str {
        "counting"
    }

    async fn migrate(&self, _ctx: &MigrationContext) -> anyhow::Result<()> {
        if self.fail_global.load(Ordering::SeqCst) {
            anyhow::bail!("global step {} broken", self.version);
        }
        self.calls.global.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn migrate_kb(&self, _ctx: &MigrationContext, kbid: &str) -> anyhow::Result<()> {
        if self.fail_kb.as_deref() == Some(kbid) {
            anyhow::bail!("kb step {} broken for {}", self.version, kbid);
        }
        self.calls.kb.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Setup {
    driver: Arc<dyn Driver>,
    calls: Arc<Calls>,
    kbids: Vec<String>,
}

async fn setup(kbs: usize) -> Setup {
    let driver: Arc<dyn Driver> = Arc::new(LocalDriver::in_memory());
    let mut kbids = Vec::new();
    let mut txn = driver.begin(false).await.unwrap();
    for i in 0..kbs {
        let kb = KbRecord::new(&format!("kb-{i}"));
        meta::kb::put(&mut txn, &kb).await.unwrap();
        kbids.push(kb.kbid);
    }
    txn.commit().await.unwrap();
    kbids.sort();
    Setup {
        driver,
        calls: Arc::new(Calls::default()),
        kbids,
    }
}

fn migrator(
    s: &Setup,
    versions: &[u32],
    fail_kb: Option<&str>,
    fail_global: Arc<AtomicBool>,
) -> Migrator {
    let mut registry = MigrationRegistry::new();
    for v in versions {
        registry
            .register(Arc::new(Counting {
                version: *v,
                calls: s.calls.clone(),
                // 只让最后一个版本失败
                fail_kb: fail_kb.filter(|_| Some(v) == versions.last()).map(str::to_string),
                fail_global: if Some(v) == versions.last() {
                    fail_global.clone()
                } else {
                    Arc::new(AtomicBool::new(false))
                },
            }))
            .unwrap();
    }
    let ctx = MigrationContext {
        driver: s.driver.clone(),
        rollover: None,
    };
    let settings = MigratorSettings {
        max_concurrent: 2,
        lock_ttl_secs: 60,
    };
    Migrator::new(ctx, registry, settings)
}

/// `migrate_kb` 睡眠 `delay`，用来占住锁
struct Slow {
    delay: Duration,
}

#[async_trait]
impl Migration for Slow {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> &str {
        "slow"
    }

    async fn migrate_kb(&self, _ctx: &MigrationContext, _kbid: &str) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

fn slow_migrator(s: &Setup, delay: Duration, lock_ttl_secs: u64) -> Migrator {
    let mut registry = MigrationRegistry::new();
    registry.register(Arc::new(Slow { delay })).unwrap();
    let ctx = MigrationContext {
        driver: s.driver.clone(),
        rollover: None,
    };
    let settings = MigratorSettings {
        max_concurrent: 1,
        lock_ttl_secs,
    };
    Migrator::new(ctx, registry, settings)
}

async fn kb_version(driver: &Arc<dyn Driver>, kbid: &str) -> u32 {
    let mut txn = driver.begin(true).await.unwrap();
    meta::migrations::get_kb(&mut txn, kbid).await.unwrap().current_version
}

#[tokio::test]
async fn second_run_makes_no_calls() {
    let s = setup(3).await;
    let never = Arc::new(AtomicBool::new(false));

    let report = migrator(&s, &[1, 2], None, never.clone()).run(None).await.unwrap();
    assert_eq!(report.target, 2);
    assert_eq!(report.global_applied, vec![1, 2]);
    assert_eq!(report.kbs_migrated, 3);
    assert!(report.kb_failures.is_empty());
    assert_eq!(s.calls.global.load(Ordering::SeqCst), 2);
    assert_eq!(s.calls.kb.load(Ordering::SeqCst), 6);

    let report = migrator(&s, &[1, 2], None, never).run(None).await.unwrap();
    assert!(report.global_applied.is_empty());
    assert_eq!(report.kbs_migrated, 0);
    assert_eq!(s.calls.global.load(Ordering::SeqCst), 2);
    assert_eq!(s.calls.kb.load(Ordering::SeqCst), 6);
    for kbid in &s.kbids {
        assert_eq!(kb_version(&s.driver, kbid).await, 2);
    }
}

#[tokio::test]
async fn failing_kb_stops_at_last_version_others_continue() {
    let s = setup(3).await;
    let bad = s.kbids[1].clone();
    let never = Arc::new(AtomicBool::new(false));

    let report = migrator(&s, &[1, 2], Some(&bad), never.clone())
        .run(None)
        .await
        .unwrap();
    assert_eq!(report.kb_failures.len(), 1);
    assert_eq!(report.kb_failures[0].0, bad);
    assert_eq!(report.kbs_migrated, 2);
    assert_eq!(kb_version(&s.driver, &bad).await, 1);
    for kbid in s.kbids.iter().filter(|k| **k != bad) {
        assert_eq!(kb_version(&s.driver, kbid).await, 2);
    }

    // 修复后重跑：只有失败的 KB 补上最后一个迁移
    let before = s.calls.kb.load(Ordering::SeqCst);
    let report = migrator(&s, &[1, 2], None, never).run(None).await.unwrap();
    assert_eq!(report.kbs_migrated, 1);
    assert_eq!(s.calls.kb.load(Ordering::SeqCst), before + 1);
    assert_eq!(kb_version(&s.driver, &bad).await, 2);
}

#[tokio::test]
async fn failing_global_migration_keeps_last_committed_version() {
    let s = setup(1).await;
    let broken = Arc::new(AtomicBool::new(true));

    let err = migrator(&s, &[1, 2, 3], None, broken.clone())
        .run(None)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Failed { version: 3, .. }));

    let mut txn = s.driver.begin(true).await.unwrap();
    let info = meta::migrations::get_global(&mut txn).await.unwrap();
    assert_eq!(info.current_version, 2);
    assert_eq!(info.target_version, Some(3));
    drop(txn);
    // KB 迁移没有开始
    assert_eq!(s.calls.kb.load(Ordering::SeqCst), 0);

    broken.store(false, Ordering::SeqCst);
    let report = migrator(&s, &[1, 2, 3], None, broken).run(None).await.unwrap();
    assert_eq!(report.global_applied, vec![3]);
    assert_eq!(s.calls.global.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn partial_target_then_rest() {
    let s = setup(2).await;
    let never = Arc::new(AtomicBool::new(false));

    let report = migrator(&s, &[1, 2, 3], None, never.clone())
        .run(Some(1))
        .await
        .unwrap();
    assert_eq!(report.global_applied, vec![1]);
    assert_eq!(kb_version(&s.driver, &s.kbids[0]).await, 1);

    let report = migrator(&s, &[1, 2, 3], None, never).run(None).await.unwrap();
    assert_eq!(report.global_applied, vec![2, 3]);
    assert_eq!(s.calls.kb.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn held_lock_rejects_second_runner() {
    let s = setup(1).await;
    let guard = meta::locks::acquire(s.driver.as_ref(), LOCK_NAME, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let err = migrator(&s, &[1], None, Arc::new(AtomicBool::new(false)))
        .run(None)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Locked(_)));
    assert_eq!(s.calls.global.load(Ordering::SeqCst), 0);

    meta::locks::release(s.driver.as_ref(), guard).await.unwrap();
    migrator(&s, &[1], None, Arc::new(AtomicBool::new(false)))
        .run(None)
        .await
        .unwrap();
    // 运行结束后锁已释放
    assert!(
        meta::locks::acquire(s.driver.as_ref(), LOCK_NAME, Duration::from_secs(60))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn lock_is_kept_alive_past_its_ttl() {
    let s = setup(1).await;
    let first = slow_migrator(&s, Duration::from_millis(1500), 1);
    let second = slow_migrator(&s, Duration::ZERO, 1);

    let (r1, r2) = tokio::join!(first.run(None), async {
        tokio::time::sleep(Duration::from_millis(1100)).await;
        second.run(None).await
    });
    let report = r1.unwrap();
    assert_eq!(report.kbs_migrated, 1);
    assert!(matches!(r2, Err(MigrationError::Locked(_))), "{r2:?}");
    assert_eq!(kb_version(&s.driver, &s.kbids[0]).await, 1);
}

#[tokio::test]
async fn lost_lock_stops_the_run() {
    let s = setup(1).await;
    let m = slow_migrator(&s, Duration::from_secs(5), 1);

    let (res, ()) = tokio::join!(m.run(None), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let record = meta::locks::LockRecord {
            holder: "someone-else".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(60),
        };
        let mut txn = s.driver.begin(false).await.unwrap();
        txn.set(&meta::keys::lock(LOCK_NAME), serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();
        txn.commit().await.unwrap();
    });
    assert!(matches!(res, Err(MigrationError::Locked(_))), "{res:?}");
    // 中止的 KB 没有写回版本
    assert_eq!(kb_version(&s.driver, &s.kbids[0]).await, 0);

    // 他人的锁不会被释放
    let mut txn = s.driver.begin(true).await.unwrap();
    let raw = txn.get(&meta::keys::lock(LOCK_NAME)).await.unwrap().unwrap();
    let current: meta::locks::LockRecord = serde_json::from_slice(&raw).unwrap();
    assert_eq!(current.holder, "someone-else");
}

#[tokio::test]
async fn interrupted_run_releases_lock() {
    let s = setup(1).await;
    let m = slow_migrator(&s, Duration::from_secs(5), 60);

    let err = m
        .run_until(None, tokio::time::sleep(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Interrupted));
    assert!(
        meta::locks::acquire(s.driver.as_ref(), LOCK_NAME, Duration::from_secs(60))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn builtin_migrations_roll_every_kb_over() {
    let driver: Arc<dyn Driver> = Arc::new(LocalDriver::in_memory());
    let registry = Arc::new(NodeRegistry::new());
    registry.announce(IndexNode::new("a", "a"));
    let connector = Arc::new(MemoryConnector::new());
    let cluster = Arc::new(ClusterManager::new(
        registry.clone(),
        connector.clone(),
        ClusterSettings {
            replicas: 1,
            ..ClusterSettings::default()
        },
    ));
    let store = Arc::new(KvResourceStore::new(driver.clone()));

    let kb = lifecycle::create_kb(
        driver.as_ref(),
        &cluster,
        "docs",
        &[IndexKind::Paragraphs, IndexKind::Vectors],
    )
    .await
    .unwrap();
    for i in 0..5 {
        let r = ResourceRepr {
            rid: format!("r{i}"),
            body: serde_json::json!({}),
        };
        store.put(&kb.kbid, &r).await.unwrap();
    }
    // slug 索引缺失，模拟 v1 之前创建的 KB
    let mut txn = driver.begin(false).await.unwrap();
    meta::kb::delete_slug(&mut txn, "docs").await.unwrap();
    txn.commit().await.unwrap();

    let before: HashSet<String> = connector.engine("a").shard_ids().into_iter().collect();
    assert_eq!(before.len(), 2);

    let rollover = Arc::new(RolloverOrchestrator::new(
        driver.clone(),
        cluster,
        store,
        RolloverSettings::default(),
    ));
    let ctx = MigrationContext {
        driver: driver.clone(),
        rollover: Some(rollover),
    };
    let report = Migrator::new(ctx, builtin_registry(true).unwrap(), MigratorSettings::default())
        .run(None)
        .await
        .unwrap();
    assert_eq!(report.target, 2);
    assert!(report.kb_failures.is_empty(), "{:?}", report.kb_failures);
    assert_eq!(report.kbs_migrated, 1);

    let mut txn = driver.begin(true).await.unwrap();
    assert_eq!(meta::kb::get_slug(&mut txn, "docs").await.unwrap(), Some(kb.kbid.clone()));
    let groups = meta::shards::list_active(&mut txn, &kb.kbid).await.unwrap();
    drop(txn);

    let after: HashSet<String> = connector.engine("a").shard_ids().into_iter().collect();
    assert_eq!(after.len(), 2);
    assert!(after.is_disjoint(&before));
    for g in groups {
        let shard = &g.replicas[0].shard;
        assert!(after.contains(shard));
        assert_eq!(connector.engine("a").resource_count(shard), Some(5));
    }
    assert_eq!(kb_version(&driver, &kb.kbid).await, 2);
}
