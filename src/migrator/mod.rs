//! 版本化元数据迁移。
//!
//! 迁移按 `u32` 版本全序执行：先全局命名空间，再逐个 KB。每成功一个迁移就持久化
//! 当前版本，失败时停在最后一个成功的版本，下一次运行从那里继续。

pub mod builtin;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::MigratorSettings;
use crate::core::KbId;
use crate::error::MigrationError;
use crate::meta;
use crate::meta::locks::LockGuard;
use crate::meta::migrations::{GlobalMigrationInfo, KbMigrationInfo};
use crate::rollover::RolloverOrchestrator;
use crate::storage::Driver;

pub use builtin::builtin_registry;

pub const LOCK_NAME: &str = "migrator";

/// 迁移体可用的依赖
pub struct MigrationContext {
    pub driver: Arc<dyn Driver>,
    /// 需要重建索引的迁移使用；未接入集群时为 None
    pub rollover: Option<Arc<RolloverOrchestrator>>,
}

#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> u32;
    fn name(&self) -> &str;

    async fn migrate(&self, _ctx: &MigrationContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn migrate_kb(&self, _ctx: &MigrationContext, _kbid: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<u32, Arc<dyn Migration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, migration: Arc<dyn Migration>) -> Result<(), MigrationError> {
        let version = migration.version();
        if self.migrations.contains_key(&version) {
            return Err(MigrationError::Duplicate(version));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    /// 已注册的最高版本；空注册表为 0
    pub fn latest(&self) -> u32 {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    /// `from < version <= to`，升序
    pub fn get_migrations(&self, from: u32, to: u32) -> Vec<Arc<dyn Migration>> {
        if from >= to {
            return Vec::new();
        }
        self.migrations
            .range(from + 1..=to)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MigrationReport {
    pub target: u32,
    pub global_applied: Vec<u32>,
    /// 本次至少应用了一个迁移的 KB 数
    pub kbs_migrated: usize,
    pub kb_failures: Vec<(KbId, String)>,
}

pub struct Migrator {
    ctx: Arc<MigrationContext>,
    registry: Arc<MigrationRegistry>,
    settings: MigratorSettings,
}

impl Migrator {
    pub fn new(
        ctx: MigrationContext,
        registry: MigrationRegistry,
        settings: MigratorSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(ctx),
            registry: Arc::new(registry),
            settings,
        }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// 持有分布式锁 `migrator` 运行到 `target`（缺省为最新版本，且不会超过最新版本）
    pub async fn run(&self, target: Option<u32>) -> Result<MigrationReport, MigrationError> {
        self.run_until(target, std::future::pending()).await
    }

    /// 同 `run`，`shutdown` 完成时中止并返回 `Interrupted`。
    ///
    /// 运行期间后台每 ttl/3 续租一次；锁丢失时立即中止，返回 `Locked`。
    /// 无论哪种结束方式都会释放锁，已提交的迁移版本保留。
    pub async fn run_until<F>(
        &self,
        target: Option<u32>,
        shutdown: F,
    ) -> Result<MigrationReport, MigrationError>
    where
        F: Future<Output = ()>,
    {
        let driver = self.ctx.driver.as_ref();
        let ttl = self.settings.lock_ttl();
        let lock = meta::locks::acquire(driver, LOCK_NAME, ttl)
            .await?
            .ok_or_else(|| MigrationError::Locked(LOCK_NAME.to_string()))?;

        let res = tokio::select! {
            res = self.run_locked(target) => res,
            lost = keep_alive(driver, &lock, ttl) => Err(lost),
            _ = shutdown => Err(MigrationError::Interrupted),
        };
        if let Err(e) = meta::locks::release(driver, lock).await {
            tracing::warn!("Failed to release migration lock: {}", e);
        }
        res
    }

    async fn run_locked(&self, target: Option<u32>) -> Result<MigrationReport, MigrationError> {
        let latest = self.registry.latest();
        let target = match target {
            Some(t) if t > latest => {
                tracing::warn!("Requested migration target {} clamped to {}", t, latest);
                latest
            }
            Some(t) => t,
            None => latest,
        };
        let mut report = MigrationReport {
            target,
            ..MigrationReport::default()
        };

        report.global_applied = self.migrate_global(target, latest).await?;
        self.migrate_kbs(target, latest, &mut report).await?;

        tracing::info!(
            "Migration run finished: target={} global_applied={:?} kbs_migrated={} kb_failures={}",
            target,
            report.global_applied,
            report.kbs_migrated,
            report.kb_failures.len()
        );
        Ok(report)
    }

    async fn migrate_global(&self, target: u32, latest: u32) -> Result<Vec<u32>, MigrationError> {
        let driver = self.ctx.driver.as_ref();
        let mut txn = driver.begin(false).await?;
        let mut info = meta::migrations::get_global(&mut txn).await?;
        if info.current_version > latest {
            return Err(MigrationError::AheadOfCode {
                scope: "global".to_string(),
                current: info.current_version,
                latest,
            });
        }
        info.target_version = Some(target);
        meta::migrations::set_global(&mut txn, &info).await?;
        txn.commit().await?;

        let mut applied = Vec::new();
        for m in self.registry.get_migrations(info.current_version, target) {
            tracing::info!("Applying global migration {} ({})", m.version(), m.name());
            m.migrate(&self.ctx)
                .await
                .map_err(|source| MigrationError::Failed {
                    scope: "global".to_string(),
                    version: m.version(),
                    source,
                })?;
            info.current_version = m.version();
            let mut txn = driver.begin(false).await?;
            meta::migrations::set_global(&mut txn, &info).await?;
            txn.commit().await?;
            applied.push(m.version());
        }

        let mut txn = driver.begin(false).await?;
        let done = GlobalMigrationInfo {
            current_version: info.current_version,
            target_version: None,
        };
        meta::migrations::set_global(&mut txn, &done).await?;
        txn.commit().await?;
        Ok(applied)
    }

    async fn migrate_kbs(
        &self,
        target: u32,
        latest: u32,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        let driver = self.ctx.driver.as_ref();
        let mut txn = driver.begin(true).await?;
        let kbids = meta::kb::list(&mut txn).await?;
        txn.commit().await?;
        if kbids.is_empty() {
            return Ok(());
        }
        tracing::info!(
            "Migrating {} knowledge boxes to version {} ({} concurrent)",
            kbids.len(),
            target,
            self.settings.max_concurrent
        );

        let limiter = Arc::new(Semaphore::new(self.settings.max_concurrent));
        let mut tasks = JoinSet::new();
        for kbid in kbids {
            let ctx = self.ctx.clone();
            let registry = self.registry.clone();
            let limiter = limiter.clone();
            tasks.spawn(async move {
                let res = match limiter.acquire_owned().await {
                    Ok(_permit) => migrate_kb(&ctx, &registry, &kbid, target, latest).await,
                    Err(_) => Ok(0),
                };
                (kbid, res)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(0))) => {}
                Ok((_, Ok(_))) => report.kbs_migrated += 1,
                Ok((kbid, Err(e))) => {
                    tracing::error!("Migration of kb {} failed: {}", kbid, e);
                    report.kb_failures.push((kbid, e.to_string()));
                }
                Err(e) => {
                    tracing::error!("Migration task panicked: {}", e);
                    report.kb_failures.push(("<unknown>".to_string(), e.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// 每 ttl/3 续租一次，只在锁丢失时返回。
/// 续租出错不立即放弃，连续失败超过一个 ttl 才视为丢失。
async fn keep_alive(driver: &dyn Driver, lock: &LockGuard, ttl: Duration) -> MigrationError {
    let every = (ttl / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_ok = Instant::now();
    loop {
        ticker.tick().await;
        match meta::locks::refresh(driver, lock).await {
            Ok(true) => last_ok = Instant::now(),
            Ok(false) => {
                tracing::error!("Migration lock {} lost, stopping run", lock.name());
                return MigrationError::Locked(lock.name().to_string());
            }
            Err(e) if last_ok.elapsed() >= ttl => {
                tracing::error!(
                    "Migration lock {} not refreshed for {:?}, stopping run: {}",
                    lock.name(),
                    ttl,
                    e
                );
                return MigrationError::Locked(lock.name().to_string());
            }
            Err(e) => tracing::warn!("Failed to refresh migration lock {}: {}", lock.name(), e),
        }
    }
}

/// 把一个 KB 迁移到 `target`；返回应用的迁移数
async fn migrate_kb(
    ctx: &MigrationContext,
    registry: &MigrationRegistry,
    kbid: &str,
    target: u32,
    latest: u32,
) -> Result<usize, MigrationError> {
    let driver = ctx.driver.as_ref();
    let mut txn = driver.begin(true).await?;
    let info = meta::migrations::get_kb(&mut txn, kbid).await?;
    txn.commit().await?;
    if info.current_version > latest {
        return Err(MigrationError::AheadOfCode {
            scope: format!("kb {kbid}"),
            current: info.current_version,
            latest,
        });
    }

    let mut applied = 0;
    for m in registry.get_migrations(info.current_version, target) {
        tracing::debug!("Applying migration {} ({}) to kb {}", m.version(), m.name(), kbid);
        m.migrate_kb(ctx, kbid)
            .await
            .map_err(|source| MigrationError::Failed {
                scope: format!("kb {kbid}"),
                version: m.version(),
                source,
            })?;

        let mut txn = driver.begin(false).await?;
        // KB 在迁移途中被删除：不再写回它的版本记录
        if !meta::kb::exists(&mut txn, kbid).await? {
            tracing::info!("Kb {} deleted during migration, stopping", kbid);
            return Ok(applied);
        }
        let info = KbMigrationInfo {
            current_version: m.version(),
        };
        meta::migrations::set_kb(&mut txn, kbid, &info).await?;
        txn.commit().await?;
        applied += 1;
    }
    Ok(applied)
}
