use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{MigrationError, RolloverError};
use crate::meta;
use crate::migrator::{Migration, MigrationContext, MigrationRegistry};

/// v1：为每个 KB 回填 `/kbslugs/{slug}` 查找键
pub struct KbSlugIndex;

#[async_trait]
impl Migration for KbSlugIndex {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> &str {
        "kb_slug_index"
    }

    async fn migrate_kb(&self, ctx: &MigrationContext, kbid: &str) -> anyhow::Result<()> {
        let mut txn = ctx.driver.begin(false).await?;
        let Some(record) = meta::kb::get(&mut txn, kbid).await? else {
            return Ok(());
        };
        match meta::kb::get_slug(&mut txn, &record.slug).await? {
            Some(owner) if owner == kbid => return Ok(()),
            Some(owner) => {
                tracing::warn!(
                    "Slug {:?} of kb {} already points at kb {}, leaving it",
                    record.slug,
                    kbid,
                    owner
                );
                return Ok(());
            }
            None => meta::kb::set_slug(&mut txn, &record.slug, kbid).await?,
        }
        txn.commit().await?;
        Ok(())
    }
}

/// v2：对 KB 的每个活跃索引做一次 rollover（部署级索引格式升级）
pub struct RolloverShards;

#[async_trait]
impl Migration for RolloverShards {
    fn version(&self) -> u32 {
        2
    }

    fn name(&self) -> &str {
        "rollover_shards"
    }

    async fn migrate_kb(&self, ctx: &MigrationContext, kbid: &str) -> anyhow::Result<()> {
        let rollover = ctx
            .rollover
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("rollover_shards needs a cluster connection"))?;

        let mut txn = ctx.driver.begin(true).await?;
        let groups = meta::shards::list_active(&mut txn, kbid).await?;
        txn.commit().await?;

        for group in groups {
            let status = match rollover.run(kbid, group.kind).await {
                // 上一次运行中断留下的 rollover：接着做完
                Err(RolloverError::InProgress { .. }) => rollover.resume(kbid, group.kind).await?,
                other => other?,
            };
            tracing::info!(
                "Kb {} {} rolled over: {} resources, state {}",
                kbid,
                group.kind,
                status.indexed,
                status.state
            );
        }
        Ok(())
    }
}

/// 内置迁移。`with_rollover` 为 false 时只注册纯元数据迁移（没有集群可用的场景）。
pub fn builtin_registry(with_rollover: bool) -> Result<MigrationRegistry, MigrationError> {
    let mut registry = MigrationRegistry::new();
    registry.register(Arc::new(KbSlugIndex))?;
    if with_rollover {
        registry.register(Arc::new(RolloverShards))?;
    }
    Ok(registry)
}
