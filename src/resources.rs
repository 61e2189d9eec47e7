use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{ResourceId, ResourceRepr};
use crate::meta;
use crate::storage::Driver;

/// 资源来源：迁移时按 id 顺序分页读取 KB 的资源并生成可索引表示
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// id 严格大于 `after` 的前 `limit` 个资源，按 id 升序
    async fn list_resources(
        &self,
        kbid: &str,
        after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<ResourceId>>;

    /// 资源已被删除时返回 None（迁移跳过它）
    async fn indexable(&self, kbid: &str, rid: &str) -> anyhow::Result<Option<ResourceRepr>>;
}

/// 资源直接存放在 KV 的 `/kbs/{kbid}/resources/{rid}` 下
pub struct KvResourceStore {
    driver: Arc<dyn Driver>,
}

impl KvResourceStore {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    pub async fn put(&self, kbid: &str, resource: &ResourceRepr) -> anyhow::Result<()> {
        let mut txn = self.driver.begin(false).await?;
        meta::resources::put(&mut txn, kbid, resource).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, kbid: &str, rid: &str) -> anyhow::Result<()> {
        let mut txn = self.driver.begin(false).await?;
        meta::resources::delete(&mut txn, kbid, rid).await?;
        txn.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for KvResourceStore {
    async fn list_resources(
        &self,
        kbid: &str,
        after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<ResourceId>> {
        let mut txn = self.driver.begin(true).await?;
        let ids = meta::resources::list_ids(&mut txn, kbid, after, limit).await?;
        txn.commit().await?;
        Ok(ids)
    }

    async fn indexable(&self, kbid: &str, rid: &str) -> anyhow::Result<Option<ResourceRepr>> {
        let mut txn = self.driver.begin(true).await?;
        let res = meta::resources::get(&mut txn, kbid, rid).await?;
        txn.commit().await?;
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalDriver;

    #[tokio::test]
    async fn deleted_resource_is_not_indexable() {
        let store = KvResourceStore::new(Arc::new(LocalDriver::in_memory()));
        let r = ResourceRepr { rid: "r1".into(), body: serde_json::json!({"title": "t"}) };
        store.put("kb", &r).await.unwrap();
        assert_eq!(store.indexable("kb", "r1").await.unwrap(), Some(r));
        assert_eq!(store.list_resources("kb", None, 10).await.unwrap(), vec!["r1"]);

        store.delete("kb", "r1").await.unwrap();
        assert_eq!(store.indexable("kb", "r1").await.unwrap(), None);
    }
}
