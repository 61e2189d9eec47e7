use serde::{Deserialize, Serialize};

use crate::error::KvError;
use crate::meta::{get_json, keys, set_json};
use crate::storage::Txn;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalMigrationInfo {
    pub current_version: u32,
    pub target_version: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KbMigrationInfo {
    pub current_version: u32,
}

/// 从未迁移过的部署视为版本 0
pub async fn get_global(txn: &mut Txn) -> Result<GlobalMigrationInfo, KvError> {
    Ok(get_json(txn, keys::MIGRATIONS_GLOBAL).await?.unwrap_or_default())
}

pub async fn set_global(txn: &mut Txn, info: &GlobalMigrationInfo) -> Result<(), KvError> {
    set_json(txn, keys::MIGRATIONS_GLOBAL, info).await
}

pub async fn get_kb(txn: &mut Txn, kbid: &str) -> Result<KbMigrationInfo, KvError> {
    Ok(get_json(txn, &keys::kb_migration(kbid)).await?.unwrap_or_default())
}

pub async fn set_kb(txn: &mut Txn, kbid: &str, info: &KbMigrationInfo) -> Result<(), KvError> {
    set_json(txn, &keys::kb_migration(kbid), info).await
}

pub async fn delete_kb(txn: &mut Txn, kbid: &str) -> Result<(), KvError> {
    txn.delete(&keys::kb_migration(kbid)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Driver, LocalDriver};

    #[tokio::test]
    async fn missing_records_default_to_zero() {
        let driver = LocalDriver::in_memory();
        let mut txn = driver.begin(false).await.unwrap();
        assert_eq!(get_global(&mut txn).await.unwrap().current_version, 0);
        assert_eq!(get_kb(&mut txn, "kb").await.unwrap().current_version, 0);

        set_kb(&mut txn, "kb", &KbMigrationInfo { current_version: 3 }).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = driver.begin(true).await.unwrap();
        assert_eq!(get_kb(&mut txn, "kb").await.unwrap().current_version, 3);
    }
}
