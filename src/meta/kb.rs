use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::KbId;
use crate::error::KvError;
use crate::meta::{get_json, keys, set_json};
use crate::storage::Txn;

/// `/kbs/{kbid}` 上的 KB 标记
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KbRecord {
    pub kbid: KbId,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

impl KbRecord {
    pub fn new(slug: &str) -> Self {
        Self {
            kbid: uuid::Uuid::new_v4().to_string(),
            slug: slug.to_string(),
            created_at: Utc::now(),
        }
    }
}

pub async fn get(txn: &mut Txn, kbid: &str) -> Result<Option<KbRecord>, KvError> {
    get_json(txn, &keys::kb(kbid)).await
}

pub async fn exists(txn: &mut Txn, kbid: &str) -> Result<bool, KvError> {
    Ok(txn.get(&keys::kb(kbid)).await?.is_some())
}

pub async fn put(txn: &mut Txn, record: &KbRecord) -> Result<(), KvError> {
    set_json(txn, &keys::kb(&record.kbid), record).await
}

const LIST_PAGE: usize = 64;

/// 所有 KB id（升序）。只取 `/kbs/` 的直接子 key，遇到 KB 子树整段跳过。
pub async fn list(txn: &mut Txn) -> Result<Vec<KbId>, KvError> {
    let mut ids = Vec::new();
    let mut after: Option<String> = None;
    'pages: loop {
        let page = txn
            .scan_keys(keys::KBS_PREFIX, after.as_deref(), LIST_PAGE)
            .await?;
        let full = page.len() == LIST_PAGE;
        for key in page {
            let rest = key.strip_prefix(keys::KBS_PREFIX).unwrap_or_default();
            match rest.split_once('/') {
                Some((kbid, _)) => {
                    // 子树内的 key 都小于 "{kbid}/" 后接最大字符
                    after = Some(format!("{}{kbid}/{}", keys::KBS_PREFIX, char::MAX));
                    continue 'pages;
                }
                None => {
                    if !rest.is_empty() {
                        ids.push(rest.to_string());
                    }
                    after = Some(key);
                }
            }
        }
        if !full {
            return Ok(ids);
        }
    }
}

pub async fn get_slug(txn: &mut Txn, slug: &str) -> Result<Option<KbId>, KvError> {
    get_json(txn, &keys::kb_slug(slug)).await
}

pub async fn set_slug(txn: &mut Txn, slug: &str, kbid: &str) -> Result<(), KvError> {
    set_json(txn, &keys::kb_slug(slug), &kbid).await
}

pub async fn delete_slug(txn: &mut Txn, slug: &str) -> Result<(), KvError> {
    txn.delete(&keys::kb_slug(slug)).await
}

/// 删除 KB 标记及 `/kbs/{kbid}/` 下的全部 key；返回删除的 key 数
pub async fn delete_tree(txn: &mut Txn, kbid: &str) -> Result<usize, KvError> {
    let children = txn.scan(&keys::kb_prefix(kbid)).await?;
    let mut deleted = 0;
    for (k, _) in children {
        txn.delete(&k).await?;
        deleted += 1;
    }
    if txn.get(&keys::kb(kbid)).await?.is_some() {
        txn.delete(&keys::kb(kbid)).await?;
        deleted += 1;
    }
    Ok(deleted)
}
