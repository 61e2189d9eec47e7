//! KV key 布局。前缀一律以 `/` 结尾，避免 `kb1` 的扫描命中 `kb10`。

use crate::core::IndexKind;

pub const KBS_PREFIX: &str = "/kbs/";
pub const MIGRATIONS_GLOBAL: &str = "/migrations/global";

pub fn kb(kbid: &str) -> String {
    format!("/kbs/{kbid}")
}

pub fn kb_prefix(kbid: &str) -> String {
    format!("/kbs/{kbid}/")
}

pub fn kb_slug(slug: &str) -> String {
    format!("/kbslugs/{slug}")
}

pub fn shards(kbid: &str, kind: IndexKind) -> String {
    format!("/kbs/{kbid}/shards/{kind}")
}

pub fn shards_prefix(kbid: &str) -> String {
    format!("/kbs/{kbid}/shards/")
}

pub fn rollover(kbid: &str, kind: IndexKind) -> String {
    format!("/kbs/{kbid}/rollover/{kind}")
}

pub fn rollover_prefix(kbid: &str) -> String {
    format!("/kbs/{kbid}/rollover/")
}

pub fn resource(kbid: &str, rid: &str) -> String {
    format!("/kbs/{kbid}/resources/{rid}")
}

pub fn resources_prefix(kbid: &str) -> String {
    format!("/kbs/{kbid}/resources/")
}

pub fn worker_offset(worker: &str, partition: &str) -> String {
    format!("/internal/worker/{worker}/{partition}")
}

pub fn worker_prefix(worker: &str) -> String {
    format!("/internal/worker/{worker}/")
}

pub fn kb_migration(kbid: &str) -> String {
    format!("/migrations/kb/{kbid}")
}

pub fn lock(name: &str) -> String {
    format!("/locks/{name}")
}
