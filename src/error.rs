use thiserror::Error;

use crate::core::{IndexKind, KbId, NodeId};

/// KV 驱动层错误。
///
/// - `Transient`：后端网络/超时类失败，只在驱动内部出现（读操作会被有限重试）
/// - `Timeout`：重试预算耗尽后对外暴露的统一超时错误，调用方据此退避
/// - `Conflict`：乐观提交冲突，调用方需整体重开事务
#[derive(Debug, Error)]
pub enum KvError {
    #[error("{op} timed out after {attempts} attempts")]
    Timeout { op: &'static str, attempts: u32 },
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("`{0}` called on a read-only transaction")]
    ReadOnly(&'static str),
    #[error("transaction already finished")]
    Closed,
    #[error("codec error: {0}")]
    Codec(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for KvError {
    fn from(e: serde_json::Error) -> Self {
        KvError::Codec(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster too small: {required} replicas requested, {available} nodes available")]
    TooSmall { required: usize, available: usize },
    #[error("unknown index node: {0}")]
    UnknownNode(NodeId),
    #[error("pending operation limiter closed for node {0}")]
    LimiterClosed(NodeId),
    #[error("index engine error: {0:#}")]
    Engine(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error(
        "sequence regression for {worker}/{partition}: stored {stored}, attempted {attempted}"
    )]
    Regression {
        worker: String,
        partition: String,
        stored: u64,
        attempted: u64,
    },
    #[error(transparent)]
    Kv(#[from] KvError),
}

#[derive(Debug, Error)]
pub enum RolloverError {
    #[error("rollover already in progress for kb {kbid} ({kind})")]
    InProgress { kbid: KbId, kind: IndexKind },
    #[error("rollover not started for kb {kbid} ({kind})")]
    NotStarted { kbid: KbId, kind: IndexKind },
    #[error("knowledge box not found: {0}")]
    KbNotFound(KbId),
    /// 持久化状态已被其他执行者推进，本执行者应让出
    #[error("rollover status for kb {kbid} ({kind}) changed underneath this runner")]
    Superseded { kbid: KbId, kind: IndexKind },
    #[error("rollover state invalid: {0}")]
    Validation(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("resource store error: {0:#}")]
    Resources(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration lock held by another runner: {0}")]
    Locked(String),
    #[error("migration run interrupted")]
    Interrupted,
    #[error("duplicate migration version {0}")]
    Duplicate(u32),
    #[error("{scope} is at version {current}, beyond the latest known migration {latest}")]
    AheadOfCode { scope: String, current: u32, latest: u32 },
    #[error("migration {version} failed for {scope}: {source:#}")]
    Failed {
        scope: String,
        version: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Kv(#[from] KvError),
}

#[derive(Debug, Error)]
pub enum KbError {
    #[error("knowledge box slug already taken: {0}")]
    SlugTaken(String),
    #[error("knowledge box not found: {0}")]
    NotFound(KbId),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Kv(#[from] KvError),
}
