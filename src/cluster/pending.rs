use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::NodeId;
use crate::error::ClusterError;

/// 按节点的在途请求上限：每次下发索引请求前先拿 permit，permit 随请求结束释放
pub struct PendingOps {
    limit: usize,
    per_node: DashMap<NodeId, Arc<Semaphore>>,
}

impl PendingOps {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            per_node: DashMap::new(),
        }
    }

    pub async fn acquire(&self, node: &str) -> Result<OwnedSemaphorePermit, ClusterError> {
        let sem = self
            .per_node
            .entry(node.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limit)))
            .clone();
        sem.acquire_owned()
            .await
            .map_err(|_| ClusterError::LimiterClosed(node.to_string()))
    }

    /// 当前在途数
    pub fn in_flight(&self, node: &str) -> usize {
        self.per_node
            .get(node)
            .map(|s| self.limit - s.available_permits())
            .unwrap_or(0)
    }
}
