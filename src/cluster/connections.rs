use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::{IndexEngine, IndexEngineConnector};

/// 按节点地址缓存的引擎客户端；`clear()` 可在不重启的情况下丢弃全部连接
pub struct ConnectionCache {
    connector: Arc<dyn IndexEngineConnector>,
    clients: DashMap<String, Arc<dyn IndexEngine>>,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn IndexEngineConnector>) -> Self {
        Self {
            connector,
            clients: DashMap::new(),
        }
    }

    pub async fn get(&self, address: &str) -> anyhow::Result<Arc<dyn IndexEngine>> {
        if let Some(c) = self.clients.get(address) {
            return Ok(c.clone());
        }
        // 连接建立期间不持有分片锁；并发建立时后写入者覆盖，两者都可用
        let client = self.connector.connect(address).await?;
        self.clients.insert(address.to_string(), client.clone());
        tracing::debug!("Index engine connected: {}", address);
        Ok(client)
    }

    pub fn evict(&self, address: &str) {
        self.clients.remove(address);
    }

    pub fn clear(&self) {
        let n = self.clients.len();
        self.clients.clear();
        tracing::info!("Connection cache cleared: {} clients dropped", n);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
