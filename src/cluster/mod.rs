//! 索引节点集群：成员登记、按负载放置副本、连接缓存、按节点限流。

pub mod connections;
pub mod manager;
pub mod node;
pub mod pending;

pub use connections::ConnectionCache;
pub use manager::ClusterManager;
pub use node::{IndexNode, NodeRegistry};
pub use pending::PendingOps;
