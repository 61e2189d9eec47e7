use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::local::DEFAULT_COMPACT_EVERY;

/// 配置文件路径的环境变量
pub const CONFIG_ENV: &str = "KB_CONTROL_CONFIG";

/// KV 后端选择（运行时配置，编排层只看到 `dyn Driver`）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Local,
    Redis,
    Tikv,
    Postgres,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    pub backend: Backend,
    /// local：数据目录；缺省为纯内存
    pub path: Option<PathBuf>,
    /// redis URL 或 postgres DSN
    pub url: Option<String>,
    /// tikv PD 地址
    pub pd_endpoints: Vec<String>,
    /// postgres 连接池上限
    pub pool_size: usize,
    /// local：每多少次提交压缩一次日志
    pub compact_every: u64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            path: None,
            url: None,
            pd_endpoints: Vec::new(),
            pool_size: 8,
            compact_every: DEFAULT_COMPACT_EVERY,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// 每个分片组的副本数
    pub replicas: usize,
    pub node_timeout_secs: u64,
    /// 每个节点同时在途的索引请求上限
    pub max_pending_per_node: usize,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            replicas: 2,
            node_timeout_secs: 30,
            max_pending_per_node: 64,
        }
    }
}

impl ClusterSettings {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloverSettings {
    pub batch_size: usize,
    /// 新分片组避开当前分片组所在节点
    pub avoid_current_nodes: bool,
}

impl Default for RolloverSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            avoid_current_nodes: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorSettings {
    /// 并发迁移的 KB 数上限
    pub max_concurrent: usize,
    pub lock_ttl_secs: u64,
}

impl Default for MigratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent: num_cpus::get().max(1),
            lock_ttl_secs: 60,
        }
    }
}

impl MigratorSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub driver: DriverSettings,
    pub cluster: ClusterSettings,
    pub rollover: RolloverSettings,
    pub migrator: MigratorSettings,
}

impl Settings {
    /// 查找顺序：显式路径 → `KB_CONTROL_CONFIG` → 用户配置目录 → 默认值。
    /// 显式指定（参数或环境变量）的文件不存在时报错；默认位置缺失则静默使用默认值。
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let settings = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => match default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {:?}: {}", path, e))?;
        tracing::info!("Loading config from {:?}", path);
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.cluster.replicas > 0, "cluster.replicas must be at least 1");
        anyhow::ensure!(self.rollover.batch_size > 0, "rollover.batch_size must be at least 1");
        anyhow::ensure!(
            self.cluster.max_pending_per_node > 0,
            "cluster.max_pending_per_node must be at least 1"
        );
        anyhow::ensure!(
            self.migrator.max_concurrent > 0,
            "migrator.max_concurrent must be at least 1"
        );
        Ok(())
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("kb-control").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let s = Settings::from_toml_str(
            r#"
            [driver]
            backend = "redis"
            url = "redis://127.0.0.1/"

            [rollover]
            batch_size = 10
            "#,
        )
        .unwrap();
        assert_eq!(s.driver.backend, Backend::Redis);
        assert_eq!(s.driver.url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(s.rollover.batch_size, 10);
        assert!(!s.rollover.avoid_current_nodes);
        assert_eq!(s.cluster.replicas, 2);
        assert_eq!(s.driver.compact_every, DEFAULT_COMPACT_EVERY);
        s.validate().unwrap();
    }

    #[test]
    fn zero_replicas_rejected() {
        let s = Settings::from_toml_str("[cluster]\nreplicas = 0\n").unwrap();
        assert!(s.validate().is_err());
    }

    #[test]
    fn unknown_backend_rejected() {
        assert!(Settings::from_toml_str("[driver]\nbackend = \"etcd\"\n").is_err());
    }
}
