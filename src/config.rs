use serde::{Deserialize, Serialize};

/// Build metadata injected at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        BuildInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Process configuration, assembled from CLI flags and passed down by
/// value. No module-level mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding every index.
    pub data_dir: String,
    /// This node's advertised host:port.
    pub host: String,
    /// All cluster members, this node included. Empty means standalone.
    pub cluster_hosts: Vec<String>,
    /// Replicas per shard.
    pub replica_n: usize,
    /// Partitions in the consistent-hash ring.
    pub partition_n: u32,
    /// Seconds between anti-entropy sweeps. Zero disables the loop.
    pub anti_entropy_interval_secs: u64,
    /// Timestamped writes skip the standard view when set.
    pub time_views_only: bool,
    /// Per-query deadline in seconds.
    pub query_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: "./data".to_string(),
            host: "localhost:10101".to_string(),
            cluster_hosts: Vec::new(),
            replica_n: 1,
            partition_n: crate::cluster::DEFAULT_PARTITION_N,
            anti_entropy_interval_secs: 600,
            time_views_only: false,
            query_timeout_secs: 30,
        }
    }
}

impl Config {
    /// The effective member list: configured hosts, or just this node.
    pub fn hosts(&self) -> Vec<String> {
        if self.cluster_hosts.is_empty() {
            vec![self.host.clone()]
        } else {
            self.cluster_hosts.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hosts_standalone() {
        let config = Config::default();
        assert_eq!(config.hosts(), vec!["localhost:10101".to_string()]);
    }

    #[test]
    fn test_cluster_hosts_override() {
        let config = Config {
            cluster_hosts: vec!["a:1".to_string(), "b:1".to_string()],
            ..Default::default()
        };
        assert_eq!(config.hosts().len(), 2);
    }
}
