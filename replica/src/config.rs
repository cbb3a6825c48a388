use log::warn;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub host: String,
    pub addr: String,
}

/// Timing, queue and compaction knobs of the consensus engine.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub snapshot_timeout_ms: u64,
    pub client_timeout_ms: u64,
    pub max_append_entries: usize,
    pub relay_queue_size: usize,
    pub failed_queue_size: usize,
    pub command_queue_size: usize,
    pub forward_max_retries: usize,
    pub forward_base_delay_ms: u64,
    pub snapshot_threshold: u64,
    pub wal_retain: u64,
    pub db_file: String,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 50,
            snapshot_timeout_ms: 5_000,
            client_timeout_ms: 5_000,
            max_append_entries: 512,
            relay_queue_size: 100_000,
            failed_queue_size: 10_000,
            command_queue_size: 100_000,
            forward_max_retries: 5,
            forward_base_delay_ms: 1,
            snapshot_threshold: 10_000,
            wal_retain: 1_000,
            db_file: "replica.db".to_string(),
        }
    }
}

impl RaftConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn forward_base_delay(&self) -> Duration {
        Duration::from_millis(self.forward_base_delay_ms)
    }

    /// Picks a fresh randomized election timeout in `[min, max]`.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min = self.election_timeout_min_ms;
        let max = self.election_timeout_max_ms.max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub host: String,
    pub addr: String,
    pub metrics_addr: String,
    pub data_dir: PathBuf,
    pub node_list: Vec<NodeConfig>,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            host: "127.0.0.1:4000".to_string(),
            addr: "0.0.0.0:4000".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            data_dir: PathBuf::from("data"),
            node_list: Vec::new(),
            raft: RaftConfig::default(),
        }
    }

    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        let config = match Self::parse(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        Some(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Cluster members; self is appended when the node list omits it.
    pub fn members(&self) -> Vec<NodeConfig> {
        let mut members = self.node_list.clone();
        if !members.iter().any(|n| n.host == self.host) {
            members.push(NodeConfig {
                host: self.host.clone(),
                addr: self.addr.clone(),
            });
        }
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cluster_config_with_raft_overrides() {
        let config = RuntimeConfig::parse(
            r#"
            host = "node1"
            addr = "127.0.0.1:4001"
            metrics_addr = "127.0.0.1:4011"
            data_dir = "/tmp/replica/node1"
            node_list = [
                { host = "node1", addr = "127.0.0.1:4001" },
                { host = "node2", addr = "127.0.0.1:4002" },
                { host = "node3", addr = "127.0.0.1:4003" },
            ]

            [raft]
            heartbeat_interval_ms = 20
            wal_retain = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "node1");
        assert_eq!(config.node_list.len(), 3);
        assert_eq!(config.raft.heartbeat_interval_ms, 20);
        assert_eq!(config.raft.wal_retain, 10);
        assert_eq!(config.raft.rpc_timeout_ms, 50);
        assert_eq!(config.raft.forward_max_retries, 5);
    }

    #[test]
    fn members_include_self() {
        let mut config = RuntimeConfig::new();
        config.host = "node1".to_string();
        config.node_list = vec![NodeConfig {
            host: "node2".to_string(),
            addr: "127.0.0.1:4002".to_string(),
        }];
        let members = config.members();
        assert_eq!(members.len(), 2);
        assert!(members.iter().any(|m| m.host == "node1"));
    }

    #[test]
    fn election_timeout_stays_in_range() {
        let raft = RaftConfig::default();
        for _ in 0..100 {
            let timeout = raft.random_election_timeout();
            assert!(timeout >= Duration::from_millis(150));
            assert!(timeout <= Duration::from_millis(300));
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = RuntimeConfig::from_toml("/nonexistent/replica.toml").unwrap();
        assert_eq!(config.addr, "0.0.0.0:4000");
        assert_eq!(config.raft.relay_queue_size, 100_000);
    }
}
