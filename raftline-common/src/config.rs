use crate::error::{RaftError, RaftResult};
use crate::types::Server;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables of a consensus node. Built once and handed to the node at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftOptions {
    /// A follower becomes a candidate if it hears nothing from a leader for this long.
    pub election_timeout_ms: u64,
    /// A leader sends AppendEntries at least this often, even with nothing to replicate.
    pub heartbeat_period_ms: u64,
    pub snapshot_period_secs: u64,
    /// Snapshots are skipped while the log is smaller than this many bytes.
    pub snapshot_min_log_size: u64,
    pub max_snapshot_bytes_per_request: usize,
    pub max_log_entries_per_request: usize,
    pub max_segment_file_size: u64,
    /// A peer within this many entries of the leader counts as caught up.
    pub catchup_margin: u64,
    /// Upper bound a client write waits for its entry to commit.
    pub max_await_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    /// Bound on concurrently running outbound consensus calls.
    pub raft_consensus_thread_num: usize,
    /// true: acknowledge writes after the local append. false: after commit.
    pub async_write: bool,
    /// Parent directory of the log and snapshot directories.
    pub data_dir: PathBuf,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            election_timeout_ms: 5000,
            heartbeat_period_ms: 500,
            snapshot_period_secs: 3600,
            snapshot_min_log_size: 100 * 1024 * 1024,
            max_snapshot_bytes_per_request: 500 * 1024,
            max_log_entries_per_request: 5000,
            max_segment_file_size: 100 * 1000 * 1000,
            catchup_margin: 500,
            max_await_timeout_ms: 1000,
            rpc_timeout_ms: 1000,
            raft_consensus_thread_num: 20,
            async_write: false,
            data_dir: PathBuf::from("./raft-data"),
        }
    }
}

impl RaftOptions {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn snapshot_period(&self) -> Duration {
        Duration::from_secs(self.snapshot_period_secs)
    }

    pub fn max_await_timeout(&self) -> Duration {
        Duration::from_millis(self.max_await_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshot")
    }

    /// Rejects option combinations a node cannot run with.
    pub fn validate(&self) -> RaftResult<()> {
        if self.election_timeout_ms == 0 {
            return Err(RaftError::Config("election_timeout_ms must be positive".into()));
        }
        if self.heartbeat_period_ms == 0 || self.heartbeat_period_ms >= self.election_timeout_ms {
            return Err(RaftError::Config(format!(
                "heartbeat_period_ms ({}) must be positive and below election_timeout_ms ({})",
                self.heartbeat_period_ms, self.election_timeout_ms
            )));
        }
        if self.snapshot_period_secs == 0 {
            return Err(RaftError::Config("snapshot_period_secs must be positive".into()));
        }
        if self.max_log_entries_per_request == 0 {
            return Err(RaftError::Config("max_log_entries_per_request must be positive".into()));
        }
        if self.max_snapshot_bytes_per_request == 0 {
            return Err(RaftError::Config(
                "max_snapshot_bytes_per_request must be positive".into(),
            ));
        }
        if self.max_segment_file_size == 0 {
            return Err(RaftError::Config("max_segment_file_size must be positive".into()));
        }
        if self.raft_consensus_thread_num == 0 {
            return Err(RaftError::Config("raft_consensus_thread_num must be positive".into()));
        }
        Ok(())
    }
}

/// Everything a process needs to start one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub local: Server,
    pub cluster: Vec<Server>,
    #[serde(default)]
    pub options: RaftOptions,
}

/// Loads a node configuration from a JSON file.
pub fn load_config(path: impl AsRef<Path>) -> RaftResult<NodeConfig> {
    let data = fs::read_to_string(path)?;
    let config: NodeConfig = serde_json::from_str(&data)?;
    config.options.validate()?;
    if !config
        .cluster
        .iter()
        .any(|s| s.server_id == config.local.server_id)
    {
        return Err(RaftError::Config(format!(
            "local server {} is not part of the cluster",
            config.local
        )));
    }
    Ok(config)
}

/// Parses `host:port:serverId`.
pub fn parse_server(s: &str) -> RaftResult<Server> {
    let mut parts = s.trim().split(':');
    let (Some(host), Some(port), Some(id), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RaftError::Config(format!(
            "expected host:port:serverId, got {s:?}"
        )));
    };
    let port = port
        .parse()
        .map_err(|_| RaftError::Config(format!("invalid port in {s:?}")))?;
    let server_id = id
        .parse()
        .map_err(|_| RaftError::Config(format!("invalid server id in {s:?}")))?;
    Ok(Server::new(server_id, host, port))
}
