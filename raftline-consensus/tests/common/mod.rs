#![allow(dead_code)]

use raftline_common::{telemetry, LogIndex, NodeId, RaftOptions, Server};
use raftline_consensus::{KeyValueStore, KvCommand, LocalNetwork, LocalNode, NodeRole, RaftNode};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

pub type Node = Arc<LocalNode<KeyValueStore>>;

const WAIT: Duration = Duration::from_secs(10);

/// Polls `check` until it holds, failing the test after a generous deadline.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

pub fn server(id: NodeId) -> Server {
    Server::new(id, "127.0.0.1", 9000 + id as u16)
}

pub fn fast_options() -> RaftOptions {
    RaftOptions {
        election_timeout_ms: 150,
        heartbeat_period_ms: 30,
        rpc_timeout_ms: 100,
        max_await_timeout_ms: 3000,
        ..RaftOptions::default()
    }
}

pub fn set(key: &str, value: &str) -> Vec<u8> {
    KvCommand::set(key, value).encode().unwrap()
}

/// A cluster of in-process nodes wired through a [`LocalNetwork`].
pub struct TestCluster {
    pub network: LocalNetwork<KeyValueStore>,
    pub nodes: BTreeMap<NodeId, Node>,
    pub members: Vec<Server>,
    options: RaftOptions,
    dirs: HashMap<NodeId, TempDir>,
}

impl TestCluster {
    pub async fn start(size: NodeId) -> Self {
        Self::start_with(size, fast_options()).await
    }

    pub async fn start_with(size: NodeId, options: RaftOptions) -> Self {
        telemetry::init_for_tests();
        let mut cluster = Self {
            network: LocalNetwork::new(),
            nodes: BTreeMap::new(),
            members: (1..=size).map(server).collect(),
            options,
            dirs: HashMap::new(),
        };
        for id in 1..=size {
            cluster.boot(id).await;
        }
        cluster
    }

    /// Starts (or restarts) node `id` on its own data directory.
    pub async fn boot(&mut self, id: NodeId) -> Node {
        let dir = self
            .dirs
            .entry(id)
            .or_insert_with(|| TempDir::new().unwrap());
        let options = RaftOptions {
            data_dir: dir.path().to_path_buf(),
            ..self.options.clone()
        };
        let node = RaftNode::start(
            server(id),
            self.members.clone(),
            options,
            KeyValueStore::default(),
            self.network.transport(id),
        )
        .await
        .unwrap();
        self.network.register(&node);
        self.network.heal(id);
        self.nodes.insert(id, Arc::clone(&node));
        node
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[&id]
    }

    /// Crash-stops a node: it is cut off and its tasks end.
    pub async fn stop(&mut self, id: NodeId) {
        self.network.isolate(id);
        self.network.unregister(id);
        if let Some(node) = self.nodes.remove(&id) {
            node.shutdown().await;
        }
    }

    /// Waits for exactly one leader among `candidates` that all of them follow.
    pub async fn leader_among(&self, candidates: &[NodeId]) -> NodeId {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(id) = self.agreed_leader(candidates).await {
                return id;
            }
            assert!(Instant::now() < deadline, "no leader among {candidates:?}");
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn agreed_leader(&self, candidates: &[NodeId]) -> Option<NodeId> {
        let mut leaders = Vec::new();
        let mut followed = Vec::new();
        for id in candidates {
            let status = self.nodes[id].status().await;
            if status.role == NodeRole::Leader {
                leaders.push(status.id);
            }
            followed.push(status.leader);
        }
        match leaders.as_slice() {
            [id] if followed.iter().all(|l| *l == Some(*id)) => Some(*id),
            _ => None,
        }
    }

    pub async fn leader(&self) -> NodeId {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        self.leader_among(&ids).await
    }

    pub async fn write(&self, leader: NodeId, key: &str, value: &str) -> LogIndex {
        self.node(leader).replicate(set(key, value)).await.unwrap()
    }

    /// Waits until every node in `ids` has applied through `index`.
    pub async fn await_applied(&self, ids: &[NodeId], index: LogIndex) {
        for id in ids {
            let node = Arc::clone(self.node(*id));
            eventually(&format!("node {id} to apply {index}"), || {
                let node = Arc::clone(&node);
                async move { node.status().await.last_applied >= index }
            })
            .await;
        }
    }

    pub async fn shutdown(self) {
        for node in self.nodes.values() {
            node.shutdown().await;
        }
    }
}
