use super::node::RaftNode;
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, GetLeaderCommitIndexRequest,
    GetLeaderCommitIndexResponse, InstallSnapshotRequest, InstallSnapshotResponse, VoteRequest,
    VoteResponse,
};
use super::state_machine::StateMachine;
use raftline_common::{NodeId, RaftError, RaftResult, Server};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Outbound half of the consensus RPC contract: send a request to a peer and
/// get its response or a failure. The node bounds every call with its own
/// timeout, so implementations need not.
pub trait Transport: Send + Sync + 'static {
    fn pre_vote(
        &self,
        target: &Server,
        req: VoteRequest,
    ) -> impl Future<Output = RaftResult<VoteResponse>> + Send;

    fn request_vote(
        &self,
        target: &Server,
        req: VoteRequest,
    ) -> impl Future<Output = RaftResult<VoteResponse>> + Send;

    fn append_entries(
        &self,
        target: &Server,
        req: AppendEntriesRequest,
    ) -> impl Future<Output = RaftResult<AppendEntriesResponse>> + Send;

    fn install_snapshot(
        &self,
        target: &Server,
        req: InstallSnapshotRequest,
    ) -> impl Future<Output = RaftResult<InstallSnapshotResponse>> + Send;

    fn get_leader_commit_index(
        &self,
        target: &Server,
        req: GetLeaderCommitIndexRequest,
    ) -> impl Future<Output = RaftResult<GetLeaderCommitIndexResponse>> + Send;
}

pub type LocalNode<SM> = RaftNode<SM, LocalTransport<SM>>;

struct Registry<SM: StateMachine> {
    nodes: HashMap<NodeId, Weak<LocalNode<SM>>>,
    isolated: HashSet<NodeId>,
}

struct Shared<SM: StateMachine> {
    registry: Mutex<Registry<SM>>,
    append_entries_calls: AtomicUsize,
    install_snapshot_calls: AtomicUsize,
}

/// In-process network connecting nodes of one process, with partitions.
pub struct LocalNetwork<SM: StateMachine> {
    shared: Arc<Shared<SM>>,
}

impl<SM: StateMachine> Clone for LocalNetwork<SM> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<SM: StateMachine> Default for LocalNetwork<SM> {
    fn default() -> Self {
        Self::new()
    }
}

impl<SM: StateMachine> LocalNetwork<SM> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    nodes: HashMap::new(),
                    isolated: HashSet::new(),
                }),
                append_entries_calls: AtomicUsize::new(0),
                install_snapshot_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// The transport a node with id `from` sends through.
    pub fn transport(&self, from: NodeId) -> LocalTransport<SM> {
        LocalTransport {
            from,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn register(&self, node: &Arc<LocalNode<SM>>) {
        self.registry()
            .nodes
            .insert(node.id(), Arc::downgrade(node));
    }

    pub fn unregister(&self, id: NodeId) {
        self.registry().nodes.remove(&id);
    }

    /// Cuts every link to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        self.registry().isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.registry().isolated.remove(&id);
    }

    pub fn heal_all(&self) {
        self.registry().isolated.clear();
    }

    pub fn append_entries_calls(&self) -> usize {
        self.shared.append_entries_calls.load(Ordering::Relaxed)
    }

    pub fn install_snapshot_calls(&self) -> usize {
        self.shared.install_snapshot_calls.load(Ordering::Relaxed)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry<SM>> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct LocalTransport<SM: StateMachine> {
    from: NodeId,
    shared: Arc<Shared<SM>>,
}

impl<SM: StateMachine> LocalTransport<SM> {
    fn route(&self, target: &Server) -> RaftResult<Arc<LocalNode<SM>>> {
        let registry = self
            .shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if registry.isolated.contains(&self.from) || registry.isolated.contains(&target.server_id) {
            return Err(RaftError::Transport(format!(
                "{} -> {} is partitioned",
                self.from, target.server_id
            )));
        }
        registry
            .nodes
            .get(&target.server_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| RaftError::Transport(format!("{target} is unreachable")))
    }
}

impl<SM: StateMachine> Transport for LocalTransport<SM> {
    async fn pre_vote(&self, target: &Server, req: VoteRequest) -> RaftResult<VoteResponse> {
        let node = self.route(target)?;
        Ok(node.handle_pre_vote(req).await)
    }

    async fn request_vote(&self, target: &Server, req: VoteRequest) -> RaftResult<VoteResponse> {
        let node = self.route(target)?;
        Ok(node.handle_request_vote(req).await)
    }

    async fn append_entries(
        &self,
        target: &Server,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        let node = self.route(target)?;
        self.shared.append_entries_calls.fetch_add(1, Ordering::Relaxed);
        Ok(node.handle_append_entries(req).await)
    }

    async fn install_snapshot(
        &self,
        target: &Server,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        let node = self.route(target)?;
        self.shared
            .install_snapshot_calls
            .fetch_add(1, Ordering::Relaxed);
        Ok(node.handle_install_snapshot(req).await)
    }

    async fn get_leader_commit_index(
        &self,
        target: &Server,
        req: GetLeaderCommitIndexRequest,
    ) -> RaftResult<GetLeaderCommitIndexResponse> {
        let node = self.route(target)?;
        Ok(node.handle_get_leader_commit_index(req).await)
    }
}
