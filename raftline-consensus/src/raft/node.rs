use super::log::{Configuration, LogEntry, LogEntryType, SegmentedLog};
use super::peer::Peer;
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, GetLeaderCommitIndexRequest,
    GetLeaderCommitIndexResponse, InstallSnapshotRequest, InstallSnapshotResponse, VoteRequest,
    VoteResponse,
};
use super::snapshot::{SnapshotFile, SnapshotMeta, SnapshotStore};
use super::state_machine::StateMachine;
use super::transport::Transport;
use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use raftline_common::{LogIndex, NodeId, RaftError, RaftOptions, RaftResult, Server, Term};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock, Semaphore};
use tokio::task;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

const APPLY_BATCH: usize = 1000;
const CATCH_UP_POLL: Duration = Duration::from_millis(10);

/// Role of the node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// Point-in-time view of a node, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub term: Term,
    pub role: NodeRole,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub first_log_index: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
}

/// An in-progress pre-vote or vote round.
struct Election {
    term: Term,
    pre_vote: bool,
    granted: HashSet<NodeId>,
}

impl Election {
    fn new(term: Term, pre_vote: bool, candidate: NodeId) -> Self {
        Self {
            term,
            pre_vote,
            granted: HashSet::from([candidate]),
        }
    }
}

/// A leader's InstallSnapshot stream this node is receiving.
struct SnapshotInstall {
    term: Term,
    leader_id: NodeId,
    last_chunk: Instant,
}

/// Storage failures leave the node unable to keep its promises to peers.
fn durable<T>(result: RaftResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            error!(error = %err, "raft storage failure, aborting");
            std::process::abort()
        }
    }
}

fn state_machine_error(err: anyhow::Error) -> RaftError {
    RaftError::StateMachine(format!("{err:#}"))
}

/// Everything guarded by the node's core lock.
struct NodeState {
    id: NodeId,
    current_term: Term,
    voted_for: Option<NodeId>,
    role: NodeRole,
    leader_id: Option<NodeId>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    configuration: Configuration,
    log: SegmentedLog,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    peers: HashMap<NodeId, Peer>,
    election: Option<Election>,
    installing: Option<SnapshotInstall>,
    election_timeout: Duration,
    election_deadline: Instant,
    last_leader_contact: Option<Instant>,
}

impl NodeState {
    fn new(
        id: NodeId,
        configuration: Configuration,
        log: SegmentedLog,
        snapshot: &SnapshotMeta,
        election_timeout: Duration,
    ) -> Self {
        let metadata = log.metadata().clone();
        let commit_index = metadata
            .commit_index
            .max(snapshot.last_included_index)
            .min(log.last_index());
        let mut state = Self {
            id,
            current_term: metadata.current_term,
            voted_for: metadata.voted_for,
            role: NodeRole::Follower,
            leader_id: None,
            commit_index,
            last_applied: snapshot.last_included_index,
            configuration,
            log,
            snapshot_index: snapshot.last_included_index,
            snapshot_term: snapshot.last_included_term,
            peers: HashMap::new(),
            election: None,
            installing: None,
            election_timeout,
            election_deadline: Instant::now(),
            last_leader_contact: None,
        };
        state.reset_election_timer();
        state
    }

    fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    fn last_log_term(&self) -> Term {
        self.term_at(self.last_log_index()).unwrap_or(0)
    }

    /// Term of the entry at `index`, if still known (in the log or the snapshot boundary).
    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            Some(0)
        } else if index == self.snapshot_index {
            Some(self.snapshot_term)
        } else {
            self.log.term_at(index)
        }
    }

    fn log_is_up_to_date(&self, last_log_term: Term, last_log_index: LogIndex) -> bool {
        let my_term = self.last_log_term();
        last_log_term > my_term
            || (last_log_term == my_term && last_log_index >= self.last_log_index())
    }

    fn persist_vote(&mut self) {
        durable(self.log.set_term_and_vote(self.current_term, self.voted_for));
    }

    fn set_commit_index(&mut self, index: LogIndex) {
        self.commit_index = index;
        durable(self.log.set_commit_index(index));
    }

    /// Next election fires after a random delay in `[timeout, 2 * timeout]`.
    fn reset_election_timer(&mut self) {
        let base = self.election_timeout.as_millis() as u64;
        let jitter = rand::rng().random_range(0..=base);
        self.election_deadline = Instant::now() + Duration::from_millis(base + jitter);
    }

    fn step_down(&mut self, term: Term) {
        if term > self.current_term {
            info!(node = self.id, term, "observed newer term");
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.persist_vote();
        }
        if self.role == NodeRole::Leader {
            info!(node = self.id, term = self.current_term, "stepping down");
            self.peers.clear();
            self.leader_id = None;
        }
        self.role = NodeRole::Follower;
        self.election = None;
        self.reset_election_timer();
    }

    /// A valid AppendEntries or InstallSnapshot arrived from `leader_id`.
    fn observe_leader(&mut self, term: Term, leader_id: NodeId) {
        if term > self.current_term || self.role != NodeRole::Follower {
            self.step_down(term);
        }
        if self.leader_id != Some(leader_id) {
            info!(node = self.id, leader = leader_id, term, "following leader");
        }
        if self
            .installing
            .as_ref()
            .is_some_and(|i| i.term != term || i.leader_id != leader_id)
        {
            debug!(node = self.id, "dropping snapshot install from a previous leader");
            self.installing = None;
        }
        self.election = None;
        self.leader_id = Some(leader_id);
        self.last_leader_contact = Some(Instant::now());
        self.reset_election_timer();
    }

    /// A snapshot stream from the current leader is still arriving.
    fn install_in_progress(&self) -> bool {
        self.installing.as_ref().is_some_and(|install| {
            install.term == self.current_term
                && self.leader_id == Some(install.leader_id)
                && install.last_chunk.elapsed() < self.election_timeout
        })
    }

    fn finish_install(&mut self, term: Term, leader_id: NodeId) {
        if self
            .installing
            .as_ref()
            .is_some_and(|i| i.term == term && i.leader_id == leader_id)
        {
            self.installing = None;
        }
    }

    fn leader_recently_seen(&self) -> bool {
        self.role == NodeRole::Leader
            || self
                .last_leader_contact
                .is_some_and(|at| at.elapsed() < self.election_timeout)
    }

    /// Members of the configuration other than this node.
    fn voting_peers(&self) -> Vec<Server> {
        self.configuration
            .servers
            .iter()
            .filter(|s| s.server_id != self.id)
            .cloned()
            .collect()
    }

    fn election_won(&self) -> bool {
        self.election.as_ref().is_some_and(|election| {
            let votes = election
                .granted
                .iter()
                .filter(|id| self.configuration.contains(**id))
                .count();
            votes >= self.configuration.quorum()
        })
    }

    fn vote_request(&self, term: Term) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    /// Leader's cursor for `peer_id`, as long as this leadership is still
    /// current and the cursor is the one the calling task was started for.
    fn replication_target(&self, peer_id: NodeId, term: Term, wake: &Arc<Notify>) -> Option<&Peer> {
        if self.role != NodeRole::Leader || self.current_term != term {
            return None;
        }
        self.peers.get(&peer_id).filter(|peer| peer.is_driven_by(wake))
    }

    fn wake_peers(&self) {
        self.peers.values().for_each(Peer::wake);
    }

    /// Moves the commit index to the highest current-term entry stored on a
    /// majority. Returns whether it moved.
    fn advance_commit_index(&mut self) -> bool {
        if self.role != NodeRole::Leader || self.configuration.servers.is_empty() {
            return false;
        }
        let mut matched: Vec<LogIndex> = self
            .configuration
            .servers
            .iter()
            .map(|s| {
                if s.server_id == self.id {
                    self.last_log_index()
                } else {
                    self.peers.get(&s.server_id).map_or(0, |p| p.match_index)
                }
            })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.configuration.quorum() - 1];

        if candidate <= self.commit_index || self.term_at(candidate) != Some(self.current_term) {
            return false;
        }
        debug!(node = self.id, commit_index = candidate, "commit index advanced");
        self.set_commit_index(candidate);
        true
    }

    fn pre_vote(&self, req: &VoteRequest) -> VoteResponse {
        let granted = req.term >= self.current_term
            && !self.leader_recently_seen()
            && self.log_is_up_to_date(req.last_log_term, req.last_log_index);
        debug!(
            node = self.id,
            candidate = req.candidate_id,
            term = req.term,
            granted,
            "pre-vote request"
        );
        VoteResponse {
            term: self.current_term,
            granted,
        }
    }

    fn request_vote(&mut self, req: &VoteRequest) -> VoteResponse {
        if req.term < self.current_term {
            return VoteResponse {
                term: self.current_term,
                granted: false,
            };
        }
        if req.term > self.current_term {
            self.step_down(req.term);
        }

        let granted = self.voted_for.map_or(true, |v| v == req.candidate_id)
            && self.log_is_up_to_date(req.last_log_term, req.last_log_index);
        if granted {
            self.voted_for = Some(req.candidate_id);
            self.persist_vote();
            self.reset_election_timer();
        }
        info!(
            node = self.id,
            candidate = req.candidate_id,
            term = req.term,
            granted,
            "vote request"
        );
        VoteResponse {
            term: self.current_term,
            granted,
        }
    }

    fn append_response(&self, success: bool) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            last_log_index: self.last_log_index(),
        }
    }

    /// Follower side of AppendEntries. The flag reports a commit index move.
    fn append_entries(&mut self, req: AppendEntriesRequest) -> (AppendEntriesResponse, bool) {
        // 1. Reject if term is older
        if req.term < self.current_term {
            return (self.append_response(false), false);
        }
        self.observe_leader(req.term, req.leader_id);

        // 2. Validate previous entry consistency. Entries below the snapshot
        //    are committed and therefore match.
        if req.prev_log_index > self.last_log_index() {
            debug!(node = self.id, prev_log_index = req.prev_log_index, "log too short");
            return (self.append_response(false), false);
        }
        if let Some(term) = self.term_at(req.prev_log_index) {
            if term != req.prev_log_term {
                debug!(node = self.id, prev_log_index = req.prev_log_index, "log mismatch");
                return (self.append_response(false), false);
            }
        }

        // 3. Skip entries already present, truncate from the first conflict
        let mut pending: &[LogEntry] = &[];
        for (i, entry) in req.entries.iter().enumerate() {
            if entry.index <= self.snapshot_index || entry.index < self.log.first_index() {
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    warn!(node = self.id, index = entry.index, "conflicting entry, truncating log");
                    durable(self.log.truncate_suffix(entry.index - 1));
                    pending = &req.entries[i..];
                    break;
                }
                None => {
                    pending = &req.entries[i..];
                    break;
                }
            }
        }
        if !pending.is_empty() {
            durable(self.log.append(pending));
        }

        // 4. Update commit index
        let last_new = req.prev_log_index + req.entries.len() as u64;
        let commit = req.leader_commit.min(last_new);
        let advanced = commit > self.commit_index;
        if advanced {
            self.set_commit_index(commit);
        }
        (self.append_response(true), advanced)
    }

    /// Adopts a snapshot received from the leader as the base of the log.
    fn install_snapshot(&mut self, meta: &SnapshotMeta) {
        let index = meta.last_included_index;
        if self.log.term_at(index) == Some(meta.last_included_term) {
            durable(self.log.truncate_prefix(index + 1));
        } else {
            durable(self.log.reset(index + 1));
        }
        self.snapshot_index = index;
        self.snapshot_term = meta.last_included_term;
        self.configuration = meta.configuration.clone();
        if index > self.commit_index {
            self.set_commit_index(index);
        }
        self.last_applied = index;
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            term: self.current_term,
            role: self.role,
            leader: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            first_log_index: self.log.first_index(),
            last_log_index: self.last_log_index(),
            snapshot_index: self.snapshot_index,
        }
    }
}

/// Outcome of one replication round to a peer.
enum Round {
    /// Leadership or the peer is gone.
    Stop,
    /// Wait for new entries or the next heartbeat.
    Idle,
    /// Send again right away.
    More,
}

enum Step {
    Append(Server, AppendEntriesRequest),
    Snapshot(Server),
}

struct Chunk {
    file: Option<String>,
    offset: u64,
    len: usize,
}

/// Splits the snapshot files into requests of at most `max` bytes. An empty
/// snapshot still needs one request to carry its metadata.
fn snapshot_chunks(files: &[SnapshotFile], max: usize) -> Vec<Chunk> {
    let max = max.max(1) as u64;
    let mut chunks = Vec::new();
    for file in files {
        let mut offset = 0;
        loop {
            let len = (file.len - offset).min(max);
            chunks.push(Chunk {
                file: Some(file.name.clone()),
                offset,
                len: len as usize,
            });
            offset += len;
            if offset >= file.len {
                break;
            }
        }
    }
    if chunks.is_empty() {
        chunks.push(Chunk {
            file: None,
            offset: 0,
            len: 0,
        });
    }
    chunks
}

fn discard_staging(path: &Path) {
    if let Err(err) = std::fs::remove_dir_all(path) {
        warn!(path = %path.display(), error = %err, "could not remove staged snapshot");
    }
}

/// A Raft node: controls its own state and participates in consensus
pub struct RaftNode<SM: StateMachine, T: Transport> {
    local: Server,
    options: RaftOptions,
    state: Mutex<NodeState>,
    state_machine: Mutex<SM>,
    snapshots: RwLock<SnapshotStore>,
    transport: T,
    rpc_slots: Semaphore,
    commit_index: watch::Sender<LogIndex>,
    applied_index: watch::Sender<LogIndex>,
    apply_trigger: Notify,
    membership: Mutex<()>,
    taking_snapshot: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl<SM: StateMachine, T: Transport> RaftNode<SM, T> {
    /// Recovers durable state from `options.data_dir` and starts the node as a
    /// follower. `cluster` is the initial membership, used only when no
    /// snapshot records one.
    pub async fn start(
        local: Server,
        cluster: Vec<Server>,
        options: RaftOptions,
        mut state_machine: SM,
        transport: T,
    ) -> RaftResult<Arc<Self>> {
        options.validate()?;
        let mut log = SegmentedLog::open(options.log_dir(), options.max_segment_file_size)?;
        let snapshots = SnapshotStore::open(options.snapshot_dir())?;
        let snapshot = snapshots.meta().clone();

        state_machine
            .read_snapshot(&snapshots.data_dir())
            .map_err(state_machine_error)?;
        if log.first_index() <= snapshot.last_included_index {
            log.truncate_prefix(snapshot.last_included_index + 1)?;
        }

        let configuration = if snapshot.configuration.servers.is_empty() {
            Configuration::new(cluster)
        } else {
            snapshot.configuration.clone()
        };
        let state = NodeState::new(
            local.server_id,
            configuration,
            log,
            &snapshot,
            options.election_timeout(),
        );
        info!(
            node = local.server_id,
            term = state.current_term,
            commit_index = state.commit_index,
            snapshot_index = state.snapshot_index,
            last_log_index = state.last_log_index(),
            "starting raft node"
        );

        let node = Arc::new(Self {
            rpc_slots: Semaphore::new(options.raft_consensus_thread_num),
            commit_index: watch::channel(state.commit_index).0,
            applied_index: watch::channel(state.last_applied).0,
            state: Mutex::new(state),
            state_machine: Mutex::new(state_machine),
            snapshots: RwLock::new(snapshots),
            transport,
            local,
            options,
            apply_trigger: Notify::new(),
            membership: Mutex::new(()),
            taking_snapshot: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
        });

        // Replay what was committed before the restart.
        node.apply_committed().await;

        tokio::spawn(Arc::clone(&node).run_election_timer());
        tokio::spawn(Arc::clone(&node).run_applier());
        tokio::spawn(Arc::clone(&node).run_snapshot_timer());
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.local.server_id
    }

    pub fn local(&self) -> &Server {
        &self.local
    }

    pub fn options(&self) -> &RaftOptions {
        &self.options
    }

    pub async fn status(&self) -> NodeStatus {
        self.state.lock().await.status()
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == NodeRole::Leader
    }

    /// The leader this node currently knows of.
    pub async fn leader(&self) -> Option<Server> {
        let state = self.state.lock().await;
        let leader = state.leader_id?;
        if leader == self.id() {
            Some(self.local.clone())
        } else {
            state.configuration.server(leader).cloned()
        }
    }

    /// The last committed configuration.
    pub async fn configuration(&self) -> Configuration {
        self.state.lock().await.configuration.clone()
    }

    /// Copies of the local log entries in `from..=to`.
    pub async fn log_entries(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        self.state.lock().await.log.entries(from, to, usize::MAX)
    }

    pub async fn snapshot_meta(&self) -> SnapshotMeta {
        self.snapshots.read().await.meta().clone()
    }

    /// Runs `f` against the local state machine without any consistency check.
    pub async fn query<R>(&self, f: impl FnOnce(&SM) -> R) -> R {
        f(&*self.state_machine.lock().await)
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops the background tasks. Inbound RPCs are still answered.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.rpc_slots.close();
        let mut state = self.state.lock().await;
        let term = state.current_term;
        state.step_down(term);
        info!(node = state.id, "raft node shut down");
    }

    /// Bounds an outbound call by the concurrency limit and the rpc timeout.
    async fn call<R>(&self, request: impl Future<Output = RaftResult<R>>) -> RaftResult<R> {
        let _permit = self
            .rpc_slots
            .acquire()
            .await
            .map_err(|_| RaftError::Shutdown)?;
        time::timeout(self.options.rpc_timeout(), request)
            .await
            .map_err(|_| RaftError::Transport("rpc timed out".into()))?
    }

    fn publish_commit(&self, commit_index: LogIndex) {
        self.commit_index.send_replace(commit_index);
        self.apply_trigger.notify_one();
    }

    //
    // Elections
    //

    async fn run_election_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.is_shut_down() {
                return;
            }
            let deadline = self.state.lock().await.election_deadline;
            tokio::select! {
                _ = time::sleep_until(deadline) => {}
                _ = shutdown.changed() => return,
            }

            let mut state = self.state.lock().await;
            if Instant::now() < state.election_deadline {
                continue;
            }
            if state.role == NodeRole::Leader {
                state.reset_election_timer();
                continue;
            }
            self.start_pre_vote(&mut state);
        }
    }

    fn start_pre_vote(self: &Arc<Self>, state: &mut NodeState) {
        state.reset_election_timer();
        if !state.configuration.contains(state.id) {
            debug!(node = state.id, "not a member of the configuration, not campaigning");
            return;
        }
        let term = state.current_term + 1;
        state.election = Some(Election::new(term, true, state.id));
        info!(node = state.id, term, "election timeout, starting pre-vote");

        if state.election_won() {
            self.campaign(state);
            return;
        }
        let req = state.vote_request(term);
        for server in state.voting_peers() {
            self.spawn_vote(server, req.clone(), true);
        }
    }

    fn campaign(self: &Arc<Self>, state: &mut NodeState) {
        state.current_term += 1;
        state.voted_for = Some(state.id);
        state.persist_vote();
        state.role = NodeRole::Candidate;
        state.leader_id = None;
        state.election = Some(Election::new(state.current_term, false, state.id));
        state.reset_election_timer();
        info!(node = state.id, term = state.current_term, "requesting votes");

        if state.election_won() {
            self.become_leader(state);
            return;
        }
        let req = state.vote_request(state.current_term);
        for server in state.voting_peers() {
            self.spawn_vote(server, req.clone(), false);
        }
    }

    fn spawn_vote(self: &Arc<Self>, server: Server, req: VoteRequest, pre_vote: bool) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let term = req.term;
            let result = if pre_vote {
                node.call(node.transport.pre_vote(&server, req)).await
            } else {
                node.call(node.transport.request_vote(&server, req)).await
            };
            node.on_vote_response(server.server_id, term, pre_vote, result)
                .await;
        });
    }

    async fn on_vote_response(
        self: &Arc<Self>,
        peer: NodeId,
        term: Term,
        pre_vote: bool,
        result: RaftResult<VoteResponse>,
    ) {
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                debug!(node = self.id(), peer, error = %err, "vote request failed");
                return;
            }
        };
        let mut state = self.state.lock().await;
        if resp.term > state.current_term {
            state.step_down(resp.term);
            return;
        }
        let Some(election) = state.election.as_mut() else {
            return;
        };
        if election.term != term || election.pre_vote != pre_vote || !resp.granted {
            return;
        }
        election.granted.insert(peer);
        if !state.election_won() {
            return;
        }

        if pre_vote {
            self.campaign(&mut state);
        } else if state.role == NodeRole::Candidate {
            self.become_leader(&mut state);
        }
    }

    fn become_leader(self: &Arc<Self>, state: &mut NodeState) {
        state.role = NodeRole::Leader;
        state.leader_id = Some(state.id);
        state.election = None;

        let next_index = state.last_log_index() + 1;
        state.peers = state
            .voting_peers()
            .into_iter()
            .map(|s| (s.server_id, Peer::new(s, next_index, false)))
            .collect();
        info!(
            node = state.id,
            term = state.current_term,
            last_log_index = state.last_log_index(),
            "became leader"
        );

        for peer in state.peers.values() {
            self.spawn_replicator(peer, state.current_term);
        }
        if state.advance_commit_index() {
            self.publish_commit(state.commit_index);
        }
    }

    pub async fn handle_pre_vote(&self, req: VoteRequest) -> VoteResponse {
        self.state.lock().await.pre_vote(&req)
    }

    pub async fn handle_request_vote(&self, req: VoteRequest) -> VoteResponse {
        self.state.lock().await.request_vote(&req)
    }

    //
    // Replication
    //

    fn spawn_replicator(self: &Arc<Self>, peer: &Peer, term: Term) {
        tokio::spawn(Arc::clone(self).run_replication(peer.server.server_id, term, peer.waker()));
    }

    /// One task per peer and leadership term; it ends when either does.
    async fn run_replication(self: Arc<Self>, peer_id: NodeId, term: Term, wake: Arc<Notify>) {
        let mut shutdown = self.shutdown.subscribe();
        debug!(node = self.id(), peer = peer_id, term, "replication started");
        loop {
            if self.is_shut_down() {
                break;
            }
            match self.replicate_once(peer_id, term, &wake).await {
                Round::Stop => break,
                Round::More => continue,
                Round::Idle => {}
            }
            tokio::select! {
                _ = wake.notified() => {}
                _ = time::sleep(self.options.heartbeat_period()) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(node = self.id(), peer = peer_id, term, "replication stopped");
    }

    async fn replicate_once(&self, peer_id: NodeId, term: Term, wake: &Arc<Notify>) -> Round {
        let step = {
            let state = self.state.lock().await;
            let Some(peer) = state.replication_target(peer_id, term, wake) else {
                return Round::Stop;
            };
            if peer.next_index <= state.snapshot_index || peer.next_index < state.log.first_index() {
                Step::Snapshot(peer.server.clone())
            } else {
                let prev_log_index = peer.next_index - 1;
                let req = AppendEntriesRequest {
                    term,
                    leader_id: state.id,
                    prev_log_index,
                    prev_log_term: state.term_at(prev_log_index).unwrap_or(0),
                    entries: state.log.entries(
                        peer.next_index,
                        state.last_log_index(),
                        self.options.max_log_entries_per_request,
                    ),
                    leader_commit: state.commit_index,
                };
                Step::Append(peer.server.clone(), req)
            }
        };

        let (server, req) = match step {
            Step::Append(server, req) => (server, req),
            Step::Snapshot(server) => return self.send_snapshot(peer_id, term, server, wake).await,
        };
        let matched = req.prev_log_index + req.entries.len() as u64;
        let result = self.call(self.transport.append_entries(&server, req)).await;

        let mut state = self.state.lock().await;
        if state.replication_target(peer_id, term, wake).is_none() {
            return Round::Stop;
        }
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                debug!(node = state.id, peer = peer_id, error = %err, "append entries failed");
                return Round::Idle;
            }
        };
        if resp.term > state.current_term {
            state.step_down(resp.term);
            return Round::Stop;
        }

        let last_log_index = state.last_log_index();
        let Some(peer) = state.peers.get_mut(&peer_id) else {
            return Round::Stop;
        };
        if !resp.success {
            peer.record_rejection(resp.last_log_index);
            debug!(peer = peer_id, next_index = peer.next_index, "append entries rejected");
            return Round::More;
        }
        peer.record_success(matched, last_log_index, self.options.catchup_margin);
        let behind = peer.next_index <= last_log_index;
        if state.advance_commit_index() {
            self.publish_commit(state.commit_index);
        }
        if behind {
            Round::More
        } else {
            Round::Idle
        }
    }

    /// Streams the current snapshot to a peer whose next entry was compacted.
    async fn send_snapshot(
        &self,
        peer_id: NodeId,
        term: Term,
        server: Server,
        wake: &Arc<Notify>,
    ) -> Round {
        let store = self.snapshots.read().await;
        let meta = store.meta().clone();
        let files = match store.files() {
            Ok(files) => files,
            Err(err) => {
                warn!(node = self.id(), error = %err, "cannot list snapshot files");
                return Round::Idle;
            }
        };
        let chunks = snapshot_chunks(&files, self.options.max_snapshot_bytes_per_request);
        let total = chunks.len();
        info!(
            node = self.id(),
            peer = peer_id,
            last_included_index = meta.last_included_index,
            chunks = total,
            "sending snapshot"
        );

        for (i, chunk) in chunks.into_iter().enumerate() {
            let data = match &chunk.file {
                Some(name) => match store.read_chunk(name, chunk.offset, chunk.len) {
                    Ok(data) => Bytes::from(data),
                    Err(err) => {
                        warn!(node = self.id(), file = %name, error = %err, "cannot read snapshot");
                        return Round::Idle;
                    }
                },
                None => Bytes::new(),
            };
            let req = InstallSnapshotRequest {
                term,
                leader_id: self.id(),
                meta: meta.clone(),
                file_name: chunk.file,
                offset: chunk.offset,
                data,
                is_first: i == 0,
                is_last: i + 1 == total,
            };
            let result = self.call(self.transport.install_snapshot(&server, req)).await;

            let mut state = self.state.lock().await;
            if state.replication_target(peer_id, term, wake).is_none() {
                return Round::Stop;
            }
            match result {
                Ok(resp) if resp.term > state.current_term => {
                    state.step_down(resp.term);
                    return Round::Stop;
                }
                Ok(resp) if resp.success => {}
                Ok(_) => {
                    debug!(peer = peer_id, "snapshot chunk refused");
                    return Round::Idle;
                }
                Err(err) => {
                    debug!(peer = peer_id, error = %err, "install snapshot failed");
                    return Round::Idle;
                }
            }
        }
        drop(store);

        let mut state = self.state.lock().await;
        if state.replication_target(peer_id, term, wake).is_none() {
            return Round::Stop;
        }
        let last_log_index = state.last_log_index();
        let Some(peer) = state.peers.get_mut(&peer_id) else {
            return Round::Stop;
        };
        peer.record_success(
            meta.last_included_index,
            last_log_index,
            self.options.catchup_margin,
        );
        info!(peer = peer_id, match_index = peer.match_index, "snapshot delivered");
        if state.advance_commit_index() {
            self.publish_commit(state.commit_index);
        }
        Round::More
    }

    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock().await;
        let (resp, advanced) = state.append_entries(req);
        if advanced {
            self.publish_commit(state.commit_index);
        }
        resp
    }

    pub async fn handle_get_leader_commit_index(
        &self,
        _req: GetLeaderCommitIndexRequest,
    ) -> GetLeaderCommitIndexResponse {
        let state = self.state.lock().await;
        GetLeaderCommitIndexResponse {
            term: state.current_term,
            is_leader: state.role == NodeRole::Leader,
            commit_index: state.commit_index,
        }
    }

    //
    // Client writes
    //

    /// Proposes `data` for the log. Returns its index once committed, or as
    /// soon as it is stored locally when `async_write` is set.
    pub async fn replicate(&self, data: impl Into<Bytes>) -> RaftResult<LogIndex> {
        let (index, term) = self.append_local(LogEntryType::Data, data.into()).await?;
        if self.options.async_write {
            return Ok(index);
        }
        self.await_commit(index, term).await
    }

    async fn append_local(&self, entry_type: LogEntryType, data: Bytes) -> RaftResult<(LogIndex, Term)> {
        if self.is_shut_down() {
            return Err(RaftError::Shutdown);
        }
        let mut state = self.state.lock().await;
        if state.role != NodeRole::Leader {
            return Err(RaftError::NotLeader {
                leader: state.leader_id,
            });
        }
        let entry = LogEntry {
            term: state.current_term,
            index: state.last_log_index() + 1,
            entry_type,
            data,
        };
        let (index, term) = (entry.index, entry.term);
        durable(state.log.append(std::slice::from_ref(&entry)));
        debug!(node = state.id, index, term, "appended entry");

        if state.advance_commit_index() {
            self.publish_commit(state.commit_index);
        }
        state.wake_peers();
        Ok((index, term))
    }

    async fn await_commit(&self, index: LogIndex, term: Term) -> RaftResult<LogIndex> {
        let mut commits = self.commit_index.subscribe();
        match time::timeout(self.options.max_await_timeout(), wait_until(&mut commits, index)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(RaftError::Uncommitted { index }),
        }
        // A different leader may have overwritten the slot before it committed.
        let state = self.state.lock().await;
        match state.term_at(index) {
            Some(t) if t != term => Err(RaftError::Uncommitted { index }),
            _ => Ok(index),
        }
    }

    //
    // Reads
    //

    /// Linearizable read barrier: the commit index of the leader, waited
    /// for until applied locally.
    pub async fn read_index(&self) -> RaftResult<LogIndex> {
        let (is_leader, commit_index, leader) = {
            let state = self.state.lock().await;
            let leader = state
                .leader_id
                .and_then(|id| state.configuration.server(id).cloned());
            (state.role == NodeRole::Leader, state.commit_index, leader)
        };

        let index = if is_leader {
            commit_index
        } else {
            let leader = leader.ok_or(RaftError::NotLeader { leader: None })?;
            let resp = self
                .call(
                    self.transport
                        .get_leader_commit_index(&leader, GetLeaderCommitIndexRequest::default()),
                )
                .await?;
            if !resp.is_leader {
                return Err(RaftError::NotLeader { leader: None });
            }
            resp.commit_index
        };

        let mut applied = self.applied_index.subscribe();
        match time::timeout(self.options.max_await_timeout(), wait_until(&mut applied, index)).await {
            Ok(result) => result.map(|()| index),
            Err(_) => Err(RaftError::Uncommitted { index }),
        }
    }

    pub async fn get(&self, key: &[u8]) -> RaftResult<Option<Vec<u8>>> {
        self.read_index().await?;
        Ok(self.state_machine.lock().await.get(key))
    }

    pub async fn get_in(&self, key: &[u8], partition: &[u8]) -> RaftResult<Option<Vec<u8>>> {
        self.read_index().await?;
        Ok(self.state_machine.lock().await.get_in(key, partition))
    }

    //
    // Applying committed entries
    //

    async fn run_applier(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = self.apply_trigger.notified() => {}
                _ = shutdown.changed() => return,
            }
            self.apply_committed().await;
        }
    }

    async fn apply_committed(self: &Arc<Self>) {
        loop {
            let mut sm = self.state_machine.lock().await;
            let (expected, batch) = {
                let state = self.state.lock().await;
                if state.last_applied >= state.commit_index {
                    return;
                }
                let expected = state.last_applied + 1;
                (
                    expected,
                    state.log.entries(expected, state.commit_index, APPLY_BATCH),
                )
            };
            let last = match batch.first() {
                Some(first) if first.index == expected => batch[batch.len() - 1].index,
                _ => {
                    error!(node = self.id(), index = expected, "committed entries missing from the log");
                    return;
                }
            };

            let mut configurations = Vec::new();
            for entry in &batch {
                match entry.entry_type {
                    LogEntryType::Data => {
                        if let Err(err) = sm.apply_data(&entry.data) {
                            let reason = format!("{err:#}");
                            warn!(index = entry.index, error = %reason, "state machine rejected entry");
                        }
                    }
                    LogEntryType::Configuration => match Configuration::decode(&entry.data) {
                        Ok(configuration) => configurations.push(configuration),
                        Err(err) => {
                            error!(index = entry.index, error = %err, "undecodable configuration entry")
                        }
                    },
                }
            }

            let mut state = self.state.lock().await;
            for configuration in configurations {
                self.apply_configuration(&mut state, configuration);
            }
            state.last_applied = last;
            drop(state);
            drop(sm);
            self.applied_index.send_replace(last);
            debug!(node = self.id(), last_applied = last, "applied committed entries");
        }
    }

    fn apply_configuration(self: &Arc<Self>, state: &mut NodeState, configuration: Configuration) {
        info!(
            node = state.id,
            servers = ?configuration.servers.iter().map(|s| s.server_id).collect::<Vec<_>>(),
            "configuration committed"
        );
        state.configuration = configuration;
        if state.role != NodeRole::Leader {
            return;
        }
        if !state.configuration.contains(state.id) {
            info!(node = state.id, "removed from the configuration");
            let term = state.current_term;
            state.step_down(term);
            return;
        }

        let configuration = state.configuration.clone();
        state
            .peers
            .retain(|id, peer| peer.learner || configuration.contains(*id));
        let (local, term, next_index) = (state.id, state.current_term, state.last_log_index() + 1);
        for server in configuration.servers {
            if server.server_id == local {
                continue;
            }
            match state.peers.get_mut(&server.server_id) {
                Some(peer) => peer.learner = false,
                None => {
                    let peer = Peer::new(server, next_index, false);
                    self.spawn_replicator(&peer, term);
                    state.peers.insert(peer.server.server_id, peer);
                }
            }
        }
    }

    //
    // Membership
    //

    /// Replicates to `servers` until they are within the catch-up margin,
    /// then commits a configuration that includes them.
    pub async fn add_peers(self: &Arc<Self>, servers: Vec<Server>) -> RaftResult<()> {
        let _membership = self.membership.lock().await;
        let ids: Vec<NodeId> = servers.iter().map(|s| s.server_id).collect();
        let configuration = {
            let mut state = self.state.lock().await;
            if state.role != NodeRole::Leader {
                return Err(RaftError::NotLeader {
                    leader: state.leader_id,
                });
            }
            if servers.is_empty() {
                return Err(RaftError::Config("no servers to add".into()));
            }
            let mut seen = HashSet::new();
            for server in &servers {
                if !seen.insert(server.server_id)
                    || state.configuration.contains(server.server_id)
                    || state.peers.contains_key(&server.server_id)
                {
                    return Err(RaftError::Config(format!("{server} is already a member")));
                }
            }

            let next_index = state.last_log_index() + 1;
            for server in &servers {
                let peer = Peer::new(server.clone(), next_index, true);
                self.spawn_replicator(&peer, state.current_term);
                state.peers.insert(server.server_id, peer);
            }
            info!(node = state.id, peers = ?ids, "catching up new peers");

            let mut configuration = state.configuration.clone();
            configuration.servers.extend(servers);
            configuration
        };

        if let Err(err) = self.await_catch_up(&ids).await {
            let mut state = self.state.lock().await;
            for id in &ids {
                if state.peers.get(id).is_some_and(|p| p.learner) {
                    state.peers.remove(id);
                }
            }
            warn!(node = state.id, peers = ?ids, error = %err, "adding peers failed");
            return Err(err);
        }
        self.append_configuration(configuration).await
    }

    async fn await_catch_up(&self, ids: &[NodeId]) -> RaftResult<()> {
        let deadline = Instant::now() + self.options.max_await_timeout();
        loop {
            {
                let state = self.state.lock().await;
                if state.role != NodeRole::Leader {
                    return Err(RaftError::NotLeader {
                        leader: state.leader_id,
                    });
                }
                if ids
                    .iter()
                    .all(|id| state.peers.get(id).is_some_and(|p| p.caught_up))
                {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(RaftError::CatchUpTimeout);
            }
            time::sleep(CATCH_UP_POLL).await;
        }
    }

    /// Commits a configuration without `servers`. Removing the leader makes
    /// it step down once the change commits.
    pub async fn remove_peers(&self, servers: Vec<Server>) -> RaftResult<()> {
        let _membership = self.membership.lock().await;
        let configuration = {
            let state = self.state.lock().await;
            if state.role != NodeRole::Leader {
                return Err(RaftError::NotLeader {
                    leader: state.leader_id,
                });
            }
            if let Some(server) = servers
                .iter()
                .find(|s| !state.configuration.contains(s.server_id))
            {
                return Err(RaftError::Config(format!("{server} is not a member")));
            }
            let remaining: Vec<Server> = state
                .configuration
                .servers
                .iter()
                .filter(|s| !servers.iter().any(|r| r.server_id == s.server_id))
                .cloned()
                .collect();
            if remaining.is_empty() {
                return Err(RaftError::Config("cannot remove every server".into()));
            }
            info!(
                node = state.id,
                peers = ?servers.iter().map(|s| s.server_id).collect::<Vec<_>>(),
                "removing peers"
            );
            Configuration::new(remaining)
        };
        self.append_configuration(configuration).await
    }

    /// Configuration changes are always acknowledged on commit.
    async fn append_configuration(&self, configuration: Configuration) -> RaftResult<()> {
        let data = configuration.encode()?;
        let (index, term) = self.append_local(LogEntryType::Configuration, data).await?;
        self.await_commit(index, term).await?;
        Ok(())
    }

    //
    // Snapshots
    //

    async fn run_snapshot_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = time::interval(self.options.snapshot_period());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            let log_size = self.state.lock().await.log.total_size();
            if log_size < self.options.snapshot_min_log_size {
                debug!(node = self.id(), log_size, "log too small to snapshot");
                continue;
            }
            if let Err(err) = self.take_snapshot().await {
                warn!(node = self.id(), error = %err, "snapshot failed");
            }
        }
    }

    /// Snapshots the state machine at its last applied index and compacts
    /// the log. Returns false if there was nothing to do or another snapshot
    /// operation is running.
    pub async fn take_snapshot(&self) -> RaftResult<bool> {
        if self.state.lock().await.install_in_progress() {
            debug!(node = self.id(), "installing a snapshot, skipping");
            return Ok(false);
        }
        if self
            .taking_snapshot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        let result = self.write_local_snapshot().await;
        self.taking_snapshot.store(false, Ordering::Release);
        result
    }

    async fn write_local_snapshot(&self) -> RaftResult<bool> {
        let (old_data, staging) = {
            let store = self.snapshots.read().await;
            (store.data_dir(), store.staging_dir())
        };

        let meta = {
            let mut sm = self.state_machine.lock().await;
            let meta = {
                let state = self.state.lock().await;
                if state.last_applied <= state.snapshot_index {
                    return Ok(false);
                }
                SnapshotMeta {
                    last_included_index: state.last_applied,
                    last_included_term: state.term_at(state.last_applied).unwrap_or(0),
                    configuration: state.configuration.clone(),
                    created_at: Some(Utc::now()),
                }
            };
            info!(
                node = self.id(),
                last_included_index = meta.last_included_index,
                "taking snapshot"
            );
            let target = SnapshotStore::staging_data_dir(&staging);
            if let Err(err) = sm.write_snapshot(&old_data, &target, meta.last_included_index) {
                discard_staging(&staging);
                return Err(state_machine_error(err));
            }
            meta
        };

        let mut store = self.snapshots.write().await;
        if meta.last_included_index <= store.meta().last_included_index {
            discard_staging(&staging);
            return Ok(false);
        }
        store.install(&staging, meta.clone())?;

        let mut state = self.state.lock().await;
        state.snapshot_index = meta.last_included_index;
        state.snapshot_term = meta.last_included_term;
        durable(state.log.truncate_prefix(meta.last_included_index + 1));
        info!(
            node = state.id,
            first_log_index = state.log.first_index(),
            "log compacted"
        );
        Ok(true)
    }

    pub async fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let (term, leader_id) = (req.term, req.leader_id);
        {
            let mut state = self.state.lock().await;
            if term < state.current_term {
                return InstallSnapshotResponse {
                    term: state.current_term,
                    success: false,
                };
            }
            state.observe_leader(term, leader_id);
            if self.taking_snapshot.load(Ordering::Acquire) {
                debug!(node = state.id, "taking a snapshot, refusing install");
                return InstallSnapshotResponse {
                    term: state.current_term,
                    success: false,
                };
            }
            let continues = state
                .installing
                .as_ref()
                .is_some_and(|i| i.term == term && i.leader_id == leader_id);
            if req.is_first || continues {
                state.installing = Some(SnapshotInstall {
                    term,
                    leader_id,
                    last_chunk: Instant::now(),
                });
            } else {
                debug!(node = state.id, leader = leader_id, "snapshot chunk without a first chunk");
                return InstallSnapshotResponse {
                    term: state.current_term,
                    success: false,
                };
            }
        }

        let is_last = req.is_last;
        let result = self.receive_snapshot_chunk(req).await;
        if let Err(err) = &result {
            warn!(node = self.id(), error = %err, "snapshot install failed");
        }
        if is_last || result.is_err() {
            self.state.lock().await.finish_install(term, leader_id);
        }
        self.snapshot_response(result.is_ok()).await
    }

    async fn snapshot_response(&self, success: bool) -> InstallSnapshotResponse {
        InstallSnapshotResponse {
            term: self.state.lock().await.current_term,
            success,
        }
    }

    async fn receive_snapshot_chunk(&self, req: InstallSnapshotRequest) -> RaftResult<()> {
        let InstallSnapshotRequest {
            meta,
            file_name,
            offset,
            data,
            is_first,
            is_last,
            ..
        } = req;
        let mut store = self.snapshots.write().await;
        let receiver = store.receiver();
        let chunks = receiver.clone();
        blocking(move || {
            if is_first {
                chunks.begin()?;
            }
            match &file_name {
                Some(name) => chunks.write_chunk(name, offset, &data),
                None => Ok(()),
            }
        })
        .await?;
        if !is_last {
            return Ok(());
        }

        let index = meta.last_included_index;
        if index <= self.state.lock().await.commit_index {
            debug!(node = self.id(), index, "snapshot is not ahead of the log, ignoring");
            return Ok(());
        }

        let mut sm = self.state_machine.lock().await;
        let promoted = meta.clone();
        blocking(move || receiver.finish(&promoted)).await?;
        store.adopt(meta.clone());
        durable(
            sm.read_snapshot(&store.data_dir())
                .map_err(state_machine_error),
        );
        let mut state = self.state.lock().await;
        state.install_snapshot(&meta);
        info!(
            node = state.id,
            last_included_index = index,
            last_included_term = meta.last_included_term,
            "snapshot installed from leader"
        );
        self.commit_index.send_replace(state.commit_index);
        self.applied_index.send_replace(state.last_applied);
        Ok(())
    }
}

/// Runs snapshot file I/O on the blocking pool.
async fn blocking<R: Send + 'static>(
    f: impl FnOnce() -> RaftResult<R> + Send + 'static,
) -> RaftResult<R> {
    task::spawn_blocking(f)
        .await
        .map_err(|err| RaftError::Storage(format!("snapshot task failed: {err}")))?
}

async fn wait_until(rx: &mut watch::Receiver<LogIndex>, index: LogIndex) -> RaftResult<()> {
    loop {
        if *rx.borrow_and_update() >= index {
            return Ok(());
        }
        rx.changed().await.map_err(|_| RaftError::Shutdown)?;
    }
}

//
// Unit Tests
//
#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::state_machine::{KeyValueStore, KvCommand};
    use crate::raft::transport::{LocalNetwork, LocalNode};
    use tempfile::TempDir;

    fn servers(n: NodeId) -> Vec<Server> {
        (1..=n)
            .map(|id| Server::new(id, "127.0.0.1", 8050 + id as u16))
            .collect()
    }

    fn test_state(dir: &TempDir, id: NodeId) -> NodeState {
        let log = SegmentedLog::open(dir.path().join("log"), 1 << 20).unwrap();
        NodeState::new(
            id,
            Configuration::new(servers(3)),
            log,
            &SnapshotMeta::default(),
            Duration::from_millis(150),
        )
    }

    fn append(
        term: Term,
        prev: (LogIndex, Term),
        entries: Vec<LogEntry>,
        commit: LogIndex,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: 2,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: commit,
        }
    }

    fn vote(term: Term, candidate: NodeId, last_index: LogIndex, last_term: Term) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: candidate,
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    #[test]
    fn test_one_vote_per_term() {
        let dir = TempDir::new().unwrap();
        let mut state = test_state(&dir, 1);

        assert!(state.request_vote(&vote(1, 2, 0, 0)).granted);
        assert!(!state.request_vote(&vote(1, 3, 0, 0)).granted);
        // The same candidate asking again gets the same answer.
        assert!(state.request_vote(&vote(1, 2, 0, 0)).granted);
        // A new term clears the vote.
        assert!(state.request_vote(&vote(2, 3, 0, 0)).granted);
        assert_eq!(state.current_term, 2);
        assert_eq!(state.log.metadata().voted_for, Some(3));
    }

    #[test]
    fn test_vote_refused_for_stale_log() {
        let dir = TempDir::new().unwrap();
        let mut state = test_state(&dir, 1);
        state
            .log
            .append(&[LogEntry::data(1, 1, &b"a"[..]), LogEntry::data(2, 2, &b"b"[..])])
            .unwrap();

        assert!(!state.request_vote(&vote(3, 2, 5, 1)).granted);
        assert!(!state.request_vote(&vote(3, 2, 1, 2)).granted);
        assert!(state.request_vote(&vote(3, 2, 2, 2)).granted);
    }

    #[test]
    fn test_pre_vote_refused_while_leader_is_alive() {
        let dir = TempDir::new().unwrap();
        let mut state = test_state(&dir, 1);
        assert!(state.pre_vote(&vote(1, 3, 0, 0)).granted);

        state.observe_leader(1, 2);
        assert!(!state.pre_vote(&vote(2, 3, 0, 0)).granted);
        // Pre-votes never change the term.
        assert_eq!(state.current_term, 1);
    }

    #[test]
    fn test_step_down_on_higher_term() {
        let dir = TempDir::new().unwrap();
        let mut state = test_state(&dir, 1);
        state.current_term = 3;
        state.role = NodeRole::Leader;

        state.step_down(5);
        assert_eq!(state.role, NodeRole::Follower);
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.log.metadata().current_term, 5);
    }

    #[test]
    fn test_handle_append_entries_heartbeat() {
        let dir = TempDir::new().unwrap();
        let mut state = test_state(&dir, 1);

        let (resp, advanced) = state.append_entries(append(1, (0, 0), vec![], 0));
        assert!(resp.success);
        assert!(!advanced);
        assert_eq!(state.leader_id, Some(2));
        assert_eq!(state.current_term, 1);
    }

    #[test]
    fn test_heartbeat_cancels_pending_pre_vote() {
        let dir = TempDir::new().unwrap();
        let mut state = test_state(&dir, 1);
        state.append_entries(append(1, (0, 0), vec![], 0));

        // Grants arriving after the leader was heard from must find nothing to count.
        state.election = Some(Election::new(2, true, 1));
        state.append_entries(append(1, (0, 0), vec![], 0));
        assert!(state.election.is_none());
        assert_eq!(state.role, NodeRole::Follower);
    }

    #[test]
    fn test_snapshot_install_is_tied_to_its_leader() {
        let dir = TempDir::new().unwrap();
        let mut state = test_state(&dir, 1);
        state.observe_leader(1, 2);
        state.installing = Some(SnapshotInstall {
            term: 1,
            leader_id: 2,
            last_chunk: Instant::now(),
        });
        assert!(state.install_in_progress());

        state.observe_leader(2, 3);
        assert!(state.installing.is_none());
        assert!(!state.install_in_progress());

        // A stream that went quiet for a full election timeout is abandoned.
        state.installing = Some(SnapshotInstall {
            term: 2,
            leader_id: 3,
            last_chunk: Instant::now() - Duration::from_millis(200),
        });
        assert!(!state.install_in_progress());
        state.finish_install(2, 3);
        assert!(state.installing.is_none());
    }

    #[test]
    fn test_handle_append_entries_reject_stale_term() {
        let dir = TempDir::new().unwrap();
        let mut state = test_state(&dir, 1);
        state.current_term = 2;

        let (resp, _) = state.append_entries(append(1, (0, 0), vec![], 0));
        assert!(!resp.success);
        assert_eq!(resp.term, 2);
        assert_eq!(state.leader_id, None);
    }

    #[test]
    fn test_append_entries_overwrites_conflicting_suffix() {
        let dir = TempDir::new().unwrap();
        let mut state = test_state(&dir, 1);
        let entries: Vec<LogEntry> = (1..=4).map(|i| LogEntry::data(1, i, &b"old"[..])).collect();
        let (resp, _) = state.append_entries(append(1, (0, 0), entries, 0));
        assert!(resp.success);

        let replacement = vec![LogEntry::data(2, 3, &b"new"[..])];
        let (resp, advanced) = state.append_entries(append(2, (2, 1), replacement, 3));
        assert!(resp.success);
        assert!(advanced);
        assert_eq!(state.last_log_index(), 3);
        assert_eq!(state.term_at(3), Some(2));
        assert_eq!(state.commit_index, 3);
    }

    #[test]
    fn test_append_entries_reports_last_index_on_gap() {
        let dir = TempDir::new().unwrap();
        let mut state = test_state(&dir, 1);

        let (resp, _) = state.append_entries(append(1, (7, 1), vec![], 0));
        assert!(!resp.success);
        assert_eq!(resp.last_log_index, 0);
    }

    #[test]
    fn test_commit_needs_current_term_entry() {
        let dir = TempDir::new().unwrap();
        let mut state = test_state(&dir, 1);
        state
            .log
            .append(&[LogEntry::data(1, 1, &b"a"[..])])
            .unwrap();
        state.current_term = 2;
        state.role = NodeRole::Leader;
        for server in state.voting_peers() {
            let mut peer = Peer::new(server, 2, false);
            peer.match_index = 1;
            state.peers.insert(peer.server.server_id, peer);
        }
        // Replicated everywhere, but from an older term.
        assert!(!state.advance_commit_index());

        state
            .log
            .append(&[LogEntry::data(2, 2, &b"b"[..])])
            .unwrap();
        state.peers.get_mut(&2).unwrap().match_index = 2;
        assert!(state.advance_commit_index());
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn test_snapshot_chunks() {
        let files = vec![
            SnapshotFile { name: "a".into(), len: 10 },
            SnapshotFile { name: "b".into(), len: 0 },
        ];
        let chunks = snapshot_chunks(&files, 4);
        let shape: Vec<(Option<&str>, u64, usize)> = chunks
            .iter()
            .map(|c| (c.file.as_deref(), c.offset, c.len))
            .collect();
        assert_eq!(
            shape,
            vec![
                (Some("a"), 0, 4),
                (Some("a"), 4, 4),
                (Some("a"), 8, 2),
                (Some("b"), 0, 0),
            ]
        );

        let empty = snapshot_chunks(&[], 4);
        assert_eq!(empty.len(), 1);
        assert!(empty[0].file.is_none());
    }

    fn single_node_options(dir: &TempDir) -> RaftOptions {
        RaftOptions {
            election_timeout_ms: 50,
            heartbeat_period_ms: 10,
            data_dir: dir.path().to_path_buf(),
            ..RaftOptions::default()
        }
    }

    async fn start_single(dir: &TempDir) -> Arc<LocalNode<KeyValueStore>> {
        let network = LocalNetwork::new();
        let server = servers(1).remove(0);
        let node = RaftNode::start(
            server.clone(),
            vec![server],
            single_node_options(dir),
            KeyValueStore::default(),
            network.transport(1),
        )
        .await
        .unwrap();
        network.register(&node);
        node
    }

    async fn await_leader(node: &LocalNode<KeyValueStore>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !node.is_leader().await {
            assert!(Instant::now() < deadline, "no leader elected");
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_single_node_commits_and_restarts() {
        let dir = TempDir::new().unwrap();
        let node = start_single(&dir).await;
        await_leader(&node).await;

        let index = node
            .replicate(KvCommand::set("key", "value").encode().unwrap())
            .await
            .unwrap();
        assert_eq!(node.get(b"key").await.unwrap(), Some(b"value".to_vec()));
        node.shutdown().await;
        drop(node);

        let restarted = start_single(&dir).await;
        let status = restarted.status().await;
        assert_eq!(status.commit_index, index);
        assert_eq!(status.last_applied, index);
        assert_eq!(
            restarted.query(|kv| kv.get(b"key")).await,
            Some(b"value".to_vec())
        );
    }

    #[tokio::test]
    async fn test_snapshot_compacts_log() {
        let dir = TempDir::new().unwrap();
        let node = start_single(&dir).await;
        await_leader(&node).await;

        for i in 0..20 {
            let command = KvCommand::set(format!("k{i}"), format!("v{i}"));
            node.replicate(command.encode().unwrap()).await.unwrap();
        }
        let applied = node.read_index().await.unwrap();
        assert!(node.take_snapshot().await.unwrap());

        let status = node.status().await;
        assert_eq!(status.snapshot_index, applied);
        assert_eq!(status.first_log_index, applied + 1);
        assert_eq!(node.snapshot_meta().await.last_included_index, applied);
        // Nothing new to cover.
        assert!(!node.take_snapshot().await.unwrap());
    }

    fn partial_chunk(term: Term, leader_id: NodeId, is_first: bool) -> InstallSnapshotRequest {
        InstallSnapshotRequest {
            term,
            leader_id,
            meta: SnapshotMeta {
                last_included_index: 100,
                last_included_term: term,
                ..SnapshotMeta::default()
            },
            file_name: Some("kv.bin".into()),
            offset: if is_first { 0 } else { 4 },
            data: Bytes::from_static(b"part"),
            is_first,
            is_last: false,
        }
    }

    #[tokio::test]
    async fn test_abandoned_install_does_not_block_snapshots() {
        let dir = TempDir::new().unwrap();
        let node = start_single(&dir).await;
        await_leader(&node).await;
        for i in 0..5 {
            let command = KvCommand::set(format!("k{i}"), "v");
            node.replicate(command.encode().unwrap()).await.unwrap();
        }
        let applied = node.read_index().await.unwrap();

        // A leader sends the first chunk and is never heard from again.
        let term = node.status().await.term;
        assert!(node.handle_install_snapshot(partial_chunk(term, 2, true)).await.success);
        time::sleep(Duration::from_millis(500)).await;

        assert!(node.take_snapshot().await.unwrap());
        assert_eq!(node.status().await.snapshot_index, applied);

        // The rest of that stream is no longer accepted.
        let term = node.status().await.term;
        let resp = node.handle_install_snapshot(partial_chunk(term, 2, false)).await;
        assert!(!resp.success);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_follower_write_is_refused() {
        let dir = TempDir::new().unwrap();
        let network: LocalNetwork<KeyValueStore> = LocalNetwork::new();
        let cluster = servers(3);
        // Peers 2 and 3 never start, so node 1 can never win an election.
        let node = RaftNode::start(
            cluster[0].clone(),
            cluster,
            single_node_options(&dir),
            KeyValueStore::default(),
            network.transport(1),
        )
        .await
        .unwrap();

        let err = node.replicate(&b"x"[..]).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
        node.shutdown().await;
    }
}
