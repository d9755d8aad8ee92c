pub mod raft;

pub use raft::log::{Configuration, LogEntry, LogEntryType, SegmentedLog};
pub use raft::node::{NodeRole, NodeStatus, RaftNode};
pub use raft::service::ClientService;
pub use raft::snapshot::{SnapshotMeta, SnapshotStore};
pub use raft::state_machine::{KeyValueStore, KvCommand, StateMachine};
pub use raft::transport::{LocalNetwork, LocalNode, LocalTransport, Transport};
