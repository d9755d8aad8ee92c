// Raft log, node behavior, and the seams to storage, network and application
pub mod log;
pub mod node;
pub mod peer;
pub mod rpc;
pub mod service;
pub mod snapshot;
pub mod state_machine;
pub mod transport;
