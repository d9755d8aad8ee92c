pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use config::{load_config, parse_server, NodeConfig, RaftOptions};
pub use error::{RaftError, RaftResult};
pub use types::{LogIndex, NodeId, Server, Term};
