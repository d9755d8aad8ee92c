use crate::types::{LogIndex, NodeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Encoding Error: {0}")]
    Codec(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Not the leader, leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("Entry {index} was not committed in time")]
    Uncommitted { index: LogIndex },

    #[error("Peers did not catch up with the leader in time")]
    CatchUpTimeout,

    #[error("State Machine Error: {0}")]
    StateMachine(String),

    #[error("Node is shut down")]
    Shutdown,
}

pub type RaftResult<T> = std::result::Result<T, RaftError>;

impl From<bincode::Error> for RaftError {
    fn from(err: bincode::Error) -> Self {
        RaftError::Codec(err.to_string())
    }
}

impl RaftError {
    /// Errors that a caller may resolve by retrying against another node or later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. }
                | RaftError::Uncommitted { .. }
                | RaftError::Transport(_)
                | RaftError::CatchUpTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bincode_error_maps_to_codec() {
        let err: RaftError = bincode::deserialize::<u64>(&[1, 2]).unwrap_err().into();
        assert!(matches!(err, RaftError::Codec(_)));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(RaftError::NotLeader { leader: Some(2) }.is_retryable());
        assert!(RaftError::Uncommitted { index: 7 }.is_retryable());
        assert!(!RaftError::Storage("disk full".into()).is_retryable());
        assert_eq!(
            RaftError::NotLeader { leader: Some(2) }.to_string(),
            "Not the leader, leader is Some(2)"
        );
    }
}
