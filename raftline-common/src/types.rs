pub type NodeId = u32;
pub type Term = u64;
pub type LogIndex = u64;

use serde::{Deserialize, Serialize};
use std::fmt;

/// A member of the cluster as it appears in configurations and log entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    pub server_id: NodeId,
    pub host: String,
    pub port: u16,
}

impl Server {
    pub fn new(server_id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            server_id,
            host: host.into(),
            port,
        }
    }

    /// `host:port` form used by transports.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.server_id, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_serialization() {
        let server = Server::new(3, "127.0.0.1", 8053);

        let json = serde_json::to_string(&server).unwrap();
        let deserialized: Server = serde_json::from_str(&json).unwrap();
        assert_eq!(server, deserialized);
        assert_eq!(deserialized.endpoint(), "127.0.0.1:8053");
        assert_eq!(deserialized.to_string(), "3@127.0.0.1:8053");
    }
}
