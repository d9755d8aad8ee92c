use super::node::RaftNode;
use super::rpc::{
    AddPeersRequest, AddPeersResponse, GetConfigurationRequest, GetConfigurationResponse,
    GetLeaderRequest, GetLeaderResponse, RemovePeersRequest, RemovePeersResponse, ResCode,
};
use super::state_machine::StateMachine;
use super::transport::Transport;
use raftline_common::{RaftError, RaftResult};
use std::sync::Arc;
use tracing::info;

/// Cluster administration surface: leader discovery and membership changes.
pub struct ClientService<SM: StateMachine, T: Transport> {
    node: Arc<RaftNode<SM, T>>,
}

impl<SM: StateMachine, T: Transport> Clone for ClientService<SM, T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

fn res_code(result: &RaftResult<()>) -> (ResCode, String) {
    match result {
        Ok(()) => (ResCode::Success, String::new()),
        Err(err @ RaftError::NotLeader { .. }) => (ResCode::NotLeader, err.to_string()),
        Err(err) => (ResCode::Fail, err.to_string()),
    }
}

impl<SM: StateMachine, T: Transport> ClientService<SM, T> {
    pub fn new(node: Arc<RaftNode<SM, T>>) -> Self {
        Self { node }
    }

    pub async fn get_leader(&self, _req: GetLeaderRequest) -> GetLeaderResponse {
        match self.node.leader().await {
            Some(leader) => GetLeaderResponse {
                res_code: ResCode::Success,
                leader: Some(leader),
            },
            None => GetLeaderResponse {
                res_code: ResCode::Fail,
                leader: None,
            },
        }
    }

    pub async fn get_configuration(&self, _req: GetConfigurationRequest) -> GetConfigurationResponse {
        let leader = self.node.leader().await;
        let servers = self.node.configuration().await.servers;
        GetConfigurationResponse {
            res_code: if leader.is_some() {
                ResCode::Success
            } else {
                ResCode::Fail
            },
            leader,
            servers,
        }
    }

    pub async fn add_peers(&self, req: AddPeersRequest) -> AddPeersResponse {
        info!(servers = ?req.servers, "add peers requested");
        let result = self.node.add_peers(req.servers).await;
        let (res_code, res_msg) = res_code(&result);
        AddPeersResponse { res_code, res_msg }
    }

    pub async fn remove_peers(&self, req: RemovePeersRequest) -> RemovePeersResponse {
        info!(servers = ?req.servers, "remove peers requested");
        let result = self.node.remove_peers(req.servers).await;
        let (res_code, res_msg) = res_code(&result);
        RemovePeersResponse { res_code, res_msg }
    }
}
