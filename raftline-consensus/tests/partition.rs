mod common;

use common::{eventually, set, TestCluster};
use raftline_common::{NodeId, RaftError};
use raftline_consensus::{NodeRole, StateMachine};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_leader_loses_uncommitted_entries() {
    let cluster = TestCluster::start(5).await;
    let old_leader = cluster.leader().await;
    let old_term = cluster.node(old_leader).status().await.term;

    for i in 1..=5 {
        let index = cluster.write(old_leader, &format!("k{i}"), "committed").await;
        assert_eq!(index, i);
    }
    let ids: Vec<NodeId> = cluster.nodes.keys().copied().collect();
    cluster.await_applied(&ids, 5).await;

    // Cut the leader off; it still accepts a write it can never commit.
    cluster.network.isolate(old_leader);
    let stale = {
        let node = Arc::clone(cluster.node(old_leader));
        tokio::spawn(async move { node.replicate(set("stale", "lost")).await })
    };

    let majority: Vec<NodeId> = ids.iter().copied().filter(|id| *id != old_leader).collect();
    let new_leader = cluster.leader_among(&majority).await;
    let new_term = cluster.node(new_leader).status().await.term;
    assert!(new_term > old_term);
    for i in 6..=10 {
        let index = cluster.write(new_leader, &format!("k{i}"), "new").await;
        assert_eq!(index, i);
    }

    let stale_result = stale.await.unwrap();
    assert!(matches!(stale_result, Err(RaftError::Uncommitted { index: 6 })));
    assert_eq!(
        cluster.node(old_leader).log_entries(6, 6).await[0].term,
        old_term
    );

    cluster.network.heal(old_leader);
    cluster.await_applied(&ids, 10).await;

    let rejoined = Arc::clone(cluster.node(old_leader));
    eventually("the old leader to adopt the new log", || {
        let rejoined = Arc::clone(&rejoined);
        async move {
            let entries = rejoined.log_entries(6, 10).await;
            entries.len() == 5 && entries.iter().all(|e| e.term == new_term)
        }
    })
    .await;

    let status = rejoined.status().await;
    assert_eq!(status.role, NodeRole::Follower);
    assert_eq!(status.leader, Some(new_leader));
    assert_eq!(rejoined.query(|kv| kv.get(b"stale")).await, None);
    assert_eq!(
        rejoined.query(|kv| kv.get(b"k10")).await,
        Some(b"new".to_vec())
    );
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_minority_cannot_commit() {
    let cluster = TestCluster::start(5).await;
    let leader = cluster.leader().await;
    let index = cluster.write(leader, "before", "split").await;

    // Leave the leader with one follower: two of five is not a majority.
    let partner = *cluster.nodes.keys().find(|id| **id != leader).unwrap();
    let others: Vec<NodeId> = cluster
        .nodes
        .keys()
        .copied()
        .filter(|id| *id != leader && *id != partner)
        .collect();
    for id in &others {
        cluster.network.isolate(*id);
    }

    let err = cluster
        .node(leader)
        .replicate(set("after", "split"))
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::Uncommitted { .. }));
    assert_eq!(cluster.node(leader).status().await.commit_index, index);
    cluster.shutdown().await;
}
