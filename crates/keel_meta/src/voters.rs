//! Bounded voter management for the consensus group.
//!
//! Keeping every member a voter makes quorums larger and elections
//! slower, so the registry caps how many nodes vote at once. The
//! consensus layer, reached through [`VoterClient`], stays the source of
//! truth for who currently votes; the registry re-reads it on every call
//! and never caches.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use keel_consensus::log::NodeId;

/// Whether a node takes part in consensus votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanVote {
    Yes,
    No,
}

/// Access to the consensus layer's voter configuration.
#[async_trait]
pub trait VoterClient: Send + Sync + 'static {
    /// Nodes that currently vote.
    async fn voters(&self) -> anyhow::Result<BTreeSet<NodeId>>;

    /// Grant or revoke voting rights for a group of nodes.
    async fn set_voter_status(&self, nodes: &[NodeId], status: CanVote) -> anyhow::Result<()>;
}

/// Grants voting rights up to a fixed cap.
pub struct VoterRegistry {
    client: Arc<dyn VoterClient>,
    max_voters: usize,
}

impl VoterRegistry {
    pub fn new(client: Arc<dyn VoterClient>, max_voters: usize) -> Self {
        Self { client, max_voters }
    }

    pub fn max_voters(&self) -> usize {
        self.max_voters
    }

    /// Current voters, straight from the consensus layer.
    pub async fn voters(&self) -> anyhow::Result<BTreeSet<NodeId>> {
        self.client.voters().await
    }

    pub async fn insert_voter(&self, node: NodeId) -> anyhow::Result<()> {
        self.insert_voters(&[node]).await
    }

    pub async fn remove_voter(&self, node: NodeId) -> anyhow::Result<()> {
        self.remove_voters(&[node]).await
    }

    /// Make candidates voters, in the order given, while the cap allows.
    /// Candidates that already vote keep their seat and consume no new
    /// capacity; candidates past the cap are left as non-voters.
    pub async fn insert_voters(&self, candidates: &[NodeId]) -> anyhow::Result<()> {
        let current = self.client.voters().await?;
        let mut granted: Vec<NodeId> = Vec::new();
        for &node in candidates {
            if current.contains(&node) || granted.contains(&node) {
                continue;
            }
            if current.len() + granted.len() >= self.max_voters {
                tracing::warn!(
                    node,
                    max_voters = self.max_voters,
                    "voter limit reached; node stays a non-voter"
                );
                continue;
            }
            granted.push(node);
        }
        if !granted.is_empty() {
            self.client.set_voter_status(&granted, CanVote::Yes).await?;
        }
        Ok(())
    }

    /// Revoke voting rights unconditionally. Removing a node that does
    /// not vote is a no-op on the consensus side, so this is safe to call
    /// on any departure.
    pub async fn remove_voters(&self, nodes: &[NodeId]) -> anyhow::Result<()> {
        let mut unique: Vec<NodeId> = Vec::new();
        for &node in nodes {
            if !unique.contains(&node) {
                unique.push(node);
            }
        }
        if unique.is_empty() {
            return Ok(());
        }
        self.client.set_voter_status(&unique, CanVote::No).await
    }
}

/// Voter configuration held in process memory. Stands in for the real
/// consensus layer on single-node deployments and in tests.
#[derive(Default)]
pub struct InMemoryVoterClient {
    voters: RwLock<BTreeSet<NodeId>>,
}

#[async_trait]
impl VoterClient for InMemoryVoterClient {
    async fn voters(&self) -> anyhow::Result<BTreeSet<NodeId>> {
        Ok(self.voters.read().unwrap().clone())
    }

    async fn set_voter_status(&self, nodes: &[NodeId], status: CanVote) -> anyhow::Result<()> {
        let mut voters = self.voters.write().unwrap();
        for node in nodes {
            match status {
                CanVote::Yes => {
                    voters.insert(*node);
                }
                CanVote::No => {
                    voters.remove(node);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory client that also records every status call.
    #[derive(Default)]
    struct RecordingVoterClient {
        voters: RwLock<BTreeSet<NodeId>>,
        calls: Mutex<Vec<(Vec<NodeId>, CanVote)>>,
    }

    #[async_trait]
    impl VoterClient for RecordingVoterClient {
        async fn voters(&self) -> anyhow::Result<BTreeSet<NodeId>> {
            Ok(self.voters.read().unwrap().clone())
        }

        async fn set_voter_status(&self, nodes: &[NodeId], status: CanVote) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((nodes.to_vec(), status));
            let mut voters = self.voters.write().unwrap();
            for node in nodes {
                match status {
                    CanVote::Yes => {
                        voters.insert(*node);
                    }
                    CanVote::No => {
                        voters.remove(node);
                    }
                }
            }
            Ok(())
        }
    }

    struct FailingClient;

    #[async_trait]
    impl VoterClient for FailingClient {
        async fn voters(&self) -> anyhow::Result<BTreeSet<NodeId>> {
            anyhow::bail!("voter configuration unavailable")
        }

        async fn set_voter_status(&self, _: &[NodeId], _: CanVote) -> anyhow::Result<()> {
            anyhow::bail!("voter configuration unavailable")
        }
    }

    async fn voters_of(client: &Arc<RecordingVoterClient>) -> Vec<NodeId> {
        client.voters().await.expect("voters").into_iter().collect()
    }

    #[tokio::test]
    async fn candidates_become_voters_in_order_up_to_the_cap() {
        let client = Arc::new(RecordingVoterClient::default());
        let registry = VoterRegistry::new(client.clone(), 3);

        registry.insert_voters(&[1, 2, 3, 4]).await.expect("insert");
        assert_eq!(voters_of(&client).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reinserting_a_voter_sends_nothing() {
        let client = Arc::new(RecordingVoterClient::default());
        let registry = VoterRegistry::new(client.clone(), 3);

        registry.insert_voter(1).await.expect("insert");
        registry.insert_voter(1).await.expect("reinsert");

        assert_eq!(voters_of(&client).await, vec![1]);
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_candidates_consume_one_seat() {
        let client = Arc::new(RecordingVoterClient::default());
        let registry = VoterRegistry::new(client.clone(), 3);

        registry.insert_voters(&[1, 1, 2]).await.expect("insert");
        assert_eq!(voters_of(&client).await, vec![1, 2]);
        assert_eq!(
            client.calls.lock().unwrap().as_slice(),
            &[(vec![1, 2], CanVote::Yes)]
        );
    }

    #[tokio::test]
    async fn removing_a_voter_frees_its_seat() {
        let client = Arc::new(RecordingVoterClient::default());
        let registry = VoterRegistry::new(client.clone(), 3);

        registry.insert_voters(&[1, 2, 3]).await.expect("insert");
        registry.insert_voter(4).await.expect("over cap");
        assert_eq!(voters_of(&client).await, vec![1, 2, 3]);

        registry.remove_voter(2).await.expect("remove");
        registry.insert_voter(4).await.expect("fill freed seat");
        assert_eq!(voters_of(&client).await, vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn removal_is_unconditional() {
        let client = Arc::new(RecordingVoterClient::default());
        let registry = VoterRegistry::new(client.clone(), 3);

        registry.remove_voter(9).await.expect("remove non-voter");
        assert_eq!(
            client.calls.lock().unwrap().as_slice(),
            &[(vec![9], CanVote::No)]
        );
    }

    #[tokio::test]
    async fn client_errors_propagate() {
        let registry = VoterRegistry::new(Arc::new(FailingClient), 3);
        let err = registry.insert_voter(1).await.expect_err("should fail");
        assert!(err.to_string().contains("unavailable"));
    }
}
