use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::types::{NodeId, Peer};

// === 集群配置 ===
/// Voting members of the consensus group and the address each listens on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Decode, Encode)]
pub struct ClusterConfig {
    pub voters: BTreeMap<NodeId, String>,
}

impl ClusterConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(peer: &Peer) -> Self {
        Self::empty().with_voter(peer)
    }

    /// Adds `peer`, replacing the address of an existing voter with the same id.
    pub fn with_voter(&self, peer: &Peer) -> Self {
        let mut voters = self.voters.clone();
        voters.insert(peer.id.clone(), peer.addr.clone());
        Self { voters }
    }

    pub fn without_voter(&self, id: &str) -> Self {
        let mut voters = self.voters.clone();
        voters.remove(id);
        Self { voters }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.voters.contains_key(id)
    }

    pub fn addr(&self, id: &str) -> Option<&str> {
        self.voters.get(id).map(String::as_str)
    }

    /// Every voter except `id`.
    pub fn peers_except(&self, id: &str) -> Vec<Peer> {
        self.voters
            .iter()
            .filter(|(voter, _)| voter.as_str() != id)
            .map(|(voter, addr)| Peer::new(voter.clone(), addr.clone()))
            .collect()
    }

    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }
}
