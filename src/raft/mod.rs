//! A compact single-group Raft.
//!
//! One task per node owns a [`RaftState`] and feeds it events: peer messages,
//! client proposals, membership changes and timer expiries. Durable state lives
//! behind the storage traits in [`traits`], peers are reached through
//! [`traits::Network`], and committed commands go to a [`traits::StateMachine`].
//!
//! The implementation covers leader election, log replication with conflict
//! hints, single-server membership changes and snapshot transfer.

mod client;
pub mod cluster_config;
mod election;
pub mod message;
mod node;
mod replication;
mod snapshot;
pub mod traits;


use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{Span, debug, info, warn};

pub use cluster_config::ClusterConfig;
pub use message::{EntryPayload, HardState, LogEntry, Message, Snapshot};
pub use node::{RaftNode, RaftStorage};
pub use traits::{HardStateStorage, LogEntryStorage, Network, SnapshotStorage, StateMachine};

use crate::config::RaftConfig;
use crate::error::{ConsensusError, ConsensusResult, StorageResult};
use crate::types::{NodeId, Peer, ServerInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Raft 事件定义（输入）
pub(crate) enum Event {
    Message {
        from: Peer,
        message: Message,
    },
    Propose {
        command: Vec<u8>,
        reply: oneshot::Sender<ConsensusResult<Vec<u8>>>,
    },
    AddVoter {
        peer: Peer,
        reply: oneshot::Sender<ConsensusResult<()>>,
    },
    RemoveServer {
        id: NodeId,
        reply: oneshot::Sender<ConsensusResult<()>>,
    },
    GetServers {
        reply: oneshot::Sender<Vec<ServerInfo>>,
    },
}

pub(crate) enum Waiter {
    Propose(oneshot::Sender<ConsensusResult<Vec<u8>>>),
    Config(oneshot::Sender<ConsensusResult<()>>),
}

impl Waiter {
    fn complete(self, result: ConsensusResult<Vec<u8>>) {
        match self {
            Waiter::Propose(tx) => {
                let _ = tx.send(result);
            }
            Waiter::Config(tx) => {
                let _ = tx.send(result.map(|_| ()));
            }
        }
    }
}

/// A client waiting for the entry it proposed at some index.
pub(crate) struct Pending {
    term: u64,
    waiter: Waiter,
}

pub(crate) struct RaftState {
    pub(crate) peer: Peer,
    options: RaftConfig,
    span: Span,

    role: Role,
    current_term: u64,
    voted_for: Option<NodeId>,
    leader: Option<Peer>,
    leader_contact: Option<Instant>,

    // 最新配置（追加即生效）与已应用的配置
    config: ClusterConfig,
    config_index: u64,
    applied_config: ClusterConfig,
    applied_config_index: u64,

    commit_index: u64,
    last_applied: u64,
    last_log_index: u64,
    last_log_term: u64,
    snapshot_index: u64,
    snapshot_term: u64,

    // 选举状态
    votes: HashSet<NodeId>,

    // 领导者状态
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    snapshot_in_flight: HashMap<NodeId, Instant>,
    pending: BTreeMap<u64, Pending>,

    election_deadline: Instant,
    heartbeat_deadline: Instant,

    log: Arc<dyn LogEntryStorage>,
    stable: Arc<dyn HardStateStorage>,
    snapshots: Arc<dyn SnapshotStorage>,
    state_machine: Arc<dyn StateMachine>,
    network: Arc<dyn Network>,
    leader_tx: watch::Sender<Option<Peer>>,
}

impl RaftState {
    fn id(&self) -> &str {
        &self.peer.id
    }

    pub(crate) fn next_deadline(&self) -> Instant {
        if self.role == Role::Leader {
            self.heartbeat_deadline
        } else {
            self.election_deadline
        }
    }

    pub(crate) async fn handle_event(&mut self, event: Event) -> ConsensusResult<()> {
        match event {
            Event::Message { from, message } => self.handle_message(from, message).await,
            Event::Propose { command, reply } => self.handle_propose(command, reply).await,
            Event::AddVoter { peer, reply } => self.handle_add_voter(peer, reply).await,
            Event::RemoveServer { id, reply } => self.handle_remove_server(id, reply).await,
            Event::GetServers { reply } => {
                let _ = reply.send(self.servers());
                Ok(())
            }
        }
    }

    pub(crate) async fn handle_timeout(&mut self) -> ConsensusResult<()> {
        if self.role == Role::Leader {
            self.handle_heartbeat_timeout().await
        } else {
            self.handle_election_timeout().await
        }
    }

    async fn handle_message(&mut self, from: Peer, message: Message) -> ConsensusResult<()> {
        match message {
            Message::RequestVote(req) => self.handle_request_vote(from, req).await,
            Message::RequestVoteResponse(resp) => self.handle_request_vote_response(from, resp).await,
            Message::AppendEntries(req) => self.handle_append_entries(from, req).await,
            Message::AppendEntriesResponse(resp) => {
                self.handle_append_entries_response(from, resp).await
            }
            Message::InstallSnapshot(req) => self.handle_install_snapshot(from, req).await,
            Message::InstallSnapshotResponse(resp) => {
                self.handle_install_snapshot_response(from, resp).await
            }
        }
    }

    fn servers(&self) -> Vec<ServerInfo> {
        let leader = self.leader.as_ref().map(|p| p.id.as_str());
        self.config
            .voters
            .iter()
            .map(|(id, addr)| ServerInfo {
                id: id.clone(),
                rpc_addr: addr.clone(),
                is_leader: Some(id.as_str()) == leader,
            })
            .collect()
    }

    // === 持久化与公共辅助 ===

    async fn persist_hard_state(&self) -> ConsensusResult<()> {
        let hard_state = HardState {
            term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        self.stable.save_hard_state(&hard_state).await.map_err(|e| {
            warn!(parent: &self.span, "Failed to persist hard state: {}", e);
            e
        })?;
        Ok(())
    }

    fn reset_election_deadline(&mut self) {
        let base = self.options.election_timeout;
        let jitter = rand::rng().random_range(0..base.as_millis().max(1) as u64);
        self.election_deadline = Instant::now() + base + std::time::Duration::from_millis(jitter);
    }

    fn set_leader(&mut self, leader: Option<Peer>) {
        if self.leader != leader {
            match &leader {
                Some(peer) => info!(parent: &self.span, "Leader is now {} in term {}", peer, self.current_term),
                None => debug!(parent: &self.span, "No known leader in term {}", self.current_term),
            }
            self.leader = leader.clone();
        }
        self.leader_tx.send_if_modified(|current| {
            if *current == leader {
                false
            } else {
                *current = leader;
                true
            }
        });
    }

    /// Term of the entry at `index`, if it is still known locally.
    async fn term_at(&self, index: u64) -> StorageResult<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.snapshot_index {
            return Ok(Some(self.snapshot_term));
        }
        if index > self.last_log_index || index < self.log.first_index().await? {
            return Ok(None);
        }
        Ok(Some(self.log.get_log(index).await?.term))
    }

    /// Moves to follower, adopting `term` when it is newer.
    async fn step_down(&mut self, term: u64) -> ConsensusResult<()> {
        if term > self.current_term {
            info!(
                parent: &self.span,
                "Updating term from {} to {}",
                self.current_term,
                term
            );
            self.current_term = term;
            self.voted_for = None;
            self.persist_hard_state().await?;
            self.set_leader(None);
        }
        if self.role != Role::Follower {
            info!(parent: &self.span, "Stepping down from {} in term {}", self.role, self.current_term);
        }
        let was_leader = self.role == Role::Leader;
        self.role = Role::Follower;
        self.votes.clear();
        if was_leader {
            self.set_leader(None);
            self.next_index.clear();
            self.match_index.clear();
            self.snapshot_in_flight.clear();
            self.fail_pending(|| ConsensusError::LeadershipLost);
        }
        self.reset_election_deadline();
        Ok(())
    }

    fn fail_pending(&mut self, err: impl Fn() -> ConsensusError) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            pending.waiter.complete(Err(err()));
        }
    }

    /// Rebuilds the latest configuration after the log suffix changed: the
    /// newest config entry still in the log wins, else the applied one.
    async fn recompute_config(&mut self) -> StorageResult<()> {
        let first = self.log.first_index().await?.max(self.applied_config_index + 1);
        let mut index = self.last_log_index;
        while index >= first && index > 0 {
            let entry = self.log.get_log(index).await?;
            if let EntryPayload::Config(config) = entry.payload {
                self.config = config;
                self.config_index = index;
                return Ok(());
            }
            index -= 1;
        }
        self.config = self.applied_config.clone();
        self.config_index = self.applied_config_index;
        Ok(())
    }

    pub(crate) fn shutdown(&mut self) {
        self.fail_pending(|| ConsensusError::Shutdown);
        self.set_leader(None);
        info!(parent: &self.span, "Raft node {} stopped in term {}", self.peer, self.current_term);
    }
}
