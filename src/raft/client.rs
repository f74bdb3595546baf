//! Client request handling for Raft state machine

use tokio::sync::oneshot;
use tracing::{debug, info};

use super::{ClusterConfig, EntryPayload, Pending, RaftState, Role, Waiter};
use crate::error::{ConsensusError, ConsensusResult};
use crate::types::{NodeId, Peer};

impl RaftState {
    fn not_leader(&self) -> ConsensusError {
        ConsensusError::NotLeader(self.leader.as_ref().map(|p| p.id.clone()))
    }

    /// 处理客户端提议
    pub(crate) async fn handle_propose(
        &mut self,
        command: Vec<u8>,
        reply: oneshot::Sender<ConsensusResult<Vec<u8>>>,
    ) -> ConsensusResult<()> {
        if self.role != Role::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return Ok(());
        }

        let index = match self.append_local(EntryPayload::Command(command)).await {
            Ok(index) => index,
            Err(e) => {
                let _ = reply.send(Err(e));
                return Ok(());
            }
        };
        self.pending.insert(
            index,
            Pending {
                term: self.current_term,
                waiter: Waiter::Propose(reply),
            },
        );
        self.replicate_all().await;
        self.advance_commit().await
    }

    pub(crate) async fn handle_add_voter(
        &mut self,
        peer: Peer,
        reply: oneshot::Sender<ConsensusResult<()>>,
    ) -> ConsensusResult<()> {
        if self.config.addr(&peer.id) == Some(peer.addr.as_str()) && self.role == Role::Leader {
            debug!(parent: &self.span, "{} is already a voter", peer);
            let _ = reply.send(Ok(()));
            return Ok(());
        }
        let config = self.config.with_voter(&peer);
        info!(parent: &self.span, "Adding voter {}", peer);
        self.change_config(config, reply).await
    }

    pub(crate) async fn handle_remove_server(
        &mut self,
        id: NodeId,
        reply: oneshot::Sender<ConsensusResult<()>>,
    ) -> ConsensusResult<()> {
        if !self.config.contains(&id) && self.role == Role::Leader {
            let _ = reply.send(Ok(()));
            return Ok(());
        }
        let config = self.config.without_voter(&id);
        info!(parent: &self.span, "Removing server {}", id);
        self.change_config(config, reply).await
    }

    /// Appends `config` as the next configuration; at most one change may be
    /// uncommitted at a time.
    async fn change_config(
        &mut self,
        config: ClusterConfig,
        reply: oneshot::Sender<ConsensusResult<()>>,
    ) -> ConsensusResult<()> {
        if self.role != Role::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return Ok(());
        }
        if self.config_index > self.commit_index {
            let _ = reply.send(Err(ConsensusError::ConfigChangeInProgress));
            return Ok(());
        }

        let index = match self.append_local(EntryPayload::Config(config)).await {
            Ok(index) => index,
            Err(e) => {
                let _ = reply.send(Err(e));
                return Ok(());
            }
        };
        self.pending.insert(
            index,
            Pending {
                term: self.current_term,
                waiter: Waiter::Config(reply),
            },
        );
        self.replicate_all().await;
        self.advance_commit().await
    }
}
