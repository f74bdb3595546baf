//! Election handling for Raft state machine

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{EntryPayload, RaftState, Role};
use crate::error::ConsensusResult;
use crate::raft::message::{Message, RequestVoteRequest, RequestVoteResponse};
use crate::types::Peer;

impl RaftState {
    /// 处理选举超时
    pub(crate) async fn handle_election_timeout(&mut self) -> ConsensusResult<()> {
        // 不在配置中的节点不参与选举
        if !self.config.contains(self.id()) {
            self.reset_election_deadline();
            return Ok(());
        }

        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.peer.id.clone());
        self.set_leader(None);
        self.persist_hard_state().await?;
        self.reset_election_deadline();

        info!(
            parent: &self.span,
            "Starting election for term {} with last log ({}, {})",
            self.current_term,
            self.last_log_index,
            self.last_log_term
        );

        self.votes.clear();
        self.votes.insert(self.peer.id.clone());
        if self.votes.len() >= self.config.quorum() {
            return self.become_leader().await;
        }

        let req = RequestVoteRequest {
            term: self.current_term,
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
        };
        for target in self.config.peers_except(self.id()) {
            self.send(&target, Message::RequestVote(req.clone())).await;
        }
        Ok(())
    }

    /// 处理投票请求
    pub(crate) async fn handle_request_vote(
        &mut self,
        from: Peer,
        req: RequestVoteRequest,
    ) -> ConsensusResult<()> {
        // 仍能联系到领导者时忽略投票请求，避免被移除的节点扰乱集群
        let leader_alive = match self.role {
            Role::Leader => true,
            Role::Follower => self
                .leader_contact
                .is_some_and(|t| t.elapsed() < self.options.election_timeout),
            Role::Candidate => false,
        };
        if leader_alive && req.term > self.current_term {
            debug!(
                parent: &self.span,
                "Ignoring vote request from {} for term {} while leader is alive",
                from,
                req.term
            );
            return Ok(());
        }

        if req.term > self.current_term {
            self.step_down(req.term).await?;
        }

        let mut vote_granted = false;
        let can_vote = self.voted_for.is_none() || self.voted_for.as_deref() == Some(from.id.as_str());
        if req.term == self.current_term
            && can_vote
            && self.is_log_up_to_date(req.last_log_index, req.last_log_term)
        {
            self.voted_for = Some(from.id.clone());
            self.persist_hard_state().await?;
            self.reset_election_deadline();
            vote_granted = true;
            info!(parent: &self.span, "Granted vote to {} for term {}", from, req.term);
        }

        let resp = RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        };
        self.send(&from, Message::RequestVoteResponse(resp)).await;
        Ok(())
    }

    fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        last_log_term > self.last_log_term
            || (last_log_term == self.last_log_term && last_log_index >= self.last_log_index)
    }

    /// 处理投票响应
    pub(crate) async fn handle_request_vote_response(
        &mut self,
        from: Peer,
        resp: RequestVoteResponse,
    ) -> ConsensusResult<()> {
        if resp.term > self.current_term {
            return self.step_down(resp.term).await;
        }
        if self.role != Role::Candidate || resp.term != self.current_term {
            return Ok(());
        }
        if resp.vote_granted && self.config.contains(&from.id) {
            self.votes.insert(from.id.clone());
            debug!(
                parent: &self.span,
                "Vote from {}, {}/{} for term {}",
                from,
                self.votes.len(),
                self.config.quorum(),
                self.current_term
            );
            if self.votes.len() >= self.config.quorum() {
                return self.become_leader().await;
            }
        }
        Ok(())
    }

    async fn become_leader(&mut self) -> ConsensusResult<()> {
        info!(
            parent: &self.span,
            "Became leader for term {} with {} voters",
            self.current_term,
            self.config.len()
        );
        self.role = Role::Leader;
        self.votes.clear();
        self.leader_contact = Some(Instant::now());
        self.set_leader(Some(self.peer.clone()));

        self.next_index.clear();
        self.match_index.clear();
        self.snapshot_in_flight.clear();
        self.sync_peers();

        // 新任期的空日志用于提交之前任期的日志
        self.append_local(EntryPayload::Noop).await?;
        self.replicate_all().await;
        self.heartbeat_deadline = Instant::now() + self.options.heartbeat_interval;
        self.advance_commit().await
    }

    pub(crate) async fn send(&self, target: &Peer, message: Message) {
        if let Err(e) = self.network.send(&self.peer, target, message).await {
            warn!(parent: &self.span, "Failed to send to {}: {}", target, e);
        }
    }
}
