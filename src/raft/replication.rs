//! Log replication, commit and apply.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{EntryPayload, LogEntry, RaftState, Role};
use crate::error::{ConsensusError, ConsensusResult, StorageError};
use crate::raft::message::{AppendEntriesRequest, AppendEntriesResponse, Message};
use crate::types::Peer;

impl RaftState {
    pub(crate) async fn handle_heartbeat_timeout(&mut self) -> ConsensusResult<()> {
        self.heartbeat_deadline = Instant::now() + self.options.heartbeat_interval;
        self.replicate_all().await;
        Ok(())
    }

    /// Appends a new entry in the current term and returns its index.
    pub(crate) async fn append_local(&mut self, payload: EntryPayload) -> ConsensusResult<u64> {
        let index = self.last_log_index + 1;
        let entry = LogEntry {
            term: self.current_term,
            index,
            payload,
        };
        self.log.store_logs(std::slice::from_ref(&entry)).await.map_err(|e| {
            warn!(parent: &self.span, "Failed to append entry {}: {}", index, e);
            e
        })?;
        self.last_log_index = index;
        self.last_log_term = self.current_term;
        if let EntryPayload::Config(config) = entry.payload {
            self.config = config;
            self.config_index = index;
            self.sync_peers();
        }
        Ok(index)
    }

    /// Aligns the replication progress with the current voter set.
    pub(crate) fn sync_peers(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let peers = self.config.peers_except(self.id());
        self.next_index
            .retain(|id, _| peers.iter().any(|p| &p.id == id));
        self.match_index
            .retain(|id, _| peers.iter().any(|p| &p.id == id));
        for peer in peers {
            let next = self.last_log_index + 1;
            self.next_index.entry(peer.id.clone()).or_insert(next);
            self.match_index.entry(peer.id).or_insert(0);
        }
    }

    pub(crate) async fn replicate_all(&mut self) {
        for peer in self.config.peers_except(self.id()) {
            if let Err(e) = self.send_append(&peer).await {
                warn!(parent: &self.span, "Failed to replicate to {}: {}", peer, e);
            }
        }
    }

    /// Sends `peer` the entries it is missing, or the snapshot when they are
    /// no longer in the log.
    pub(crate) async fn send_append(&mut self, peer: &Peer) -> ConsensusResult<()> {
        let Some(&next) = self.next_index.get(&peer.id) else {
            return Ok(());
        };
        let first = self.log.first_index().await?;
        let prev_log_index = next - 1;

        let prev_known = prev_log_index == 0
            || prev_log_index == self.snapshot_index
            || (prev_log_index >= first && prev_log_index <= self.last_log_index);
        if next < first || !prev_known {
            return self.send_snapshot(peer).await;
        }
        let Some(prev_log_term) = self.term_at(prev_log_index).await? else {
            return self.send_snapshot(peer).await;
        };

        let last = self
            .last_log_index
            .min(next + self.options.max_append_entries as u64 - 1);
        let mut entries = Vec::with_capacity((last + 1).saturating_sub(next) as usize);
        for index in next..=last {
            entries.push(self.log.get_log(index).await?);
        }

        // 乐观推进，失败时由冲突提示回退
        if let Some(entry) = entries.last() {
            self.next_index.insert(peer.id.clone(), entry.index + 1);
        }

        let req = AppendEntriesRequest {
            term: self.current_term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        self.send(peer, Message::AppendEntries(req)).await;
        Ok(())
    }

    pub(crate) async fn handle_append_entries(
        &mut self,
        from: Peer,
        mut req: AppendEntriesRequest,
    ) -> ConsensusResult<()> {
        if req.term < self.current_term {
            let resp = AppendEntriesResponse {
                term: self.current_term,
                success: false,
                matched_index: 0,
                conflict_index: 0,
            };
            self.send(&from, Message::AppendEntriesResponse(resp)).await;
            return Ok(());
        }

        if req.term > self.current_term || self.role != Role::Follower {
            self.step_down(req.term).await?;
        }
        self.leader_contact = Some(Instant::now());
        self.set_leader(Some(from.clone()));
        self.reset_election_deadline();

        // 快照之前的日志一定已提交，跳过
        if req.prev_log_index < self.snapshot_index {
            let skip = (self.snapshot_index - req.prev_log_index) as usize;
            if skip > req.entries.len() {
                let resp = AppendEntriesResponse {
                    term: self.current_term,
                    success: true,
                    matched_index: req.prev_log_index + req.entries.len() as u64,
                    conflict_index: 0,
                };
                self.send(&from, Message::AppendEntriesResponse(resp)).await;
                return Ok(());
            }
            req.entries.drain(..skip);
            req.prev_log_index = self.snapshot_index;
            req.prev_log_term = self.snapshot_term;
        }

        if let Some(conflict_index) = self.check_prev(req.prev_log_index, req.prev_log_term).await? {
            debug!(
                parent: &self.span,
                "Rejecting entries after {} from {}, resume at {}",
                req.prev_log_index,
                from,
                conflict_index
            );
            let resp = AppendEntriesResponse {
                term: self.current_term,
                success: false,
                matched_index: 0,
                conflict_index,
            };
            self.send(&from, Message::AppendEntriesResponse(resp)).await;
            return Ok(());
        }

        let matched_index = req.prev_log_index + req.entries.len() as u64;
        self.append_from_leader(req.entries).await?;

        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(matched_index).max(self.commit_index);
            self.apply_committed().await?;
        }

        let resp = AppendEntriesResponse {
            term: self.current_term,
            success: true,
            matched_index,
            conflict_index: 0,
        };
        self.send(&from, Message::AppendEntriesResponse(resp)).await;
        Ok(())
    }

    /// Returns where the leader should resume when the entry before the
    /// batch does not match, `None` when it does.
    async fn check_prev(&self, prev_log_index: u64, prev_log_term: u64) -> ConsensusResult<Option<u64>> {
        if prev_log_index > self.last_log_index {
            return Ok(Some(self.last_log_index + 1));
        }
        match self.term_at(prev_log_index).await? {
            Some(term) if term == prev_log_term => Ok(None),
            Some(term) => {
                // 回退到冲突任期的第一条日志
                let first = self.log.first_index().await?.max(self.snapshot_index + 1);
                let mut index = prev_log_index;
                while index > first && self.term_at(index - 1).await? == Some(term) {
                    index -= 1;
                }
                Ok(Some(index))
            }
            None => Ok(Some(self.snapshot_index + 1)),
        }
    }

    async fn append_from_leader(&mut self, entries: Vec<LogEntry>) -> ConsensusResult<()> {
        let mut new_from = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            if entry.index > self.last_log_index {
                new_from = i;
                break;
            }
            if self.term_at(entry.index).await? == Some(entry.term) {
                continue;
            }
            if entry.index <= self.commit_index {
                return Err(StorageError::Consistency(format!(
                    "leader conflicts with committed entry {}",
                    entry.index
                ))
                .into());
            }
            info!(
                parent: &self.span,
                "Truncating conflicting entries from {} to {}",
                entry.index,
                self.last_log_index
            );
            self.log.delete_range(entry.index, self.last_log_index).await?;
            self.last_log_index = entry.index - 1;
            self.last_log_term = self.term_at(self.last_log_index).await?.unwrap_or(0);
            if self.config_index >= entry.index {
                self.recompute_config().await?;
            }
            new_from = i;
            break;
        }

        let entries = &entries[new_from..];
        let Some(last) = entries.last() else {
            return Ok(());
        };
        self.log.store_logs(entries).await?;
        self.last_log_index = last.index;
        self.last_log_term = last.term;
        for entry in entries {
            if let EntryPayload::Config(config) = &entry.payload {
                self.config = config.clone();
                self.config_index = entry.index;
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_append_entries_response(
        &mut self,
        from: Peer,
        resp: AppendEntriesResponse,
    ) -> ConsensusResult<()> {
        if resp.term > self.current_term {
            return self.step_down(resp.term).await;
        }
        if self.role != Role::Leader || resp.term != self.current_term {
            return Ok(());
        }
        let Some(&next) = self.next_index.get(&from.id) else {
            return Ok(());
        };

        if resp.success {
            let matched = self.match_index.entry(from.id.clone()).or_insert(0);
            *matched = (*matched).max(resp.matched_index);
            self.next_index
                .insert(from.id.clone(), next.max(resp.matched_index + 1));
            self.advance_commit().await?;
            if self.next_index.get(&from.id).is_some_and(|&n| n <= self.last_log_index) {
                self.send_append(&from).await?;
            }
        } else {
            let next = resp.conflict_index.min(next).max(1);
            self.next_index.insert(from.id.clone(), next);
            self.send_append(&from).await?;
        }
        Ok(())
    }

    /// Commits the highest index stored on a majority in the current term.
    pub(crate) async fn advance_commit(&mut self) -> ConsensusResult<()> {
        if self.role != Role::Leader || self.config.is_empty() {
            return Ok(());
        }
        let mut matched: Vec<u64> = self
            .config
            .voters
            .keys()
            .map(|id| {
                if id == self.id() {
                    self.last_log_index
                } else {
                    self.match_index.get(id).copied().unwrap_or(0)
                }
            })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.config.quorum() - 1];

        if candidate > self.commit_index && self.term_at(candidate).await? == Some(self.current_term) {
            debug!(parent: &self.span, "Commit index {} -> {}", self.commit_index, candidate);
            self.commit_index = candidate;
            self.apply_committed().await?;
        }
        Ok(())
    }

    /// Applies committed entries in order and answers their proposers.
    pub(crate) async fn apply_committed(&mut self) -> ConsensusResult<()> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.log.get_log(index).await?;
            let result = match &entry.payload {
                EntryPayload::Command(command) => self
                    .state_machine
                    .apply(index, command)
                    .await
                    .map_err(ConsensusError::from),
                EntryPayload::Config(config) => {
                    self.applied_config = config.clone();
                    self.applied_config_index = index;
                    Ok(Vec::new())
                }
                EntryPayload::Noop => Ok(Vec::new()),
            };
            self.last_applied = index;

            if let Err(e) = &result {
                warn!(parent: &self.span, "Failed to apply entry {}: {}", index, e);
            }
            if let Some(pending) = self.pending.remove(&index) {
                if pending.term == entry.term {
                    pending.waiter.complete(result);
                } else {
                    pending.waiter.complete(Err(ConsensusError::LeadershipLost));
                }
            }
        }

        // 被移出配置的领导者在变更提交后退位
        if self.role == Role::Leader
            && self.config_index <= self.commit_index
            && !self.config.contains(self.id())
        {
            info!(parent: &self.span, "Removed from the configuration, stepping down");
            self.step_down(self.current_term).await?;
        }

        self.maybe_snapshot().await
    }
}
