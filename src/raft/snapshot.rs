//! Snapshot handling for Raft state machine

use std::io::Read;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{RaftState, Role, Snapshot};
use crate::error::{ConsensusResult, StorageError};
use crate::raft::message::{InstallSnapshotRequest, InstallSnapshotResponse, Message};
use crate::types::Peer;

impl RaftState {
    pub(crate) async fn maybe_snapshot(&mut self) -> ConsensusResult<()> {
        if self.last_applied.saturating_sub(self.snapshot_index) < self.options.snapshot_threshold {
            return Ok(());
        }
        self.take_snapshot().await
    }

    /// Snapshots the state machine at `last_applied` and compacts the log
    /// behind it, keeping `trailing_logs` entries for slow followers.
    pub(crate) async fn take_snapshot(&mut self) -> ConsensusResult<()> {
        let index = self.last_applied;
        let Some(term) = self.term_at(index).await? else {
            return Err(StorageError::Consistency(format!("no term for applied entry {}", index)).into());
        };

        let mut data = Vec::new();
        self.state_machine.snapshot()?.read_to_end(&mut data).map_err(|e| {
            warn!(parent: &self.span, "Failed to read state machine snapshot: {}", e);
            StorageError::Io(e)
        })?;
        let size = data.len();

        self.snapshots
            .save_snapshot(Snapshot {
                index,
                term,
                config: self.applied_config.clone(),
                data,
            })
            .await?;
        self.snapshot_index = index;
        self.snapshot_term = term;

        let first = self.log.first_index().await?;
        let compact_to = index.saturating_sub(self.options.trailing_logs);
        if compact_to >= first && compact_to > 0 {
            self.log.delete_range(first, compact_to).await?;
        }
        info!(
            parent: &self.span,
            "Snapshot at ({}, {}) with {} bytes, log compacted through {}",
            index,
            term,
            size,
            compact_to
        );
        Ok(())
    }

    /// 发送快照到目标节点
    pub(crate) async fn send_snapshot(&mut self, target: &Peer) -> ConsensusResult<()> {
        if let Some(sent) = self.snapshot_in_flight.get(&target.id) {
            if sent.elapsed() < self.options.election_timeout {
                return Ok(());
            }
        }
        let Some(snap) = self.snapshots.load_snapshot().await? else {
            error!(parent: &self.span, "No snapshot available for {}", target);
            return Ok(());
        };

        info!(
            parent: &self.span,
            "Sending snapshot ({}, {}) to {}",
            snap.index,
            snap.term,
            target
        );
        let req = InstallSnapshotRequest {
            term: self.current_term,
            last_included_index: snap.index,
            last_included_term: snap.term,
            config: snap.config,
            data: snap.data,
        };
        self.snapshot_in_flight.insert(target.id.clone(), Instant::now());
        self.send(target, Message::InstallSnapshot(req)).await;
        Ok(())
    }

    pub(crate) async fn handle_install_snapshot(
        &mut self,
        from: Peer,
        req: InstallSnapshotRequest,
    ) -> ConsensusResult<()> {
        if req.term < self.current_term {
            let resp = InstallSnapshotResponse {
                term: self.current_term,
                success: false,
                last_index: self.last_log_index,
            };
            self.send(&from, Message::InstallSnapshotResponse(resp)).await;
            return Ok(());
        }

        if req.term > self.current_term || self.role != Role::Follower {
            self.step_down(req.term).await?;
        }
        self.leader_contact = Some(Instant::now());
        self.set_leader(Some(from.clone()));
        self.reset_election_deadline();

        let index = req.last_included_index;
        if index <= self.commit_index {
            debug!(parent: &self.span, "Ignoring stale snapshot at {}", index);
            let resp = InstallSnapshotResponse {
                term: self.current_term,
                success: true,
                last_index: index,
            };
            self.send(&from, Message::InstallSnapshotResponse(resp)).await;
            return Ok(());
        }

        info!(
            parent: &self.span,
            "Installing snapshot ({}, {}) from {}",
            index,
            req.last_included_term,
            from
        );
        let keep_suffix = self.term_at(index).await? == Some(req.last_included_term);

        let snap = Snapshot {
            index,
            term: req.last_included_term,
            config: req.config.clone(),
            data: req.data,
        };
        self.state_machine.restore(&mut snap.data.as_slice())?;
        self.snapshots.save_snapshot(snap).await?;

        self.snapshot_index = index;
        self.snapshot_term = req.last_included_term;
        self.applied_config = req.config.clone();
        self.applied_config_index = index;

        if keep_suffix {
            // 快照之后的日志与领导者一致，保留
            let first = self.log.first_index().await?;
            if index >= first {
                self.log.delete_range(first, index).await?;
            }
            self.recompute_config().await?;
        } else {
            self.log.reset(index + 1).await?;
            self.last_log_index = index;
            self.last_log_term = req.last_included_term;
            self.config = req.config;
            self.config_index = index;
        }
        self.commit_index = index;
        self.last_applied = index;

        let resp = InstallSnapshotResponse {
            term: self.current_term,
            success: true,
            last_index: index,
        };
        self.send(&from, Message::InstallSnapshotResponse(resp)).await;
        Ok(())
    }

    pub(crate) async fn handle_install_snapshot_response(
        &mut self,
        from: Peer,
        resp: InstallSnapshotResponse,
    ) -> ConsensusResult<()> {
        if resp.term > self.current_term {
            return self.step_down(resp.term).await;
        }
        if self.role != Role::Leader || resp.term != self.current_term {
            return Ok(());
        }
        self.snapshot_in_flight.remove(&from.id);
        if !self.next_index.contains_key(&from.id) {
            return Ok(());
        }
        if !resp.success {
            warn!(parent: &self.span, "{} rejected snapshot", from);
            return Ok(());
        }

        let matched = self.match_index.entry(from.id.clone()).or_insert(0);
        *matched = (*matched).max(resp.last_index);
        self.next_index.insert(from.id.clone(), resp.last_index + 1);
        self.advance_commit().await?;
        self.send_append(&from).await
    }
}
