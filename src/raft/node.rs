use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Span, info, warn};

use super::{
    ClusterConfig, EntryPayload, Event, HardStateStorage, LogEntry, LogEntryStorage, Message, Network,
    RaftState, Role, SnapshotStorage, StateMachine,
};
use crate::config::RaftConfig;
use crate::error::{ConsensusError, ConsensusResult, report};
use crate::types::{NodeId, Peer, ServerInfo};

/// Durable state a node needs.
#[derive(Clone)]
pub struct RaftStorage {
    pub log: Arc<dyn LogEntryStorage>,
    pub stable: Arc<dyn HardStateStorage>,
    pub snapshots: Arc<dyn SnapshotStorage>,
}

/// Handle to a running consensus node.
pub struct RaftNode {
    peer: Peer,
    commit_timeout: Duration,
    tx: mpsc::UnboundedSender<Event>,
    leader_rx: watch::Receiver<Option<Peer>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl RaftNode {
    /// Recovers state from `storage`, bootstraps a single-voter cluster when
    /// asked to and nothing is on disk, then starts the node's task.
    pub async fn start(
        peer: Peer,
        options: RaftConfig,
        storage: RaftStorage,
        state_machine: Arc<dyn StateMachine>,
        network: Arc<dyn Network>,
        span: Span,
    ) -> ConsensusResult<Self> {
        let hard_state = storage.stable.load_hard_state().await?.unwrap_or_default();
        let snapshot = storage.snapshots.load_snapshot().await?;

        // 状态机从快照恢复，之后的日志随提交重新应用
        let (snapshot_index, snapshot_term, snapshot_config) = match &snapshot {
            Some(snap) => {
                state_machine.restore(&mut snap.data.as_slice())?;
                (snap.index, snap.term, snap.config.clone())
            }
            None => {
                state_machine.restore(&mut std::io::empty())?;
                (0, 0, ClusterConfig::empty())
            }
        };

        let first = storage.log.first_index().await?;
        let mut last = storage.log.last_index().await?;
        let has_state = hard_state.term > 0 || last > 0 || snapshot.is_some();

        let mut state = RaftState {
            peer: peer.clone(),
            options: options.clone(),
            span: span.clone(),
            role: Role::Follower,
            current_term: hard_state.term,
            voted_for: hard_state.voted_for,
            leader: None,
            leader_contact: None,
            config: snapshot_config.clone(),
            config_index: snapshot_index,
            applied_config: snapshot_config,
            applied_config_index: snapshot_index,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            last_log_index: snapshot_index,
            last_log_term: snapshot_term,
            snapshot_index,
            snapshot_term,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            snapshot_in_flight: HashMap::new(),
            pending: BTreeMap::new(),
            election_deadline: Instant::now(),
            heartbeat_deadline: Instant::now(),
            log: storage.log,
            stable: storage.stable,
            snapshots: storage.snapshots,
            state_machine,
            network,
            leader_tx: watch::Sender::new(None),
        };

        if options.bootstrap && !has_state {
            info!(parent: &span, "Bootstrapping cluster with {}", peer);
            let entry = LogEntry {
                term: 1,
                index: 1,
                payload: EntryPayload::Config(ClusterConfig::single(&peer)),
            };
            state.log.store_logs(std::slice::from_ref(&entry)).await?;
            state.current_term = 1;
            state.persist_hard_state().await?;
            last = 1;
        }

        if last >= first && last > 0 {
            state.last_log_index = last;
            state.last_log_term = state.log.get_log(last).await?.term;
            state.recompute_config().await?;
        }
        state.reset_election_deadline();

        info!(
            parent: &span,
            "Raft node {} starting at term {}, log ({}, {}), snapshot {}, {} voters",
            peer,
            state.current_term,
            state.last_log_index,
            state.last_log_term,
            snapshot_index,
            state.config.len()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let leader_rx = state.leader_tx.subscribe();
        let handle = tokio::spawn(Self::run(state, rx, shutdown_rx));

        Ok(Self {
            peer,
            commit_timeout: options.commit_timeout,
            tx,
            leader_rx,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
            span,
        })
    }

    async fn run(
        mut state: RaftState,
        mut rx: mpsc::UnboundedReceiver<Event>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let span = state.span.clone();
        loop {
            let deadline = state.next_deadline();
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    report(&span, state.handle_event(event).await, "handle_event");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    report(&span, state.handle_timeout().await, "handle_timeout");
                }
            }
        }
        state.shutdown();
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    fn submit(&self, event: Event) -> ConsensusResult<()> {
        self.tx.send(event).map_err(|_| ConsensusError::Shutdown)
    }

    async fn wait<T>(&self, rx: oneshot::Receiver<ConsensusResult<T>>) -> ConsensusResult<T> {
        match tokio::time::timeout(self.commit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConsensusError::Shutdown),
            Err(_) => Err(ConsensusError::Timeout),
        }
    }

    /// Replicates `command` and returns what the state machine made of it.
    pub async fn propose(&self, command: Vec<u8>) -> ConsensusResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::Propose { command, reply })?;
        self.wait(rx).await
    }

    pub async fn add_voter(&self, peer: Peer) -> ConsensusResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::AddVoter { peer, reply })?;
        self.wait(rx).await
    }

    pub async fn remove_server(&self, id: impl Into<NodeId>) -> ConsensusResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::RemoveServer { id: id.into(), reply })?;
        self.wait(rx).await
    }

    pub async fn servers(&self) -> ConsensusResult<Vec<ServerInfo>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::GetServers { reply })?;
        rx.await.map_err(|_| ConsensusError::Shutdown)
    }

    /// Hands a message from `from` to the node.
    pub fn deliver(&self, from: Peer, message: Message) -> ConsensusResult<()> {
        self.submit(Event::Message { from, message })
    }

    pub fn leader(&self) -> Option<Peer> {
        self.leader_rx.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.leader().is_some_and(|l| l.id == self.peer.id)
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> ConsensusResult<Peer> {
        let mut rx = self.leader_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(leader)) => (*leader).clone().ok_or(ConsensusError::Timeout),
            Ok(Err(_)) => Err(ConsensusError::Shutdown),
            Err(_) => Err(ConsensusError::Timeout),
        }
    }

    /// Stops the node's task and waits for it; pending proposals fail.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(parent: &self.span, "Raft task ended abnormally: {}", e);
            }
        }
    }
}
