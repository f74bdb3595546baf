//! Pull-based replication: one task per known server copies that server's
//! records into the local log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::ClientTlsConfig;
use tracing::{Span, debug, info, warn};

use crate::error::{ReplicationError, Result};
use crate::network::connect_lazy;
use crate::network::pb;
use crate::network::pb::log_client::LogClient;
use crate::server::SUBJECT_METADATA_KEY;
use crate::types::{Offset, Record};

/// Source of records at a remote server.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// Opens a stream of every record at `addr`, from offset 0 on.
    async fn open(&self, addr: &str) -> Result<BoxStream<'static, Result<Record>>>;
}

/// Sink the replicated records are produced into.
#[async_trait]
pub trait LocalProducer: Send + Sync + 'static {
    async fn produce(&self, record: Record) -> Result<Offset>;
}

/// [`Upstream`] backed by the peer's `ConsumeStream` RPC.
pub struct GrpcUpstream {
    subject: String,
    tls: Option<ClientTlsConfig>,
    connect_timeout: Duration,
}

impl GrpcUpstream {
    pub fn new(subject: impl Into<String>, tls: Option<ClientTlsConfig>) -> Self {
        Self {
            subject: subject.into(),
            tls,
            connect_timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl Upstream for GrpcUpstream {
    async fn open(&self, addr: &str) -> Result<BoxStream<'static, Result<Record>>> {
        let dial_error = |message: String| ReplicationError::Dial {
            addr: addr.to_string(),
            message,
        };
        let channel = connect_lazy(addr, self.connect_timeout, self.tls.as_ref())
            .map_err(|e| dial_error(e.to_string()))?;
        let subject: MetadataValue<Ascii> = self
            .subject
            .parse()
            .map_err(|e| dial_error(format!("invalid subject {:?}: {}", self.subject, e)))?;

        let mut request = tonic::Request::new(pb::ConsumeRequest { offset: 0 });
        request.metadata_mut().insert(SUBJECT_METADATA_KEY, subject);

        let mut client = LogClient::new(channel);
        let stream = client
            .consume_stream(request)
            .await
            .map_err(|status| ReplicationError::Stream {
                addr: addr.to_string(),
                status: Box::new(status),
            })?
            .into_inner();

        let addr = addr.to_string();
        Ok(stream
            .map(move |item| match item {
                Ok(response) => Ok(response.record.unwrap_or_default().into()),
                Err(status) => Err(ReplicationError::Stream {
                    addr: addr.clone(),
                    status: Box::new(status),
                }
                .into()),
            })
            .boxed())
    }
}

struct Worker {
    leave_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ReplicatorState {
    servers: HashMap<String, Worker>,
    closed: bool,
}

pub struct Replicator {
    upstream: Arc<dyn Upstream>,
    local: Arc<dyn LocalProducer>,
    state: Mutex<ReplicatorState>,
    close_tx: watch::Sender<bool>,
    span: Span,
}

impl Replicator {
    pub fn new(upstream: Arc<dyn Upstream>, local: Arc<dyn LocalProducer>, span: Span) -> Self {
        Self {
            upstream,
            local,
            state: Mutex::new(ReplicatorState::default()),
            close_tx: watch::Sender::new(false),
            span,
        }
    }

    /// Starts replicating from `addr` under `name`. Joining a known name, or
    /// joining after close, does nothing.
    pub fn join(&self, name: &str, addr: &str) {
        let mut state = self.state.lock();
        if state.closed || state.servers.contains_key(name) {
            return;
        }

        let (leave_tx, leave_rx) = oneshot::channel();
        let handle = tokio::spawn(replicate(
            self.upstream.clone(),
            self.local.clone(),
            name.to_string(),
            addr.to_string(),
            leave_rx,
            self.close_tx.subscribe(),
            self.span.clone(),
        ));
        state.servers.insert(name.to_string(), Worker { leave_tx, handle });
        info!(parent: &self.span, "Replicating from {} at {}", name, addr);
    }

    /// Stops replicating from `name` and waits for its task to finish.
    pub async fn leave(&self, name: &str) {
        let worker = self.state.lock().servers.remove(name);
        if let Some(worker) = worker {
            let _ = worker.leave_tx.send(());
            if let Err(e) = worker.handle.await {
                warn!(parent: &self.span, "Replication task for {} failed: {}", name, e);
            }
            info!(parent: &self.span, "Stopped replicating from {}", name);
        }
    }

    /// Stops every task. Later joins are ignored.
    pub async fn close(&self) {
        let workers: Vec<(String, Worker)> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.servers.drain().collect()
        };
        self.close_tx.send_replace(true);

        for (name, worker) in workers {
            if let Err(e) = worker.handle.await {
                warn!(parent: &self.span, "Replication task for {} failed: {}", name, e);
            }
        }
        info!(parent: &self.span, "Replicator closed");
    }

    /// Names currently being replicated from.
    pub fn servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().servers.keys().cloned().collect();
        names.sort();
        names
    }
}

async fn replicate(
    upstream: Arc<dyn Upstream>,
    local: Arc<dyn LocalProducer>,
    name: String,
    addr: String,
    mut leave_rx: oneshot::Receiver<()>,
    mut close_rx: watch::Receiver<bool>,
    span: Span,
) {
    let mut stream = tokio::select! {
        biased;
        _ = &mut leave_rx => return,
        _ = close_rx.changed() => return,
        opened = upstream.open(&addr) => match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(parent: &span, "Failed to open stream from {}: {}", name, e);
                return;
            }
        },
    };

    loop {
        let record = tokio::select! {
            biased;
            _ = &mut leave_rx => return,
            _ = close_rx.changed() => return,
            item = stream.next() => match item {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    warn!(parent: &span, "Replication from {} stopped: {}", name, e);
                    return;
                }
                None => {
                    debug!(parent: &span, "Stream from {} ended", name);
                    return;
                }
            },
        };

        // 已取出的记录先写完，再检查退出信号
        if let Err(e) = local.produce(Record::new(record.value)).await {
            warn!(parent: &span, "Failed to produce record from {}: {}", name, e);
        }
    }
}
