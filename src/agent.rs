//! Wires storage, consensus, replication and the RPC server into one node.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{ClientTlsConfig, Server, ServerTlsConfig};
use tracing::{Span, debug, info, info_span, warn};

use crate::config::{Config, RaftConfig, SegmentConfig};
use crate::distributed::DistributedLog;
use crate::error::{ConsensusError, Error, Result};
use crate::network::{GrpcNetwork, GrpcNetworkOptions};
use crate::replicator::{GrpcUpstream, Replicator};
use crate::server::{
    AclAuthorizer, AllowAll, Authorizer, LogService, MetadataSubjectResolver, SubjectResolver,
};
use crate::types::Peer;

/// How records reach the other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReplicationMode {
    /// Appends go through consensus; membership changes the voter set.
    #[default]
    Consensus,
    /// Every node bootstraps alone and pulls the records of the servers it
    /// is told about. The pull topology must be acyclic.
    Mirror,
}

#[derive(Clone, Default)]
pub struct AgentConfig {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub node_name: String,
    pub bootstrap: bool,
    /// Addresses of existing members, for the membership collaborator.
    pub start_join_addrs: Vec<String>,
    pub mode: ReplicationMode,
    pub server_tls: Option<ServerTlsConfig>,
    pub peer_tls: Option<ClientTlsConfig>,
    pub acl_model_file: Option<PathBuf>,
    pub acl_policy_file: Option<PathBuf>,
    /// Subject presented on calls to other nodes.
    pub subject: String,
    /// Defaults to [`MetadataSubjectResolver`].
    pub subject_resolver: Option<Arc<dyn SubjectResolver>>,
    pub segment: SegmentConfig,
    pub raft: RaftConfig,
}

/// Receives cluster membership events.
#[async_trait]
pub trait MembershipHandler: Send + Sync {
    async fn join(&self, name: &str, addr: &str) -> Result<()>;
    async fn leave(&self, name: &str) -> Result<()>;
}

struct ServerHandle {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<std::result::Result<(), tonic::transport::Error>>,
}

pub struct Agent {
    config: AgentConfig,
    rpc_addr: SocketAddr,
    dlog: Arc<DistributedLog>,
    network: GrpcNetwork,
    replicator: Replicator,
    log_service: LogService,
    server: Mutex<Option<ServerHandle>>,
    membership_stopped: AtomicBool,
    shutdown: tokio::sync::Mutex<bool>,
    span: Span,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> anyhow::Result<Self> {
        let span = info_span!("agent", node = %config.node_name);

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.bind_addr))?;
        let rpc_addr = listener.local_addr()?;

        let network = GrpcNetwork::new(
            GrpcNetworkOptions {
                tls: config.peer_tls.clone(),
                ..Default::default()
            },
            span.clone(),
        );
        let dlog_config = Config {
            segment: config.segment.clone(),
            raft: RaftConfig {
                local_id: config.node_name.clone(),
                advertise_addr: rpc_addr.to_string(),
                bootstrap: config.bootstrap || config.mode == ReplicationMode::Mirror,
                ..config.raft.clone()
            },
        };
        let dlog = Arc::new(
            DistributedLog::new(
                &config.data_dir,
                dlog_config,
                Arc::new(network.clone()),
                span.clone(),
            )
            .await
            .context("failed to open distributed log")?,
        );

        let replicator = Replicator::new(
            Arc::new(GrpcUpstream::new(config.subject.clone(), config.peer_tls.clone())),
            dlog.clone(),
            span.clone(),
        );

        let authorizer: Arc<dyn Authorizer> = match (&config.acl_model_file, &config.acl_policy_file) {
            (Some(model), Some(policy)) => Arc::new(AclAuthorizer::new(model, policy).await?),
            _ => Arc::new(AllowAll),
        };
        let resolver = config
            .subject_resolver
            .clone()
            .unwrap_or_else(|| Arc::new(MetadataSubjectResolver));
        let log_service = LogService::new(dlog.clone(), authorizer, span.clone());

        let mut builder = Server::builder();
        if let Some(tls) = config.server_tls.clone() {
            builder = builder.tls_config(tls).context("invalid server TLS config")?;
        }
        let router = builder
            .add_service(log_service.clone().into_server(resolver))
            .add_service(dlog.raft_service());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(router.serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            async move {
                let _ = shutdown_rx.await;
            },
        ));

        info!(parent: &span, "Agent {} serving on {}", config.node_name, rpc_addr);
        Ok(Self {
            config,
            rpc_addr,
            dlog,
            network,
            replicator,
            log_service,
            server: Mutex::new(Some(ServerHandle { shutdown_tx, handle })),
            membership_stopped: AtomicBool::new(false),
            shutdown: tokio::sync::Mutex::new(false),
            span,
        })
    }

    /// Address the RPC server is bound to.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<DistributedLog> {
        &self.dlog
    }

    pub fn peer(&self) -> Peer {
        Peer::new(self.config.node_name.clone(), self.rpc_addr.to_string())
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<Peer> {
        self.dlog.wait_for_leader(timeout).await
    }

    /// Stops membership, replication, the server and the log, in that
    /// order. Later calls do nothing.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let mut shut = self.shutdown.lock().await;
        if *shut {
            return Ok(());
        }
        *shut = true;
        info!(parent: &self.span, "Shutting down agent {}", self.config.node_name);

        self.membership_stopped.store(true, Ordering::SeqCst);
        self.replicator.close().await;

        self.log_service.shutdown();
        let server = self.server.lock().take();
        if let Some(server) = server {
            let _ = server.shutdown_tx.send(());
            match server.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(parent: &self.span, "Server stopped with error: {}", e),
                Err(e) => warn!(parent: &self.span, "Server task failed: {}", e),
            }
        }

        self.dlog.close().await.context("failed to close distributed log")?;
        self.network.shutdown();
        info!(parent: &self.span, "Agent {} stopped", self.config.node_name);
        Ok(())
    }
}

#[async_trait]
impl MembershipHandler for Agent {
    async fn join(&self, name: &str, addr: &str) -> Result<()> {
        if self.membership_stopped.load(Ordering::SeqCst) || name == self.config.node_name {
            return Ok(());
        }
        match self.config.mode {
            ReplicationMode::Consensus => match self.dlog.join(name, addr).await {
                Err(Error::Consensus(ConsensusError::NotLeader(leader))) => {
                    debug!(parent: &self.span, "Ignoring join of {}, leader is {:?}", name, leader);
                    Ok(())
                }
                result => result,
            },
            ReplicationMode::Mirror => {
                self.replicator.join(name, addr);
                Ok(())
            }
        }
    }

    async fn leave(&self, name: &str) -> Result<()> {
        if self.membership_stopped.load(Ordering::SeqCst) || name == self.config.node_name {
            return Ok(());
        }
        match self.config.mode {
            ReplicationMode::Consensus => match self.dlog.leave(name).await {
                Err(Error::Consensus(ConsensusError::NotLeader(leader))) => {
                    debug!(parent: &self.span, "Ignoring leave of {}, leader is {:?}", name, leader);
                    Ok(())
                }
                result => result,
            },
            ReplicationMode::Mirror => {
                self.replicator.leave(name).await;
                Ok(())
            }
        }
    }
}
