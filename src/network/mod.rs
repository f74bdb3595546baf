// network.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{Span, debug, info, warn};

use crate::error::{RpcError, RpcResult};
use crate::raft::{Message, Network, RaftNode};
use crate::types::Peer;
use pb::raft_client::RaftClient;
use pb::raft_server::{Raft, RaftServer};

pub mod pb;

/// Prefixes a bare `host:port` with the scheme matching the TLS setting.
pub fn endpoint_uri(addr: &str, tls: bool) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else if tls {
        format!("https://{}", addr)
    } else {
        format!("http://{}", addr)
    }
}

/// Builds a lazily connecting channel to `addr`.
pub fn connect_lazy(
    addr: &str,
    connect_timeout: Duration,
    tls: Option<&ClientTlsConfig>,
) -> RpcResult<Channel> {
    let uri = endpoint_uri(addr, tls.is_some());
    let mut endpoint = Endpoint::from_shared(uri)
        .map_err(|e| RpcError::Network(format!("Invalid endpoint {}: {}", addr, e)))?
        .connect_timeout(connect_timeout);
    if let Some(tls) = tls {
        endpoint = endpoint
            .tls_config(tls.clone())
            .map_err(|e| RpcError::Network(format!("Invalid TLS config for {}: {}", addr, e)))?;
    }
    Ok(endpoint.connect_lazy())
}

#[derive(Debug, Clone)]
pub struct GrpcNetworkOptions {
    pub connect_timeout: Duration,
    /// Messages sent to one peer in a single call at most.
    pub batch_size: usize,
    /// A sender with nothing to send for this long is dropped; peers that
    /// left the configuration stop getting traffic and are pruned this way.
    pub idle_timeout: Duration,
    pub tls: Option<ClientTlsConfig>,
}

impl Default for GrpcNetworkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            batch_size: 64,
            idle_timeout: Duration::from_secs(30),
            tls: None,
        }
    }
}

/// Raft transport over gRPC: one queue and one sender task per peer address,
/// so messages to a peer arrive in the order they were sent.
#[derive(Clone)]
pub struct GrpcNetwork {
    options: GrpcNetworkOptions,
    outgoing_tx: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>>,
    shutdown: watch::Sender<bool>,
    span: Span,
}

impl GrpcNetwork {
    pub fn new(options: GrpcNetworkOptions, span: Span) -> Self {
        Self {
            options,
            outgoing_tx: Arc::new(RwLock::new(HashMap::new())),
            shutdown: watch::Sender::new(false),
            span,
        }
    }

    fn get_outgoing_tx(&self, from: &Peer, addr: &str) -> RpcResult<mpsc::UnboundedSender<Message>> {
        if let Some(tx) = self.outgoing_tx.read().get(addr) {
            return Ok(tx.clone());
        }

        let mut outgoing = self.outgoing_tx.write();
        if let Some(tx) = outgoing.get(addr) {
            return Ok(tx.clone());
        }
        let channel = connect_lazy(addr, self.options.connect_timeout, self.options.tls.as_ref())?;
        let (tx, rx) = mpsc::unbounded_channel();
        outgoing.insert(addr.to_string(), tx.clone());

        debug!(parent: &self.span, "Starting sender to {}", addr);
        let sender = self.clone();
        let from = from.clone();
        let addr = addr.to_string();
        tokio::spawn(async move { sender.run_message_sender(rx, channel, from, addr).await });
        Ok(tx)
    }

    // 批量发送消息到远程节点
    async fn run_message_sender(
        &self,
        mut rx: mpsc::UnboundedReceiver<Message>,
        channel: Channel,
        from: Peer,
        addr: String,
    ) {
        let batch_size = self.options.batch_size.max(1);
        let mut client = RaftClient::new(channel)
            .max_encoding_message_size(usize::MAX)
            .max_decoding_message_size(usize::MAX);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let mut batch = Vec::with_capacity(batch_size);
            tokio::select! {
                size = rx.recv_many(&mut batch, batch_size) => {
                    if size == 0 {
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    debug!(parent: &self.span, "Sender to {} stopped", addr);
                    return;
                }
                _ = tokio::time::sleep(self.options.idle_timeout) => {
                    let mut outgoing = self.outgoing_tx.write();
                    if !rx.is_empty() {
                        continue;
                    }
                    outgoing.remove(&addr);
                    debug!(parent: &self.span, "Sender to {} idle, dropping it", addr);
                    return;
                }
            }

            let mut messages = Vec::with_capacity(batch.len());
            for message in batch {
                match message.encode() {
                    Ok(bytes) => messages.push(bytes),
                    Err(e) => warn!(parent: &self.span, "Failed to encode message for {}: {}", addr, e),
                }
            }
            let request = pb::RaftBatch {
                from: from.id.clone(),
                from_addr: from.addr.clone(),
                messages,
            };
            match client.send_batch(request).await {
                Ok(response) if !response.get_ref().success => {
                    debug!(parent: &self.span, "{} rejected batch: {}", addr, response.get_ref().error);
                }
                Ok(_) => {}
                Err(status) => {
                    debug!(parent: &self.span, "Failed to send batch to {}: {}", addr, status.message());
                }
            }
        }
    }

    #[cfg(test)]
    fn sender_count(&self) -> usize {
        self.outgoing_tx.read().len()
    }

    /// Stops every sender task.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.outgoing_tx.write().clear();
        info!(parent: &self.span, "Raft network shut down");
    }
}

#[async_trait]
impl Network for GrpcNetwork {
    async fn send(&self, from: &Peer, target: &Peer, message: Message) -> RpcResult<()> {
        if *self.shutdown.borrow() {
            return Err(RpcError::Network("network shut down".into()));
        }
        self.get_outgoing_tx(from, &target.addr)?
            .send(message)
            .map_err(|_| RpcError::Network(format!("sender to {} closed", target)))
    }
}

/// Server side of the transport: hands every received message to the node.
pub struct RaftTransportService {
    node: Arc<RaftNode>,
}

impl RaftTransportService {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }

    pub fn into_server(self) -> RaftServer<Self> {
        RaftServer::new(self)
            .max_decoding_message_size(usize::MAX)
            .max_encoding_message_size(usize::MAX)
    }
}

#[async_trait]
impl Raft for RaftTransportService {
    async fn send_batch(
        &self,
        request: tonic::Request<pb::RaftBatch>,
    ) -> Result<tonic::Response<pb::RaftBatchResponse>, tonic::Status> {
        let batch = request.into_inner();
        let from = Peer::new(batch.from, batch.from_addr);

        for bytes in batch.messages {
            let message = Message::decode(&bytes)
                .map_err(|e| tonic::Status::invalid_argument(format!("bad raft message: {}", e)))?;
            if let Err(e) = self.node.deliver(from.clone(), message) {
                return Ok(tonic::Response::new(pb::RaftBatchResponse {
                    success: false,
                    error: e.to_string(),
                }));
            }
        }
        Ok(tonic::Response::new(pb::RaftBatchResponse {
            success: true,
            error: String::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::message::AppendEntriesResponse;

    #[test]
    fn test_endpoint_uri() {
        assert_eq!(endpoint_uri("127.0.0.1:8400", false), "http://127.0.0.1:8400");
        assert_eq!(endpoint_uri("127.0.0.1:8400", true), "https://127.0.0.1:8400");
        assert_eq!(endpoint_uri("http://node:1", true), "http://node:1");
    }

    #[tokio::test]
    async fn test_idle_sender_is_pruned() {
        let network = GrpcNetwork::new(
            GrpcNetworkOptions {
                connect_timeout: Duration::from_millis(100),
                idle_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            Span::none(),
        );
        let from = Peer::new("node1", "127.0.0.1:1");
        // 已离开集群的节点，地址上没有服务
        let gone = Peer::new("node2", "127.0.0.1:2");
        let message = Message::AppendEntriesResponse(AppendEntriesResponse {
            term: 1,
            success: true,
            matched_index: 0,
            conflict_index: 0,
        });

        network.send(&from, &gone, message.clone()).await.unwrap();
        assert_eq!(network.sender_count(), 1);

        let mut pruned = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if network.sender_count() == 0 {
                pruned = true;
                break;
            }
        }
        assert!(pruned, "idle sender was not dropped");

        // 再次发送会重新建立发送任务
        network.send(&from, &gone, message).await.unwrap();
        assert_eq!(network.sender_count(), 1);
        network.shutdown();
        assert_eq!(network.sender_count(), 0);
    }
}
