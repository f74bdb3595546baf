//! gRPC front end of the commit log.
//!
//! Every call carries a [`Subject`] resolved by [`SubjectInterceptor`] and is
//! authorized against `(subject, "*", action)` before it touches the log.

pub mod auth;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::InterceptedService;
use tonic::{Code, Request, Response, Status, Streaming};
use tonic_types::{ErrorDetails, StatusExt};
use tracing::{Span, debug, info, warn};

pub use auth::{
    AclAuthorizer, AllowAll, Authorizer, CONSUME_ACTION, MetadataSubjectResolver, OBJECT_WILDCARD,
    PRODUCE_ACTION, SUBJECT_METADATA_KEY, Subject, SubjectInterceptor, SubjectResolver,
};

use crate::error::{AuthError, ConsensusError, Error, Result, StorageError};
use crate::network::pb;
use crate::network::pb::log_server::{Log, LogServer};
use crate::types::{Offset, Record, ServerInfo};

/// Reason attached to out-of-range statuses.
pub const OFFSET_OUT_OF_RANGE_REASON: &str = "OFFSET_OUT_OF_RANGE";
const ERROR_DOMAIN: &str = "distlog";
const STREAM_BUFFER: usize = 16;

/// What the service needs from the log behind it.
#[async_trait]
pub trait CommitLog: Send + Sync + 'static {
    async fn append(&self, record: Record) -> Result<Offset>;
    fn read(&self, offset: Offset) -> Result<Record>;
    fn lowest_offset(&self) -> Offset;
    async fn get_servers(&self) -> Result<Vec<ServerInfo>>;
}

/// `NotFound` status for an offset outside the log, with machine and human
/// readable details.
pub fn offset_out_of_range(offset: Offset) -> Status {
    let mut details = ErrorDetails::with_error_info(
        OFFSET_OUT_OF_RANGE_REASON,
        ERROR_DOMAIN,
        HashMap::from([("offset".to_string(), offset.to_string())]),
    );
    details.set_localized_message(
        "en-US",
        format!("The requested offset is outside the log's range: {}", offset),
    );
    Status::with_error_details(
        Code::NotFound,
        StorageError::OffsetOutOfRange(offset).to_string(),
        details,
    )
}

/// Maps a crate error onto a status. Only the service boundary does this.
pub fn to_status(err: Error) -> Status {
    match err {
        Error::Storage(StorageError::OffsetOutOfRange(offset)) => offset_out_of_range(offset),
        Error::Storage(e) => Status::internal(e.to_string()),
        Error::Consensus(e @ (ConsensusError::Storage(_) | ConsensusError::Apply(_))) => {
            Status::internal(e.to_string())
        }
        Error::Consensus(e) => Status::unavailable(e.to_string()),
        Error::Auth(e @ AuthError::Denied { .. }) => Status::permission_denied(e.to_string()),
        Error::Auth(e @ AuthError::Unauthenticated) => Status::unauthenticated(e.to_string()),
        Error::Auth(e @ AuthError::Policy(_)) => Status::internal(e.to_string()),
        Error::Replication(e) => Status::unavailable(e.to_string()),
        Error::Rpc(e) => Status::unavailable(e.to_string()),
    }
}

#[derive(Clone)]
pub struct LogService {
    commit_log: Arc<dyn CommitLog>,
    authorizer: Arc<dyn Authorizer>,
    poll_interval: Duration,
    shutdown: Arc<watch::Sender<bool>>,
    span: Span,
}

impl LogService {
    pub fn new(commit_log: Arc<dyn CommitLog>, authorizer: Arc<dyn Authorizer>, span: Span) -> Self {
        Self {
            commit_log,
            authorizer,
            poll_interval: Duration::from_millis(100),
            shutdown: Arc::new(watch::Sender::new(false)),
            span,
        }
    }

    /// How often `ConsumeStream` checks for a record not yet written.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Wraps the service with subject resolution.
    pub fn into_server(
        self,
        resolver: Arc<dyn SubjectResolver>,
    ) -> InterceptedService<LogServer<LogService>, SubjectInterceptor> {
        LogServer::with_interceptor(self, SubjectInterceptor::new(resolver))
    }

    /// Ends every open stream. Clones share the signal.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        info!(parent: &self.span, "Log service streams stopped");
    }

    fn authorize<T>(&self, request: &Request<T>, action: &str) -> std::result::Result<(), Status> {
        let subject = subject(request)?;
        self.authorizer
            .authorize(subject, OBJECT_WILDCARD, action)
            .map_err(|e| {
                debug!(parent: &self.span, "Denied {} for {}: {}", action, subject, e);
                to_status(e.into())
            })
    }
}

fn subject<T>(request: &Request<T>) -> std::result::Result<&str, Status> {
    request
        .extensions()
        .get::<Subject>()
        .map(|subject| subject.0.as_str())
        .ok_or_else(|| to_status(AuthError::Unauthenticated.into()))
}

type ResponseStream<T> = Pin<Box<dyn Stream<Item = std::result::Result<T, Status>> + Send>>;

#[async_trait]
impl Log for LogService {
    async fn produce(
        &self,
        request: Request<pb::ProduceRequest>,
    ) -> std::result::Result<Response<pb::ProduceResponse>, Status> {
        self.authorize(&request, PRODUCE_ACTION)?;
        let record = request.into_inner().record.unwrap_or_default();
        let offset = self.commit_log.append(record.into()).await.map_err(to_status)?;
        Ok(Response::new(pb::ProduceResponse { offset }))
    }

    async fn consume(
        &self,
        request: Request<pb::ConsumeRequest>,
    ) -> std::result::Result<Response<pb::ConsumeResponse>, Status> {
        self.authorize(&request, CONSUME_ACTION)?;
        let record = self
            .commit_log
            .read(request.into_inner().offset)
            .map_err(to_status)?;
        Ok(Response::new(pb::ConsumeResponse {
            record: Some(record.into()),
        }))
    }

    type ConsumeStreamStream = ResponseStream<pb::ConsumeResponse>;

    async fn consume_stream(
        &self,
        request: Request<pb::ConsumeRequest>,
    ) -> std::result::Result<Response<Self::ConsumeStreamStream>, Status> {
        self.authorize(&request, CONSUME_ACTION)?;
        let start = request.into_inner().offset;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let service = self.clone();
        tokio::spawn(async move { service.stream_records(start, tx).await });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    type ProduceStreamStream = ResponseStream<pb::ProduceResponse>;

    async fn produce_stream(
        &self,
        request: Request<Streaming<pb::ProduceRequest>>,
    ) -> std::result::Result<Response<Self::ProduceStreamStream>, Status> {
        self.authorize(&request, PRODUCE_ACTION)?;
        let mut requests = request.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let commit_log = self.commit_log.clone();
        let span = self.span.clone();
        tokio::spawn(async move {
            while let Some(item) = requests.next().await {
                let request = match item {
                    Ok(request) => request,
                    Err(status) => {
                        debug!(parent: &span, "Produce stream closed by client: {}", status);
                        return;
                    }
                };
                let record = request.record.unwrap_or_default();
                match commit_log.append(record.into()).await {
                    Ok(offset) => {
                        if tx.send(Ok(pb::ProduceResponse { offset })).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(parent: &span, "Produce stream append failed: {}", e);
                        let _ = tx.send(Err(to_status(e))).await;
                        return;
                    }
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_servers(
        &self,
        request: Request<pb::GetServersRequest>,
    ) -> std::result::Result<Response<pb::GetServersResponse>, Status> {
        subject(&request)?;
        let servers = self.commit_log.get_servers().await.map_err(to_status)?;
        Ok(Response::new(pb::GetServersResponse {
            servers: servers.into_iter().map(Into::into).collect(),
        }))
    }
}

impl LogService {
    /// Sends `start..` to `tx` until the client goes away, the service shuts
    /// down or the next offset falls below the log.
    async fn stream_records(
        &self,
        start: Offset,
        tx: mpsc::Sender<std::result::Result<pb::ConsumeResponse, Status>>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let mut offset = start;

        loop {
            if *shutdown.borrow_and_update() {
                return;
            }
            if offset < self.commit_log.lowest_offset() {
                let _ = tx.send(Err(offset_out_of_range(offset))).await;
                return;
            }

            match self.commit_log.read(offset) {
                Ok(record) => {
                    let response = pb::ConsumeResponse {
                        record: Some(record.into()),
                    };
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => return,
                        sent = tx.send(Ok(response)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    offset += 1;
                }
                // 还没写到这个位置，稍后再读
                Err(Error::Storage(StorageError::OffsetOutOfRange(_))) => {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => return,
                        _ = tx.closed() => return,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(parent: &self.span, "Consume stream read at {} failed: {}", offset, e);
                    let _ = tx.send(Err(to_status(e))).await;
                    return;
                }
            }
        }
    }
}
