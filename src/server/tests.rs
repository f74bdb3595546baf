//! Service tests over a real listener, backed by a single local log.

use std::net::SocketAddr;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Server};

use super::*;
use crate::config::SegmentConfig;
use crate::network::pb::log_client::LogClient;
use crate::storage::log::Log as SegmentedLog;

struct LocalCommitLog {
    log: SegmentedLog,
}

#[async_trait]
impl CommitLog for LocalCommitLog {
    async fn append(&self, record: Record) -> Result<Offset> {
        Ok(self.log.append(record)?)
    }

    fn read(&self, offset: Offset) -> Result<Record> {
        Ok(self.log.read(offset)?)
    }

    fn lowest_offset(&self) -> Offset {
        self.log.lowest_offset()
    }

    async fn get_servers(&self) -> Result<Vec<ServerInfo>> {
        Ok(vec![ServerInfo {
            id: "local".into(),
            rpc_addr: "127.0.0.1:0".into(),
            is_leader: true,
        }])
    }
}

struct TestServer {
    addr: SocketAddr,
    log: Arc<LocalCommitLog>,
    service: LogService,
    _dir: TempDir,
}

async fn start(authorizer: Arc<dyn Authorizer>) -> TestServer {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(LocalCommitLog {
        log: SegmentedLog::new(dir.path(), SegmentConfig::default(), Span::none()).unwrap(),
    });
    let service = LogService::new(log.clone(), authorizer, Span::none())
        .with_poll_interval(Duration::from_millis(10));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = service.clone().into_server(Arc::new(MetadataSubjectResolver));
    tokio::spawn(async move {
        Server::builder()
            .add_service(server)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    TestServer {
        addr,
        log,
        service,
        _dir: dir,
    }
}

async fn client(addr: SocketAddr) -> LogClient<Channel> {
    LogClient::connect(format!("http://{}", addr)).await.unwrap()
}

fn as_subject<T>(subject: &str, message: T) -> Request<T> {
    let mut request = Request::new(message);
    request
        .metadata_mut()
        .insert(SUBJECT_METADATA_KEY, MetadataValue::try_from(subject).unwrap());
    request
}

fn produce_request(value: &[u8]) -> pb::ProduceRequest {
    pb::ProduceRequest {
        record: Some(pb::Record {
            value: value.to_vec(),
            offset: 0,
        }),
    }
}

async fn root_only() -> Arc<dyn Authorizer> {
    Arc::new(auth::tests::acl_with("p, root, *, produce\np, root, *, consume\n").await)
}

#[tokio::test]
async fn test_produce_consume() {
    let server = start(Arc::new(AllowAll)).await;
    let mut client = client(server.addr).await;

    let produced = client
        .produce(as_subject("root", produce_request(b"hello world")))
        .await
        .unwrap()
        .into_inner();
    let consumed = client
        .consume(as_subject("root", pb::ConsumeRequest { offset: produced.offset }))
        .await
        .unwrap()
        .into_inner();

    let record = consumed.record.unwrap();
    assert_eq!(record.value, b"hello world");
    assert_eq!(record.offset, produced.offset);
}

#[tokio::test]
async fn test_consume_past_boundary() {
    let server = start(Arc::new(AllowAll)).await;
    let mut client = client(server.addr).await;

    let produced = client
        .produce(as_subject("root", produce_request(b"hello world")))
        .await
        .unwrap()
        .into_inner();
    let status = client
        .consume(as_subject("root", pb::ConsumeRequest { offset: produced.offset + 1 }))
        .await
        .unwrap_err();

    let want = produced.offset + 1;
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(status.message(), format!("offset out of range: {}", want));

    let details = status.get_error_details();
    let info = details.error_info().unwrap();
    assert_eq!(info.reason, OFFSET_OUT_OF_RANGE_REASON);
    assert_eq!(info.metadata.get("offset"), Some(&want.to_string()));
    let localized = details.localized_message().unwrap();
    assert_eq!(localized.locale, "en-US");
    assert_eq!(
        localized.message,
        format!("The requested offset is outside the log's range: {}", want)
    );
}

#[tokio::test]
async fn test_produce_consume_stream() {
    let server = start(Arc::new(AllowAll)).await;
    let mut client = client(server.addr).await;

    let values: Vec<&[u8]> = vec![b"first message", b"second message"];
    let requests: Vec<pb::ProduceRequest> = values.iter().map(|v| produce_request(v)).collect();
    let mut responses = client
        .produce_stream(as_subject("root", tokio_stream::iter(requests)))
        .await
        .unwrap()
        .into_inner();
    for want in 0..values.len() as u64 {
        let response = responses.message().await.unwrap().unwrap();
        assert_eq!(response.offset, want);
    }
    assert!(responses.message().await.unwrap().is_none());

    let mut records = client
        .consume_stream(as_subject("root", pb::ConsumeRequest { offset: 0 }))
        .await
        .unwrap()
        .into_inner();
    for (i, value) in values.iter().enumerate() {
        let record = records.message().await.unwrap().unwrap().record.unwrap();
        assert_eq!(record.value, *value);
        assert_eq!(record.offset, i as u64);
    }

    // 流会等待后续写入
    server.log.append(Record::new(b"late".to_vec())).await.unwrap();
    let record = records.message().await.unwrap().unwrap().record.unwrap();
    assert_eq!(record.value, b"late");
    assert_eq!(record.offset, 2);
}

#[tokio::test]
async fn test_consume_stream_below_lowest_offset() {
    let server = start(Arc::new(AllowAll)).await;
    let mut client = client(server.addr).await;
    for i in 0..5u8 {
        server.log.append(Record::new(vec![i; 600])).await.unwrap();
    }
    server.log.log.truncate(3).unwrap();
    let lowest = server.log.lowest_offset();
    assert!(lowest > 0);

    let mut records = client
        .consume_stream(as_subject("root", pb::ConsumeRequest { offset: 0 }))
        .await
        .unwrap()
        .into_inner();
    let status = records.message().await.unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn test_shutdown_ends_consume_stream() {
    let server = start(Arc::new(AllowAll)).await;
    let mut client = client(server.addr).await;

    let mut records = client
        .consume_stream(as_subject("root", pb::ConsumeRequest { offset: 0 }))
        .await
        .unwrap()
        .into_inner();
    server.service.shutdown();

    let next = tokio::time::timeout(Duration::from_secs(5), records.message())
        .await
        .unwrap();
    assert!(matches!(next, Ok(None)));
}

#[tokio::test]
async fn test_unauthorized() {
    let server = start(root_only().await).await;
    let mut client = client(server.addr).await;

    let status = client
        .produce(as_subject("nobody", produce_request(b"hello world")))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    let status = client
        .consume(as_subject("nobody", pb::ConsumeRequest { offset: 0 }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    let status = client
        .produce(Request::new(produce_request(b"hello world")))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);

    // 被拒绝的写入没有落盘
    assert_eq!(server.log.log.next_offset(), 0);
    let status = client
        .consume(as_subject("root", pb::ConsumeRequest { offset: 0 }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    // root passes the same policy
    let produced = client
        .produce(as_subject("root", produce_request(b"hello world")))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(produced.offset, 0);
}

#[tokio::test]
async fn test_get_servers() {
    let server = start(root_only().await).await;
    let mut client = client(server.addr).await;

    let servers = client
        .get_servers(as_subject("nobody", pb::GetServersRequest {}))
        .await
        .unwrap()
        .into_inner()
        .servers;
    assert_eq!(servers.len(), 1);
    assert!(servers[0].is_leader);
}

#[test]
fn test_status_mapping() {
    let status = to_status(ConsensusError::NotLeader(None).into());
    assert_eq!(status.code(), Code::Unavailable);

    let status = to_status(ConsensusError::Timeout.into());
    assert_eq!(status.code(), Code::Unavailable);

    let status = to_status(
        AuthError::Denied {
            subject: "a".into(),
            object: "*".into(),
            action: "produce".into(),
        }
        .into(),
    );
    assert_eq!(status.code(), Code::PermissionDenied);

    let status = to_status(StorageError::Corrupted("bad".into()).into());
    assert_eq!(status.code(), Code::Internal);

    let status = to_status(StorageError::OffsetOutOfRange(3).into());
    assert_eq!(status.code(), Code::NotFound);
}
