//! End-to-end tests for replica sessions over TCP.

use dsrepl_core::{AttributeChange, AttributeValue, Csn, Operation, ServerState, UpdateRecord};
use dsrepl_protocol::{
    read_frame_async, write_frame_async, ErrorCode, ReplMessage, StartMsg, PROTOCOL_VERSION,
};
use dsrepl_server::{ReplicationServer, ServerConfig, SubmitRequest};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const BASE: &str = "dc=example,dc=com";
const ENTRY: &str = "cn=alice,dc=example,dc=com";
const READ_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    _dir: TempDir,
    server: ReplicationServer,
    addr: SocketAddr,
    serving: JoinHandle<dsrepl_server::ReplicationResult<()>>,
}

impl Harness {
    async fn start(configure: impl FnOnce(ServerConfig) -> ServerConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = configure(ServerConfig::new(1, dir.path()));
        let server = ReplicationServer::open(config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_with_listener(listener).await })
        };
        Self {
            _dir: dir,
            server,
            addr,
            serving,
        }
    }

    async fn stop(self) {
        self.server.shutdown();
        self.serving.await.unwrap().unwrap();
    }
}

/// Reads the next message that is not a heartbeat.
async fn recv(stream: &mut TcpStream) -> Option<ReplMessage> {
    loop {
        let frame = tokio::time::timeout(READ_TIMEOUT, read_frame_async(stream))
            .await
            .expect("timed out waiting for a frame")
            .unwrap();
        match frame {
            Some(ReplMessage::Heartbeat) => continue,
            other => return other,
        }
    }
}

async fn connect(addr: SocketAddr, replica_id: u16, state: ServerState) -> (TcpStream, ServerState) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let start = ReplMessage::Start(StartMsg::new(BASE, replica_id, state));
    write_frame_async(&mut stream, &start).await.unwrap();
    match recv(&mut stream).await {
        Some(ReplMessage::StartAck(ack)) => {
            assert_eq!(ack.server_id, 1);
            assert_eq!(ack.protocol_version, PROTOCOL_VERSION);
            (stream, ack.state)
        }
        other => panic!("expected start-ack, got {other:?}"),
    }
}

fn add_alice() -> Operation {
    Operation::Add {
        attributes: vec![("cn".to_string(), vec![AttributeValue::from("alice")])],
    }
}

fn add_mail(value: &str) -> Operation {
    Operation::Modify {
        changes: vec![AttributeChange::add("mail", [value])],
    }
}

#[tokio::test]
async fn catch_up_replays_changelog_in_order() {
    let harness = Harness::start(|c| c).await;
    let mut expected = Vec::new();
    expected.push(
        harness
            .server
            .submit(SubmitRequest::local(BASE, ENTRY, add_alice()))
            .unwrap()
            .csn,
    );
    let mut values = vec!["a@x", "b@x", "c@x", "d@x"];
    values.shuffle(&mut rand::thread_rng());
    for value in values {
        let ack = harness
            .server
            .submit(SubmitRequest::local(BASE, ENTRY, add_mail(value)))
            .unwrap();
        expected.push(ack.csn);
    }

    let (mut stream, state) = connect(harness.addr, 2, ServerState::new()).await;
    assert_eq!(state.max_csn(1), expected.last().copied());

    let mut received = Vec::new();
    while received.len() < expected.len() {
        match recv(&mut stream).await {
            Some(ReplMessage::Update(record)) => received.push(record.csn),
            other => panic!("expected update, got {other:?}"),
        }
    }
    assert_eq!(received, expected);

    // resuming after the third record skips what the peer already has
    drop(stream);
    let resume: ServerState = [expected[2]].into_iter().collect();
    let (mut stream, _) = connect(harness.addr, 2, resume).await;
    match recv(&mut stream).await {
        Some(ReplMessage::Update(record)) => assert_eq!(record.csn, expected[3]),
        other => panic!("expected update, got {other:?}"),
    }

    write_frame_async(&mut stream, &ReplMessage::Stop).await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn updates_fan_out_to_other_sessions() {
    let harness = Harness::start(|c| c).await;
    let (mut from_two, _) = connect(harness.addr, 2, ServerState::new()).await;
    let (mut from_three, _) = connect(harness.addr, 3, ServerState::new()).await;

    let add = UpdateRecord::new(Csn::new(1_000, 0, 2), ENTRY, add_alice());
    let modify = UpdateRecord::new(Csn::new(1_001, 0, 2), ENTRY, add_mail("alice@x"));
    write_frame_async(&mut from_two, &ReplMessage::Update(add.clone()))
        .await
        .unwrap();
    write_frame_async(&mut from_two, &ReplMessage::Update(modify.clone()))
        .await
        .unwrap();

    assert_eq!(recv(&mut from_three).await, Some(ReplMessage::Update(add)));
    assert_eq!(recv(&mut from_three).await, Some(ReplMessage::Update(modify)));

    // acknowledgements from replica 3 feed the purge limit
    let ack: ServerState = [Csn::new(1_001, 0, 2)].into_iter().collect();
    write_frame_async(&mut from_three, &ReplMessage::ServerState(ack.clone()))
        .await
        .unwrap();

    let domain = harness.server.domain(BASE).unwrap();
    tokio::time::timeout(READ_TIMEOUT, async {
        while domain.peer_states().get(&3) != Some(&ack) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        harness.server.resolved_values(BASE, ENTRY, "mail").unwrap(),
        Some(vec![AttributeValue::from("alice@x")])
    );
    assert_eq!(domain.sessions().len(), 2);

    write_frame_async(&mut from_two, &ReplMessage::Stop).await.unwrap();
    write_frame_async(&mut from_three, &ReplMessage::Stop).await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn local_submit_reaches_connected_replica() {
    let harness = Harness::start(|c| c).await;
    let (mut stream, _) = connect(harness.addr, 2, ServerState::new()).await;

    let ack = harness
        .server
        .submit(SubmitRequest::local(BASE, ENTRY, add_alice()))
        .unwrap();
    match recv(&mut stream).await {
        Some(ReplMessage::Update(record)) => {
            assert_eq!(record.csn, ack.csn);
            assert_eq!(record.entry_dn, ENTRY);
        }
        other => panic!("expected update, got {other:?}"),
    }
    harness.stop().await;
}

#[tokio::test]
async fn foreign_csn_ends_the_session() {
    let harness = Harness::start(|c| c).await;
    let (mut stream, _) = connect(harness.addr, 2, ServerState::new()).await;

    let forged = UpdateRecord::new(Csn::new(5_000, 0, 9), ENTRY, add_alice());
    write_frame_async(&mut stream, &ReplMessage::Update(forged))
        .await
        .unwrap();
    match recv(&mut stream).await {
        Some(ReplMessage::Error(err)) => assert_eq!(err.code, ErrorCode::ForeignCsn),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(harness
        .server
        .domain(BASE)
        .unwrap()
        .changelog()
        .find(Csn::new(5_000, 0, 9))
        .unwrap()
        .is_none());
    harness.stop().await;
}

#[tokio::test]
async fn silent_peer_times_out_in_handshake() {
    let harness =
        Harness::start(|c| c.with_handshake_timeout(Duration::from_millis(100))).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    match recv(&mut stream).await {
        Some(ReplMessage::Error(err)) => assert_eq!(err.code, ErrorCode::UnexpectedMessage),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(recv(&mut stream).await, None);
    harness.stop().await;
}

#[tokio::test]
async fn wrong_protocol_version_is_refused() {
    let harness = Harness::start(|c| c).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    let mut start = StartMsg::new(BASE, 2, ServerState::new());
    start.protocol_version = PROTOCOL_VERSION + 1;
    write_frame_async(&mut stream, &ReplMessage::Start(start))
        .await
        .unwrap();
    match recv(&mut stream).await {
        Some(ReplMessage::Error(err)) => assert_eq!(err.code, ErrorCode::ProtocolVersion),
        other => panic!("expected error, got {other:?}"),
    }
    harness.stop().await;
}

#[tokio::test]
async fn session_limit_rejects_extra_connections() {
    let harness = Harness::start(|c| c.with_max_sessions(1)).await;
    let (_first, _) = connect(harness.addr, 2, ServerState::new()).await;
    tokio::time::timeout(READ_TIMEOUT, async {
        while harness.server.active_sessions() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut second = TcpStream::connect(harness.addr).await.unwrap();
    match recv(&mut second).await {
        Some(ReplMessage::Error(err)) => assert_eq!(err.code, ErrorCode::Unavailable),
        other => panic!("expected error, got {other:?}"),
    }
    harness.stop().await;
}

#[tokio::test]
async fn shutdown_saves_state() {
    let harness = Harness::start(|c| c).await;
    let (mut stream, _) = connect(harness.addr, 2, ServerState::new()).await;
    let record = UpdateRecord::new(Csn::new(2_000, 0, 2), ENTRY, add_alice());
    write_frame_async(&mut stream, &ReplMessage::Update(record))
        .await
        .unwrap();

    let domain = harness.server.domain(BASE).unwrap();
    tokio::time::timeout(READ_TIMEOUT, async {
        while domain.state().max_csn(2).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let state_file = domain.dir().join("server.state");
    harness.server.shutdown();
    // the session is told to stop
    assert_eq!(recv(&mut stream).await, Some(ReplMessage::Stop));
    let Harness {
        _dir, serving, ..
    } = harness;
    serving.await.unwrap().unwrap();

    let (base_dn, saved) = dsrepl_core::read_state_file(&state_file).unwrap();
    assert_eq!(base_dn, BASE);
    assert_eq!(saved.max_csn(2), Some(Csn::new(2_000, 0, 2)));
}
