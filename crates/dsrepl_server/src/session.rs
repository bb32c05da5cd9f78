//! Server side of a replica session.
//!
//! The handshake runs under a deadline from the [`TimeoutChecker`]. Once
//! streaming, the session splits in two: the calling task reads frames and
//! hands updates to the domain, while a writer task first replays the
//! changelog from the replica's state and then forwards live updates. The
//! session is registered with the domain before the replay starts, and
//! live records already covered by the replay are skipped, so the replica
//! sees every record exactly once.

use crate::domain::{ReplicationDomain, SessionEvent, SessionInfo};
use crate::error::{ReplicationError, ReplicationResult};
use crate::server::ServerInner;
use crate::timeout::{OperationKind, TimeoutChecker};
use dsrepl_core::{normalize_dn, ChangelogCursor, ChangelogResult, ServerState, UpdateRecord};
use dsrepl_protocol::{
    read_frame_async, write_frame_async, ErrorCode, ErrorMsg, ReplMessage, SessionError,
    SessionState, StartAckMsg, StartMsg, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const CATCH_UP_BATCH: usize = 256;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum Flow {
    Continue,
    Stop,
}

/// Decrements the active session count when dropped.
struct ActiveGuard(Arc<ServerInner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Runs one session to completion. Errors end only this session.
pub(crate) async fn run_session(
    server: Arc<ServerInner>,
    timeouts: Arc<TimeoutChecker>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    server.active_sessions.fetch_add(1, Ordering::AcqRel);
    let _active = ActiveGuard(Arc::clone(&server));
    let id = Uuid::new_v4();
    let _ = stream.set_nodelay(true);

    let mut state = SessionState::Connecting;
    match drive(&server, &timeouts, stream, peer, id, &mut state).await {
        Ok(()) => {
            let _ = state.transition(SessionState::Disconnected);
            info!(session = %id, peer = %peer, "session closed");
        }
        Err(err) => {
            let _ = state.transition(SessionState::Error);
            warn!(session = %id, peer = %peer, error = %err, "session failed");
        }
    }
}

/// Rejects a connection over the session limit.
pub(crate) async fn reject(mut stream: TcpStream, peer: SocketAddr, reason: &str) {
    let msg = ReplMessage::Error(ErrorMsg::new(ErrorCode::Unavailable, reason));
    if let Err(err) = write_frame_async(&mut stream, &msg).await {
        debug!(peer = %peer, error = %err, "failed to send rejection");
    }
    let _ = stream.shutdown().await;
}

async fn drive(
    server: &Arc<ServerInner>,
    timeouts: &TimeoutChecker,
    stream: TcpStream,
    peer: SocketAddr,
    id: Uuid,
    state: &mut SessionState,
) -> ReplicationResult<()> {
    let (mut reader, mut writer) = stream.into_split();
    state.transition(SessionState::Handshaking)?;

    let start = match handshake(server, timeouts, &mut reader, &mut writer).await? {
        Some(start) => start,
        None => return Ok(()),
    };
    let base_dn = normalize_dn(&start.base_dn);

    let lookup = {
        let server = Arc::clone(server);
        let base_dn = base_dn.clone();
        tokio::task::spawn_blocking(move || server.domain_or_create(&base_dn)).await?
    };
    let domain = match lookup {
        Ok(domain) => domain,
        Err(err) => {
            refuse(&mut writer, ErrorCode::DomainUnavailable, &err.to_string()).await;
            return Err(err);
        }
    };

    let info = SessionInfo {
        id,
        replica_id: start.replica_id,
        peer,
    };
    let (events, domain_state) = match domain.register_session(info) {
        Ok(registered) => registered,
        Err(err) => {
            refuse(&mut writer, ErrorCode::DomainUnavailable, &err.to_string()).await;
            return Err(err);
        }
    };
    domain.record_peer_state(start.replica_id, &start.state);

    let ack = ReplMessage::StartAck(StartAckMsg {
        server_id: server.config.server_id,
        protocol_version: PROTOCOL_VERSION,
        state: domain_state,
    });
    if let Err(err) = write_frame_async(&mut writer, &ack).await {
        domain.unregister_session(id);
        return Err(err.into());
    }
    state.transition(SessionState::Streaming)?;
    info!(
        session = %id,
        peer = %peer,
        base_dn = %domain.base_dn(),
        replica_id = start.replica_id,
        from = %start.state,
        "session streaming"
    );

    let mut writer_task = tokio::spawn(outbound(
        Arc::clone(&domain),
        writer,
        events,
        start.state,
        server.config.heartbeat_interval,
        id,
    ));

    let mut writer_finished = false;
    let result = loop {
        let frame = tokio::select! {
            frame = read_frame_async(&mut reader) => frame,
            joined = &mut writer_task => {
                writer_finished = true;
                break joined.map_err(ReplicationError::from).and_then(|r| r);
            }
        };
        match frame {
            Ok(Some(message)) => {
                match handle_incoming(&domain, *state, message, start.replica_id, id).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => break Ok(()),
                    Err(err) => break Err(err),
                }
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err.into()),
        }
    };

    if !writer_finished {
        if let Err(err) = &result {
            let report = ReplMessage::Error(ErrorMsg::new(error_code(err), err.to_string()));
            domain.send_to_session(id, SessionEvent::Send(report));
        }
    }
    domain.unregister_session(id);
    if !writer_finished {
        let abort = writer_task.abort_handle();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task)
            .await
            .is_err()
        {
            abort.abort();
        }
    }
    result
}

/// Waits for `Start` and validates it. `None` means the peer stopped
/// before starting.
async fn handshake(
    server: &ServerInner,
    timeouts: &TimeoutChecker,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
) -> ReplicationResult<Option<StartMsg>> {
    let mut deadline = timeouts.register(
        Instant::now() + server.config.handshake_timeout,
        OperationKind::Handshake,
    );
    let frame = tokio::select! {
        frame = read_frame_async(reader) => frame?,
        () = deadline.expired() => {
            refuse(writer, ErrorCode::UnexpectedMessage, "handshake timed out").await;
            return Err(SessionError::Timeout("handshake").into());
        }
    };
    deadline.cancel();

    let start = match frame {
        Some(ReplMessage::Start(start)) => start,
        Some(ReplMessage::Stop) => return Ok(None),
        Some(other) => {
            refuse(writer, ErrorCode::UnexpectedMessage, "expected start").await;
            return Err(SessionError::UnexpectedMessage {
                state: SessionState::Handshaking,
                message: other.name(),
            }
            .into());
        }
        None => return Err(SessionError::Closed.into()),
    };

    if start.protocol_version != PROTOCOL_VERSION {
        let reason = format!(
            "protocol version {} not supported, expected {PROTOCOL_VERSION}",
            start.protocol_version
        );
        refuse(writer, ErrorCode::ProtocolVersion, &reason).await;
        return Err(SessionError::Handshake(reason).into());
    }
    if start.replica_id == 0 {
        refuse(writer, ErrorCode::UnexpectedMessage, "replica id 0 is reserved").await;
        return Err(SessionError::Handshake("replica id 0".into()).into());
    }
    if normalize_dn(&start.base_dn).is_empty() {
        refuse(writer, ErrorCode::DomainUnavailable, "empty base DN").await;
        return Err(SessionError::Handshake("empty base DN".into()).into());
    }
    Ok(Some(start))
}

async fn refuse(writer: &mut OwnedWriteHalf, code: ErrorCode, reason: &str) {
    let msg = ReplMessage::Error(ErrorMsg::new(code, reason));
    let _ = write_frame_async(writer, &msg).await;
    let _ = writer.shutdown().await;
}

fn error_code(err: &ReplicationError) -> ErrorCode {
    match err {
        ReplicationError::ForeignCsn { .. } => ErrorCode::ForeignCsn,
        ReplicationError::DomainUnavailable(_) | ReplicationError::Changelog(_) => {
            ErrorCode::DomainUnavailable
        }
        ReplicationError::Session(SessionError::UnexpectedMessage { .. }) => {
            ErrorCode::UnexpectedMessage
        }
        _ => ErrorCode::Internal,
    }
}

async fn handle_incoming(
    domain: &Arc<ReplicationDomain>,
    state: SessionState,
    message: ReplMessage,
    replica_id: u16,
    id: Uuid,
) -> ReplicationResult<Flow> {
    state.check_incoming(&message)?;
    match message {
        ReplMessage::Update(record) => {
            if record.csn.replica_id() != replica_id {
                return Err(ReplicationError::ForeignCsn {
                    csn: record.csn,
                    replica_id,
                });
            }
            let csn = record.csn;
            let target = Arc::clone(domain);
            let outcome =
                tokio::task::spawn_blocking(move || target.accept(&record, Some(id))).await?;
            match outcome {
                Ok(accepted) => trace!(session = %id, csn = %accepted.csn, "update accepted"),
                Err(err) if err.is_benign() => {
                    debug!(session = %id, csn = %csn, "duplicate update ignored");
                }
                Err(err @ ReplicationError::OrderingViolation { .. }) => {
                    warn!(session = %id, error = %err, "out-of-order update discarded");
                }
                Err(err) => return Err(err),
            }
        }
        ReplMessage::ServerState(peer_state) => {
            trace!(session = %id, state = %peer_state, "peer state");
            domain.record_peer_state(replica_id, &peer_state);
        }
        ReplMessage::Heartbeat => {}
        ReplMessage::Stop => return Ok(Flow::Stop),
        ReplMessage::Error(msg) => {
            return Err(SessionError::Remote {
                code: msg.code,
                message: msg.message,
            }
            .into());
        }
        other @ (ReplMessage::Start(_) | ReplMessage::StartAck(_)) => {
            return Err(SessionError::UnexpectedMessage {
                state,
                message: other.name(),
            }
            .into());
        }
    }
    Ok(Flow::Continue)
}

fn read_batch(cursor: &mut ChangelogCursor) -> ChangelogResult<Vec<UpdateRecord>> {
    let mut batch = Vec::new();
    while batch.len() < CATCH_UP_BATCH {
        match cursor.next()? {
            Some(record) => batch.push(record),
            None => break,
        }
    }
    Ok(batch)
}

async fn outbound(
    domain: Arc<ReplicationDomain>,
    mut writer: OwnedWriteHalf,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    from: ServerState,
    heartbeat: Duration,
    id: Uuid,
) -> ReplicationResult<()> {
    let result = stream_updates(&domain, &mut writer, events, from, heartbeat, id).await;
    let _ = writer.shutdown().await;
    result
}

async fn stream_updates(
    domain: &Arc<ReplicationDomain>,
    writer: &mut OwnedWriteHalf,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    from: ServerState,
    heartbeat: Duration,
    id: Uuid,
) -> ReplicationResult<()> {
    let mut sent = from.clone();
    let mut cursor = domain.changelog().cursor(&from);
    let mut replayed = 0usize;
    loop {
        let (returned, batch) = tokio::task::spawn_blocking(move || {
            let batch = read_batch(&mut cursor);
            (cursor, batch)
        })
        .await?;
        cursor = returned;
        let batch = batch?;
        if batch.is_empty() {
            break;
        }
        for record in batch {
            sent.update(record.csn);
            write_frame_async(writer, &ReplMessage::Update(record)).await?;
            replayed += 1;
        }
    }
    debug!(session = %id, replayed, "catch-up complete");

    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Update(record)) => {
                    if !sent.update(record.csn) {
                        continue;
                    }
                    write_frame_async(writer, &ReplMessage::Update(record)).await?;
                }
                Some(SessionEvent::Send(message)) => {
                    let last = matches!(message, ReplMessage::Error(_) | ReplMessage::Stop);
                    write_frame_async(writer, &message).await?;
                    if last {
                        return Ok(());
                    }
                }
                Some(SessionEvent::Close) => {
                    write_frame_async(writer, &ReplMessage::Stop).await?;
                    return Ok(());
                }
                None => return Ok(()),
            },
            _ = ticker.tick() => {
                write_frame_async(writer, &ReplMessage::Heartbeat).await?;
            }
        }
    }
}
