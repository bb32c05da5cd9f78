//! The replica broker: one replica's session with a replication server.

use crate::applier::UpdateApplier;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use dsrepl_core::{
    normalize_dn, Csn, CsnGenerator, Operation, PersistentServerState, ServerState, UpdateRecord,
};
use dsrepl_protocol::{
    read_frame_async, write_frame_async, ReplMessage, StartAckMsg, StartMsg, PROTOCOL_VERSION,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection status of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStatus {
    /// Handshake in progress.
    Connecting,
    /// Streaming changes.
    Connected,
    /// Closed by either side.
    Disconnected,
    /// Ended by an error.
    Error,
}

impl BrokerStatus {
    /// Returns true while changes flow.
    pub fn is_connected(&self) -> bool {
        matches!(self, BrokerStatus::Connected)
    }
}

/// Counters of a broker session.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    /// Changes received from the server.
    pub received: u64,
    /// Received changes handed to the applier.
    pub applied: u64,
    /// Received changes the replica already had.
    pub skipped: u64,
    /// Local changes published.
    pub published: u64,
    /// State acknowledgements sent.
    pub acks_sent: u64,
    /// Connection attempts that failed before one succeeded.
    pub retries: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

struct Shared<A> {
    config: BrokerConfig,
    applier: A,
    state: PersistentServerState,
    generator: CsnGenerator,
    status: RwLock<BrokerStatus>,
    stats: RwLock<BrokerStats>,
    progress: watch::Sender<ServerState>,
    publish_lock: Mutex<()>,
}

impl<A> Shared<A> {
    fn set_status(&self, status: BrokerStatus) {
        *self.status.write() = status;
    }

    fn fail(&self, err: &BrokerError) {
        self.set_status(BrokerStatus::Error);
        self.stats.write().last_error = Some(err.to_string());
    }
}

/// Connects one replica to a replication server for one domain.
///
/// Received changes go to the [`UpdateApplier`] in server order; local
/// changes are published with [`ReplicaBroker::publish`]. The replica's
/// server state is kept in [`BrokerConfig::state_path`] so a reconnect
/// resumes where the last session stopped.
pub struct ReplicaBroker<A: UpdateApplier + 'static> {
    shared: Arc<Shared<A>>,
    server_id: u16,
    server_state: ServerState,
    outbound: mpsc::UnboundedSender<ReplMessage>,
    reader: JoinHandle<BrokerResult<()>>,
    writer: JoinHandle<BrokerResult<()>>,
}

impl<A: UpdateApplier + 'static> ReplicaBroker<A> {
    /// Connects to the server, retrying retryable failures per
    /// [`BrokerConfig::retry`].
    ///
    /// # Errors
    ///
    /// Returns the last connection error, or a state error if the state
    /// file cannot be loaded.
    pub async fn connect(config: BrokerConfig, applier: A) -> BrokerResult<Self> {
        if config.replica_id == 0 {
            return Err(BrokerError::Handshake("replica id 0 is reserved".into()));
        }
        let base_dn = normalize_dn(&config.base_dn);
        let state = PersistentServerState::load(&config.state_path, &base_dn)?;
        let generator = CsnGenerator::new(config.replica_id);
        let snapshot = state.snapshot();
        for (_, csn) in snapshot.iter() {
            generator.adjust(csn);
        }
        let (progress, _) = watch::channel(snapshot);

        let shared = Arc::new(Shared {
            config,
            applier,
            state,
            generator,
            status: RwLock::new(BrokerStatus::Connecting),
            stats: RwLock::new(BrokerStats::default()),
            progress,
            publish_lock: Mutex::new(()),
        });

        let retry = shared.config.retry.clone();
        let attempts = retry.max_attempts.max(1);
        let mut attempt = 0;
        let (stream, ack) = loop {
            if attempt > 0 {
                let delay = retry.delay_for_attempt(attempt);
                debug!(attempt, delay = ?delay, "retrying connection");
                tokio::time::sleep(delay).await;
                shared.stats.write().retries += 1;
            }
            match handshake(&shared.config, shared.state.snapshot()).await {
                Ok(connected) => break connected,
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    warn!(
                        addr = %shared.config.server_addr,
                        attempt,
                        error = %err,
                        "connection attempt failed"
                    );
                    attempt += 1;
                }
                Err(err) => {
                    shared.fail(&err);
                    return Err(err);
                }
            }
        };

        for (_, csn) in ack.state.iter() {
            shared.generator.adjust(csn);
        }
        shared.set_status(BrokerStatus::Connected);
        info!(
            addr = %shared.config.server_addr,
            base_dn = %shared.state.base_dn(),
            replica_id = shared.config.replica_id,
            server_id = ack.server_id,
            "connected to replication server"
        );

        let (reader, writer) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(inbound(Arc::clone(&shared), reader));
        let writer = tokio::spawn(outbound_loop(Arc::clone(&shared), writer, rx));

        Ok(Self {
            shared,
            server_id: ack.server_id,
            server_state: ack.state,
            outbound,
            reader,
            writer,
        })
    }

    /// Id of the connected server.
    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    /// Server state received in the handshake.
    pub fn server_state(&self) -> &ServerState {
        &self.server_state
    }

    /// Id of this replica.
    pub fn replica_id(&self) -> u16 {
        self.shared.config.replica_id
    }

    /// The replica's current server state.
    pub fn state(&self) -> ServerState {
        self.shared.state.snapshot()
    }

    /// Connection status.
    pub fn status(&self) -> BrokerStatus {
        *self.shared.status.read()
    }

    /// Session counters.
    pub fn stats(&self) -> BrokerStats {
        self.shared.stats.read().clone()
    }

    /// The applier changes are handed to.
    pub fn applier(&self) -> &A {
        &self.shared.applier
    }

    /// Publishes a local change. It is applied locally first, then sent.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] after the session ended,
    /// [`BrokerError::CsnExhausted`] if no CSN is left this millisecond,
    /// or the applier's error.
    pub fn publish(
        &self,
        entry_dn: impl Into<String>,
        operation: Operation,
        correlation_id: Option<Uuid>,
    ) -> BrokerResult<Csn> {
        if !self.status().is_connected() {
            return Err(BrokerError::NotConnected);
        }
        // CSN order and send order must agree
        let _guard = self.shared.publish_lock.lock();
        let csn = self.shared.generator.next()?;
        let mut record = UpdateRecord::new(csn, entry_dn, operation);
        record.correlation_id = correlation_id;

        self.shared.applier.apply(&record)?;
        self.shared.state.update(csn);
        self.shared.progress.send_replace(self.shared.state.snapshot());
        self.outbound
            .send(ReplMessage::Update(record))
            .map_err(|_| BrokerError::NotConnected)?;
        self.shared.stats.write().published += 1;
        trace!(csn = %csn, "published change");
        Ok(csn)
    }

    /// Waits until the replica's state covers `csn`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Timeout`] if `timeout` passes first and
    /// [`BrokerError::NotConnected`] if the session ends first.
    pub async fn wait_for(&self, csn: Csn, timeout: Duration) -> BrokerResult<()> {
        let mut progress = self.shared.progress.subscribe();
        let wait = progress.wait_for(|state| state.covers(&csn));
        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BrokerError::NotConnected),
            Err(_) => Err(BrokerError::Timeout("wait for change")),
        };
        result
    }

    /// Writes the replica's state if it changed. Returns true if written.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn save_state(&self) -> BrokerResult<bool> {
        Ok(self.shared.state.save()?)
    }

    /// Sends `Stop`, waits for the session to end and saves the state.
    ///
    /// # Errors
    ///
    /// Returns the first error of the session tasks or the final save.
    pub async fn disconnect(mut self) -> BrokerResult<()> {
        let _ = self.outbound.send(ReplMessage::Stop);
        let writer_result = match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut self.writer).await {
            Ok(joined) => joined.map_err(BrokerError::from).and_then(|r| r),
            Err(_) => Err(BrokerError::Timeout("disconnect")),
        };
        let reader_result = match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut self.reader).await {
            Ok(joined) => joined.map_err(BrokerError::from).and_then(|r| r),
            // the server did not close its side
            Err(_) => Ok(()),
        };

        let shared = &self.shared;
        if shared.status.read().is_connected() {
            shared.set_status(BrokerStatus::Disconnected);
        }
        let saved = shared.state.save();
        info!(replica_id = shared.config.replica_id, "disconnected");
        writer_result?;
        reader_result?;
        saved?;
        Ok(())
    }
}

impl<A: UpdateApplier + 'static> Drop for ReplicaBroker<A> {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl<A: UpdateApplier + 'static> std::fmt::Debug for ReplicaBroker<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaBroker")
            .field("replica_id", &self.shared.config.replica_id)
            .field("server_id", &self.server_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Connects and exchanges `Start` / `StartAck` within the handshake
/// timeout.
async fn handshake(
    config: &BrokerConfig,
    state: ServerState,
) -> BrokerResult<(TcpStream, StartAckMsg)> {
    let exchange = async {
        let mut stream = TcpStream::connect(config.server_addr).await?;
        let _ = stream.set_nodelay(true);
        let start = StartMsg::new(config.base_dn.clone(), config.replica_id, state);
        write_frame_async(&mut stream, &ReplMessage::Start(start)).await?;
        let reply = read_frame_async(&mut stream).await?;
        Ok::<_, BrokerError>((stream, reply))
    };
    let (mut stream, reply) = tokio::time::timeout(config.handshake_timeout, exchange)
        .await
        .map_err(|_| BrokerError::Timeout("handshake"))??;

    match reply {
        Some(ReplMessage::StartAck(ack)) if ack.protocol_version == PROTOCOL_VERSION => {
            Ok((stream, ack))
        }
        Some(ReplMessage::StartAck(ack)) => {
            let _ = stream.shutdown().await;
            Err(BrokerError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: ack.protocol_version,
            })
        }
        Some(ReplMessage::Error(err)) => Err(BrokerError::Rejected {
            code: err.code,
            message: err.message,
        }),
        Some(other) => Err(BrokerError::Handshake(format!(
            "expected start-ack, got {}",
            other.name()
        ))),
        None => Err(BrokerError::transport_retryable(
            "connection closed during handshake",
        )),
    }
}

/// Receives changes until the server stops or the connection fails.
async fn inbound<A: UpdateApplier>(
    shared: Arc<Shared<A>>,
    mut reader: OwnedReadHalf,
) -> BrokerResult<()> {
    let result = receive(&shared, &mut reader).await;
    match &result {
        Ok(()) => shared.set_status(BrokerStatus::Disconnected),
        Err(err) => {
            warn!(replica_id = shared.config.replica_id, error = %err, "session failed");
            shared.fail(err);
        }
    }
    result
}

async fn receive<A: UpdateApplier>(
    shared: &Shared<A>,
    reader: &mut OwnedReadHalf,
) -> BrokerResult<()> {
    loop {
        let message = match read_frame_async(reader).await? {
            Some(message) => message,
            None => return Ok(()),
        };
        match message {
            ReplMessage::Update(record) => {
                shared.stats.write().received += 1;
                let csn = record.csn;
                if shared.state.snapshot().covers(&csn) {
                    shared.stats.write().skipped += 1;
                    trace!(csn = %csn, "change already applied");
                    continue;
                }
                shared.applier.apply(&record)?;
                shared.generator.adjust(csn);
                shared.state.update(csn);
                shared.progress.send_replace(shared.state.snapshot());
                shared.stats.write().applied += 1;
                trace!(csn = %csn, dn = %record.entry_dn, "applied change");
            }
            ReplMessage::Heartbeat | ReplMessage::ServerState(_) => {}
            ReplMessage::Stop => {
                debug!("server stopped the session");
                return Ok(());
            }
            ReplMessage::Error(err) => {
                return Err(BrokerError::Rejected {
                    code: err.code,
                    message: err.message,
                })
            }
            other @ (ReplMessage::Start(_) | ReplMessage::StartAck(_)) => {
                return Err(BrokerError::Handshake(format!(
                    "unexpected {} while streaming",
                    other.name()
                )))
            }
        }
    }
}

/// Sends published changes, and on every tick either the replica's state
/// (if it moved) or a heartbeat.
async fn outbound_loop<A: UpdateApplier>(
    shared: Arc<Shared<A>>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<ReplMessage>,
) -> BrokerResult<()> {
    let interval = shared.config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut acked = shared.state.snapshot();

    let result = loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => {
                    let last = matches!(message, ReplMessage::Stop);
                    if let Err(err) = write_frame_async(&mut writer, &message).await {
                        break Err(err.into());
                    }
                    if last {
                        break Ok(());
                    }
                }
                None => break Ok(()),
            },
            _ = ticker.tick() => {
                let current = shared.state.snapshot();
                let message = if current != acked {
                    shared.stats.write().acks_sent += 1;
                    acked = current.clone();
                    ReplMessage::ServerState(current)
                } else {
                    ReplMessage::Heartbeat
                };
                if let Err(err) = write_frame_async(&mut writer, &message).await {
                    break Err(err.into());
                }
            }
        }
    };
    let _ = writer.shutdown().await;
    result
}
