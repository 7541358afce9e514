//! One live session with a remote party.
//!
//! A `Connection` is a cheap cloneable handle. Sending only enqueues onto a
//! bounded channel drained by a writer task, so a slow peer fills its own
//! queue and nobody else's.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{MenuCodec, read_frame, write_frame};
use crate::error::RemoteError;
use crate::protocol::{DEFAULT_HEARTBEAT_FREQUENCY_MS, MenuCommand};

/// Missed heartbeat periods tolerated before a peer counts as dead.
pub const LIVENESS_TOLERANCE: u32 = 3;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection within this process
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Result of comparing heartbeat stamps against the frequency contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Nothing sent for a full period; a heartbeat should go out.
    HeartbeatDue,
    /// Nothing received for more than `LIVENESS_TOLERANCE` periods.
    Dead,
}

/// Anything commands can be handed to.
pub trait CommandSender: Send + Sync {
    fn send_command(&self, cmd: MenuCommand) -> Result<(), RemoteError>;
}

type CloseHandler = Box<dyn FnOnce(ConnectionId) + Send>;

struct Stamps {
    last_received: Instant,
    last_transmitted: Instant,
}

struct Inner {
    id: ConnectionId,
    label: String,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<MenuCommand>,
    cancel: CancellationToken,
    closed: AtomicBool,
    frequency_ms: AtomicU64,
    stamps: Mutex<Stamps>,
    close_handlers: Mutex<Vec<CloseHandler>>,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Create a connection whose outbound commands appear on the returned
    /// receiver. Transport wiring (`spawn_stream`) drains it into a socket;
    /// tests read it directly.
    pub fn new(label: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<MenuCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let now = Instant::now();
        let inner = Inner {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            label: label.into(),
            connected_at: Utc::now(),
            outbound: tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            frequency_ms: AtomicU64::new(DEFAULT_HEARTBEAT_FREQUENCY_MS),
            stamps: Mutex::new(Stamps {
                last_received: now,
                last_transmitted: now,
            }),
            close_handlers: Mutex::new(Vec::new()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Wire a byte stream to a new connection.
    ///
    /// A reader task decodes frames onto the returned inbound channel; a
    /// writer task drains the outbound queue into the stream. Malformed
    /// frames are logged and skipped. End of stream or an I/O error closes
    /// this connection only.
    pub fn spawn_stream<S>(
        stream: S,
        label: impl Into<String>,
        codec: Arc<dyn MenuCodec>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<MenuCommand>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (conn, mut outbound_rx) = Self::new(label, capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
        let (mut reader, mut writer) = tokio::io::split(stream);

        let writer_conn = conn.clone();
        let writer_codec = codec.clone();
        tokio::spawn(async move {
            let cancel = writer_conn.inner.cancel.clone();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = outbound_rx.recv() => {
                        let Some(cmd) = cmd else { break };
                        if let Err(e) = write_command(&mut writer, writer_codec.as_ref(), &cmd).await {
                            warn!(conn = %writer_conn.id(), error = %e, "write failed, closing");
                            writer_conn.close();
                            return;
                        }
                    }
                }
            }
            // Flush whatever was queued before the close (final acks, goodbye heartbeats).
            while let Ok(cmd) = outbound_rx.try_recv() {
                if write_command(&mut writer, writer_codec.as_ref(), &cmd)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
        });

        let reader_conn = conn.clone();
        tokio::spawn(async move {
            let cancel = reader_conn.inner.cancel.clone();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = read_frame(&mut reader) => match frame {
                        Ok(Some(bytes)) => match codec.decode(&bytes) {
                            Ok(cmd) => {
                                reader_conn.mark_received();
                                debug!(conn = %reader_conn.id(), command = cmd.name(), "received");
                                if inbound_tx.send(cmd).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(conn = %reader_conn.id(), error = %e, "malformed frame, skipping");
                            }
                        },
                        Ok(None) => {
                            debug!(conn = %reader_conn.id(), "peer closed the stream");
                            break;
                        }
                        Err(e) => {
                            warn!(conn = %reader_conn.id(), error = %e, "read failed");
                            break;
                        }
                    }
                }
            }
            reader_conn.close();
        });

        (conn, inbound_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    /// Enqueue a command without waiting.
    pub fn send(&self, cmd: MenuCommand) -> Result<(), RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::Closed);
        }
        match self.inner.outbound.try_send(cmd) {
            Ok(()) => {
                lock(&self.inner.stamps).last_transmitted = Instant::now();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(RemoteError::Backpressure(self.id())),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RemoteError::Closed),
        }
    }

    /// Enqueue a command, waiting for room in the queue. Only the caller
    /// waits; use for bulk output to one session such as a boot sequence.
    pub async fn send_wait(&self, cmd: MenuCommand) -> Result<(), RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::Closed);
        }
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(RemoteError::Closed),
            sent = self.inner.outbound.send(cmd) => {
                sent.map_err(|_| RemoteError::Closed)?;
                lock(&self.inner.stamps).last_transmitted = Instant::now();
                Ok(())
            }
        }
    }

    /// Record that something arrived from the peer.
    pub fn mark_received(&self) {
        lock(&self.inner.stamps).last_received = Instant::now();
    }

    pub fn last_received(&self) -> Instant {
        lock(&self.inner.stamps).last_received
    }

    pub fn last_transmitted(&self) -> Instant {
        lock(&self.inner.stamps).last_transmitted
    }

    pub fn set_heartbeat_frequency(&self, frequency_ms: u64) {
        self.inner
            .frequency_ms
            .store(frequency_ms.max(1), Ordering::Relaxed);
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.inner.frequency_ms.load(Ordering::Relaxed))
    }

    /// Judge the session at `now`.
    pub fn liveness(&self, now: Instant) -> Liveness {
        let frequency = self.heartbeat_frequency();
        let stamps = lock(&self.inner.stamps);
        if now.saturating_duration_since(stamps.last_received) > frequency * LIVENESS_TOLERANCE {
            Liveness::Dead
        } else if now.saturating_duration_since(stamps.last_transmitted) > frequency {
            Liveness::HeartbeatDue
        } else {
            Liveness::Alive
        }
    }

    /// Register a handler run once when the connection closes. Runs
    /// immediately if it already has.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnOnce(ConnectionId) + Send + 'static,
    {
        let mut handlers = lock(&self.inner.close_handlers);
        if self.inner.closed.load(Ordering::Acquire) {
            drop(handlers);
            handler(self.id());
        } else {
            handlers.push(Box::new(handler));
        }
    }

    /// Close the connection. Only the first call has any effect.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        info!(conn = %self.id(), label = %self.label(), "connection closed");
        let handlers = std::mem::take(&mut *lock(&self.inner.close_handlers));
        for handler in handlers {
            handler(self.id());
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }
}

impl CommandSender for Connection {
    fn send_command(&self, cmd: MenuCommand) -> Result<(), RemoteError> {
        self.send(cmd)
    }
}

async fn write_command<W>(
    writer: &mut W,
    codec: &dyn MenuCodec,
    cmd: &MenuCommand,
) -> Result<(), RemoteError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = codec.encode(cmd)?;
    write_frame(writer, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::protocol::{AckStatus, CorrelationId, HeartbeatMode};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn full_queue_is_backpressure() {
        let (conn, _rx) = Connection::new("test", 1);
        conn.send(MenuCommand::heartbeat(1500, HeartbeatMode::Normal))
            .unwrap();
        let err = conn
            .send(MenuCommand::heartbeat(1500, HeartbeatMode::Normal))
            .unwrap_err();
        assert!(matches!(err, RemoteError::Backpressure(id) if id == conn.id()));
    }

    #[test]
    fn close_is_idempotent_and_runs_handlers_once() {
        let (conn, _rx) = Connection::new("test", 4);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        conn.on_close(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        conn.close();
        conn.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.send(MenuCommand::ack(CorrelationId::EMPTY, AckStatus::Success)),
            Err(RemoteError::Closed)
        ));

        let late = calls.clone();
        conn.on_close(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn liveness_uses_three_periods() {
        let (conn, _rx) = Connection::new("test", 4);
        conn.set_heartbeat_frequency(100);
        let base = conn.last_received().max(conn.last_transmitted());

        assert_eq!(conn.liveness(base + Duration::from_millis(50)), Liveness::Alive);
        assert_eq!(
            conn.liveness(base + Duration::from_millis(150)),
            Liveness::HeartbeatDue
        );
        assert_eq!(
            conn.liveness(base + Duration::from_millis(301)),
            Liveness::Dead
        );
    }

    #[tokio::test]
    async fn stream_end_closes_connection() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (conn, mut inbound) = Connection::spawn_stream(ours, "duplex", Arc::new(JsonCodec), 8);
        drop(theirs);

        assert!(inbound.recv().await.is_none());
        conn.closed().await;
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn queued_commands_are_flushed_on_close() {
        let (ours, mut theirs) = tokio::io::duplex(4096);
        let (conn, _inbound) = Connection::spawn_stream(ours, "duplex", Arc::new(JsonCodec), 8);

        let ack = MenuCommand::ack(CorrelationId(9), AckStatus::InvalidCredentials);
        conn.send(ack.clone()).unwrap();
        conn.close();

        let bytes = read_frame(&mut theirs).await.unwrap().unwrap();
        assert_eq!(JsonCodec.decode(&bytes).unwrap(), ack);
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let (ours, mut theirs) = tokio::io::duplex(4096);
        let (_conn, mut inbound) = Connection::spawn_stream(ours, "duplex", Arc::new(JsonCodec), 8);

        write_frame(&mut theirs, b"not json").await.unwrap();
        let hb = MenuCommand::heartbeat(200, HeartbeatMode::Normal);
        write_frame(&mut theirs, &JsonCodec.encode(&hb).unwrap())
            .await
            .unwrap();

        assert_eq!(inbound.recv().await.unwrap(), hb);
    }
}
