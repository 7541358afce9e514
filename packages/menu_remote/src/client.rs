//! `RemoteConnector`: the client role, dialing a menu server and keeping the
//! link up.
//!
//! The connector runs one task that dials, drives the `ConnectorMachine`
//! from inbound commands and liveness ticks, and reconnects with
//! exponential back-off when the link drops. A rejected `Join` ends the
//! task; there is no point retrying the same credentials.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use menu_tree::MenuId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{CommandSender, Connection};
use crate::connector::{AuthStatus, ConnectorEffect, ConnectorEvent, ConnectorMachine};
use crate::correlation::CorrelationTracker;
use crate::error::RemoteError;
use crate::protocol::{
    API_VERSION, AckStatus, BootstrapMode, ChangeType, CorrelationId, DEFAULT_HEARTBEAT_FREQUENCY_MS,
    HeartbeatMode, MenuCommand,
};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Produces a fresh channel to the remote on each call.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self) -> BoxFuture<'_, Result<(Connection, mpsc::Receiver<MenuCommand>), RemoteError>>;

    /// Where this dialer connects, for logs.
    fn describe(&self) -> String;
}

/// Receives what the connector sees. Called synchronously from the
/// connector task, so implementations must not block.
pub trait ConnectorListener: Send + Sync {
    fn on_command(&self, _cmd: &MenuCommand) {}
    fn on_status(&self, _status: AuthStatus) {}

    /// Apply a value change pushed by the remote, after `on_command` has
    /// seen it. The first listener returning an error status decides the
    /// acknowledgement.
    fn on_change(&self, _item_id: MenuId, _change_type: ChangeType, _value: &str) -> AckStatus {
        AckStatus::Success
    }
}

/// How this side introduces itself in `Join`.
#[derive(Debug, Clone)]
pub struct ConnectorIdentity {
    pub name: String,
    pub uuid: Uuid,
    pub platform: String,
}

impl ConnectorIdentity {
    pub fn new(name: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            name: name.into(),
            uuid,
            platform: "rust".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Our declared heartbeat period.
    pub heartbeat_frequency: Duration,
    /// How often the liveness tick runs.
    pub tick_interval: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            heartbeat_frequency: Duration::from_millis(DEFAULT_HEARTBEAT_FREQUENCY_MS),
            tick_interval: Duration::from_millis(200),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RemoteConnector {
    dialer: Box<dyn Dialer>,
    identity: ConnectorIdentity,
    settings: ConnectorSettings,
    machine: Mutex<ConnectorMachine>,
    status_tx: watch::Sender<AuthStatus>,
    connection: Mutex<Option<Connection>>,
    listeners: Mutex<Vec<Weak<dyn ConnectorListener>>>,
    tracker: CorrelationTracker,
    cancel: CancellationToken,
}

impl RemoteConnector {
    pub fn new(
        dialer: impl Dialer,
        identity: ConnectorIdentity,
        settings: ConnectorSettings,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(AuthStatus::NotStarted);
        Arc::new(Self {
            dialer: Box::new(dialer),
            identity,
            settings,
            machine: Mutex::new(ConnectorMachine::new()),
            status_tx,
            connection: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            tracker: CorrelationTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn identity(&self) -> &ConnectorIdentity {
        &self.identity
    }

    pub fn status(&self) -> AuthStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AuthStatus> {
        self.status_tx.subscribe()
    }

    /// Name announced by the remote on the current channel.
    pub fn remote_name(&self) -> Option<String> {
        lock(&self.machine).remote_name().map(str::to_string)
    }

    pub fn pending_acks(&self) -> usize {
        self.tracker.pending()
    }

    /// Register a listener. Only a weak reference is kept.
    pub fn add_listener<L>(&self, listener: &Arc<L>)
    where
        L: ConnectorListener + 'static,
    {
        let weak: Weak<dyn ConnectorListener> = Arc::downgrade(listener) as Weak<dyn ConnectorListener>;
        lock(&self.listeners).push(weak);
    }

    /// Spawn the connect/drive/reconnect loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    /// Announce a graceful close, then stop the loop.
    pub fn stop(&self) {
        if let Some(conn) = self.current_connection() {
            let goodbye = MenuCommand::heartbeat(self.frequency_ms(), HeartbeatMode::End);
            if let Err(e) = conn.send(goodbye) {
                debug!(error = %e, "could not announce close");
            }
        }
        self.cancel.cancel();
        if let Some(conn) = self.current_connection() {
            conn.close();
        }
    }

    /// Send a command if the current state allows it.
    pub fn send_command(&self, cmd: MenuCommand) -> Result<(), RemoteError> {
        let conn = self.current_connection().ok_or(RemoteError::NotConnected)?;
        let status = self.status();
        if !status.can_send_command_to_remote(&cmd) {
            return Err(RemoteError::NotPermitted {
                status,
                command: cmd.name(),
            });
        }
        conn.send(cmd)
    }

    /// Send a change under a fresh correlation id and wait on its ack.
    pub fn send_change(
        &self,
        item_id: MenuId,
        change_type: ChangeType,
        value: impl Into<String>,
    ) -> Result<(CorrelationId, oneshot::Receiver<AckStatus>), RemoteError> {
        let (correlation, rx) = self.tracker.next();
        let cmd = MenuCommand::Change {
            correlation,
            item_id,
            change_type,
            value: value.into(),
        };
        match self.send_command(cmd) {
            Ok(()) => Ok((correlation, rx)),
            Err(e) => {
                self.tracker.forget(correlation);
                Err(e)
            }
        }
    }

    fn frequency_ms(&self) -> u64 {
        self.settings.heartbeat_frequency.as_millis() as u64
    }

    fn current_connection(&self) -> Option<Connection> {
        lock(&self.connection).clone()
    }

    async fn run(self: Arc<Self>) {
        let target = self.dialer.describe();
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.apply(ConnectorEvent::Start);
            info!(remote = %target, attempt, "connecting");

            let dialed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                dialed = self.dialer.dial() => dialed,
            };
            match dialed {
                Ok((conn, inbound)) => {
                    if self.drive(conn, inbound).await {
                        attempt = 0;
                    }
                }
                Err(e) => {
                    warn!(remote = %target, error = %e, "connect failed");
                    self.apply(ConnectorEvent::Disconnected);
                }
            }

            if self.status() == AuthStatus::FailedAuth {
                warn!(remote = %target, "authentication rejected, not reconnecting");
                break;
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let delay = Duration::from_secs(1 << attempt.min(6)).min(MAX_BACKOFF);
            attempt += 1;
            debug!(remote = %target, delay_secs = delay.as_secs(), "waiting before reconnect");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(remote = %target, "connector loop finished");
    }

    /// Run one channel until it drops. Returns whether it ever became ready.
    async fn drive(&self, conn: Connection, mut inbound: mpsc::Receiver<MenuCommand>) -> bool {
        conn.set_heartbeat_frequency(self.frequency_ms());
        *lock(&self.connection) = Some(conn.clone());
        self.apply(ConnectorEvent::Connected);

        let mut reached_ready = false;
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        loop {
            if self.status() == AuthStatus::ConnectionReady {
                reached_ready = true;
            }
            if self.status().is_terminal() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = conn.closed() => {
                    // commands read before the close, such as a final ack
                    while let Ok(cmd) = inbound.try_recv() {
                        self.dispatch(&conn, cmd);
                    }
                    break;
                }
                _ = ticker.tick() => {
                    let liveness = conn.liveness(Instant::now());
                    self.apply(ConnectorEvent::Tick(liveness));
                }
                cmd = inbound.recv() => match cmd {
                    Some(cmd) => self.dispatch(&conn, cmd),
                    None => break,
                }
            }
        }

        self.apply(ConnectorEvent::Disconnected);
        conn.close();
        *lock(&self.connection) = None;
        reached_ready
    }

    fn dispatch(&self, conn: &Connection, cmd: MenuCommand) {
        match &cmd {
            MenuCommand::Heartbeat { frequency_ms, mode } => {
                conn.set_heartbeat_frequency(*frequency_ms);
                if *mode == HeartbeatMode::End {
                    info!(conn = %conn.id(), "remote announced close");
                    conn.close();
                }
                return;
            }
            MenuCommand::Join { name, .. } => {
                self.apply(ConnectorEvent::JoinReceived { name: name.clone() });
                return;
            }
            _ => {}
        }

        self.notify_command(&cmd);
        match cmd {
            MenuCommand::Ack {
                correlation,
                status,
            } => {
                self.tracker.resolve(correlation, status);
                self.apply(ConnectorEvent::AckReceived(status));
            }
            MenuCommand::Bootstrap { mode } => self.apply(ConnectorEvent::BootstrapReceived(mode)),
            MenuCommand::Change {
                correlation,
                item_id,
                change_type,
                value,
            } => {
                let status = self.notify_change(item_id, change_type, &value);
                if !correlation.is_empty() {
                    if let Err(e) = conn.send(MenuCommand::ack(correlation, status)) {
                        warn!(conn = %conn.id(), %correlation, error = %e, "change not acknowledged");
                    }
                }
            }
            _ => {}
        }
    }

    /// Feed one event to the machine and carry out its effects.
    fn apply(&self, event: ConnectorEvent) {
        let mut pending = vec![event];
        while let Some(event) = pending.pop() {
            let effects = lock(&self.machine).handle(event);
            for effect in effects {
                if let Some(follow_up) = self.execute(effect) {
                    pending.push(follow_up);
                }
            }
        }
    }

    fn execute(&self, effect: ConnectorEffect) -> Option<ConnectorEvent> {
        match effect {
            ConnectorEffect::SendHeartbeat(mode) => {
                if let Some(conn) = self.current_connection() {
                    if let Err(e) = conn.send(MenuCommand::heartbeat(self.frequency_ms(), mode)) {
                        warn!(conn = %conn.id(), error = %e, "heartbeat not sent");
                    }
                }
                None
            }
            ConnectorEffect::SendJoin => {
                let conn = self.current_connection()?;
                let join = MenuCommand::Join {
                    uuid: self.identity.uuid,
                    name: self.identity.name.clone(),
                    platform: self.identity.platform.clone(),
                    api_version: API_VERSION,
                };
                match conn.send(join) {
                    Ok(()) => Some(ConnectorEvent::JoinSent),
                    Err(e) => {
                        warn!(conn = %conn.id(), error = %e, "join not sent");
                        Some(ConnectorEvent::Disconnected)
                    }
                }
            }
            ConnectorEffect::CloseChannel => {
                if let Some(conn) = self.current_connection() {
                    conn.close();
                }
                None
            }
            ConnectorEffect::AbandonPending => {
                let dropped = self.tracker.abandon_all();
                if dropped > 0 {
                    debug!(dropped, "abandoned pending acknowledgements");
                }
                None
            }
            ConnectorEffect::StatusChanged(status) => {
                info!(remote = %self.dialer.describe(), %status, "connector status");
                for listener in self.live_listeners() {
                    listener.on_status(status);
                }
                self.status_tx.send_replace(status);
                None
            }
        }
    }

    fn notify_command(&self, cmd: &MenuCommand) {
        for listener in self.live_listeners() {
            listener.on_command(cmd);
        }
    }

    fn notify_change(&self, item_id: MenuId, change_type: ChangeType, value: &str) -> AckStatus {
        let mut outcome = AckStatus::Success;
        for listener in self.live_listeners() {
            let status = listener.on_change(item_id, change_type, value);
            if outcome == AckStatus::Success {
                outcome = status;
            }
        }
        outcome
    }

    fn live_listeners(&self) -> Vec<Arc<dyn ConnectorListener>> {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }
}

impl CommandSender for RemoteConnector {
    fn send_command(&self, cmd: MenuCommand) -> Result<(), RemoteError> {
        RemoteConnector::send_command(self, cmd)
    }
}
