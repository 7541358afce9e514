//! The menu server.
//!
//! Each accepted connection becomes a session with its own read task. The
//! server authenticates joins, boots authenticated sessions with the whole
//! visible tree, arbitrates value changes and fans accepted changes out to
//! every other authenticated session. A separate task polices heartbeats.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use menu_remote::{
    API_VERSION, AckStatus, ChangeType, CommandSender, Connection, ConnectionId,
    CorrelationId, CorrelationTracker, DialogMode, HeartbeatMode, Liveness, MenuCommand,
    RemoteError,
};
use menu_tree::{MenuId, MenuItem, MenuTree, MenuValue, TreeError};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::ManagerConfig;
use crate::dialog::DialogManager;
use crate::error::ServerError;
use crate::metrics::ServerMetrics;

/// Observer of tree changes. Held weakly; called on the mutating task.
pub trait MenuManagerListener: Send + Sync {
    /// `remote_change` is true when a connected session made the change.
    fn menu_item_changed(&self, _item: &MenuItem, _remote_change: bool) {}
    fn tree_structure_changed(&self, _id: MenuId) {}
}

struct Session {
    conn: Connection,
    authenticated: AtomicBool,
    remote_name: Mutex<Option<String>>,
}

impl Session {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }
}

/// Public view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub label: String,
    pub remote_name: Option<String>,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MenuManagerServer {
    tree: Arc<MenuTree>,
    authenticator: Arc<dyn Authenticator>,
    config: ManagerConfig,
    sessions: DashMap<ConnectionId, Arc<Session>>,
    listeners: Mutex<Vec<Weak<dyn MenuManagerListener>>>,
    tracker: CorrelationTracker,
    dialog: Mutex<Option<Arc<DialogManager>>>,
    metrics: Arc<ServerMetrics>,
    cancel: CancellationToken,
}

impl MenuManagerServer {
    pub fn new(
        tree: Arc<MenuTree>,
        authenticator: Arc<dyn Authenticator>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tree,
            authenticator,
            config,
            sessions: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            tracker: CorrelationTracker::new(),
            dialog: Mutex::new(None),
            metrics: Arc::new(ServerMetrics::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn tree(&self) -> &Arc<MenuTree> {
        &self.tree
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let s = entry.value();
                SessionInfo {
                    id: s.conn.id().0,
                    label: s.conn.label().to_string(),
                    remote_name: lock(&s.remote_name).clone(),
                    authenticated: s.is_authenticated(),
                    connected_at: s.conn.connected_at(),
                }
            })
            .collect()
    }

    /// Register a listener. Only a weak reference is kept.
    pub fn add_listener<L>(&self, listener: &Arc<L>)
    where
        L: MenuManagerListener + 'static,
    {
        let weak: Weak<dyn MenuManagerListener> =
            Arc::downgrade(listener) as Weak<dyn MenuManagerListener>;
        lock(&self.listeners).push(weak);
    }

    /// Route remote dialog traffic to `dialog` and let it broadcast through
    /// this server.
    pub fn attach_dialog_manager(self: &Arc<Self>, dialog: Arc<DialogManager>) {
        dialog.set_channel(self);
        *lock(&self.dialog) = Some(dialog);
    }

    pub fn dialog_manager(&self) -> Option<Arc<DialogManager>> {
        lock(&self.dialog).clone()
    }

    /// Track `conn` as a session. The session disappears when the
    /// connection closes.
    pub fn register_connection(self: &Arc<Self>, conn: &Connection) {
        let session = Arc::new(Session {
            conn: conn.clone(),
            authenticated: AtomicBool::new(false),
            remote_name: Mutex::new(None),
        });
        self.sessions.insert(conn.id(), session);
        self.metrics.session_opened();
        info!(conn = %conn.id(), label = %conn.label(), "session opened");

        let server = Arc::downgrade(self);
        conn.on_close(move |id| {
            if let Some(server) = server.upgrade() {
                if server.sessions.remove(&id).is_some() {
                    server.metrics.session_closed();
                }
            }
        });
    }

    /// Serve one connection: a read task feeding `handle_command`, and a
    /// supervisor that closes the session when the read task ends, fails or
    /// panics.
    pub fn accept(
        self: &Arc<Self>,
        conn: Connection,
        inbound: mpsc::Receiver<MenuCommand>,
    ) -> JoinHandle<()> {
        self.register_connection(&conn);

        let server = Arc::clone(self);
        let reader_conn = conn.clone();
        let reader = tokio::spawn(async move { server.read_loop(reader_conn, inbound).await });

        tokio::spawn(async move {
            match reader.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(conn = %conn.id(), error = %e, "session failed"),
                Err(e) if e.is_panic() => error!(conn = %conn.id(), "session task panicked"),
                Err(e) => debug!(conn = %conn.id(), error = %e, "session task cancelled"),
            }
            conn.close();
        })
    }

    async fn read_loop(
        &self,
        conn: Connection,
        mut inbound: mpsc::Receiver<MenuCommand>,
    ) -> Result<(), ServerError> {
        loop {
            let cmd = tokio::select! {
                _ = conn.closed() => return Ok(()),
                _ = self.cancel.cancelled() => return Ok(()),
                cmd = inbound.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => return Ok(()),
                },
            };
            self.handle_command(&conn, cmd).await?;
        }
    }

    /// Process one command received on `conn`.
    pub async fn handle_command(
        &self,
        conn: &Connection,
        cmd: MenuCommand,
    ) -> Result<(), ServerError> {
        conn.mark_received();
        self.metrics.command_received();
        let Some(session) = self.sessions.get(&conn.id()).map(|s| Arc::clone(s.value())) else {
            debug!(conn = %conn.id(), command = cmd.name(), "command for unknown session");
            return Ok(());
        };
        debug!(conn = %conn.id(), command = cmd.name(), "command received");

        match cmd {
            MenuCommand::Join {
                uuid,
                name,
                platform,
                api_version,
            } => {
                if !self.authenticator.authenticate(&name, uuid) {
                    warn!(conn = %conn.id(), client = %name, %uuid, "join refused");
                    self.metrics.auth_failed();
                    self.send_to(conn, MenuCommand::ack(CorrelationId::EMPTY, AckStatus::InvalidCredentials));
                    conn.close();
                    return Ok(());
                }
                session.authenticated.store(true, Ordering::Release);
                *lock(&session.remote_name) = Some(name.clone());
                info!(
                    conn = %conn.id(),
                    client = %name,
                    %platform,
                    api_version,
                    "client authenticated"
                );
                self.send_to(conn, MenuCommand::ack(CorrelationId::EMPTY, AckStatus::Success));
                self.send_boot(conn).await?;
            }

            MenuCommand::Heartbeat { frequency_ms, mode } => {
                conn.set_heartbeat_frequency(frequency_ms);
                match mode {
                    HeartbeatMode::Start => {
                        self.send_to(conn, self.join_command());
                    }
                    HeartbeatMode::Normal => {}
                    HeartbeatMode::End => {
                        info!(conn = %conn.id(), "peer closed the session");
                        conn.close();
                    }
                }
            }

            MenuCommand::Change {
                correlation,
                item_id,
                change_type,
                value,
            } => {
                if !session.is_authenticated() {
                    debug!(conn = %conn.id(), item = %item_id, "change before authentication ignored");
                    return Ok(());
                }
                self.apply_remote_change(conn, correlation, item_id, change_type, &value);
            }

            MenuCommand::Ack {
                correlation,
                status,
            } => {
                if status.is_error() {
                    warn!(conn = %conn.id(), %correlation, code = status.code(), "error acknowledgement");
                }
                self.tracker.resolve(correlation, status);
            }

            dialog @ MenuCommand::Dialog { .. } => {
                if !session.is_authenticated() {
                    debug!(conn = %conn.id(), "dialog before authentication ignored");
                    return Ok(());
                }
                self.handle_dialog(conn, &dialog);
            }

            MenuCommand::Bootstrap { .. } => {
                debug!(conn = %conn.id(), "bootstrap from a client ignored");
            }

            other => {
                debug!(conn = %conn.id(), command = other.name(), "boot from a client ignored");
            }
        }
        Ok(())
    }

    fn handle_dialog(&self, conn: &Connection, cmd: &MenuCommand) {
        let MenuCommand::Dialog {
            mode, correlation, ..
        } = cmd
        else {
            return;
        };
        let applied = self
            .dialog_manager()
            .is_some_and(|dialog| dialog.handle_remote(cmd));
        if *mode == DialogMode::Action && !correlation.is_empty() {
            let status = if applied {
                AckStatus::Success
            } else {
                AckStatus::UnknownError
            };
            self.send_to(conn, MenuCommand::ack(*correlation, status));
        }
    }

    fn apply_remote_change(
        &self,
        conn: &Connection,
        correlation: CorrelationId,
        item_id: MenuId,
        change_type: ChangeType,
        raw: &str,
    ) {
        let (item, value) = match self.arbitrate(item_id, change_type, raw) {
            Ok(applied) => applied,
            Err(status) => {
                warn!(
                    conn = %conn.id(),
                    item = %item_id,
                    ?change_type,
                    value = raw,
                    code = status.code(),
                    "change rejected"
                );
                self.metrics.change_rejected();
                self.send_to(conn, MenuCommand::ack(correlation, status));
                return;
            }
        };

        self.metrics.change_accepted();
        self.send_to(conn, MenuCommand::ack(correlation, AckStatus::Success));
        self.broadcast_change(item_id, &value, Some(conn.id()), CorrelationId::EMPTY);
        self.notify_item_changed(&item, true);
    }

    /// Decide and store the new value for a remote change, or return the
    /// ack explaining why not. Local-only items do not exist for remotes.
    fn arbitrate(
        &self,
        item_id: MenuId,
        change_type: ChangeType,
        raw: &str,
    ) -> Result<(MenuItem, MenuValue), AckStatus> {
        if item_id.is_root() || !self.tree.is_remote_visible(item_id) {
            return Err(AckStatus::IdNotFound);
        }
        let item = self.tree.get_item(item_id).ok_or(AckStatus::IdNotFound)?;
        if item.read_only {
            return Err(AckStatus::ValueRangeWarning);
        }
        let delta = match change_type {
            ChangeType::Delta => Some(
                raw.trim()
                    .parse::<i32>()
                    .map_err(|_| AckStatus::ValueRangeWarning)?,
            ),
            ChangeType::Absolute => None,
        };
        let value = self
            .tree
            .update_item(item_id, |current| match delta {
                Some(delta) => item.apply_delta(current, delta),
                None => item.parse_value(raw),
            })
            .map_err(|e| match e {
                TreeError::ItemNotFound(_) => AckStatus::IdNotFound,
                e => {
                    debug!(item = %item_id, error = %e, "change value refused");
                    AckStatus::ValueRangeWarning
                }
            })?;
        Ok((item, value))
    }

    /// Send the full visible tree to `conn`, waiting for queue room as needed.
    pub async fn send_boot(&self, conn: &Connection) -> Result<(), ServerError> {
        let items = self.tree.visible_depth_first();
        conn.send_wait(MenuCommand::Bootstrap {
            mode: menu_remote::BootstrapMode::Start,
        })
        .await?;
        let mut sent = 1u64;
        for (parent, item) in items {
            let value = self.tree.value_or_default(&item);
            if let Some(boot) = MenuCommand::boot_for(parent, item, value) {
                conn.send_wait(boot).await?;
                sent += 1;
            }
        }
        conn.send_wait(MenuCommand::Bootstrap {
            mode: menu_remote::BootstrapMode::End,
        })
        .await?;
        sent += 1;
        for _ in 0..sent {
            self.metrics.command_sent();
        }
        debug!(conn = %conn.id(), commands = sent, "boot sequence sent");
        Ok(())
    }

    /// Set a value locally and tell every authenticated session.
    pub fn update_menu_item(&self, id: MenuId, value: MenuValue) -> Result<(), ServerError> {
        let item = self.tree.get_item(id).ok_or(TreeError::ItemNotFound(id))?;
        self.tree.change_item(id, value.clone())?;
        self.broadcast_change(id, &value, None, CorrelationId::EMPTY);
        self.notify_item_changed(&item, false);
        Ok(())
    }

    /// Like `update_menu_item`, but the broadcast carries a fresh correlation
    /// and the first session to acknowledge it completes the returned waiter.
    pub fn update_menu_item_tracked(
        &self,
        id: MenuId,
        value: MenuValue,
    ) -> Result<(CorrelationId, oneshot::Receiver<AckStatus>), ServerError> {
        let item = self.tree.get_item(id).ok_or(TreeError::ItemNotFound(id))?;
        self.tree.change_item(id, value.clone())?;
        let (correlation, waiter) = self.tracker.next();
        if self.broadcast_change(id, &value, None, correlation) == 0 {
            // nobody can answer; the waiter sees the sender dropped
            self.tracker.forget(correlation);
        }
        self.notify_item_changed(&item, false);
        Ok((correlation, waiter))
    }

    /// Send an absolute change to every authenticated session except
    /// `exclude`. Returns how many sessions took it. Local-only items are
    /// never sent.
    pub fn broadcast_change(
        &self,
        id: MenuId,
        value: &MenuValue,
        exclude: Option<ConnectionId>,
        correlation: CorrelationId,
    ) -> usize {
        if !self.tree.is_remote_visible(id) {
            debug!(item = %id, "local-only change not broadcast");
            return 0;
        }
        let cmd = MenuCommand::absolute_change(correlation, id, value);
        self.authenticated_sessions()
            .into_iter()
            .filter(|s| Some(s.conn.id()) != exclude)
            .filter(|s| self.send_to(&s.conn, cmd.clone()))
            .count()
    }

    /// One liveness pass at `now`. Dead sessions are closed, quiet ones get
    /// a heartbeat. Returns the sessions that were closed.
    pub fn check_liveness_at(&self, now: Instant) -> Vec<ConnectionId> {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        let mut closed = Vec::new();
        for session in sessions {
            let conn = &session.conn;
            match conn.liveness(now) {
                Liveness::Alive => {}
                Liveness::HeartbeatDue => {
                    self.send_to(
                        conn,
                        MenuCommand::heartbeat(self.config.heartbeat_frequency_ms(), HeartbeatMode::Normal),
                    );
                }
                Liveness::Dead => {
                    warn!(
                        conn = %conn.id(),
                        frequency_ms = conn.heartbeat_frequency().as_millis() as u64,
                        "no heartbeat from peer, closing"
                    );
                    self.metrics.liveness_disconnect();
                    conn.close();
                    closed.push(conn.id());
                }
            }
        }
        closed
    }

    /// Run `check_liveness_at` every `liveness_interval` until shutdown.
    pub fn start_liveness_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let server = Arc::clone(self);
        let period = self.config.liveness_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = server.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        server.check_liveness_at(Instant::now());
                    }
                }
            }
            debug!("liveness loop stopped");
        })
    }

    /// The tree's shape changed under `id`: tell listeners and re-boot every
    /// authenticated session.
    pub fn tree_structure_changed(self: &Arc<Self>, id: MenuId) {
        for listener in self.live_listeners() {
            listener.tree_structure_changed(id);
        }
        for session in self.authenticated_sessions() {
            let server = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = server.send_boot(&session.conn).await {
                    debug!(conn = %session.conn.id(), error = %e, "re-boot not delivered");
                }
            });
        }
    }

    /// Stop background work, say goodbye to every session and close it.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        let goodbye = MenuCommand::heartbeat(self.config.heartbeat_frequency_ms(), HeartbeatMode::End);
        for session in &sessions {
            if let Err(e) = session.conn.send(goodbye.clone()) {
                debug!(conn = %session.conn.id(), error = %e, "goodbye not sent");
            }
            session.conn.close();
        }
        let abandoned = self.tracker.abandon_all();
        info!(sessions = sessions.len(), abandoned, "server shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn join_command(&self) -> MenuCommand {
        MenuCommand::Join {
            uuid: self.config.uuid,
            name: self.config.name.clone(),
            platform: "rust".to_string(),
            api_version: API_VERSION,
        }
    }

    /// Enqueue on one session. A full queue closes that session.
    fn send_to(&self, conn: &Connection, cmd: MenuCommand) -> bool {
        match conn.send(cmd) {
            Ok(()) => {
                self.metrics.command_sent();
                true
            }
            Err(RemoteError::Backpressure(id)) => {
                warn!(conn = %id, "outbound queue full, closing session");
                self.metrics.backpressure_close();
                conn.close();
                false
            }
            Err(e) => {
                debug!(conn = %conn.id(), error = %e, "send skipped");
                false
            }
        }
    }

    fn authenticated_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|e| e.value().is_authenticated())
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    fn notify_item_changed(&self, item: &MenuItem, remote_change: bool) {
        for listener in self.live_listeners() {
            listener.menu_item_changed(item, remote_change);
        }
    }

    fn live_listeners(&self) -> Vec<Arc<dyn MenuManagerListener>> {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }
}

impl CommandSender for MenuManagerServer {
    /// Broadcast to every authenticated session. Per-session failures are
    /// handled per session; the call fails only when no session took it.
    fn send_command(&self, cmd: MenuCommand) -> Result<(), RemoteError> {
        let delivered = self
            .authenticated_sessions()
            .into_iter()
            .filter(|session| self.send_to(&session.conn, cmd.clone()))
            .count();
        if delivered == 0 {
            return Err(RemoteError::NotConnected);
        }
        Ok(())
    }
}
