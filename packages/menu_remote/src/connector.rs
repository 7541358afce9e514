//! Client-side connection state machine.
//!
//! `ConnectorMachine` is pure: it takes `ConnectorEvent`s and returns the
//! `ConnectorEffect`s the driver must carry out. Nothing here does I/O, so a
//! whole lifecycle can be replayed from a list of events.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connection::Liveness;
use crate::protocol::{AckStatus, BootstrapMode, HeartbeatMode, MenuCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    NotStarted,
    AwaitingConnection,
    EstablishedConnection,
    SendAuth,
    Authenticated,
    BootstrapInProgress,
    ConnectionReady,
    FailedAuth,
    ConnectionFailed,
}

impl AuthStatus {
    /// States with a live channel.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            Self::EstablishedConnection
                | Self::SendAuth
                | Self::Authenticated
                | Self::BootstrapInProgress
                | Self::ConnectionReady
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::FailedAuth | Self::ConnectionFailed)
    }

    /// Which commands may go out in this state.
    pub fn can_send_command_to_remote(self, cmd: &MenuCommand) -> bool {
        match self {
            Self::EstablishedConnection | Self::SendAuth => matches!(
                cmd,
                MenuCommand::Join { .. } | MenuCommand::Heartbeat { .. }
            ),
            Self::Authenticated | Self::BootstrapInProgress => matches!(
                cmd,
                MenuCommand::Join { .. } | MenuCommand::Heartbeat { .. } | MenuCommand::Ack { .. }
            ),
            Self::ConnectionReady => true,
            _ => false,
        }
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::AwaitingConnection => "awaiting_connection",
            Self::EstablishedConnection => "established_connection",
            Self::SendAuth => "send_auth",
            Self::Authenticated => "authenticated",
            Self::BootstrapInProgress => "bootstrap_in_progress",
            Self::ConnectionReady => "connection_ready",
            Self::FailedAuth => "failed_auth",
            Self::ConnectionFailed => "connection_failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// The driver is about to dial.
    Start,
    /// A channel to the remote is open.
    Connected,
    /// Our `Join` went out.
    JoinSent,
    /// The remote introduced itself.
    JoinReceived { name: String },
    AckReceived(AckStatus),
    BootstrapReceived(BootstrapMode),
    /// Periodic liveness check of the channel.
    Tick(Liveness),
    /// The channel went away, or dialing failed.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEffect {
    SendHeartbeat(HeartbeatMode),
    SendJoin,
    CloseChannel,
    /// Outstanding correlations can never be answered.
    AbandonPending,
    StatusChanged(AuthStatus),
}

#[derive(Debug, Clone)]
pub struct ConnectorMachine {
    status: AuthStatus,
    remote_name: Option<String>,
}

impl Default for ConnectorMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorMachine {
    pub fn new() -> Self {
        Self {
            status: AuthStatus::NotStarted,
            remote_name: None,
        }
    }

    pub fn status(&self) -> AuthStatus {
        self.status
    }

    /// Name the remote gave in its `Join`, if one arrived on this channel.
    pub fn remote_name(&self) -> Option<&str> {
        self.remote_name.as_deref()
    }

    pub fn handle(&mut self, event: ConnectorEvent) -> Vec<ConnectorEffect> {
        use AuthStatus::*;

        let mut effects = Vec::new();
        let next = match (self.status, event) {
            (NotStarted | FailedAuth | ConnectionFailed, ConnectorEvent::Start) => {
                Some(AwaitingConnection)
            }
            (AwaitingConnection, ConnectorEvent::Connected) => Some(EstablishedConnection),
            (AwaitingConnection, ConnectorEvent::Disconnected) => Some(ConnectionFailed),
            (EstablishedConnection, ConnectorEvent::JoinSent) => Some(SendAuth),
            (SendAuth, ConnectorEvent::AckReceived(status)) => {
                if status.is_error() {
                    Some(FailedAuth)
                } else {
                    Some(Authenticated)
                }
            }
            (
                Authenticated | ConnectionReady,
                ConnectorEvent::BootstrapReceived(BootstrapMode::Start),
            ) => Some(BootstrapInProgress),
            (BootstrapInProgress, ConnectorEvent::BootstrapReceived(BootstrapMode::End)) => {
                Some(ConnectionReady)
            }
            (state, ConnectorEvent::JoinReceived { name }) if state.is_open() => {
                self.remote_name = Some(name);
                None
            }
            (state, ConnectorEvent::Disconnected | ConnectorEvent::Tick(Liveness::Dead))
                if state.is_open() =>
            {
                Some(ConnectionFailed)
            }
            (state, ConnectorEvent::Tick(Liveness::HeartbeatDue)) if state.is_open() => {
                effects.push(ConnectorEffect::SendHeartbeat(HeartbeatMode::Normal));
                None
            }
            (state, event) => {
                debug!(status = %state, ?event, "event has no effect");
                None
            }
        };

        if let Some(next) = next {
            self.transition(next, &mut effects);
        }
        effects
    }

    fn transition(&mut self, next: AuthStatus, effects: &mut Vec<ConnectorEffect>) {
        effects.extend(self.on_exit(next));
        debug!(from = %self.status, to = %next, "connector transition");
        self.status = next;
        effects.push(ConnectorEffect::StatusChanged(next));
        effects.extend(self.on_enter());
    }

    fn on_enter(&mut self) -> Vec<ConnectorEffect> {
        match self.status {
            AuthStatus::AwaitingConnection => {
                self.remote_name = None;
                Vec::new()
            }
            AuthStatus::EstablishedConnection => vec![
                ConnectorEffect::SendHeartbeat(HeartbeatMode::Start),
                ConnectorEffect::SendJoin,
            ],
            AuthStatus::FailedAuth | AuthStatus::ConnectionFailed => {
                vec![ConnectorEffect::CloseChannel]
            }
            _ => Vec::new(),
        }
    }

    fn on_exit(&self, next: AuthStatus) -> Vec<ConnectorEffect> {
        if self.status.is_open() && next.is_terminal() {
            vec![ConnectorEffect::AbandonPending]
        } else {
            Vec::new()
        }
    }
}
