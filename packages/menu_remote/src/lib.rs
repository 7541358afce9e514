//! Menu Remote - the command protocol spoken between menu servers and their
//! remote parties
//!
//! - `protocol`: the `MenuCommand` vocabulary, correlation ids and ack codes
//! - `codec`: the pluggable payload codec plus length-prefixed framing
//! - `connection`: one session with its outbound queue, heartbeat stamps and
//!   idempotent close
//! - `correlation`: outstanding requests waiting for an ack
//! - `connector` / `client`: the client-side state machine and the task that
//!   drives it over a `Dialer`

pub mod client;
pub mod codec;
pub mod connection;
pub mod connector;
pub mod correlation;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{ConnectorIdentity, ConnectorListener, ConnectorSettings, Dialer, RemoteConnector};
pub use codec::{JsonCodec, MAX_FRAME_SIZE, MenuCodec, read_frame, write_frame};
pub use connection::{CommandSender, Connection, ConnectionId, LIVENESS_TOLERANCE, Liveness};
pub use connector::{AuthStatus, ConnectorEffect, ConnectorEvent, ConnectorMachine};
pub use correlation::CorrelationTracker;
pub use error::RemoteError;
pub use protocol::{
    API_VERSION, AckStatus, BootItem, BootstrapMode, ChangeType, CorrelationId,
    DEFAULT_HEARTBEAT_FREQUENCY_MS, DialogMode, HeartbeatMode, MenuButtonType, MenuCommand,
};
pub use transport::TcpDialer;
