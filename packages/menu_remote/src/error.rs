use crate::connection::ConnectionId;
use crate::connector::AuthStatus;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("outbound queue for {0} is full")]
    Backpressure(ConnectionId),

    #[error("connection is closed")]
    Closed,

    #[error("no connection to the remote")]
    NotConnected,

    #[error("{command} may not be sent while {status:?}")]
    NotPermitted {
        status: AuthStatus,
        command: &'static str,
    },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Errors after which the session cannot be used any more.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::NotConnected | Self::Io(_) | Self::FrameTooLarge { .. }
        )
    }
}
