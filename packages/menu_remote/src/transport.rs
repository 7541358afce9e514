//! TCP transport for the connector.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::Dialer;
use crate::codec::MenuCodec;
use crate::connection::Connection;
use crate::error::RemoteError;
use crate::protocol::MenuCommand;

/// Dials `host:port` and frames commands with `codec`.
pub struct TcpDialer {
    address: String,
    codec: Arc<dyn MenuCodec>,
    capacity: usize,
}

impl TcpDialer {
    pub fn new(host: &str, port: u16, codec: Arc<dyn MenuCodec>, capacity: usize) -> Self {
        Self {
            address: format!("{host}:{port}"),
            codec,
            capacity,
        }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self) -> BoxFuture<'_, Result<(Connection, mpsc::Receiver<MenuCommand>), RemoteError>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.address).await?;
            stream.set_nodelay(true)?;
            debug!(address = %self.address, "tcp connected");
            Ok(Connection::spawn_stream(
                stream,
                self.address.clone(),
                self.codec.clone(),
                self.capacity,
            ))
        })
    }

    fn describe(&self) -> String {
        self.address.clone()
    }
}
