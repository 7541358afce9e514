//! TCP accept loop.

use std::sync::Arc;
use std::time::Duration;

use menu_remote::{Connection, MenuCodec};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::MenuManagerServer;

/// Accept connections until `cancel` fires, handing each to `server`.
pub async fn serve(
    listener: TcpListener,
    server: Arc<MenuManagerServer>,
    codec: Arc<dyn MenuCodec>,
    capacity: usize,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    info!(%local, "accepting connections");
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "nodelay not set");
        }
        let (conn, inbound) = Connection::spawn_stream(stream, peer.to_string(), codec.clone(), capacity);
        server.accept(conn, inbound);
    }
    info!(%local, "accept loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OpenAuthenticator;
    use crate::config::ManagerConfig;
    use menu_remote::{Dialer, HeartbeatMode, JsonCodec, MenuCommand, TcpDialer};
    use menu_tree::MenuTree;

    #[tokio::test]
    async fn serves_framed_sessions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = MenuManagerServer::new(
            Arc::new(MenuTree::new()),
            Arc::new(OpenAuthenticator),
            ManagerConfig::default(),
        );
        let cancel = CancellationToken::new();
        let accept_loop = tokio::spawn(serve(
            listener,
            Arc::clone(&server),
            Arc::new(JsonCodec),
            16,
            cancel.clone(),
        ));

        let dialer = TcpDialer::new("127.0.0.1", port, Arc::new(JsonCodec), 16);
        let (conn, mut inbound) = dialer.dial().await.unwrap();
        conn.send(MenuCommand::heartbeat(1500, HeartbeatMode::Start)).unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap();
        match reply {
            Some(MenuCommand::Join { name, .. }) => assert_eq!(name, "menud"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.session_count(), 1);

        cancel.cancel();
        accept_loop.await.unwrap().unwrap();
    }
}
