use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use menu_remote::{ConnectorIdentity, ConnectorSettings, JsonCodec, MenuCodec, RemoteConnector, TcpDialer};
use menu_tree::MenuTree;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use menu_manager::config::{FileConfig, ReplicateConfig, build_authenticator, load_config, load_tree};
use menu_manager::{ManagerConfig, MenuInMenu, MenuManagerServer};

#[derive(Parser)]
#[command(name = "menud")]
#[command(about = "Serve a menu tree to remote control panels")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_directive = if args.debug {
        "menud=debug,menu_manager=debug,menu_remote=debug,info"
    } else {
        "menud=info,menu_manager=info,menu_remote=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let file: FileConfig = load_config(args.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    let config = ManagerConfig::from_file(&file.server);
    info!(name = %config.name, uuid = %config.uuid, "Starting menud");

    let tree = match &file.tree.file {
        Some(path) => load_tree(path)?,
        None => {
            warn!("no tree file configured, serving an empty menu");
            MenuTree::new()
        }
    };

    let bind_addr = config.bind_addr();
    let capacity = config.send_queue_capacity;
    let identity_name = config.name.clone();
    let identity_uuid = config.uuid;
    let heartbeat_frequency = config.heartbeat_frequency;
    let server = MenuManagerServer::new(Arc::new(tree), build_authenticator(&file.auth), config);
    let liveness = server.start_liveness_loop();

    let codec: Arc<dyn MenuCodec> = Arc::new(JsonCodec);
    let mut links = Vec::new();
    for entry in &file.replicate {
        let link = ReplicateConfig::from_file(entry)
            .with_context(|| format!("Invalid replicate entry {}", entry.name))?;
        let connector = RemoteConnector::new(
            TcpDialer::new(&link.host, link.port, codec.clone(), capacity),
            ConnectorIdentity::new(identity_name.clone(), identity_uuid),
            ConnectorSettings {
                heartbeat_frequency,
                ..Default::default()
            },
        );
        let mim = MenuInMenu::new(link.definition, Arc::clone(&server), connector)
            .with_context(|| format!("Failed to link {}", entry.name))?;
        let task = mim.start();
        links.push((mim, task));
    }

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    let cancel = CancellationToken::new();
    let accept_loop = tokio::spawn(menu_manager::tcp::serve(
        listener,
        Arc::clone(&server),
        codec,
        capacity,
        cancel.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("Received shutdown signal, cleaning up...");

    cancel.cancel();
    for (mim, _) in &links {
        mim.stop();
    }
    server.shutdown();

    for (mim, task) in links {
        if let Err(e) = task.await {
            warn!(link = %mim.definition().name, error = %e, "replication task failed");
        }
    }
    if let Err(e) = liveness.await {
        warn!(error = %e, "liveness task failed");
    }
    match accept_loop.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "accept loop failed"),
        Err(e) => warn!(error = %e, "accept task failed"),
    }

    let snapshot = server.metrics().snapshot();
    info!(
        sessions = snapshot.sessions.total,
        changes = snapshot.changes.accepted,
        uptime_secs = snapshot.uptime_secs,
        "menud stopped"
    );
    Ok(())
}
