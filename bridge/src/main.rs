use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chanbridge::client::ChatClient;
use chanbridge::client::matrix::MatrixClient;
use chanbridge::config::BridgeConfig;
use chanbridge::engine::group_index::GroupIndex;
use chanbridge::engine::membership::MembershipTracker;
use chanbridge::engine::router::EventRouter;
use chanbridge::engine::worker::run_sync_loop;
use chanbridge::shutdown::ShutdownCoordinator;

/// Bridges Matrix rooms across independent homeservers: rooms configured
/// with the same name form one channel, and traffic is mirrored between
/// every member room.
#[derive(Parser)]
#[command(name = "chanbridge", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(path = %args.config, "reading config file");
    let config = BridgeConfig::load(&args.config)?;

    // Log in to every homeserver and join the configured rooms. Login
    // failures are fatal; join failures are logged and never retried.
    let mut connections: Vec<Arc<MatrixClient>> = Vec::new();
    for server_cfg in &config.servers {
        let client = MatrixClient::connect(
            server_cfg,
            &config.unique_device_id,
            &config.device_display_name,
        )
        .await
        .with_context(|| format!("login to {} failed", server_cfg.homeserver))?;
        info!(
            server = %server_cfg.homeserver,
            user = %client.identity(),
            "connected"
        );

        for room in &server_cfg.rooms {
            if let Err(e) = client.join_room(&room.room).await {
                warn!(
                    server = %server_cfg.homeserver,
                    room = %room.room,
                    error = %e,
                    "failed to join room"
                );
            }
        }

        connections.push(Arc::new(client));
    }

    let index = Arc::new(GroupIndex::build(&config));
    let by_server: Arc<HashMap<String, Arc<MatrixClient>>> = Arc::new(
        connections
            .iter()
            .map(|c| (c.homeserver().to_string(), c.clone()))
            .collect(),
    );
    let tracker = Arc::new(MembershipTracker::new(index.clone()));
    let router = Arc::new(EventRouter::new(index, by_server));

    let mut coordinator = ShutdownCoordinator::new();
    for client in &connections {
        coordinator.register(tokio::spawn(run_sync_loop(
            client.clone(),
            tracker.clone(),
            router.clone(),
            coordinator.token(),
        )));
    }
    info!(servers = connections.len(), "bridge running");

    wait_for_signal().await;
    coordinator.shutdown(&connections).await;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
