//! `meshd` — joins one workspace's mesh overlay and logs membership and
//! document-sync traffic. A thin wiring layer over [`PeerManager`]; it
//! owns no CRDT engine or persistence of its own (spec §1 Non-goals).

use std::net::SocketAddr;

use clap::Parser;
use mesh_core::config::{parse_workspace_key, CliArgs, MeshConfig};
use mesh_core::crypto::{decrypt_update, WorkspaceKey};
use mesh_core::{MeshEvent, PeerManager};
use mesh_proto::PeerId;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match MeshConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&cli.log_level, cli.log_file.as_deref());

    let Some(workspace_id) = cli.workspace_id.clone() else {
        tracing::error!("--workspace-id (or MESH_WORKSPACE_ID) is required");
        std::process::exit(1);
    };

    let workspace_key = match cli.workspace_key.as_deref().map(parse_workspace_key) {
        Some(Ok(bytes)) => match WorkspaceKey::new(bytes) {
            Ok(key) => Some(key),
            Err(_) => {
                tracing::error!("workspace key is invalid (all-zero)");
                std::process::exit(1);
            }
        },
        Some(Err(e)) => {
            tracing::error!(error = %e, "invalid --workspace-key");
            std::process::exit(1);
        }
        None => None,
    };

    let local_peer_id = PeerId::random();
    tracing::info!(%local_peer_id, %workspace_id, relay_url = %config.relay_url, "starting meshd");

    let direct_bind_addr: SocketAddr = config.direct_bind_addr.parse().unwrap_or_else(|e| {
        tracing::error!(error = %e, addr = %config.direct_bind_addr, "invalid direct-transport bind address");
        std::process::exit(1);
    });
    let dht_sidecar_addr: SocketAddr = config.dht_sidecar_addr.parse().unwrap_or_else(|e| {
        tracing::error!(error = %e, addr = %config.dht_sidecar_addr, "invalid DHT sidecar address");
        std::process::exit(1);
    });

    let (manager, mut events) = PeerManager::new(
        local_peer_id,
        format!("meshd-{local_peer_id}"),
        String::new(),
        config.relay_url.clone(),
        direct_bind_addr,
        dht_sidecar_addr,
        config.local_listen_port,
        config.max_connections,
    );

    if let Err(e) = manager.join_workspace(&workspace_id).await {
        tracing::error!(error = %e, "failed to join workspace");
        std::process::exit(1);
    }

    tracing::info!("joined workspace, entering event loop (ctrl-c to stop)");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::warn!("event channel closed, shutting down");
                    break;
                };
                handle_event(event, workspace_key.as_ref());
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, leaving workspace");
                break;
            }
        }
    }

    manager.leave_workspace().await;
}

fn handle_event(event: MeshEvent, workspace_key: Option<&WorkspaceKey>) {
    match event {
        MeshEvent::PeerJoined { peer } => {
            tracing::info!(peer = %peer.peer_id, display_name = %peer.display_name, "peer joined");
        }
        MeshEvent::PeerLeft { peer } => {
            tracing::info!(%peer, "peer left");
        }
        MeshEvent::Sync { doc_id, data, origin } => {
            let decrypted = workspace_key.and_then(|key| decrypt_update(&data, key).ok());
            match decrypted {
                Some(plaintext) => {
                    tracing::info!(%doc_id, %origin, bytes = plaintext.len(), "document update decrypted");
                }
                None => {
                    tracing::info!(%doc_id, %origin, bytes = data.len(), "document update received (undecrypted)");
                }
            }
        }
        MeshEvent::Awareness { doc_id, states } => {
            tracing::debug!(%doc_id, peers = states.len(), "awareness update");
        }
    }
}

fn init_tracing(log_level: &str, log_file: Option<&std::path::Path>) {
    let filter = tracing_subscriber::EnvFilter::new(log_level);
    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().map_or_else(|| "meshd.log".into(), std::ffi::OsStr::to_os_string);
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // Leaked intentionally: the guard must outlive `main`, and
            // `meshd` runs for the lifetime of the process.
            std::mem::forget(guard);
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
