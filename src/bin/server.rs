//! Relay server binary: loads or generates this node's identity, loads
//! whatever neighbour keys have already been dropped into the
//! neighbours directory, then runs the two WebSocket accept loops, one
//! reconnect task per configured neighbour, and the HTTP file store,
//! all sharing one `Arc<RelayState>`.

use std::sync::Arc;

use neighbourhood::config::ServerConfig;
use neighbourhood::crypto::{self, KeyPair};
use neighbourhood::file_store::{self, FileStore};
use neighbourhood::neighbourhood::{neighbour_key_filename, run_reconnect_loop, Neighbourhood};
use neighbourhood::server::{connect_to_neighbour, run_client_listener, run_peer_listener, RelayState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("configuration error: {e}");
        std::process::exit(1);
    });
    let config = Arc::new(config);

    let private_path = config.key_dir.join("server_private_key.pem");
    let public_path = config.key_dir.join("server_public_key.pem");
    let keys = Arc::new(KeyPair::load_or_generate(&private_path, &public_path).unwrap_or_else(|e| {
        eprintln!("failed to load or generate key material: {e}");
        std::process::exit(1);
    }));
    let own_fingerprint = keys.fingerprint().unwrap_or_else(|e| {
        eprintln!("failed to fingerprint own key: {e}");
        std::process::exit(1);
    });
    tracing::info!(fingerprint = %own_fingerprint, external_address = %config.external_address, "node identity loaded");

    let neighbours_dir = config.key_dir.join("neighbours");
    let neighbourhood = Neighbourhood::new(&config.neighbour_addresses);
    load_neighbour_keys(&neighbourhood, &neighbours_dir, &config.neighbour_addresses).await;

    let state = RelayState::new(config.clone(), keys.clone(), neighbourhood.clone()).unwrap_or_else(|e| {
        eprintln!("failed to initialize relay state: {e}");
        std::process::exit(1);
    });

    let file_store_state = Arc::new(FileStore {
        files_dir: config.file_store_dir.clone(),
        neighbours_dir: neighbours_dir.clone(),
        keys: keys.clone(),
        external_address: config.external_address.clone(),
        http_port: config.http_port,
    });

    for address in config.neighbour_addresses.clone() {
        let neighbourhood = neighbourhood.clone();
        let state = state.clone();
        let neighbours_dir = neighbours_dir.clone();
        tokio::spawn(async move {
            run_reconnect_loop(neighbourhood, neighbours_dir, address, move |_registry, addr| {
                let state = state.clone();
                async move { connect_to_neighbour(state, addr).await }
            })
            .await;
        });
    }

    let http_listener = tokio::net::TcpListener::bind((config.bind_address, config.http_port)).await?;
    let http_server = axum::serve(http_listener, file_store::router(file_store_state));

    tokio::select! {
        result = run_client_listener(state.clone()) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "client listener exited");
            }
        }
        result = run_peer_listener(state.clone()) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "peer listener exited");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "http file store exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    state.shutdown().await;
    Ok(())
}

/// Load whatever neighbour public keys already sit in the neighbours
/// directory. A missing file for a configured address just leaves that
/// neighbour's registry entry keyless — its inbound `server_hello` and
/// our own outbound dial will both fail signature checks until an
/// operator drops the right PEM in (trust is admitted out of band, see
/// the protocol's non-goals on neighbourhood admission).
async fn load_neighbour_keys(neighbourhood: &Arc<Neighbourhood>, neighbours_dir: &std::path::Path, addresses: &[String]) {
    for address in addresses {
        let path = neighbours_dir.join(neighbour_key_filename(address));
        let Ok(pem) = tokio::fs::read_to_string(&path).await else {
            tracing::debug!(%address, path = %path.display(), "no persisted key for neighbour yet");
            continue;
        };
        match crypto::public_key_from_pem(&pem) {
            Ok(public_key) => {
                let fingerprint = crypto::fingerprint_of_pem(&pem);
                neighbourhood.set_identity(address, public_key, fingerprint).await;
                tracing::info!(%address, "loaded persisted neighbour key");
            }
            Err(e) => {
                tracing::warn!(%address, error = %e, "malformed persisted neighbour key, ignoring");
            }
        }
    }
}
