//! Client binary: loads or generates this client's identity, opens its
//! local message store, connects to its home server, and serves the
//! local HTTP facade a frontend drives.

use std::sync::Arc;

use neighbourhood::client::{ClientEngine, MessageStore};
use neighbourhood::config::ClientConfig;
use neighbourhood::crypto::KeyPair;
use neighbourhood::http_facade::{self, Facade};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ClientConfig::from_env().unwrap_or_else(|e| {
        eprintln!("configuration error: {e}");
        std::process::exit(1);
    });

    let private_path = config.key_dir.join("private_key.pem");
    let public_path = config.key_dir.join("public_key.pem");
    let keys = Arc::new(KeyPair::load_or_generate(&private_path, &public_path).unwrap_or_else(|e| {
        eprintln!("failed to load or generate key material: {e}");
        std::process::exit(1);
    }));
    let own_fingerprint = keys.fingerprint().unwrap_or_else(|e| {
        eprintln!("failed to fingerprint own key: {e}");
        std::process::exit(1);
    });
    tracing::info!(fingerprint = %own_fingerprint, client_name = %config.client_name, "client identity loaded");

    let store_path = config.key_dir.join("messages.jsonl");
    let store = Arc::new(MessageStore::open(&store_path).await.unwrap_or_else(|e| {
        eprintln!("failed to open message store at {}: {e}", store_path.display());
        std::process::exit(1);
    }));

    let http_port = config.http_port;
    let engine = ClientEngine::connect(config, keys, store).await.unwrap_or_else(|e| {
        eprintln!("failed to connect to home server: {e}");
        std::process::exit(1);
    });

    let facade = Arc::new(Facade { engine });
    // The facade is a local API for whatever chat frontend runs
    // alongside this process, not a server other nodes dial into, so
    // it only ever binds loopback.
    let http_listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, http_port)).await?;
    tracing::info!(%http_port, "local HTTP facade listening");

    tokio::select! {
        result = axum::serve(http_listener, http_facade::router(facade.clone())) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "local HTTP facade exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    facade.engine.shutdown().await;
    Ok(())
}
