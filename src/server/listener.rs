//! The two WebSocket accept loops: one for clients, one for peers.
//! Each accepted socket is handed off to its own task immediately so a
//! slow handshake on one connection never blocks new accepts.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::server::client_conn::handle_client_connection;
use crate::server::peer_conn::handle_peer_connection;
use crate::server::state::RelayState;

pub async fn run_client_listener(state: Arc<RelayState>) -> std::io::Result<()> {
    let addr = (state.config.bind_address, state.config.client_ws_port);
    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "client listener bound");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "client listener accept failed");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            info!(%peer_addr, "client connection accepted");
            handle_client_connection(state, stream).await;
        });
    }
}

pub async fn run_peer_listener(state: Arc<RelayState>) -> std::io::Result<()> {
    let addr = (state.config.bind_address, state.config.server_ws_port);
    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "peer listener bound");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "peer listener accept failed");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            info!(%peer_addr, "peer connection accepted");
            handle_peer_connection(state, stream).await;
        });
    }
}
