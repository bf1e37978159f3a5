//! Handling for a peer-to-peer link, in both directions: the outbound
//! side dialed by this server's neighbourhood reconnect loop, and the
//! inbound side accepted on the peer listener. Once a link reaches
//! `Connected` both sides run the same read loop and are registered
//! in [`RelayState::peers`] under the neighbour's configured address,
//! so routing code doesn't need to know which side dialed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::envelope::{self, DirectoryFrame, Frame, Payload};
use crate::neighbourhood::{Neighbourhood, PeerState};
use crate::server::state::{PeerHandle, RelayState, OUTBOUND_QUEUE_DEPTH};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial a neighbour, send our signed `server_hello`, and run the link
/// until it drops. Invoked repeatedly by
/// [`crate::neighbourhood::run_reconnect_loop`] — this function
/// returning just means "try again after the fixed interval".
pub async fn connect_to_neighbour(state: Arc<RelayState>, address: String) {
    let url = format!("ws://{address}");
    let (ws, _) = match tokio_tungstenite::connect_async(&url).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(%address, error = %e, "failed to dial neighbour");
            return;
        }
    };

    state.neighbourhood.set_state(&address, PeerState::Handshaking).await;

    let hello = match build_server_hello(&state) {
        Ok(hello) => hello,
        Err(e) => {
            warn!(error = %e, "failed to build server_hello");
            return;
        }
    };

    let (mut sink, stream) = ws.split();
    if sink.send(WsMessage::Text(hello)).await.is_err() {
        return;
    }

    run_peer_link(state, address, sink, stream).await;
}

/// Accept an inbound peer connection: wait for the dialer's signed
/// `server_hello`, match its self-reported address against a
/// configured neighbour, and verify against that neighbour's
/// registered public key.
pub async fn handle_peer_connection(state: Arc<RelayState>, stream: TcpStream) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "peer websocket handshake failed");
            return;
        }
    };
    let (sink, mut stream) = ws.split();

    let first_text = match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => text,
        _ => {
            debug!("peer did not send a valid server_hello within the handshake window");
            return;
        }
    };

    let address = match verify_server_hello(&state.neighbourhood, &first_text).await {
        Ok(address) => address,
        Err(e) => {
            warn!(error = %e, "inbound server_hello rejected");
            return;
        }
    };

    state.neighbourhood.set_state(&address, PeerState::Handshaking).await;
    run_peer_link(state, address, sink, stream).await;
}

/// Shared tail of the inbound and outbound handshake paths: register
/// the link, run the read loop, and clean up on disconnect. Generic
/// over the sink/stream halves because `accept_async` and
/// `connect_async` wrap different underlying stream types.
async fn run_peer_link<S, R>(state: Arc<RelayState>, address: String, mut sink: S, mut stream: R)
where
    S: futures_util::Sink<WsMessage> + Unpin + Send + 'static,
    R: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE_DEPTH);
    state.peers.write().await.insert(
        address.clone(),
        PeerHandle {
            sender: tx,
            last_seen_counter: 0,
            remote_clients: Vec::new(),
        },
    );
    state.neighbourhood.set_state(&address, PeerState::Connected).await;
    info!(%address, "peer link connected");

    if let Ok(request) = build_client_update_request(&state) {
        let _ = state.peers.read().await.get(&address).map(|h| h.sender.try_send(WsMessage::Text(request)));
    }

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        if !handle_peer_frame(&state, &address, &text).await {
            break;
        }
    }

    writer.abort();
    state.peers.write().await.remove(&address);
    state.neighbourhood.set_state(&address, PeerState::Disconnected).await;
    info!(%address, "peer link disconnected");
}

async fn handle_peer_frame(state: &Arc<RelayState>, address: &str, text: &str) -> bool {
    let frame = match envelope::parse_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%address, error = %e, "malformed frame from peer");
            return true;
        }
    };

    match frame {
        Frame::Directory(DirectoryFrame::ClientUpdate { clients }) => {
            let valid_pems = clients
                .into_iter()
                .filter(|pem| crate::crypto::fingerprint_of_pem_checked(pem).is_some())
                .collect();
            if let Some(handle) = state.peers.write().await.get_mut(address) {
                handle.remote_clients = valid_pems;
            }
            true
        }
        Frame::Directory(_) => {
            warn!(%address, "unexpected directory frame from peer, dropping");
            true
        }
        Frame::Signed(raw) => {
            let public_key = match state.neighbourhood.public_key_of(address).await {
                Some(key) => key,
                None => {
                    warn!(%address, "no registered key for peer, dropping frame");
                    return true;
                }
            };
            let last_seen = state.neighbourhood.last_seen_counter(address).await;
            let payload = match envelope::verify_envelope(&raw, &public_key, last_seen) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(%address, error = %e, "peer envelope rejected, disconnecting");
                    return false;
                }
            };
            state.neighbourhood.record_counter(address, raw.counter).await;
            if let Some(handle) = state.peers.write().await.get_mut(address) {
                handle.last_seen_counter = raw.counter;
            }
            dispatch_peer_payload(state, address, payload, text).await;
            true
        }
    }
}

async fn dispatch_peer_payload(state: &Arc<RelayState>, address: &str, payload: Payload, text: &str) {
    match payload {
        Payload::ClientUpdateRequest => {
            let clients = state.local_client_pems().await;
            let frame = serde_json::to_string(&DirectoryFrame::ClientUpdate { clients })
                .expect("DirectoryFrame serializes infallibly");
            let _ = state.send_to_peer(address, &frame).await;
        }
        Payload::Chat { .. } => {
            state.broadcast_to_local_clients(text, None).await;
        }
        Payload::PublicChat { .. } => {
            state.broadcast_to_local_clients(text, None).await;
        }
        other => {
            debug!(%address, inner_type = other.type_name(), "unhandled inner type from peer, ignoring");
        }
    }
}

fn build_server_hello(state: &RelayState) -> Result<String, crate::error::EnvelopeError> {
    let counter = state.next_counter();
    let payload = Payload::ServerHello {
        address: state.config.external_address.clone(),
    };
    envelope::build_envelope(&payload, counter, &state.keys.private)
}

fn build_client_update_request(state: &RelayState) -> Result<String, crate::error::EnvelopeError> {
    let counter = state.next_counter();
    envelope::build_envelope(&Payload::ClientUpdateRequest, counter, &state.keys.private)
}

async fn verify_server_hello(neighbourhood: &Arc<Neighbourhood>, text: &str) -> Result<String, crate::error::PeerError> {
    let frame = envelope::parse_frame(text).map_err(|_| crate::error::PeerError::HandshakeSignature("unparseable frame".to_string()))?;
    let Frame::Signed(raw) = frame else {
        return Err(crate::error::PeerError::HandshakeSignature("expected signed_data".to_string()));
    };

    let declared: Payload = serde_json::from_str(raw.raw_data)
        .map_err(|_| crate::error::PeerError::HandshakeSignature("malformed server_hello".to_string()))?;
    let Payload::ServerHello { address } = declared else {
        return Err(crate::error::PeerError::HandshakeSignature("expected server_hello".to_string()));
    };

    let public_key = neighbourhood
        .public_key_of(&address)
        .await
        .ok_or_else(|| crate::error::PeerError::UnknownPeer(address.clone()))?;

    envelope::verify_envelope(&raw, &public_key, 0)
        .map_err(|_| crate::error::PeerError::HandshakeSignature(address.clone()))?;

    Ok(address)
}
