//! Handling for one accepted client WebSocket connection: registration
//! via `hello`, then the per-frame counter/signature check and the
//! routing rules for `chat`, `public_chat`, and `client_list_request`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::crypto;
use crate::envelope::{self, DirectoryFrame, Frame, Payload};
use crate::server::state::{ClientHandle, RelayState, MAX_CONSECUTIVE_FAILURES, OUTBOUND_QUEUE_DEPTH};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn handle_client_connection(state: Arc<RelayState>, stream: TcpStream) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "client websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let first_text = match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => text,
        _ => {
            debug!("client did not send a valid hello within the handshake window");
            return;
        }
    };

    let (fingerprint, public_key, initial_counter) = match register_client(&first_text) {
        Ok(triple) => triple,
        Err(e) => {
            warn!(error = %e, "client hello rejected");
            return;
        }
    };

    {
        let clients = state.clients.read().await;
        if clients.contains_key(&fingerprint) {
            warn!(%fingerprint, "duplicate hello for already-connected client, rejecting");
            return;
        }
    }

    let (tx, mut rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE_DEPTH);
    {
        let mut clients = state.clients.write().await;
        clients.insert(
            fingerprint.clone(),
            ClientHandle {
                public_key: public_key.clone(),
                last_seen_counter: initial_counter,
                sender: tx,
                consecutive_failures: 0,
            },
        );
    }
    info!(%fingerprint, "client registered");
    state.persist_client_key(&fingerprint, &public_key).await;
    announce_client_update(&state).await;

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

        if !handle_client_frame(&state, &fingerprint, &text).await {
            break;
        }
    }

    writer.abort();
    state.clients.write().await.remove(&fingerprint);
    info!(%fingerprint, "client disconnected");
    announce_client_update(&state).await;
}

/// Parse and self-verify a `hello` frame: the declared public key IS
/// the identity, so the signature is checked against the key the
/// frame itself carries. Returns the fingerprint, key, and the
/// counter the hello was sent with (becomes this client's initial
/// `last_seen_counter`).
fn register_client(text: &str) -> Result<(String, rsa::RsaPublicKey, u64), crate::error::EnvelopeError> {
    let frame = envelope::parse_frame(text)?;
    let Frame::Signed(raw) = frame else {
        return Err(crate::error::EnvelopeError::UnknownType("expected signed_data".to_string()));
    };

    let declared: Payload = serde_json::from_str(raw.raw_data)?;
    let Payload::Hello { public_key } = declared else {
        return Err(crate::error::EnvelopeError::MissingField("hello.public_key"));
    };

    let public_key = crypto::public_key_from_pem(&public_key).map_err(crate::error::EnvelopeError::Crypto)?;
    let payload = envelope::verify_envelope(&raw, &public_key, 0)?;
    let fingerprint = crypto::fingerprint_of(&public_key).map_err(crate::error::EnvelopeError::Crypto)?;

    match payload {
        Payload::Hello { .. } => Ok((fingerprint, public_key, raw.counter)),
        _ => Err(crate::error::EnvelopeError::UnknownType("expected hello".to_string())),
    }
}

/// Process one post-registration frame from a client. Returns `false`
/// if the connection should be torn down.
async fn handle_client_frame(state: &Arc<RelayState>, sender_fp: &str, text: &str) -> bool {
    let frame = match envelope::parse_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%sender_fp, error = %e, "malformed frame from client");
            return true;
        }
    };

    let Frame::Signed(raw) = frame else {
        warn!(%sender_fp, "client sent an unsigned directory frame, dropping");
        return true;
    };

    let (public_key, last_seen) = {
        let clients = state.clients.read().await;
        match clients.get(sender_fp) {
            Some(handle) => (handle.public_key.clone(), handle.last_seen_counter),
            None => return false,
        }
    };

    let payload = match envelope::verify_envelope(&raw, &public_key, last_seen) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(%sender_fp, error = %e, "envelope rejected");
            // §4.4 scopes the disconnect threshold to repeated signature
            // failure specifically — a forged or unauthenticated frame —
            // not to `CounterNotIncreasing`, which an ordinarily
            // reordered or duplicated (non-forged) frame can trigger on
            // its own and shouldn't count toward tearing the link down.
            if matches!(e, crate::error::EnvelopeError::SignatureMismatch | crate::error::EnvelopeError::Crypto(_)) {
                let mut clients = state.clients.write().await;
                if let Some(handle) = clients.get_mut(sender_fp) {
                    handle.consecutive_failures += 1;
                    if handle.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        warn!(%sender_fp, "too many consecutive signature failures, disconnecting client");
                        return false;
                    }
                }
            }
            return true;
        }
    };

    {
        let mut clients = state.clients.write().await;
        if let Some(handle) = clients.get_mut(sender_fp) {
            handle.last_seen_counter = raw.counter;
            handle.consecutive_failures = 0;
        }
    }

    match payload {
        Payload::ClientListRequest => {
            let servers = state.build_client_list().await;
            let reply = serde_json::to_string(&DirectoryFrame::ClientList { servers })
                .expect("DirectoryFrame serializes infallibly");
            let clients = state.clients.read().await;
            if let Some(handle) = clients.get(sender_fp) {
                let _ = handle.sender.try_send(WsMessage::Text(reply));
            }
        }
        Payload::Chat { destination_servers, .. } => {
            if state.config.log_messages {
                info!(%sender_fp, ?destination_servers, "routing chat frame");
            }
            route_chat(state, sender_fp, &destination_servers, text).await;
        }
        Payload::PublicChat { ref message, .. } => {
            if state.config.log_messages {
                info!(%sender_fp, %message, "broadcasting public chat frame");
            }
            let fp = sender_fp.to_string();
            state.broadcast_to_local_clients(text, Some(&fp)).await;
            state.broadcast_to_peers(text).await;
        }
        other => {
            warn!(%sender_fp, inner_type = other.type_name(), "unexpected inner type from client, dropping");
        }
    }

    true
}

async fn route_chat(state: &Arc<RelayState>, sender_fp: &str, destination_servers: &[String], text: &str) {
    let local_address = &state.config.external_address;
    let sender_fp = sender_fp.to_string();
    for address in destination_servers {
        if address == local_address {
            state.broadcast_to_local_clients(text, Some(&sender_fp)).await;
        } else if !state.send_to_peer(address, text).await {
            warn!(%address, "chat destined for disconnected or unknown peer, dropped");
        }
    }
}

/// Tell every connected peer that the local client table changed.
/// `client_update` is an unsigned directory frame (see the wire format
/// design note on the neighbourhood directory being a hint, not an
/// authenticated record).
async fn announce_client_update(state: &Arc<RelayState>) {
    let clients = state.local_client_pems().await;
    let frame = serde_json::to_string(&DirectoryFrame::ClientUpdate { clients })
        .expect("DirectoryFrame serializes infallibly");
    state.broadcast_to_peers(&frame).await;
}
