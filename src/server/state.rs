//! Shared relay state: the local client table and peer table, behind
//! one coarse lock each. Hold times are kept short — every lookup
//! copies what it needs (a public key, a sender handle, a counter)
//! and releases the lock before doing any network I/O, matching the
//! concurrency contract that forbids holding a lock across an await
//! on a socket.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rsa::RsaPublicKey;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::warn;

use crate::config::ServerConfig;
use crate::crypto::{Fingerprint, KeyPair};
use crate::neighbourhood::Neighbourhood;

/// Outbound frames are queued per-connection; a slow or wedged peer
/// fills its queue and gets dropped rather than stalling the relay.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Consecutive envelope failures from one client before the
/// connection is torn down outright.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

pub struct ClientHandle {
    pub public_key: RsaPublicKey,
    pub last_seen_counter: u64,
    pub sender: mpsc::Sender<WsMessage>,
    pub consecutive_failures: u32,
}

pub struct PeerHandle {
    pub sender: mpsc::Sender<WsMessage>,
    pub last_seen_counter: u64,
    /// PEM public keys last gossiped to us by this peer via
    /// `client_update` — kept as full keys, not just fingerprints, so
    /// a `client_list_request` reply can hand remote clients' keys to
    /// our own clients the same way it hands out local ones.
    pub remote_clients: Vec<String>,
}

pub struct RelayState {
    pub config: Arc<ServerConfig>,
    pub keys: Arc<KeyPair>,
    pub own_fingerprint: Fingerprint,
    pub own_counter: AtomicU64,
    pub clients: RwLock<HashMap<Fingerprint, ClientHandle>>,
    pub peers: RwLock<HashMap<String, PeerHandle>>,
    pub neighbourhood: Arc<Neighbourhood>,
    /// Where known clients' public keys are persisted, one PEM file per
    /// fingerprint (`<clients_dir>/<fingerprint>.pem`). A client's table
    /// entry is only ever live while connected, but the key itself is
    /// kept on disk once seen, the same way a neighbour's key outlives
    /// any one connection to it.
    pub clients_dir: PathBuf,
}

impl RelayState {
    pub fn new(config: Arc<ServerConfig>, keys: Arc<KeyPair>, neighbourhood: Arc<Neighbourhood>) -> Result<Arc<Self>, crate::error::CryptoError> {
        let own_fingerprint = keys.fingerprint()?;
        let clients_dir = config.key_dir.join("clients");
        Ok(Arc::new(Self {
            config,
            keys,
            own_fingerprint,
            own_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            neighbourhood,
            clients_dir,
        }))
    }

    /// Persist a known client's public key to disk, write-then-rename so
    /// a crash mid-write never leaves a half-written PEM behind.
    pub async fn persist_client_key(&self, fingerprint: &Fingerprint, public_key: &RsaPublicKey) {
        let Ok(pem) = crate::crypto::public_key_to_pem(public_key) else {
            warn!(%fingerprint, "failed to encode client key for persistence");
            return;
        };
        if let Err(e) = tokio::fs::create_dir_all(&self.clients_dir).await {
            warn!(%fingerprint, error = %e, "failed to create clients directory");
            return;
        }
        let tmp_path = self.clients_dir.join(format!(".{fingerprint}.pem.tmp"));
        let final_path = self.clients_dir.join(format!("{fingerprint}.pem"));
        if let Err(e) = tokio::fs::write(&tmp_path, &pem).await {
            warn!(%fingerprint, error = %e, "failed to write client key");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            warn!(%fingerprint, error = %e, "failed to install client key");
        }
    }

    /// Close every connected client and peer link. Sends a WebSocket
    /// close frame down each sender, then drops the table entirely —
    /// dropping the last clone of a connection's `Sender` closes its
    /// channel, which ends that connection's writer task and, with it,
    /// the owned sink/socket. Each connection's own reader task notices
    /// the closed transport on its next poll and exits on its own.
    pub async fn shutdown(&self) {
        let mut clients = self.clients.write().await;
        for (_, handle) in clients.drain() {
            let _ = handle.sender.try_send(WsMessage::Close(None));
        }
        drop(clients);

        let mut peers = self.peers.write().await;
        for (_, handle) in peers.drain() {
            let _ = handle.sender.try_send(WsMessage::Close(None));
        }
    }

    /// Next counter value for an envelope this server signs as itself
    /// (`server_hello`, `client_update_request`). Shared across every
    /// peer link, since a counter is a property of the sender, not of
    /// one connection.
    pub fn next_counter(&self) -> u64 {
        self.own_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn local_client_fingerprints(&self) -> Vec<Fingerprint> {
        self.clients.read().await.keys().cloned().collect()
    }

    pub async fn local_client_pems(&self) -> Vec<String> {
        let clients = self.clients.read().await;
        clients
            .values()
            .filter_map(|c| crate::crypto::public_key_to_pem(&c.public_key).ok())
            .collect()
    }

    /// Send a frame to every locally connected client except `exclude`.
    /// Connections whose outbound queue is full are dropped immediately
    /// rather than allowed to stall the broadcast.
    pub async fn broadcast_to_local_clients(&self, text: &str, exclude: Option<&Fingerprint>) {
        let clients = self.clients.read().await;
        for (fp, handle) in clients.iter() {
            if Some(fp) == exclude {
                continue;
            }
            if handle.sender.try_send(WsMessage::Text(text.to_string())).is_err() {
                warn!(fingerprint = %fp, "client outbound queue full, dropping frame");
            }
        }
    }

    pub async fn send_to_peer(&self, address: &str, text: &str) -> bool {
        let peers = self.peers.read().await;
        match peers.get(address) {
            Some(handle) => handle.sender.try_send(WsMessage::Text(text.to_string())).is_ok(),
            None => false,
        }
    }

    pub async fn broadcast_to_peers(&self, text: &str) {
        let peers = self.peers.read().await;
        for (address, handle) in peers.iter() {
            if handle.sender.try_send(WsMessage::Text(text.to_string())).is_err() {
                warn!(%address, "peer outbound queue full, dropping frame");
            }
        }
    }

    /// Build this server's view of the neighbourhood directory for a
    /// `client_list` reply: the local entry plus one entry per peer
    /// using its last-gossiped client list.
    pub async fn build_client_list(&self) -> Vec<crate::envelope::ServerListing> {
        let mut servers = vec![crate::envelope::ServerListing {
            address: self.config.external_address.clone(),
            server_fingerprint: self.own_fingerprint.clone(),
            clients: self.local_client_pems().await,
        }];

        let peers = self.peers.read().await;
        for address in self.neighbourhood.addresses().await {
            let fingerprint = self.neighbourhood.fingerprint_of(&address).await.unwrap_or_default();
            let clients = peers
                .get(&address)
                .map(|h| h.remote_clients.clone())
                .unwrap_or_default();
            servers.push(crate::envelope::ServerListing {
                address,
                server_fingerprint: fingerprint,
                clients,
            });
        }
        servers
    }
}
