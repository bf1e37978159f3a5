//! Neighbourhood registry: the set of peer servers this relay dials out
//! to, and the state machine tracking each connection's lifecycle.
//!
//! Unlike the general-purpose peer manager this crate's connection
//! tracking is modelled after, reconnects here are NOT exponential
//! backoff. The protocol fixes a flat two-second retry with no give-up
//! — a relay that can't reach a neighbour keeps trying at the same
//! cadence forever, since neighbourhoods are small, operator-configured
//! sets rather than a churny gossiped peer pool.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rsa::RsaPublicKey;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::crypto::Fingerprint;

pub const RECONNECT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

/// One neighbour server: its address, its last-known public key (if
/// any neighbour file has been persisted for it yet), and the counter
/// discipline state for frames it sends us.
#[derive(Debug, Clone)]
pub struct Neighbour {
    pub address: String,
    pub state: PeerState,
    pub public_key: Option<RsaPublicKey>,
    pub fingerprint: Option<Fingerprint>,
    pub last_seen_counter: u64,
}

impl Neighbour {
    fn new(address: String) -> Self {
        Self {
            address,
            state: PeerState::Disconnected,
            public_key: None,
            fingerprint: None,
            last_seen_counter: 0,
        }
    }
}

/// Registry of configured neighbours, addressed by `host:port`. Shared
/// behind an `Arc` between the reconnect-loop task (one per neighbour)
/// and the peer-listener's inbound handshake handling — both sides can
/// observe and update the same connection's state.
pub struct Neighbourhood {
    neighbours: RwLock<HashMap<String, Neighbour>>,
}

impl Neighbourhood {
    pub fn new(addresses: &[String]) -> Arc<Self> {
        let neighbours = addresses
            .iter()
            .cloned()
            .map(|addr| (addr.clone(), Neighbour::new(addr)))
            .collect();
        Arc::new(Self {
            neighbours: RwLock::new(neighbours),
        })
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.neighbours.read().await.keys().cloned().collect()
    }

    pub async fn state_of(&self, address: &str) -> Option<PeerState> {
        self.neighbours.read().await.get(address).map(|n| n.state)
    }

    pub async fn set_state(&self, address: &str, state: PeerState) {
        let mut neighbours = self.neighbours.write().await;
        if let Some(neighbour) = neighbours.get_mut(address) {
            if neighbour.state != state {
                debug!(%address, ?state, "neighbour state transition");
            }
            neighbour.state = state;
        }
    }

    pub async fn set_identity(&self, address: &str, public_key: RsaPublicKey, fingerprint: Fingerprint) {
        let mut neighbours = self.neighbours.write().await;
        if let Some(neighbour) = neighbours.get_mut(address) {
            neighbour.public_key = Some(public_key);
            neighbour.fingerprint = Some(fingerprint);
        }
    }

    pub async fn fingerprint_of(&self, address: &str) -> Option<Fingerprint> {
        self.neighbours.read().await.get(address)?.fingerprint.clone()
    }

    pub async fn public_key_of(&self, address: &str) -> Option<RsaPublicKey> {
        self.neighbours.read().await.get(address)?.public_key.clone()
    }

    pub async fn last_seen_counter(&self, address: &str) -> u64 {
        self.neighbours
            .read()
            .await
            .get(address)
            .map(|n| n.last_seen_counter)
            .unwrap_or(0)
    }

    pub async fn record_counter(&self, address: &str, counter: u64) {
        let mut neighbours = self.neighbours.write().await;
        if let Some(neighbour) = neighbours.get_mut(address) {
            neighbour.last_seen_counter = counter;
        }
    }

    pub async fn connected_addresses(&self) -> Vec<String> {
        self.neighbours
            .read()
            .await
            .iter()
            .filter(|(_, n)| n.state == PeerState::Connected)
            .map(|(addr, _)| addr.clone())
            .collect()
    }
}

/// The name a persisted neighbour public key is written under, derived
/// from the neighbour's `host:port` address.
pub fn neighbour_key_filename(address: &str) -> String {
    let sanitized = address.replace([':', '.'], "_");
    format!("{sanitized}_public_key.pem")
}

/// Re-read a neighbour's persisted public key from disk and register it
/// if present. Called at the top of every reconnect attempt rather than
/// only once at startup, so a neighbour configured before its key has
/// been uploaded (via `/upload_key`) becomes dialable as soon as an
/// operator drops the PEM in, without a process restart.
pub async fn reload_neighbour_key(registry: &Arc<Neighbourhood>, neighbours_dir: &Path, address: &str) {
    let path = neighbours_dir.join(neighbour_key_filename(address));
    let Ok(pem) = tokio::fs::read_to_string(&path).await else {
        return;
    };
    match crate::crypto::public_key_from_pem(&pem) {
        Ok(public_key) => {
            let fingerprint = crate::crypto::fingerprint_of_pem(&pem);
            registry.set_identity(address, public_key, fingerprint).await;
        }
        Err(e) => {
            debug!(%address, error = %e, "malformed persisted neighbour key, ignoring");
        }
    }
}

/// Drive the fixed-interval reconnect loop for one neighbour. `connect`
/// performs the actual dial-and-handshake and resolves once the
/// connection has dropped (or failed to establish); this loop just
/// re-invokes it every `RECONNECT_INTERVAL` for as long as the process
/// runs, logging each failure without ever giving up.
/// Consecutive failed dial attempts after which a warning is logged.
/// Retries continue at the same interval regardless — there is no
/// permanent give-up for a configured neighbour.
const FAILURE_LOG_THRESHOLD: u32 = 5;

pub async fn run_reconnect_loop<F, Fut>(registry: Arc<Neighbourhood>, neighbours_dir: std::path::PathBuf, address: String, mut connect: F)
where
    F: FnMut(Arc<Neighbourhood>, String) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut consecutive_failures = 0u32;
    loop {
        reload_neighbour_key(&registry, &neighbours_dir, &address).await;
        registry.set_state(&address, PeerState::Connecting).await;
        connect(registry.clone(), address.clone()).await;

        let reached_connected = registry.state_of(&address).await == Some(PeerState::Connected);
        registry.set_state(&address, PeerState::Disconnected).await;

        if reached_connected {
            consecutive_failures = 0;
        } else {
            consecutive_failures += 1;
            if consecutive_failures >= FAILURE_LOG_THRESHOLD {
                tracing::warn!(%address, consecutive_failures, "neighbour has failed repeatedly, still retrying");
            }
        }

        info!(%address, interval_secs = RECONNECT_INTERVAL.as_secs(), "neighbour disconnected, retrying");
        tokio::time::sleep(RECONNECT_INTERVAL).await;
    }
}
