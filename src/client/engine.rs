//! Client protocol engine (C6): register with the home server, keep
//! the client directory fresh, and encrypt/sign outbound chat while
//! verifying/decrypting inbound chat.
//!
//! State machine: `Idle → Connecting → Hello-Sent → Ready → Closed`.
//! `connect` drives the first three transitions in one call (dialing,
//! sending `hello`, and returning once the reader/writer tasks are
//! running counts as `Ready` — there's no explicit ack from the
//! server); `Closed` is whatever the caller does when `connect`'s
//! background tasks end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use rsa::RsaPublicKey;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::client::directory::{self, Directory};
use crate::client::store::MessageStore;
use crate::config::ClientConfig;
use crate::crypto::{self, Fingerprint, KeyPair};
use crate::envelope::{self, DirectoryFrame, Frame, Payload};
use crate::error::ClientError;

const OUTBOUND_QUEUE_DEPTH: usize = 64;

pub struct ClientEngine {
    pub config: ClientConfig,
    pub keys: Arc<KeyPair>,
    pub own_fingerprint: Fingerprint,
    counter: AtomicU64,
    outbound: mpsc::Sender<WsMessage>,
    directory: RwLock<Directory>,
    store: Arc<MessageStore>,
}

impl ClientEngine {
    /// Dial the home server, send `hello` as counter 1, and spawn the
    /// reader/writer tasks that run for the engine's lifetime.
    pub async fn connect(
        config: ClientConfig,
        keys: Arc<KeyPair>,
        store: Arc<MessageStore>,
    ) -> Result<Arc<Self>, ClientError> {
        let own_fingerprint = keys.fingerprint()?;
        let url = format!("ws://{}:{}", config.server_address, config.server_port);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ClientError::Envelope(envelope_transport_error(e)))?;
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE_DEPTH);

        let engine = Arc::new(Self {
            config,
            keys,
            own_fingerprint,
            counter: AtomicU64::new(0),
            outbound: tx,
            directory: RwLock::new(Directory::new()),
            store,
        });

        let hello_text = envelope::build_envelope(
            &Payload::Hello { public_key: engine.keys.public_pem()? },
            engine.next_counter(),
            &engine.keys.private,
        )?;
        engine
            .outbound
            .send(WsMessage::Text(hello_text))
            .await
            .map_err(|_| ClientError::NotConnected)?;

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_engine = engine.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                reader_engine.handle_inbound(&text).await;
            }
            info!("home server connection closed");
        });

        Ok(engine)
    }

    fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn known_fingerprints(&self) -> Vec<Fingerprint> {
        self.directory.read().await.fingerprints()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Send a close frame down the outbound channel so the writer task
    /// forwards it to the home server before the process exits.
    pub async fn shutdown(&self) {
        let _ = self.outbound.send(WsMessage::Close(None)).await;
    }

    pub async fn request_client_list(&self) -> Result<(), ClientError> {
        let text = envelope::build_envelope(&Payload::ClientListRequest, self.next_counter(), &self.keys.private)?;
        self.outbound.send(WsMessage::Text(text)).await.map_err(|_| ClientError::NotConnected)
    }

    /// Send a private chat to a set of recipients, per §4.6: group by
    /// home server, wrap a fresh AES key per recipient, GCM-encrypt the
    /// inner `{participants, message}` JSON once.
    pub async fn send_chat(&self, recipients: &[Fingerprint], message: &str) -> Result<(), ClientError> {
        let directory = self.directory.read().await;
        let (destination_servers, symm_key_order) = directory::group_recipients_by_server(&directory, recipients)?;

        let (key, iv) = crypto::generate_aes_key_and_iv();
        let symm_keys = symm_key_order
            .iter()
            .map(|fp| {
                let entry = directory.get(fp).expect("fingerprint came from this same directory");
                crypto::oaep_encrypt(&entry.public_key, &key).map(|ct| crypto::b64_encode(&ct))
            })
            .collect::<Result<Vec<_>, _>>()?;
        drop(directory);

        let mut participants = vec![self.own_fingerprint.clone()];
        participants.extend(recipients.iter().cloned());
        let inner = serde_json::json!({ "participants": participants, "message": message });
        let plaintext = serde_json::to_vec(&inner).map_err(crate::error::EnvelopeError::InvalidJson)?;
        let ciphertext = crypto::aes_gcm_encrypt(&key, &iv, &plaintext)?;

        let payload = Payload::Chat {
            destination_servers,
            iv: crypto::b64_encode(&iv),
            symm_keys,
            chat: crypto::b64_encode(&ciphertext),
        };
        let text = envelope::build_envelope(&payload, self.next_counter(), &self.keys.private)?;
        self.outbound.send(WsMessage::Text(text)).await.map_err(|_| ClientError::NotConnected)
    }

    pub async fn send_public_chat(&self, message: &str) -> Result<(), ClientError> {
        let payload = Payload::PublicChat {
            message: message.to_string(),
            sender_fingerprint: self.own_fingerprint.clone(),
        };
        let text = envelope::build_envelope(&payload, self.next_counter(), &self.keys.private)?;
        self.outbound.send(WsMessage::Text(text)).await.map_err(|_| ClientError::NotConnected)
    }

    async fn handle_inbound(&self, text: &str) {
        let frame = match envelope::parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed frame from home server");
                return;
            }
        };

        match frame {
            Frame::Directory(DirectoryFrame::ClientList { servers }) => {
                self.directory.write().await.replace_from_client_list(&servers);
                debug!(count = servers.len(), "refreshed client directory");
            }
            Frame::Directory(DirectoryFrame::ClientUpdate { .. }) => {
                debug!("ignoring client_update addressed to a client");
            }
            Frame::Signed(raw) => self.handle_signed_inbound(&raw).await,
        }
    }

    async fn handle_signed_inbound(&self, raw: &envelope::RawEnvelope<'_>) {
        // Peek the inner type without verifying yet — chat needs to be
        // decrypted first to learn the sender's fingerprint (see
        // `receive_chat`); only then is there a key to verify against.
        let declared: Payload = match serde_json::from_str(raw.raw_data) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed signed frame from home server");
                return;
            }
        };

        match declared {
            Payload::Chat { symm_keys, iv, chat, .. } => {
                self.receive_chat(raw, &symm_keys, &iv, &chat).await;
            }
            Payload::PublicChat { message, sender_fingerprint } => {
                self.receive_public_chat(raw, &sender_fingerprint, &message).await;
            }
            other => {
                debug!(inner_type = other.type_name(), "unexpected inner type from home server, dropping");
            }
        }
    }

    async fn receive_chat(
        &self,
        raw: &envelope::RawEnvelope<'_>,
        symm_keys: &[String],
        iv: &str,
        chat: &str,
    ) {
        let Some(key) = self.try_unwrap_symm_key(symm_keys) else {
            // Not a recipient of this message; nothing to do.
            return;
        };

        let iv_bytes = match crypto::b64_decode(iv).and_then(|v| v.try_into().map_err(|_| crate::error::CryptoError::MalformedPem("iv length".into()))) {
            Ok(iv) => iv,
            Err(e) => {
                warn!(error = %e, "malformed chat iv");
                return;
            }
        };
        let ciphertext = match crypto::b64_decode(chat) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "malformed chat ciphertext");
                return;
            }
        };
        let plaintext = match crypto::aes_gcm_decrypt(&key, &iv_bytes, &ciphertext) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "chat ciphertext failed authentication, dropping");
                return;
            }
        };

        #[derive(serde::Deserialize)]
        struct Inner {
            participants: Vec<String>,
            message: String,
        }
        let inner: Inner = match serde_json::from_slice(&plaintext) {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "malformed chat plaintext");
                return;
            }
        };

        if !inner.participants.iter().any(|p| p == &self.own_fingerprint) {
            warn!("decrypted chat does not list us as a participant, dropping");
            return;
        }
        let Some(sender_fp) = inner.participants.first() else {
            warn!("chat has no participants, dropping");
            return;
        };

        if !self.verify_against_directory(raw, sender_fp).await {
            return;
        }

        self.store.append(sender_fp.clone(), inner.message).await;
    }

    async fn receive_public_chat(&self, raw: &envelope::RawEnvelope<'_>, sender_fp: &str, message: &str) {
        if !self.verify_against_directory(raw, sender_fp).await {
            return;
        }
        self.store.append(sender_fp.to_string(), message.to_string()).await;
    }

    /// §4.6: verify against the sender's key from the cached directory;
    /// if unknown, request a fresh `client_list` and retry once before
    /// giving up on this frame.
    async fn verify_against_directory(&self, raw: &envelope::RawEnvelope<'_>, sender_fp: &str) -> bool {
        if let Some(key) = self.directory_key(sender_fp).await {
            return self.check_signature(raw, &key);
        }

        if self.request_client_list().await.is_err() {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        match self.directory_key(sender_fp).await {
            Some(key) => self.check_signature(raw, &key),
            None => {
                warn!(%sender_fp, "sender unknown even after directory refresh, dropping");
                false
            }
        }
    }

    async fn directory_key(&self, fingerprint: &str) -> Option<RsaPublicKey> {
        self.directory.read().await.get(fingerprint).map(|e| e.public_key.clone())
    }

    fn check_signature(&self, raw: &envelope::RawEnvelope<'_>, key: &RsaPublicKey) -> bool {
        match envelope::verify_signature_only(raw, key) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "envelope signature failed verification, dropping");
                false
            }
        }
    }

    fn try_unwrap_symm_key(&self, symm_keys: &[String]) -> Option<[u8; crypto::AES_KEY_LEN]> {
        for slot in symm_keys {
            let Ok(wrapped) = crypto::b64_decode(slot) else { continue };
            let Ok(unwrapped) = crypto::oaep_decrypt(&self.keys.private, &wrapped) else { continue };
            if let Ok(key) = unwrapped.try_into() {
                return Some(key);
            }
        }
        None
    }
}

fn envelope_transport_error(e: tokio_tungstenite::tungstenite::Error) -> crate::error::EnvelopeError {
    crate::error::EnvelopeError::UnknownType(format!("transport error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_unwrap_symm_key_finds_matching_slot() {
        let keys = Arc::new(KeyPair::generate().unwrap());
        let (aes_key, _iv) = crypto::generate_aes_key_and_iv();
        let wrapped = crypto::oaep_encrypt(&keys.public, &aes_key).unwrap();

        let engine = ClientEngine {
            config: test_config(),
            keys: keys.clone(),
            own_fingerprint: keys.fingerprint().unwrap(),
            counter: AtomicU64::new(0),
            outbound: mpsc::channel(1).0,
            directory: RwLock::new(Directory::new()),
            store: Arc::new(test_store().await),
        };

        let slots = vec!["garbage".to_string(), crypto::b64_encode(&wrapped)];
        let found = engine.try_unwrap_symm_key(&slots).unwrap();
        assert_eq!(found, aes_key);
    }

    fn test_config() -> ClientConfig {
        ClientConfig {
            server_address: "127.0.0.1".parse().unwrap(),
            server_port: 9000,
            http_port: 9100,
            home_http_port: 9100,
            client_name: "test".to_string(),
            message_expiry_time: -1,
            key_dir: std::env::temp_dir(),
        }
    }

    async fn test_store() -> MessageStore {
        let dir = std::env::temp_dir().join(format!("neighbourhood-engine-test-{:x}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        MessageStore::open(dir.join("messages.jsonl")).await.unwrap()
    }
}
