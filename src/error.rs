//! Error kinds for the relay and client protocol engine.
//!
//! Each variant here maps to one row of the error-handling table in the
//! protocol design: `ConfigError` is fatal at startup, the rest are
//! handled at the point they occur (drop a frame, close a connection,
//! mark a peer disconnected) and never silently swallowed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for environment variable {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA-OAEP decryption failed")]
    OaepDecrypt,
    #[error("RSA-OAEP encryption failed")]
    OaepEncrypt,
    #[error("RSA-PSS signature verification failed")]
    PssVerify,
    #[error("RSA-PSS signing failed")]
    PssSign,
    #[error("AES-GCM authentication tag mismatch")]
    GcmTag,
    #[error("malformed PEM key material: {0}")]
    MalformedPem(String),
    #[error("malformed base64 field: {0}")]
    MalformedBase64(#[from] base64::DecodeError),
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signature verification failed")]
    SignatureMismatch,
    #[error("counter {got} is not greater than last accepted counter {last_seen}")]
    CounterNotIncreasing { got: u64, last_seen: u64 },
    #[error("unknown inner payload type: {0}")]
    UnknownType(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {0} failed handshake signature verification")]
    HandshakeSignature(String),
    #[error("peer {0} is not registered in the neighbourhood")]
    UnknownPeer(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("recipient {0} is not in the cached directory")]
    UnknownRecipient(String),
    #[error("not connected to home server")]
    NotConnected,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload exceeds maximum size of {max} bytes")]
    TooLarge { max: usize },
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
