//! Signed envelope: build, parse, and authenticate the `signed_data`
//! wire frame, plus the unsigned directory frames (`client_list`,
//! `client_update`) that ride alongside it.
//!
//! The signature covers `JSON(data) || ascii(counter)` — the exact
//! bytes the sender produced, not a re-serialization of them. Parsing
//! therefore borrows the raw, unparsed text of the `data` field via
//! `serde_json::value::RawValue` and verifies against that slice
//! directly; it is never re-encoded before the signature check. This
//! is the "sign once, carry the bytes through" rule the wire format
//! depends on — a verifier that re-serialized `data` before checking
//! the signature would reject frames from senders whose JSON encoder
//! orders or spaces fields differently.

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::crypto::{self, Fingerprint};
use crate::error::EnvelopeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Hello {
        public_key: String,
    },
    Chat {
        destination_servers: Vec<String>,
        iv: String,
        symm_keys: Vec<String>,
        chat: String,
    },
    PublicChat {
        message: String,
        /// Who broadcast this. `public_chat` carries no ciphertext for a
        /// recipient to decrypt and recover the sender's identity from
        /// (unlike `chat`, where `participants[0]` plays that role), so
        /// the sender names itself directly; a forged value is caught
        /// by the envelope signature, which only verifies under the
        /// fingerprint's own key.
        sender_fingerprint: String,
    },
    ClientUpdateRequest,
    ClientListRequest,
    ServerHello {
        address: String,
    },
}

impl Payload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Hello { .. } => "hello",
            Payload::Chat { .. } => "chat",
            Payload::PublicChat { .. } => "public_chat",
            Payload::ClientUpdateRequest => "client_update_request",
            Payload::ClientListRequest => "client_list_request",
            Payload::ServerHello { .. } => "server_hello",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerListing {
    pub address: String,
    pub server_fingerprint: Fingerprint,
    /// PEM public keys of the clients this server currently claims,
    /// not bare fingerprints — a client engine needs the actual key to
    /// RSA-OAEP-wrap an AES key for a recipient, and a fingerprint alone
    /// can't be inverted back into one. Each entry's fingerprint is
    /// derived locally with `crypto::fingerprint_of_pem`.
    pub clients: Vec<String>,
}

/// Unsigned server-to-server/server-to-client directory frames. See
/// the protocol's design note on the directory being globally unsigned:
/// a malicious peer can lie about who it hosts, but the end-to-end
/// signature on every `chat` prevents impersonation regardless.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectoryFrame {
    ClientList { servers: Vec<ServerListing> },
    ClientUpdate { clients: Vec<String> },
}

/// Minimal peek used to decide which concrete shape to parse a frame as.
#[derive(Deserialize)]
struct TypePeek {
    r#type: String,
}

/// A parsed and (not yet verified) `signed_data` frame. `raw_data`
/// borrows directly from the original frame text — nothing about it
/// has been re-serialized.
pub struct RawEnvelope<'a> {
    pub raw_data: &'a str,
    pub counter: u64,
    pub signature: String,
}

#[derive(Deserialize)]
struct RawEnvelopeFields<'a> {
    #[allow(dead_code)]
    r#type: String,
    #[serde(borrow)]
    data: &'a RawValue,
    counter: u64,
    signature: String,
}

pub enum Frame<'a> {
    Signed(RawEnvelope<'a>),
    Directory(DirectoryFrame),
}

/// Parse the outer shape of an inbound frame without verifying anything.
pub fn parse_frame(text: &str) -> Result<Frame<'_>, EnvelopeError> {
    let peek: TypePeek = serde_json::from_str(text)?;
    match peek.r#type.as_str() {
        "signed_data" => {
            let fields: RawEnvelopeFields = serde_json::from_str(text)?;
            Ok(Frame::Signed(RawEnvelope {
                raw_data: fields.data.get(),
                counter: fields.counter,
                signature: fields.signature,
            }))
        }
        "client_list" | "client_update" => {
            let frame: DirectoryFrame = serde_json::from_str(text)?;
            Ok(Frame::Directory(frame))
        }
        other => Err(EnvelopeError::UnknownType(other.to_string())),
    }
}

/// Verify a parsed envelope's counter and signature against the
/// sender's public key and last-accepted counter. Does not update
/// `last_seen` itself — the caller updates it under the same lock it
/// read it from, so the check-then-update is atomic (see the relay
/// state's counter discipline).
pub fn verify_envelope(
    envelope: &RawEnvelope<'_>,
    sender_public_key: &RsaPublicKey,
    last_seen: u64,
) -> Result<Payload, EnvelopeError> {
    if envelope.counter <= last_seen {
        return Err(EnvelopeError::CounterNotIncreasing {
            got: envelope.counter,
            last_seen,
        });
    }

    let signing_input = signing_input(envelope.raw_data, envelope.counter);
    let signature = crypto::b64_decode(&envelope.signature)?;
    crypto::pss_verify(sender_public_key, &signing_input, &signature)
        .map_err(|_| EnvelopeError::SignatureMismatch)?;

    let payload: Payload = serde_json::from_str(envelope.raw_data)?;
    Ok(payload)
}

/// Verify an envelope's signature only, without a counter check.
///
/// The relay enforces counter strict-monotonicity per sender at the
/// sender's home server (§4.4); a receiving *client* has no equivalent
/// `last_seen` table for every fingerprint it might ever hear from over
/// a `chat`/`public_chat` forward, and the protocol doesn't ask it to
/// keep one — only that the signature verify against the sender's key
/// (§4.6). Used for end-to-end verification of forwarded chat frames.
pub fn verify_signature_only(
    envelope: &RawEnvelope<'_>,
    sender_public_key: &RsaPublicKey,
) -> Result<Payload, EnvelopeError> {
    let signing_input = signing_input(envelope.raw_data, envelope.counter);
    let signature = crypto::b64_decode(&envelope.signature)?;
    crypto::pss_verify(sender_public_key, &signing_input, &signature)
        .map_err(|_| EnvelopeError::SignatureMismatch)?;

    let payload: Payload = serde_json::from_str(envelope.raw_data)?;
    Ok(payload)
}

/// Build a signed `signed_data` frame. The `data` object embedded in
/// the returned text is exactly the bytes that were signed — the
/// string is spliced in directly rather than re-serialized through a
/// wrapping struct.
pub fn build_envelope(
    payload: &Payload,
    counter: u64,
    signing_key: &RsaPrivateKey,
) -> Result<String, EnvelopeError> {
    let data_str = serde_json::to_string(payload)?;
    let signing_input = signing_input(&data_str, counter);
    let signature = crypto::pss_sign(signing_key, &signing_input)?;
    let signature_b64 = crypto::b64_encode(&signature);

    Ok(format!(
        r#"{{"type":"signed_data","data":{},"counter":{},"signature":"{}"}}"#,
        data_str, counter, signature_b64
    ))
}

fn signing_input(data_str: &str, counter: u64) -> Vec<u8> {
    let mut input = Vec::with_capacity(data_str.len() + 20);
    input.extend_from_slice(data_str.as_bytes());
    input.extend_from_slice(counter.to_string().as_bytes());
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn build_then_verify_round_trips() {
        let keys = KeyPair::generate().unwrap();
        let text = build_envelope(&Payload::ClientListRequest, 1, &keys.private).unwrap();

        let frame = parse_frame(&text).unwrap();
        let Frame::Signed(raw) = frame else { panic!("expected signed frame") };
        let payload = verify_envelope(&raw, &keys.public, 0).unwrap();
        assert!(matches!(payload, Payload::ClientListRequest));
    }

    #[test]
    fn counter_must_strictly_increase() {
        let keys = KeyPair::generate().unwrap();
        let text = build_envelope(&Payload::ClientListRequest, 5, &keys.private).unwrap();
        let frame = parse_frame(&text).unwrap();
        let Frame::Signed(raw) = frame else { panic!("expected signed frame") };

        // Replaying the exact same counter is rejected.
        assert!(verify_envelope(&raw, &keys.public, 5).is_err());
        // A strictly greater last_seen also rejects it.
        assert!(verify_envelope(&raw, &keys.public, 10).is_err());
    }

    #[test]
    fn first_accepted_counter_must_be_at_least_one() {
        let keys = KeyPair::generate().unwrap();
        let text = build_envelope(&Payload::ClientListRequest, 1, &keys.private).unwrap();
        let frame = parse_frame(&text).unwrap();
        let Frame::Signed(raw) = frame else { panic!("expected signed frame") };
        assert!(verify_envelope(&raw, &keys.public, 0).is_ok());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let keys = KeyPair::generate().unwrap();
        let other = KeyPair::generate().unwrap();
        let text = build_envelope(&Payload::ClientListRequest, 1, &keys.private).unwrap();
        let frame = parse_frame(&text).unwrap();
        let Frame::Signed(raw) = frame else { panic!("expected signed frame") };
        // Verifying against the wrong public key must fail.
        assert!(verify_envelope(&raw, &other.public, 0).is_err());
    }

    #[test]
    fn unknown_inner_type_is_rejected() {
        let err = parse_frame(r#"{"type":"not_a_real_type"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnknownType(_)));
    }

    #[test]
    fn chat_payload_round_trips_through_json() {
        let keys = KeyPair::generate().unwrap();
        let payload = Payload::Chat {
            destination_servers: vec!["127.0.0.1:9001".to_string()],
            iv: crypto::b64_encode(&[0u8; 16]),
            symm_keys: vec![crypto::b64_encode(b"wrapped-key")],
            chat: crypto::b64_encode(b"ciphertext+tag"),
        };
        let text = build_envelope(&payload, 2, &keys.private).unwrap();
        let frame = parse_frame(&text).unwrap();
        let Frame::Signed(raw) = frame else { panic!("expected signed frame") };
        let decoded = verify_envelope(&raw, &keys.public, 1).unwrap();
        match decoded {
            Payload::Chat { destination_servers, .. } => {
                assert_eq!(destination_servers, vec!["127.0.0.1:9001".to_string()]);
            }
            _ => panic!("expected chat payload"),
        }
    }
}
