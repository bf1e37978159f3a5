//! In-process relay integration tests: start a real `RelayState`-backed
//! server on a loopback port and drive it with real `tokio-tungstenite`
//! client connections, the way the teacher drives its own networking
//! code in `tests/net_test.rs` rather than through a spawned binary.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use neighbourhood::client::{ClientEngine, MessageStore};
use neighbourhood::config::{ClientConfig, ServerConfig};
use neighbourhood::crypto::KeyPair;
use neighbourhood::envelope::{self, DirectoryFrame, Frame, Payload};
use neighbourhood::neighbourhood::{Neighbourhood, PeerState};
use neighbourhood::server::{connect_to_neighbour, run_client_listener, run_peer_listener, RelayState};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay(client_ws_port: u16, external_address: &str) -> Arc<RelayState> {
    let config = Arc::new(ServerConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        client_ws_port,
        server_ws_port: client_ws_port + 1,
        http_port: client_ws_port + 2,
        neighbour_addresses: Vec::new(),
        external_address: external_address.to_string(),
        log_messages: false,
        key_dir: std::env::temp_dir(),
        file_store_dir: std::env::temp_dir(),
    });
    let keys = Arc::new(KeyPair::generate().unwrap());
    let neighbourhood = Neighbourhood::new(&[]);
    let state = RelayState::new(config.clone(), keys, neighbourhood).unwrap();

    let listener_state = state.clone();
    tokio::spawn(async move {
        let _ = run_client_listener(listener_state).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    state
}

async fn connect_and_hello(port: u16, keys: &KeyPair) -> Ws {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    let hello = envelope::build_envelope(
        &Payload::Hello { public_key: keys.public_pem().unwrap() },
        1,
        &keys.private,
    )
    .unwrap();
    ws.send(WsMessage::Text(hello)).await.unwrap();
    ws
}

async fn next_text(ws: &mut Ws) -> String {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => return text,
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn client_registers_and_appears_in_its_own_client_list() {
    let state = spawn_relay(19100, "127.0.0.1:19101").await;
    let alice = KeyPair::generate().unwrap();
    let mut ws = connect_and_hello(19100, &alice).await;

    // registration is asynchronous relative to the hello ack (there is
    // none); give the server a moment to insert the client record.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.clients.read().await.len(), 1);

    let request = envelope::build_envelope(&Payload::ClientListRequest, 2, &alice.private).unwrap();
    ws.send(WsMessage::Text(request)).await.unwrap();

    let text = next_text(&mut ws).await;
    let Frame::Directory(DirectoryFrame::ClientList { servers }) = envelope::parse_frame(&text).unwrap() else {
        panic!("expected a client_list frame");
    };
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].clients.len(), 1);
}

#[tokio::test]
async fn replayed_counter_is_rejected_and_frame_is_dropped() {
    let state = spawn_relay(19110, "127.0.0.1:19111").await;
    let alice = KeyPair::generate().unwrap();
    let mut ws = connect_and_hello(19110, &alice).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let replayed = envelope::build_envelope(&Payload::ClientListRequest, 1, &alice.private).unwrap();
    ws.send(WsMessage::Text(replayed)).await.unwrap();

    // The relay silently drops a rejected frame rather than closing the
    // connection on the first offense; assert no client_list arrives
    // within a short window, then confirm the connection is still alive
    // by sending a frame with a valid, strictly-increasing counter.
    let nothing_yet = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(nothing_yet.is_err(), "a replayed counter must not produce a reply");

    let valid = envelope::build_envelope(&Payload::ClientListRequest, 2, &alice.private).unwrap();
    ws.send(WsMessage::Text(valid)).await.unwrap();
    let text = next_text(&mut ws).await;
    assert!(matches!(envelope::parse_frame(&text).unwrap(), Frame::Directory(DirectoryFrame::ClientList { .. })));

    drop(state);
}

#[tokio::test]
async fn tampered_chat_ciphertext_does_not_reach_other_clients() {
    let state = spawn_relay(19120, "127.0.0.1:19121").await;
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap();
    let mut alice_ws = connect_and_hello(19120, &alice).await;
    let mut bob_ws = connect_and_hello(19120, &bob).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (key, iv) = neighbourhood::crypto::generate_aes_key_and_iv();
    let wrapped = neighbourhood::crypto::oaep_encrypt(&bob.public, &key).unwrap();
    let mut ciphertext = neighbourhood::crypto::aes_gcm_encrypt(&key, &iv, b"{\"participants\":[],\"message\":\"hi\"}").unwrap();
    let last = ciphertext.len() - 1;
    ciphertext[last] ^= 0xFF;

    let payload = Payload::Chat {
        destination_servers: vec!["127.0.0.1:19121".to_string()],
        iv: neighbourhood::crypto::b64_encode(&iv),
        symm_keys: vec![neighbourhood::crypto::b64_encode(&wrapped)],
        chat: neighbourhood::crypto::b64_encode(&ciphertext),
    };
    let text = envelope::build_envelope(&payload, 2, &alice.private).unwrap();
    alice_ws.send(WsMessage::Text(text)).await.unwrap();

    // The relay forwards any well-formed (correctly signed, strictly
    // increasing counter) chat frame regardless of ciphertext validity —
    // E2E authentication is the recipient's job, not the relay's. Bob
    // still receives the frame; his own GCM tag check is what would
    // later reject it, which `client::engine` covers separately.
    let text = next_text(&mut bob_ws).await;
    assert!(matches!(envelope::parse_frame(&text).unwrap(), Frame::Signed(_)));

    drop(state);
}

#[tokio::test]
async fn public_chat_reaches_other_local_clients_but_not_the_sender() {
    let state = spawn_relay(19130, "127.0.0.1:19131").await;
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap();
    let mut alice_ws = connect_and_hello(19130, &alice).await;
    let mut bob_ws = connect_and_hello(19130, &bob).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let payload = Payload::PublicChat {
        message: "hello neighbourhood".to_string(),
        sender_fingerprint: alice.fingerprint().unwrap(),
    };
    let text = envelope::build_envelope(&payload, 2, &alice.private).unwrap();
    alice_ws.send(WsMessage::Text(text)).await.unwrap();

    let received = next_text(&mut bob_ws).await;
    let Frame::Signed(raw) = envelope::parse_frame(&received).unwrap() else {
        panic!("expected signed frame");
    };
    let payload = envelope::verify_signature_only(&raw, &alice.public).unwrap();
    assert!(matches!(payload, Payload::PublicChat { message, .. } if message == "hello neighbourhood"));

    let nothing_for_alice = tokio::time::timeout(Duration::from_millis(200), alice_ws.next()).await;
    assert!(nothing_for_alice.is_err(), "a public_chat sender must not receive its own broadcast back");

    drop(state);
}

fn client_config(server_ws_port: u16, home_http_port: u16) -> ClientConfig {
    ClientConfig {
        server_address: "127.0.0.1".parse().unwrap(),
        server_port: server_ws_port,
        http_port: home_http_port + 1000,
        home_http_port,
        client_name: "test".to_string(),
        message_expiry_time: -1,
        key_dir: std::env::temp_dir(),
    }
}

async fn test_store() -> MessageStore {
    let dir = std::env::temp_dir().join(format!("neighbourhood-relay-test-{:x}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    MessageStore::open(dir.join("messages.jsonl")).await.unwrap()
}

async fn wait_for_peer_state(state: &RelayState, address: &str, want: PeerState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if state.neighbourhood.state_of(address).await == Some(want) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return state.neighbourhood.state_of(address).await == Some(want);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Spec §8 scenario 3: a client on one server chats with a client on a
/// neighbouring server. S1 must forward the frame to S2 exactly once
/// (not loop it back to the sender), S2 must deliver it to Bob once, and
/// Bob's OAEP/GCM round trip must recover the plaintext with both
/// fingerprints listed as participants.
#[tokio::test]
async fn chat_crosses_two_servers_exactly_once_with_no_echo() {
    let s1_address = "127.0.0.1:19241";
    let s2_address = "127.0.0.1:19251";

    let config_s1 = Arc::new(ServerConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        client_ws_port: 19240,
        server_ws_port: 19241,
        http_port: 19242,
        neighbour_addresses: vec![s2_address.to_string()],
        external_address: s1_address.to_string(),
        log_messages: false,
        key_dir: std::env::temp_dir(),
        file_store_dir: std::env::temp_dir(),
    });
    let config_s2 = Arc::new(ServerConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        client_ws_port: 19250,
        server_ws_port: 19251,
        http_port: 19252,
        neighbour_addresses: vec![s1_address.to_string()],
        external_address: s2_address.to_string(),
        log_messages: false,
        key_dir: std::env::temp_dir(),
        file_store_dir: std::env::temp_dir(),
    });

    let keys_s1 = Arc::new(KeyPair::generate().unwrap());
    let keys_s2 = Arc::new(KeyPair::generate().unwrap());

    let neighbourhood_s1 = Neighbourhood::new(&[s2_address.to_string()]);
    let neighbourhood_s2 = Neighbourhood::new(&[s1_address.to_string()]);
    neighbourhood_s1
        .set_identity(s2_address, keys_s2.public.clone(), keys_s2.fingerprint().unwrap())
        .await;
    neighbourhood_s2
        .set_identity(s1_address, keys_s1.public.clone(), keys_s1.fingerprint().unwrap())
        .await;

    let state_s1 = RelayState::new(config_s1, keys_s1, neighbourhood_s1).unwrap();
    let state_s2 = RelayState::new(config_s2, keys_s2, neighbourhood_s2).unwrap();

    tokio::spawn(run_client_listener(state_s1.clone()));
    tokio::spawn(run_client_listener(state_s2.clone()));
    tokio::spawn(run_peer_listener(state_s2.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let dial = tokio::spawn(connect_to_neighbour(state_s1.clone(), s2_address.to_string()));
    assert!(
        wait_for_peer_state(&state_s1, s2_address, PeerState::Connected, Duration::from_secs(3)).await,
        "peer link between the two servers never came up"
    );

    let alice_keys = Arc::new(KeyPair::generate().unwrap());
    let bob_keys = Arc::new(KeyPair::generate().unwrap());
    let alice_fp = alice_keys.fingerprint().unwrap();
    let bob_fp = bob_keys.fingerprint().unwrap();

    let alice = ClientEngine::connect(client_config(19240, 19242), alice_keys, Arc::new(test_store().await))
        .await
        .unwrap();
    let bob = ClientEngine::connect(client_config(19250, 19252), bob_keys, Arc::new(test_store().await))
        .await
        .unwrap();

    // Registration on each server triggers a `client_update` gossip to
    // the other over the peer link; give that time to land before either
    // client asks its own server for a directory.
    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.request_client_list().await.unwrap();
    bob.request_client_list().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    alice.send_chat(&[bob_fp.clone()], "hello across servers").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let bob_messages = bob.store().read_all(-1).await;
    assert_eq!(bob_messages.len(), 1, "bob must receive exactly one message, not zero or a duplicate");
    assert_eq!(bob_messages[0].sender, alice_fp);
    assert_eq!(bob_messages[0].message, "hello across servers");

    assert!(
        alice.store().read_all(-1).await.is_empty(),
        "alice must not receive an echo of her own chat"
    );

    dial.abort();
}
