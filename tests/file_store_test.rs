//! Exercises `file_store::router()` directly through `tower::ServiceExt::oneshot`
//! instead of over a real TCP listener, the same way the teacher drives
//! its rate limiter types directly as library calls in
//! `tests/rate_limit_test.rs` rather than over the wire.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use neighbourhood::crypto::KeyPair;
use neighbourhood::file_store::{self, FileStore};
use tower::ServiceExt;

fn test_store(tmp: &std::path::Path) -> Arc<FileStore> {
    Arc::new(FileStore {
        files_dir: tmp.join("files"),
        neighbours_dir: tmp.join("neighbours"),
        keys: Arc::new(KeyPair::generate().unwrap()),
        external_address: "127.0.0.1:9001".to_string(),
        http_port: 9002,
    })
}

fn tempdir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("neighbourhood-file-store-test-{:x}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn multipart_body(boundary: &str, field_name: &str, filename: Option<&str>, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    match filename {
        Some(name) => body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{field_name}\"; filename=\"{name}\"\r\n\r\n").as_bytes(),
        ),
        None => body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{field_name}\"\r\n\r\n").as_bytes()),
    }
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[tokio::test]
async fn upload_then_download_round_trips() {
    let store = test_store(&tempdir());
    let router = file_store::router(store);

    let boundary = "testboundary";
    let body = multipart_body(boundary, "file", Some("hello.txt"), b"hello neighbourhood");
    let request = Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header("content-type", format!("multipart/form-data; boundary={boundary}"))
        .body(Body::from(body))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let file_url = json["file_url"].as_str().unwrap();
    assert!(file_url.starts_with("http://127.0.0.1:9001/files/"));

    let path = file_url.trim_start_matches("http://127.0.0.1:9001");
    let request = Request::builder().method("GET").uri(path).body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let downloaded = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&downloaded[..], b"hello neighbourhood");
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let store = test_store(&tempdir());
    let router = file_store::router(store);

    let boundary = "testboundary";
    let oversized = vec![0u8; file_store::MAX_UPLOAD_BYTES + 1];
    let body = multipart_body(boundary, "file", Some("big.bin"), &oversized);
    let request = Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header("content-type", format!("multipart/form-data; boundary={boundary}"))
        .body(Body::from(body))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn download_of_unknown_file_is_404() {
    let store = test_store(&tempdir());
    let router = file_store::router(store);

    let request = Request::builder()
        .method("GET")
        .uri("/files/doesnotexist/name.txt")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pub_endpoint_returns_pem_public_key() {
    let store = test_store(&tempdir());
    let expected = store.keys.public_pem().unwrap();
    let router = file_store::router(store);

    let request = Request::builder().method("GET").uri("/pub").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), expected);
}
