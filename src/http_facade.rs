//! Local HTTP facade (C7): a thin polling API the out-of-scope chat UI
//! drives. Routed with axum, the same shape as `file_store.rs` — a
//! small `Router` over a shared `Arc` state, `IntoResponse` error
//! mapping, one `tracing` line per notable outcome.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::client::{ClientEngine, StoredMessage};
use crate::crypto::Fingerprint;
use crate::error::ClientError;

pub struct Facade {
    pub engine: Arc<ClientEngine>,
}

impl IntoResponse for ClientError {
    fn into_response(self) -> Response {
        let status = match &self {
            ClientError::UnknownRecipient(_) => StatusCode::BAD_REQUEST,
            ClientError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
            ClientError::Envelope(_) | ClientError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub fn router(facade: Arc<Facade>) -> Router {
    Router::new()
        .route("/get_fingerprint", get(get_fingerprint))
        .route("/get_clients", get(get_clients))
        .route("/request_client_list", get(request_client_list))
        .route("/get_messages", get(get_messages))
        .route("/send_message", post(send_message))
        .route("/send_public_message", post(send_public_message))
        .route("/upload_file", post(upload_file))
        .layer(axum::extract::DefaultBodyLimit::max(crate::file_store::MAX_UPLOAD_BYTES))
        .with_state(facade)
}

#[derive(Serialize)]
struct FingerprintResponse {
    fingerprint: Fingerprint,
    name: String,
    server_address: String,
    server_port: u16,
    http_port: u16,
    public_host: String,
}

async fn get_fingerprint(State(facade): State<Arc<Facade>>) -> Json<FingerprintResponse> {
    let config = &facade.engine.config;
    Json(FingerprintResponse {
        fingerprint: facade.engine.own_fingerprint.clone(),
        name: config.client_name.clone(),
        server_address: config.server_address.to_string(),
        server_port: config.server_port,
        http_port: config.http_port,
        public_host: config.server_address.to_string(),
    })
}

async fn get_clients(State(facade): State<Arc<Facade>>) -> Json<Vec<Fingerprint>> {
    Json(facade.engine.known_fingerprints().await)
}

async fn request_client_list(State(facade): State<Arc<Facade>>) -> Result<Json<serde_json::Value>, ClientError> {
    facade.engine.request_client_list().await?;
    Ok(Json(serde_json::json!({})))
}

async fn get_messages(State(facade): State<Arc<Facade>>) -> Json<Vec<StoredMessage>> {
    let expiry = facade.engine.config.message_expiry_time;
    Json(facade.engine.store().read_all(expiry).await)
}

#[derive(Deserialize)]
struct SendMessageRequest {
    message: String,
    recipients: Vec<Fingerprint>,
}

async fn send_message(
    State(facade): State<Arc<Facade>>,
    Json(req): Json<SendMessageRequest>,
) -> Result<StatusCode, ClientError> {
    facade.engine.send_chat(&req.recipients, &req.message).await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct SendPublicMessageRequest {
    message: String,
}

async fn send_public_message(
    State(facade): State<Arc<Facade>>,
    Json(req): Json<SendPublicMessageRequest>,
) -> Result<StatusCode, ClientError> {
    facade.engine.send_public_chat(&req.message).await?;
    Ok(StatusCode::OK)
}

/// Upload the multipart body to the home server's file store (C5),
/// then emit a chat carrying the returned URL, per §4.7: the facade
/// is a thin shell that turns one multipart POST into a C5 upload plus
/// a C6 `chat` send — it never writes to `files_dir` itself. Expects a
/// `file` field plus an optional `recipients` field (comma-separated
/// fingerprints) and an optional `public` field (`"true"` to send as
/// a public chat instead of a private one).
async fn upload_file(
    State(facade): State<Arc<Facade>>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ClientError> {
    let mut filename = "upload.bin".to_string();
    let mut bytes = Vec::new();
    let mut recipients: Vec<Fingerprint> = Vec::new();
    let mut public = false;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!(error = %e, "malformed multipart upload");
        ClientError::NotConnected
    })? {
        match field.name().unwrap_or("") {
            "recipients" => {
                let text = field.text().await.unwrap_or_default();
                recipients = text.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
            }
            "public" => {
                public = field.text().await.unwrap_or_default() == "true";
            }
            _ => {
                if let Some(name) = field.file_name() {
                    filename = name.to_string();
                }
                bytes = field.bytes().await.unwrap_or_default().to_vec();
            }
        }
    }

    let home_http_port = facade.engine.config.home_http_port;
    let upload_url = format!("http://{}:{}/api/upload", facade.engine.config.server_address, home_http_port);

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(bytes).file_name(filename),
    );
    let response = reqwest::Client::new()
        .post(&upload_url)
        .multipart(form)
        .send()
        .await
        .map_err(|_| ClientError::NotConnected)?;

    #[derive(Deserialize)]
    struct UploadResponse {
        file_url: String,
    }
    let upload: UploadResponse = response.json().await.map_err(|_| ClientError::NotConnected)?;

    let body = format!("[File] {}", upload.file_url);
    if public {
        facade.engine.send_public_chat(&body).await?;
    } else {
        facade.engine.send_chat(&recipients, &body).await?;
    }

    Ok(Json(serde_json::json!({ "file_url": upload.file_url })))
}
