//! HTTP file store (C5): size-capped uploads addressed by a random id,
//! plus the two small endpoints a server uses to publish its own
//! public key and accept a neighbour's.
//!
//! Routed with axum the way the rest of this pack's HTTP-facing crates
//! do — a small `Router` built from a shared `Arc<FileStore>` state,
//! `IntoResponse` error mapping instead of manual status juggling, and
//! one `tracing` line per request outcome rather than a middleware
//! stack (this surface is small enough not to need one).

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Multipart, Path as AxPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::crypto::KeyPair;
use crate::error::StorageError;

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const FILE_ID_LEN: usize = 32;

pub struct FileStore {
    pub files_dir: PathBuf,
    pub neighbours_dir: PathBuf,
    pub keys: Arc<KeyPair>,
    pub external_address: String,
    pub http_port: u16,
}

impl IntoResponse for StorageError {
    fn into_response(self) -> Response {
        let status = match &self {
            StorageError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Serialize)]
struct UploadResponse {
    file_url: String,
}

pub fn router(store: Arc<FileStore>) -> Router {
    Router::new()
        .route("/api/upload", post(upload_file))
        .route("/files/{id}/{name}", get(download_file))
        .route("/pub", get(public_key))
        .route("/upload_key", post(upload_neighbour_key))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(store)
}

async fn upload_file(
    State(store): State<Arc<FileStore>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, StorageError> {
    let mut filename = "upload.bin".to_string();
    let mut bytes = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!(error = %e, "malformed multipart upload");
        StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    })? {
        if let Some(name) = field.file_name() {
            filename = sanitize_filename(name);
        }
        let data = field.bytes().await.map_err(|e| {
            StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
        })?;
        if bytes.len() + data.len() > MAX_UPLOAD_BYTES {
            return Err(StorageError::TooLarge { max: MAX_UPLOAD_BYTES });
        }
        bytes.extend_from_slice(&data);
    }

    let id: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(FILE_ID_LEN)
        .map(char::from)
        .collect();

    let dir = store.files_dir.join(&id);
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join(&filename), &bytes).await?;

    info!(%id, %filename, size = bytes.len(), "file uploaded");

    let file_url = format!(
        "http://{}:{}/files/{}/{}",
        store.external_address, store.http_port, id, filename
    );
    Ok(Json(UploadResponse { file_url }))
}

async fn download_file(
    State(store): State<Arc<FileStore>>,
    AxPath((id, name)): AxPath<(String, String)>,
) -> Result<Vec<u8>, StorageError> {
    let path = store.files_dir.join(sanitize_id(&id)).join(sanitize_filename(&name));
    tokio::fs::read(&path)
        .await
        .map_err(|_| StorageError::NotFound(format!("{id}/{name}")))
}

async fn public_key(State(store): State<Arc<FileStore>>) -> Result<String, StorageError> {
    store.keys.public_pem().map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

/// Accept a neighbour's public key PEM, named `<host>_<port>_public_key.pem`,
/// and write it into the neighbours directory. Written to a temp file
/// and renamed into place so a concurrent reconnect attempt never sees
/// a half-written key.
async fn upload_neighbour_key(
    State(store): State<Arc<FileStore>>,
    mut multipart: Multipart,
) -> Result<StatusCode, StorageError> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    })? {
        let Some(filename) = field.file_name().map(sanitize_filename) else {
            continue;
        };
        let data = field.bytes().await.map_err(|e| {
            StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
        })?;

        tokio::fs::create_dir_all(&store.neighbours_dir).await?;
        let tmp_path = store.neighbours_dir.join(format!(".{filename}.tmp"));
        let final_path = store.neighbours_dir.join(&filename);
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        info!(%filename, "neighbour key installed");
    }
    Ok(StatusCode::OK)
}

fn sanitize_filename(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
}

fn sanitize_id(id: &str) -> String {
    id.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filename_strips_path_components() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
    }

    #[test]
    fn sanitize_id_strips_non_alphanumeric() {
        assert_eq!(sanitize_id("../secret"), "secret");
    }
}
