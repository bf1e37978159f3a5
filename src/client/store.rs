//! The client's local chat-history store: a simple append/read
//! interface over a `messages.jsonl` file.
//!
//! The protocol's own scope note calls the storage engine behind this
//! an external collaborator — the UI just needs something to poll. This
//! repository's ambient expansion picks the simplest thing that
//! satisfies `GET /get_messages`: one JSON object per line, kept in
//! memory behind a mutex and mirrored to disk in append mode, the same
//! "never rewrite, only append" shape `file_store.rs` uses for uploaded
//! files. Expiry (`MESSAGE_EXPIRY_TIME`) is applied when a message is
//! read back, not when it is written, so the on-disk log never needs a
//! compaction pass.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::time::now_unix;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub sender: String,
    pub message: String,
    pub timestamp: u64,
}

pub struct MessageStore {
    path: PathBuf,
    messages: Mutex<Vec<StoredMessage>>,
}

impl MessageStore {
    /// Load any existing `messages.jsonl`, ignoring lines that fail to
    /// parse (a half-written line from a previous crash shouldn't take
    /// down the whole store).
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut messages = Vec::new();
        if let Ok(text) = tokio::fs::read_to_string(&path).await {
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(line) {
                    Ok(msg) => messages.push(msg),
                    Err(e) => warn!(error = %e, "skipping malformed line in message store"),
                }
            }
        } else if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        Ok(Self {
            path,
            messages: Mutex::new(messages),
        })
    }

    pub async fn append(&self, sender: impl Into<String>, message: impl Into<String>) {
        let entry = StoredMessage {
            sender: sender.into(),
            message: message.into(),
            timestamp: now_unix(),
        };

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize message, dropping");
                return;
            }
        };

        if let Err(e) = self.append_line(&line).await {
            warn!(error = %e, "failed to persist message to disk");
        }

        self.messages.lock().await.push(entry);
    }

    async fn append_line(&self, line: &str) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// All currently-live messages, oldest first, filtered by
    /// `expiry_secs` (`-1` keeps everything, `0` keeps nothing, `N`
    /// drops anything older than `N` seconds).
    pub async fn read_all(&self, expiry_secs: i64) -> Vec<StoredMessage> {
        if expiry_secs == 0 {
            return Vec::new();
        }
        let now = now_unix();
        let messages = self.messages.lock().await;
        if expiry_secs < 0 {
            return messages.clone();
        }
        let expiry_secs = expiry_secs as u64;
        messages
            .iter()
            .filter(|m| now.saturating_sub(m.timestamp) <= expiry_secs)
            .cloned()
            .collect()
    }
}
