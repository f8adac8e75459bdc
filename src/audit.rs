//! Audit persistence for generated thoughts and augmented conversations.
//!
//! The relay only needs an append-and-read-latest surface; anything richer
//! (relational storage, retention, querying) belongs to an external
//! consumer of these records. Two backends are provided: in-memory for
//! tests and ephemeral deployments, JSONL files for anything that should
//! survive a restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::Message;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// One persisted chain-of-thought block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtRecord {
    pub id: String,
    pub timestamp: u64,
    pub content: String,
}

/// One persisted augmented conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    pub timestamp: u64,
    pub messages: Vec<Message>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record_thought(&self, content: &str) -> Result<ThoughtRecord>;
    async fn record_chat(&self, messages: &[Message]) -> Result<ChatRecord>;
    /// Most recently recorded thought, if any.
    async fn latest_thought(&self) -> Result<Option<ThoughtRecord>>;
}

/// Volatile store, newest record last.
#[derive(Default)]
pub struct MemoryAuditStore {
    thoughts: Mutex<Vec<ThoughtRecord>>,
    chats: Mutex<Vec<ChatRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn record_thought(&self, content: &str) -> Result<ThoughtRecord> {
        let record = ThoughtRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: current_timestamp(),
            content: content.to_string(),
        };
        self.thoughts.lock().await.push(record.clone());
        Ok(record)
    }

    async fn record_chat(&self, messages: &[Message]) -> Result<ChatRecord> {
        let record = ChatRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: current_timestamp(),
            messages: messages.to_vec(),
        };
        self.chats.lock().await.push(record.clone());
        Ok(record)
    }

    async fn latest_thought(&self) -> Result<Option<ThoughtRecord>> {
        Ok(self.thoughts.lock().await.last().cloned())
    }
}

/// Append-only JSONL store: `thoughts.jsonl` and `chats.jsonl` under one
/// directory, one record per line.
pub struct JsonlAuditStore {
    thoughts_path: PathBuf,
    chats_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| AuditError::Storage(format!("create {}: {e}", dir.display())))?;
        Ok(Self {
            thoughts_path: dir.join("thoughts.jsonl"),
            chats_path: dir.join("chats.jsonl"),
            write_lock: Mutex::new(()),
        })
    }

    async fn append_line(&self, path: &Path, line: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    async fn record_thought(&self, content: &str) -> Result<ThoughtRecord> {
        let record = ThoughtRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: current_timestamp(),
            content: content.to_string(),
        };
        self.append_line(&self.thoughts_path, serde_json::to_string(&record)?)
            .await?;
        Ok(record)
    }

    async fn record_chat(&self, messages: &[Message]) -> Result<ChatRecord> {
        let record = ChatRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: current_timestamp(),
            messages: messages.to_vec(),
        };
        self.append_line(&self.chats_path, serde_json::to_string(&record)?)
            .await?;
        Ok(record)
    }

    async fn latest_thought(&self) -> Result<Option<ThoughtRecord>> {
        let raw = match tokio::fs::read_to_string(&self.thoughts_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(line) = raw.lines().rev().find(|l| !l.trim().is_empty()) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(line)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_returns_newest_thought() {
        let store = MemoryAuditStore::new();
        assert!(store.latest_thought().await.unwrap().is_none());
        store.record_thought("first").await.unwrap();
        store.record_thought("second").await.unwrap();
        let latest = store.latest_thought().await.unwrap().unwrap();
        assert_eq!(latest.content, "second");
    }

    #[tokio::test]
    async fn jsonl_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");

        {
            let store = JsonlAuditStore::new(dir.path()).unwrap();
            store.record_thought("persisted").await.unwrap();
            store
                .record_chat(&[Message::user("Hi")])
                .await
                .unwrap();
        }

        let store = JsonlAuditStore::new(dir.path()).unwrap();
        let latest = store.latest_thought().await.unwrap().unwrap();
        assert_eq!(latest.content, "persisted");
    }

    #[tokio::test]
    async fn jsonl_store_empty_file_has_no_latest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonlAuditStore::new(dir.path()).unwrap();
        assert!(store.latest_thought().await.unwrap().is_none());
    }
}
