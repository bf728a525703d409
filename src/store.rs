use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::types::{ChannelId, StoredMessage};

/// Durable home for per-channel conversation state. Every save is a complete
/// snapshot, never a diff.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn save(&self, channel: ChannelId, snapshot: &ContextSnapshot)
        -> Result<(), PersistenceError>;

    /// Load the last saved snapshot, if any.
    async fn load(&self, channel: ChannelId) -> Result<Option<ContextSnapshot>, PersistenceError>;

    /// Forget a channel entirely.
    async fn remove(&self, channel: ChannelId) -> Result<(), PersistenceError>;
}

/// What gets written for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub messages: Vec<StoredMessage>,
    #[serde(default)]
    pub token_counts: Vec<u32>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl ContextSnapshot {
    /// True when the counts came from disk alongside the messages, as opposed
    /// to a legacy file that stored only the message list.
    pub fn has_counts(&self) -> bool {
        self.token_counts.len() == self.messages.len()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PersistedContext {
    Snapshot(ContextSnapshot),
    Legacy(Vec<StoredMessage>),
}

pub(crate) fn parse_snapshot(json: &str) -> Result<ContextSnapshot, PersistenceError> {
    Ok(match serde_json::from_str(json)? {
        PersistedContext::Snapshot(snapshot) => snapshot,
        PersistedContext::Legacy(messages) => ContextSnapshot {
            messages,
            token_counts: Vec::new(),
            total_tokens: 0,
            saved_at: None,
        },
    })
}

// --- NoContextStore ---

/// No persistence. Contexts live and die with the process.
pub struct NoContextStore;

#[async_trait]
impl ContextStore for NoContextStore {
    async fn save(&self, _: ChannelId, _: &ContextSnapshot) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn load(&self, _: ChannelId) -> Result<Option<ContextSnapshot>, PersistenceError> {
        Ok(None)
    }

    async fn remove(&self, _: ChannelId) -> Result<(), PersistenceError> {
        Ok(())
    }
}

// --- FileContextStore ---

/// One `<channel>.json` file per channel under `dir`.
pub struct FileContextStore {
    dir: PathBuf,
}

impl FileContextStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, channel: ChannelId) -> PathBuf {
        self.dir.join(format!("{channel}.json"))
    }
}

/// Write to a sibling temp file, then rename over the target so readers never
/// observe a half-written file.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ContextStore for FileContextStore {
    async fn save(
        &self,
        channel: ChannelId,
        snapshot: &ContextSnapshot,
    ) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        write_atomic(&self.path(channel), json.as_bytes()).await
    }

    async fn load(&self, channel: ChannelId) -> Result<Option<ContextSnapshot>, PersistenceError> {
        match tokio::fs::read_to_string(self.path(channel)).await {
            Ok(json) => parse_snapshot(&json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, channel: ChannelId) -> Result<(), PersistenceError> {
        match tokio::fs::remove_file(self.path(channel)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, StoredPart};

    fn sample() -> ContextSnapshot {
        ContextSnapshot {
            messages: vec![
                StoredMessage::system("sys"),
                StoredMessage {
                    role: Role::User,
                    parts: vec![
                        StoredPart::Text("alice: look".into()),
                        StoredPart::Inline {
                            mime_type: "image/png".into(),
                            data: "AAEC".into(),
                        },
                    ],
                },
            ],
            token_counts: vec![3, 11],
            total_tokens: 14,
            saved_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContextStore::new(dir.path().join("contexts"));
        let snapshot = sample();

        store.save(ChannelId(42), &snapshot).await.unwrap();
        let loaded = store.load(ChannelId(42)).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(loaded.has_counts());
        assert!(!dir.path().join("contexts/42.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContextStore::new(dir.path());
        assert!(store.load(ChannelId(7)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn legacy_bare_array_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("9.json"),
            r#"[{"role": "system", "parts": ["old"]}, {"role": "user", "parts": ["bob: hi"]}]"#,
        )
        .unwrap();

        let store = FileContextStore::new(dir.path());
        let loaded = store.load(ChannelId(9)).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert!(!loaded.has_counts());
        assert_eq!(loaded.total_tokens, 0);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("5.json"), "{not json").unwrap();
        let store = FileContextStore::new(dir.path());
        assert!(matches!(
            store.load(ChannelId(5)).await,
            Err(PersistenceError::Serialize(_))
        ));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContextStore::new(dir.path());
        store.save(ChannelId(1), &sample()).await.unwrap();
        store.remove(ChannelId(1)).await.unwrap();
        store.remove(ChannelId(1)).await.unwrap();
        assert!(store.load(ChannelId(1)).await.unwrap().is_none());
    }
}
