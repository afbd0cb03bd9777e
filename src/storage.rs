//! File-backed conversation history.
//!
//! Each conversation lives in its own JSON file,
//! `chat_messages_<conversation>.json`, holding the complete message list.
//! Reads are total: a missing or unreadable file is an empty history, so a
//! fresh install and a wiped data directory behave identically. Writes
//! replace the whole file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::clog;
use crate::envelope::Envelope;

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Serialize(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "history io error: {err}"),
            StoreError::Serialize(err) => write!(f, "history serialize error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(err) => Some(err),
            StoreError::Serialize(err) => Some(err),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialize(err)
    }
}

/// Handle on a directory of per-conversation history files.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    /// Open (creating if needed) the history directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn conversation_path(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!(
            "chat_messages_{}.json",
            sanitize_conversation_id(conversation_id)
        ))
    }

    /// Full history of a conversation, oldest first. Never fails: missing,
    /// unreadable or corrupt files read as an empty log.
    pub fn load(&self, conversation_id: &str) -> Vec<Envelope> {
        let path = self.conversation_path(conversation_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                clog!("failed to read {}: {err}", path.display());
                return Vec::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(messages) => messages,
            Err(err) => {
                clog!("discarding corrupt history at {}: {err}", path.display());
                Vec::new()
            }
        }
    }

    /// Replace the stored conversation with `messages`.
    pub fn save(&self, conversation_id: &str, messages: &[Envelope]) -> Result<(), StoreError> {
        let path = self.conversation_path(conversation_id);
        let body = serde_json::to_vec(messages)?;
        fs::write(&path, body)?;
        Ok(())
    }
}

/// Conversation ids become file names; anything outside `[A-Za-z0-9._-]`
/// maps to `_` so ids cannot escape the history directory.
fn sanitize_conversation_id(conversation_id: &str) -> String {
    conversation_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    fn store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, store) = store();
        let messages = vec![
            Envelope::new("default", "alice", "hola"),
            Envelope::new("default", "bob", "hey"),
        ];
        store.save("default", &messages).unwrap();
        assert_eq!(store.load("default"), messages);
    }

    #[test]
    fn missing_conversation_reads_empty() {
        let (_dir, store) = store();
        assert!(store.load("never-written").is_empty());
    }

    #[test]
    fn corrupt_file_reads_empty() {
        let (dir, store) = store();
        fs::write(dir.path().join("chat_messages_default.json"), b"{not json").unwrap();
        assert!(store.load("default").is_empty());
    }

    #[test]
    fn save_replaces_previous_contents() {
        let (_dir, store) = store();
        store
            .save("default", &[Envelope::new("default", "alice", "first")])
            .unwrap();
        let replacement = vec![Envelope::new("default", "alice", "second")];
        store.save("default", &replacement).unwrap();
        assert_eq!(store.load("default"), replacement);
    }

    #[test]
    fn hostile_conversation_ids_stay_inside_the_directory() {
        let (dir, store) = store();
        let id = "../escape/attempt:1";
        store.save(id, &[Envelope::new(id, "alice", "hola")]).unwrap();

        assert_eq!(store.load(id).len(), 1);
        assert!(dir
            .path()
            .join("chat_messages_.._escape_attempt_1.json")
            .exists());
    }
}
