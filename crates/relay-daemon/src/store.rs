//! File-backed whiteboard store.
//!
//! Each session's elements live in one JSON Lines file under the data
//! directory, one element per line. Saving appends a single line, so the
//! cost of a save does not grow with the session.

use async_trait::async_trait;
use relay_core::{DrawingElement, StoreError, WhiteboardStore};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Prefix marking a hex-encoded session ID.
const ENCODED_PREFIX: &str = "x-";

pub struct JsonFileStore {
    dir: PathBuf,
    /// Serializes appends, and keeps loads from seeing a half-written line
    file_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            file_lock: Mutex::new(()),
        })
    }

    /// File holding a session's elements.
    ///
    /// IDs made of `[a-z0-9_-]` that do not start with `x-` are used as-is.
    /// Everything else, including the empty ID, becomes `x-<hex>`. Plain
    /// names never carry the prefix and hex is lowercase, so distinct IDs
    /// always map to distinct files, even on case-insensitive filesystems.
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        let is_plain = !session_id.is_empty()
            && !session_id.starts_with(ENCODED_PREFIX)
            && session_id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        let stem = if is_plain {
            session_id.to_string()
        } else {
            format!("{}{}", ENCODED_PREFIX, hex::encode(session_id))
        };
        self.dir.join(format!("{}.jsonl", stem))
    }
}

#[async_trait]
impl WhiteboardStore for JsonFileStore {
    async fn save(&self, session_id: &str, element: DrawingElement) -> Result<(), StoreError> {
        let path = self.session_path(session_id);
        let mut line = serde_json::to_vec(&element)?;
        line.push(b'\n');

        let _guard = self.file_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(session_id, kind = ?element.kind, "Saved drawing element");
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<DrawingElement>, StoreError> {
        let path = self.session_path(session_id);
        let content = {
            let _guard = self.file_lock.lock().await;
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            }
        };

        let mut elements = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            // A crash mid-append can leave a truncated last line
            match serde_json::from_str(line) {
                Ok(element) => elements.push(element),
                Err(e) => warn!(session_id, line = index + 1, error = %e, "Skipping unreadable element"),
            }
        }
        Ok(elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ElementKind;
    use serde_json::json;
    use tempfile::TempDir;

    fn element(tool: &str) -> DrawingElement {
        DrawingElement::from_payload(&json!({"tool": tool, "coordinates": [{"x": 1.0, "y": 1.0}]}))
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        store.save("board1", element("pen")).await.unwrap();
        store.save("board1", element("circle")).await.unwrap();

        let loaded = store.load("board1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].kind, ElementKind::Pen);
        assert_eq!(loaded[1].kind, ElementKind::Circle);

        let content = std::fs::read_to_string(dir.path().join("board1.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        JsonFileStore::new(dir.path())
            .unwrap()
            .save("board1", element("line"))
            .await
            .unwrap();

        let reopened = JsonFileStore::new(dir.path()).unwrap();
        assert_eq!(reopened.load("board1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        assert!(store.load("nothing-here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        store.save("board1", element("pen")).await.unwrap();

        let path = store.session_path("board1");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str(r#"{"type":"li"#);
        std::fs::write(&path, content).unwrap();

        let loaded = store.load("board1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].kind, ElementKind::Pen);
    }

    #[test]
    fn test_session_ids_cannot_escape_directory() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        let path = store.session_path("../../etc/passwd");
        assert_eq!(path.parent(), Some(dir.path()));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("x-"));

        assert_eq!(
            store.session_path("65f1c2-abc_d"),
            dir.path().join("65f1c2-abc_d.jsonl")
        );
        assert_eq!(store.session_path(""), dir.path().join("x-.jsonl"));
    }

    #[test]
    fn test_encoded_names_never_collide_with_plain_ids() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        // hex("a b") == "612062"
        assert_ne!(store.session_path("a b"), store.session_path("x-612062"));
        assert_ne!(store.session_path("Board1"), store.session_path("board1"));
        assert_ne!(store.session_path(""), store.session_path("x-"));
    }

    #[tokio::test]
    async fn test_lookalike_sessions_stay_separate() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        store.save("a b", element("pen")).await.unwrap();

        assert!(store.load("x-612062").await.unwrap().is_empty());
        assert_eq!(store.load("a b").await.unwrap().len(), 1);
    }
}
