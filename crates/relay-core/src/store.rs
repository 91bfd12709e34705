//! Storage collaborator for drawing elements.
//!
//! The relay itself keeps no history. When persistence is enabled, each
//! relayed drawing event that is a valid element is handed to a
//! [`WhiteboardStore`]; what the store does with it is its own business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Drawing tool that produced an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Pen,
    Line,
    Rectangle,
    Circle,
    Eraser,
    Clear,
}

/// One persisted drawing element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawingElement {
    /// The web client calls this field `tool`.
    #[serde(rename = "type", alias = "tool")]
    pub kind: ElementKind,
    /// Points, e.g. `[{"x": 1.0, "y": 2.0}]`.
    #[serde(default)]
    pub coordinates: Vec<BTreeMap<String, f64>>,
    #[serde(default)]
    pub style: Map<String, Value>,
}

impl DrawingElement {
    /// Interpret a `drawing_data` payload as an element, if it is one.
    pub fn from_payload(data: &Value) -> Option<Self> {
        Self::deserialize(data).ok()
    }
}

/// Durable storage for whiteboard elements, keyed by session.
#[async_trait]
pub trait WhiteboardStore: Send + Sync {
    /// Append an element to the session's history.
    async fn save(&self, session_id: &str, element: DrawingElement) -> Result<(), StoreError>;

    /// All elements saved for the session, oldest first.
    async fn load(&self, session_id: &str) -> Result<Vec<DrawingElement>, StoreError>;
}

/// In-process store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    elements: RwLock<HashMap<String, Vec<DrawingElement>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WhiteboardStore for MemoryStore {
    async fn save(&self, session_id: &str, element: DrawingElement) -> Result<(), StoreError> {
        self.elements
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .push(element);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<DrawingElement>, StoreError> {
        Ok(self
            .elements
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}
