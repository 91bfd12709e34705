//! Configuration loading and management

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use relay_core::{IdentityProvider, MemoryStore, TokenGrant, TokenTable, WhiteboardStore};
use serde::{Deserialize, Serialize};

use crate::store::JsonFileStore;

/// Main configuration for the relay daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-connection limits
    #[serde(default)]
    pub relay: RelayLimits,

    /// How connection tokens map to peer identities
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Drawing persistence
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayLimits {
    /// Frames buffered per peer before deliveries to it start failing
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Inbound frames larger than this are dropped
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_message_size: default_max_message_size(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MiB
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Use tokens that are not listed below as the peer ID itself
    #[serde(default = "default_true")]
    pub trust_unknown_tokens: bool,

    /// Known tokens
    #[serde(default)]
    pub tokens: Vec<TokenGrant>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trust_unknown_tokens: true,
            tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Hand relayed drawing elements to the store
    #[serde(default)]
    pub persist_drawings: bool,

    /// Directory for per-session element files; in-memory when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a JSON file, writing defaults if it is absent
    pub fn load(config_file: &Path) -> Result<Self> {
        if config_file.exists() {
            let content = std::fs::read_to_string(config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", config_file))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            if let Some(parent) = config_file.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    /// Identity provider described by this configuration
    pub fn identity_provider(&self) -> Arc<dyn IdentityProvider> {
        Arc::new(TokenTable::new(
            self.identity.tokens.iter().cloned(),
            self.identity.trust_unknown_tokens,
        ))
    }

    /// Store for relayed drawing elements, if persistence is enabled
    pub fn whiteboard_store(&self) -> Result<Option<Arc<dyn WhiteboardStore>>> {
        if !self.storage.persist_drawings {
            return Ok(None);
        }
        let store: Arc<dyn WhiteboardStore> = match &self.storage.data_dir {
            Some(dir) => Arc::new(JsonFileStore::new(dir)?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Some(store))
    }
}
