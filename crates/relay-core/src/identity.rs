//! Identity collaborator: turns a connection token into a peer identity.
//!
//! The relay does no authorization of its own. Whatever an
//! [`IdentityProvider`] returns is trusted as the peer's stable ID.

use crate::protocol::UserInfo;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("connection token is empty")]
    EmptyToken,
    #[error("connection token is not recognized")]
    UnknownToken,
    #[error("token grant is inactive")]
    Inactive,
}

/// A resolved peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerIdentity {
    pub peer_id: String,
    /// Display metadata; None lets the registry use its default.
    pub info: Option<UserInfo>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<PeerIdentity, IdentityError>;
}

/// A configured token and the peer it identifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub peer_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Static token table.
///
/// With `trust_unknown_tokens`, a token that is not in the table is taken
/// verbatim as the peer ID. That is how deployments behind an external
/// gateway pass an already-authenticated user ID in the token position.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    grants: HashMap<String, TokenGrant>,
    trust_unknown_tokens: bool,
}

impl TokenTable {
    pub fn new(grants: impl IntoIterator<Item = TokenGrant>, trust_unknown_tokens: bool) -> Self {
        Self {
            grants: grants
                .into_iter()
                .map(|grant| (grant.token.clone(), grant))
                .collect(),
            trust_unknown_tokens,
        }
    }

    /// Table that accepts every non-empty token as a peer ID.
    pub fn trusting() -> Self {
        Self::new(Vec::new(), true)
    }
}

#[async_trait]
impl IdentityProvider for TokenTable {
    async fn resolve(&self, token: &str) -> Result<PeerIdentity, IdentityError> {
        if token.is_empty() {
            return Err(IdentityError::EmptyToken);
        }

        match self.grants.get(token) {
            Some(grant) if !grant.active => Err(IdentityError::Inactive),
            Some(grant) => {
                let info = grant.display_name.as_ref().map(|name| {
                    let mut info = UserInfo::new();
                    info.insert("display_name".into(), Value::String(name.clone()));
                    info
                });
                Ok(PeerIdentity {
                    peer_id: grant.peer_id.clone(),
                    info,
                })
            }
            None if self.trust_unknown_tokens => Ok(PeerIdentity {
                peer_id: token.to_string(),
                info: None,
            }),
            None => Err(IdentityError::UnknownToken),
        }
    }
}
