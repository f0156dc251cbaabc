//! External collaborators: authentication and the user directory.

use crate::backend::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    /// Display role (student, counselor, ...).
    #[serde(default)]
    pub role: String,
}

impl Identity {
    /// Create an identity without an email.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: String::new(),
            name: name.into(),
            role: role.into(),
        }
    }
}

/// Authentication errors. All are fatal to the connection.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingCredential,

    #[error("Invalid token: {0}")]
    InvalidCredential(String),

    #[error("Token expired")]
    Expired,

    #[error("Authentication unavailable: {0}")]
    Unavailable(String),
}

/// Verifies a bearer credential presented at handshake.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Resolves display names for presence entries.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up a user's display name. `Ok(None)` means not found.
    async fn lookup_name(&self, user_id: &str) -> Result<Option<String>, BackendError>;
}

/// A fixed user-id to name map.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    names: HashMap<String, String>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a name.
    pub fn insert(&mut self, user_id: impl Into<String>, name: impl Into<String>) {
        self.names.insert(user_id.into(), name.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StaticDirectory {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            names: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn lookup_name(&self, user_id: &str) -> Result<Option<String>, BackendError> {
        Ok(self.names.get(user_id).cloned())
    }
}

/// An authenticator that accepts a fixed set of tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, Identity>,
}

impl StaticAuthenticator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `identity`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(|| AuthError::InvalidCredential("unknown token".into()))
    }
}
