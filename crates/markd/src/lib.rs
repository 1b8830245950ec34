/// Real-time bookmark reconciliation
/// Merges a fetched snapshot with live insert/delete events and local writes
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod bookmark;
pub use bookmark::*;

mod store;
pub use store::*;

mod reconciler;
pub use reconciler::*;

mod connection;
pub use connection::*;

mod projector;
pub use projector::*;

mod draft;
pub use draft::*;

mod card;
pub use card::*;

mod confirm;
pub use confirm::*;

mod backend;
pub use backend::*;

mod memory;
pub use memory::*;

mod config;
pub use config::*;

mod session;
pub use session::*;

mod wire;
pub use wire::*;

mod relay;
pub use relay::*;

mod remote;
pub use remote::*;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MarkdError {
    #[error("{0}")]
    Validation(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("session closed")]
    SessionClosed,

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MarkdError>;

impl From<serde_json::Error> for MarkdError {
    fn from(e: serde_json::Error) -> Self {
        MarkdError::Serialization(e.to_string())
    }
}

/// Authenticated user owning a bookmark list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Opaque bookmark identity, the dedup key for every merge
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookmarkId(pub String);

impl BookmarkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh server-side id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookmarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BookmarkId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
