use crate::{Kind, Object, ObjectKey, ValidationError};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;

/// A lazy stream of store mutations.
///
/// The stream never ends cleanly: it terminates only after yielding an error, at which point the
/// consumer is expected to relist and start a new watch.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, StoreError>> + Send + 'static>>;

/// Durable, optimistically versioned storage for policy records.
///
/// Every write bumps the record's `resourceVersion`. Updates must carry the version they were
/// derived from; a stale version fails with [`StoreError::Conflict`].
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    async fn get(&self, key: &ObjectKey) -> Result<Object, StoreError>;

    /// Lists records of `kind`. When `namespace` is `None`, records in every scope (including
    /// cluster-scoped records) are returned.
    async fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<List, StoreError>;

    async fn create(&self, object: Object) -> Result<Object, StoreError>;

    async fn update(&self, object: Object) -> Result<Object, StoreError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Watches records of `kind`, starting after `since` or, if unset, at the current version.
    ///
    /// Every mutation after `since` is delivered in order. Events may be delivered more than once
    /// across restarts.
    fn watch(&self, kind: Kind, since: Option<String>) -> WatchStream;
}

#[derive(Clone, Debug, PartialEq)]
pub struct List {
    pub items: Vec<Object>,

    /// The store version as of this list. A watch started from here observes every later write.
    pub resource_version: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub object: Object,
    pub resource_version: String,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),

    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),

    #[error("{key} has been modified: expected resource version {expected:?}, found {current}")]
    Conflict {
        key: ObjectKey,
        expected: Option<String>,
        current: String,
    },

    #[error("resource version {0} is no longer available")]
    Expired(String),

    #[error("policy store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

// === impl StoreError ===

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Indicates the write lost a race with another writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists(_))
    }

    /// Indicates the store could not be consulted at all. Callers may retry with backoff.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Indicates a watch must be restarted from a fresh list.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired(_))
    }
}
