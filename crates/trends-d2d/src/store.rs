//! Signaling store contract
//!
//! A watchable document store used only for rendezvous: offers, answers,
//! ICE candidates and inbox invitations. Any backend with document get/put,
//! change subscriptions and append-only sub-collections can implement it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// A stored document: a JSON object of top-level fields
pub type Document = Map<String, Value>;

/// Signaling store errors. All of them are retryable from the caller's side.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("malformed document at {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// Live subscription handle. Delivery stops when it is dropped.
pub struct Watch<T> {
    rx: mpsc::UnboundedReceiver<T>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Watch<T> {
    /// Wrap a receiver; `on_drop` detaches the subscription from the backend.
    pub fn new(rx: mpsc::UnboundedReceiver<T>, on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Next delivered value, or `None` once the backend stops delivering.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking poll
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stop watching
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Watch<T> {
    fn drop(&mut self) {
        if let Some(detach) = self.on_drop.take() {
            detach();
        }
    }
}

/// Watchable document store used for signaling
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Upsert `fields` into the document at `path`, keeping other fields
    async fn put(&self, path: &str, fields: Document) -> Result<(), StoreError>;

    /// Read a document
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError>;

    /// Subscribe to a document. The current value is delivered first,
    /// `None` means absent or deleted.
    async fn watch(&self, path: &str) -> Result<Watch<Option<Document>>, StoreError>;

    /// Delete a document together with its sub-collections
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Append to an append-only collection, returning the item id
    async fn append(&self, collection: &str, item: Document) -> Result<String, StoreError>;

    /// One-shot read of a collection, in append order
    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError>;

    /// Subscribe to items appended after this call
    async fn watch_collection(&self, collection: &str) -> Result<Watch<Document>, StoreError>;
}

#[async_trait]
impl<T: SignalingStore + ?Sized> SignalingStore for Arc<T> {
    async fn put(&self, path: &str, fields: Document) -> Result<(), StoreError> {
        (**self).put(path, fields).await
    }

    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        (**self).get(path).await
    }

    async fn watch(&self, path: &str) -> Result<Watch<Option<Document>>, StoreError> {
        (**self).watch(path).await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        (**self).delete(path).await
    }

    async fn append(&self, collection: &str, item: Document) -> Result<String, StoreError> {
        (**self).append(collection, item).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        (**self).list(collection).await
    }

    async fn watch_collection(&self, collection: &str) -> Result<Watch<Document>, StoreError> {
        (**self).watch_collection(collection).await
    }
}

/// Serialize a record into a document
pub fn to_document<T: Serialize>(path: &str, value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Malformed {
            path: path.to_string(),
            reason: format!("expected an object, got {}", other),
        }),
        Err(e) => Err(StoreError::Malformed {
            path: path.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Deserialize a document into a record
pub fn from_document<T: DeserializeOwned>(path: &str, doc: Document) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(doc)).map_err(|e| StoreError::Malformed {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Build a document from a single field
pub fn field(name: &str, value: impl Into<Value>) -> Document {
    let mut doc = Document::new();
    doc.insert(name.to_string(), value.into());
    doc
}
