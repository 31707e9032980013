//! Typed signaling operations
//!
//! Wraps a [`SignalingStore`] with the record layout used for rendezvous:
//!
//! ```text
//! signals/{signalId}                    SignalingRecord
//! signals/{signalId}/offerCandidates    caller ICE candidates
//! signals/{signalId}/answerCandidates   callee ICE candidates
//! peerInbox/{receiverId}                InboxRecord
//! ```

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{field, from_document, to_document, Document, SignalingStore, StoreError, Watch};
use crate::types::{
    candidates_path, inbox_path, signal_path, IceCandidate, InboxRecord, Role, SessionDescription,
    SignalingRecord, SignalingStatus,
};

/// Signaling record operations for one local peer
#[derive(Clone)]
pub struct SignalingClient {
    store: Arc<dyn SignalingStore>,
}

impl SignalingClient {
    pub fn new(store: Arc<dyn SignalingStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SignalingStore> {
        &self.store
    }

    /// Write a new record
    pub async fn publish_record(&self, signal_id: &str, record: &SignalingRecord) -> Result<(), StoreError> {
        let path = signal_path(signal_id);
        self.store.put(&path, to_document(&path, record)?).await
    }

    pub async fn read_record(&self, signal_id: &str) -> Result<Option<SignalingRecord>, StoreError> {
        let path = signal_path(signal_id);
        match self.store.get(&path).await? {
            Some(doc) => from_document(&path, doc).map(Some),
            None => Ok(None),
        }
    }

    /// Merge the answer and mark the record connected
    pub async fn publish_answer(&self, signal_id: &str, answer: &SessionDescription) -> Result<(), StoreError> {
        let path = signal_path(signal_id);
        let answer = serde_json::to_value(answer).map_err(|e| StoreError::Malformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let mut fields = field("answer", answer);
        fields.insert("status".into(), status_value(SignalingStatus::Connected));
        self.store.put(&path, fields).await
    }

    pub async fn set_status(&self, signal_id: &str, status: SignalingStatus) -> Result<(), StoreError> {
        self.store
            .put(&signal_path(signal_id), field("status", status_value(status)))
            .await
    }

    /// Watch the record. Values that fail to parse are skipped with a warning.
    pub async fn watch_record(&self, signal_id: &str) -> Result<Watch<Option<Document>>, StoreError> {
        self.store.watch(&signal_path(signal_id)).await
    }

    pub async fn delete_record(&self, signal_id: &str) -> Result<(), StoreError> {
        self.store.delete(&signal_path(signal_id)).await
    }

    /// Invite `receiver`. Replaces any invitation already there.
    pub async fn write_inbox(&self, receiver: &str, record: &InboxRecord) -> Result<(), StoreError> {
        let path = inbox_path(receiver);
        self.store.put(&path, to_document(&path, record)?).await
    }

    pub async fn watch_inbox(&self, peer_id: &str) -> Result<Watch<Option<Document>>, StoreError> {
        self.store.watch(&inbox_path(peer_id)).await
    }

    /// Clear `receiver`'s inbox only while it still points at `signal_id`
    pub async fn withdraw_invitation(&self, receiver: &str, signal_id: &str) -> Result<(), StoreError> {
        let path = inbox_path(receiver);
        let current = match self.store.get(&path).await? {
            Some(doc) => doc,
            None => return Ok(()),
        };
        if current.get("signalId").and_then(Value::as_str) == Some(signal_id) {
            debug!(signal = %signal_id, "withdrawing invitation to {}", receiver);
            self.store.delete(&path).await?;
        }
        Ok(())
    }

    /// Publish one of our candidates
    pub async fn append_candidate(
        &self,
        signal_id: &str,
        role: Role,
        candidate: &IceCandidate,
    ) -> Result<String, StoreError> {
        let path = candidates_path(signal_id, role);
        self.store.append(&path, to_document(&path, candidate)?).await
    }

    /// Candidates the other side has published so far
    pub async fn list_candidates(&self, signal_id: &str, written_by: Role) -> Result<Vec<IceCandidate>, StoreError> {
        let path = candidates_path(signal_id, written_by);
        let docs = self.store.list(&path).await?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| parse_candidate(&path, doc))
            .collect())
    }

    pub async fn watch_candidates(&self, signal_id: &str, written_by: Role) -> Result<Watch<Document>, StoreError> {
        self.store
            .watch_collection(&candidates_path(signal_id, written_by))
            .await
    }
}

fn status_value(status: SignalingStatus) -> Value {
    serde_json::to_value(status).unwrap_or(Value::Null)
}

/// Parse a candidate document, skipping malformed ones
pub fn parse_candidate(path: &str, doc: Document) -> Option<IceCandidate> {
    match from_document(path, doc) {
        Ok(candidate) => Some(candidate),
        Err(e) => {
            warn!("Skipping malformed candidate: {}", e);
            None
        }
    }
}

/// Parse a watched record value, skipping malformed ones
pub fn parse_record(signal_id: &str, doc: Document) -> Option<SignalingRecord> {
    match from_document(&signal_path(signal_id), doc) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(signal = %signal_id, "Skipping malformed signaling record: {}", e);
            None
        }
    }
}
