//! Shared types for the D2D layer
//!
//! Identities, connection and transfer statuses, the documents exchanged
//! through the signaling store, and the protocol constants both peers must
//! agree on.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// File chunk size in bytes. Both peers must agree; changing it breaks the protocol.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Data channel label for the D2D protocol
pub const DATA_CHANNEL_LABEL: &str = "d2d";

/// Collection holding one signaling record per connection attempt
pub const SIGNALS_COLLECTION: &str = "signals";

/// Collection holding one invitation document per receiving peer
pub const INBOX_COLLECTION: &str = "peerInbox";

/// Sub-collection of caller ICE candidates
pub const OFFER_CANDIDATES: &str = "offerCandidates";

/// Sub-collection of callee ICE candidates
pub const ANSWER_CANDIDATES: &str = "answerCandidates";

/// Connection status of a Peer Connection Manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Never started, or torn down
    Idle,
    /// Signaling in progress
    Connecting,
    /// Data channel open
    Connected,
    /// Transport lost after being connected
    Disconnected,
    /// Setup failed or the attempt was rejected
    Failed,
}

impl ConnectionStatus {
    /// Connecting or Connected
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Terminal until explicit teardown
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// Whether `self -> next` is a legal forward transition.
    ///
    /// Moving back to `Idle` is only done by explicit teardown and is not
    /// covered here.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Failed)
                | (Connected, Disconnected)
                | (Connected, Failed)
        )
    }
}

/// Status field of a signaling record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingStatus {
    Pending,
    Connected,
    Rejected,
    /// Written by whichever side hangs up a call
    Ended,
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as stored in the signaling record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate. Equality is by value, which is what de-duplication relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Shared record for one connection attempt, at `signals/{signalId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingRecord {
    pub offer: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    pub caller_id: String,
    pub receiver_id: String,
    pub status: SignalingStatus,
    #[serde(default)]
    pub with_audio: bool,
    #[serde(default)]
    pub created_at: u64,
}

/// Invitation at `peerInbox/{receiverId}`. One per receiver; a newer write replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxRecord {
    pub signal_id: String,
    pub caller_id: String,
    #[serde(default)]
    pub with_audio: bool,
    #[serde(default)]
    pub timestamp: u64,
}

/// Which side of a transfer we are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

/// Transfer lifecycle. Completed, Rejected and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Rejected,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }
}

/// Observable state of one file transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferState {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub total_chunks: u32,
    /// 0..=100; capped at 99 until the transfer completes
    pub progress: u8,
}

/// Role a manager plays in its connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Build the signal id for a connection attempt between two peers.
///
/// The pair is sorted so both sides derive the same prefix.
pub fn signal_id_for(local: &str, remote: &str, millis: u64) -> String {
    let (a, b) = if local <= remote {
        (local, remote)
    } else {
        (remote, local)
    };
    format!("{}_{}_{}", a, b, millis)
}

/// Perfect negotiation: the peer with the lower id is polite and backs off on glare.
pub fn is_polite_peer(local: &str, remote: &str) -> bool {
    local < remote
}

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock milliseconds, strictly increasing within the process.
///
/// Two attempts started in the same millisecond still get distinct signal ids.
pub fn unique_millis() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = now_millis();
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Path of a signaling record
pub fn signal_path(signal_id: &str) -> String {
    format!("{}/{}", SIGNALS_COLLECTION, signal_id)
}

/// Path of a peer's inbox document
pub fn inbox_path(peer_id: &str) -> String {
    format!("{}/{}", INBOX_COLLECTION, peer_id)
}

/// Path of the candidate collection written by `role`
pub fn candidates_path(signal_id: &str, role: Role) -> String {
    let sub = match role {
        Role::Caller => OFFER_CANDIDATES,
        Role::Callee => ANSWER_CANDIDATES,
    };
    format!("{}/{}", signal_path(signal_id), sub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_id_is_symmetric() {
        assert_eq!(signal_id_for("bob", "alice", 7), "alice_bob_7");
        assert_eq!(signal_id_for("alice", "bob", 7), "alice_bob_7");
    }

    #[test]
    fn test_unique_millis_increases() {
        let a = unique_millis();
        let b = unique_millis();
        assert!(b > a);
    }

    #[test]
    fn test_polite_peer_is_exclusive() {
        assert!(is_polite_peer("alice", "bob"));
        assert!(!is_polite_peer("bob", "alice"));
    }

    #[test]
    fn test_status_transitions() {
        use ConnectionStatus::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(!Connected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Connecting));
    }

    #[test]
    fn test_signaling_record_field_names() {
        let record = SignalingRecord {
            offer: SessionDescription::offer("v=0"),
            answer: None,
            caller_id: "alice".into(),
            receiver_id: "bob".into(),
            status: SignalingStatus::Pending,
            with_audio: true,
            created_at: 1,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["offer"]["type"], "offer");
        assert_eq!(json["callerId"], "alice");
        assert_eq!(json["receiverId"], "bob");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["withAudio"], true);
        assert!(json.get("answer").is_none());
    }

    #[test]
    fn test_candidate_paths() {
        assert_eq!(
            candidates_path("a_b_1", Role::Caller),
            "signals/a_b_1/offerCandidates"
        );
        assert_eq!(
            candidates_path("a_b_1", Role::Callee),
            "signals/a_b_1/answerCandidates"
        );
        assert_eq!(inbox_path("bob"), "peerInbox/bob");
    }
}
