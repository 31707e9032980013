//! Transport abstractions
//!
//! Traits for the peer connection, its data channel and local media so the
//! Peer Connection Manager can run over webrtc-rs or over in-memory mocks.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{IceCandidate, SessionDescription};

/// Errors from transport operations
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),
    #[error("ICE candidate rejected: {0}")]
    Candidate(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Channel not open")]
    NotOpen,
    #[error("Connection closed")]
    Closed,
}

/// Local media errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("media unavailable: {0}")]
    Unavailable(String),
}

/// Underlying transport state as reported by the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// States after which the connection will not recover
    pub fn is_lost(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// One data channel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Events emitted by a data channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Message(Frame),
    Closed,
}

/// Events emitted by a peer connection
pub enum ConnectionEvent {
    /// A locally gathered ICE candidate to publish
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    /// Data channel opened by the remote side
    DataChannel(Arc<dyn DataChannel>),
    /// Remote media track
    RemoteTrack(MediaHandle),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            Self::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            Self::RemoteTrack(m) => f.debug_tuple("RemoteTrack").field(m).finish(),
        }
    }
}

/// Relay and route hints for a new connection
#[derive(Debug, Clone, Default)]
pub struct RtcConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

/// Kind of media track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
}

/// Handle to a local or remote media track.
///
/// Clones share the enabled and stopped flags.
#[derive(Debug, Clone)]
pub struct MediaHandle {
    id: String,
    kind: MediaKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl MediaHandle {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Mute or unmute
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Release the underlying device
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// Source of local capture devices
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_audio(&self) -> Result<MediaHandle, MediaError>;
}

/// Ordered, reliable data channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;

    /// Bytes queued locally and not yet handed to the network
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    /// Take the event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn close(&self);
}

/// A single peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an ordered, reliable data channel (caller side)
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Attach a local media track
    async fn add_local_media(&self, media: &MediaHandle) -> Result<(), TransportError>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer and apply it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Take the event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;

    async fn close(&self);
}

/// Factory for peer connections
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_connection(&self, config: &RtcConfig) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

#[async_trait]
impl<T: DataChannel + ?Sized> DataChannel for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        (**self).send_text(text).await
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        (**self).send_binary(data).await
    }

    async fn buffered_amount(&self) -> usize {
        (**self).buffered_amount().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        (**self).take_events()
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn create_connection(&self, config: &RtcConfig) -> Result<Arc<dyn PeerConnection>, TransportError> {
        (**self).create_connection(config).await
    }
}

#[async_trait]
impl<T: MediaSource + ?Sized> MediaSource for Arc<T> {
    async fn acquire_audio(&self) -> Result<MediaHandle, MediaError> {
        (**self).acquire_audio().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_handle_clones_share_state() {
        let handle = MediaHandle::new("mic", MediaKind::Audio);
        let clone = handle.clone();
        clone.set_enabled(false);
        assert!(!handle.is_enabled());
        handle.stop();
        assert!(clone.is_stopped());
    }

    #[test]
    fn test_lost_states() {
        assert!(TransportState::Disconnected.is_lost());
        assert!(TransportState::Closed.is_lost());
        assert!(!TransportState::Connecting.is_lost());
    }
}
