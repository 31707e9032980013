//! WebRTC transport backed by the `webrtc` crate
//!
//! Callbacks registered on the native objects are turned into the event
//! queues the transport traits expose. Audio capture is left to the
//! application, which feeds encoded Opus frames to
//! [`RtcPeerConnection::write_audio_sample`]. Muting is honoured there.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::transport::{
    ChannelEvent, ConnectionEvent, DataChannel, Frame, MediaError, MediaHandle, MediaKind,
    MediaSource, PeerConnection, RtcConfig, Transport, TransportError, TransportState,
};
use crate::types::{IceCandidate, SdpKind, SessionDescription};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn failed(e: impl std::fmt::Display) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

// ============================================================================
// Data channel
// ============================================================================

struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl RtcDataChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let message_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let frame = if msg.is_string {
                String::from_utf8(msg.data.to_vec())
                    .map(Frame::Text)
                    .map_err(|e| warn!("Dropping non-UTF-8 text frame: {}", e))
                    .ok()
            } else {
                Some(Frame::Binary(msg.data))
            };
            if let Some(frame) = frame {
                let _ = message_tx.send(ChannelEvent::Message(frame));
            }
            Box::pin(async {})
        }));

        let close_tx = tx.clone();
        dc.on_close(Box::new(move || {
            let _ = close_tx.send(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        // Remote channels may already be open when handed over
        if dc.ready_state() == RTCDataChannelState::Open {
            let _ = tx.send(ChannelEvent::Open);
        }

        Arc::new(Self {
            label: dc.label().to_string(),
            dc,
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        lock(&self.events).take()
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

// ============================================================================
// Peer connection
// ============================================================================

/// A `webrtc` peer connection adapted to [`PeerConnection`]
pub struct RtcPeerConnection {
    connection: Arc<RTCPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    local_audio: Mutex<Option<LocalAudio>>,
}

struct LocalAudio {
    track: Arc<TrackLocalStaticSample>,
    handle: MediaHandle,
}

impl RtcPeerConnection {
    fn wrap(connection: Arc<RTCPeerConnection>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let state_tx = tx.clone();
        connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = match s {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => TransportState::New,
                RTCPeerConnectionState::Connecting => TransportState::Connecting,
                RTCPeerConnectionState::Connected => TransportState::Connected,
                RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                RTCPeerConnectionState::Failed => TransportState::Failed,
                RTCPeerConnectionState::Closed => TransportState::Closed,
            };
            let _ = state_tx.send(ConnectionEvent::StateChanged(state));
            Box::pin(async {})
        }));

        let candidate_tx = tx.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(json) => {
                        let _ = tx.send(ConnectionEvent::LocalCandidate(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_m_line_index: json.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let channel_tx = tx.clone();
        connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel: Arc<dyn DataChannel> = RtcDataChannel::wrap(dc);
            let _ = channel_tx.send(ConnectionEvent::DataChannel(channel));
            Box::pin(async {})
        }));

        let track_tx = tx;
        connection.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            debug!("Remote track {}", track.id());
            let _ = track_tx.send(ConnectionEvent::RemoteTrack(MediaHandle::new(
                track.id(),
                MediaKind::Audio,
            )));
            Box::pin(async {})
        }));

        Arc::new(Self {
            connection,
            events: Mutex::new(Some(rx)),
            local_audio: Mutex::new(None),
        })
    }

    /// Opus track for the local microphone, once media has been added.
    ///
    /// Writing to the track directly bypasses mute; use
    /// [`write_audio_sample`](Self::write_audio_sample) unless the writer
    /// checks [`MediaHandle::is_enabled`] itself.
    pub fn local_audio_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        lock(&self.local_audio).as_ref().map(|a| a.track.clone())
    }

    /// Send one encoded Opus frame. Returns `false` without sending while
    /// the microphone is muted or stopped, or before media was added.
    pub async fn write_audio_sample(&self, data: Bytes, duration: Duration) -> Result<bool, TransportError> {
        let local = lock(&self.local_audio)
            .as_ref()
            .map(|a| (a.track.clone(), a.handle.clone()));
        let Some((track, handle)) = local else {
            return Ok(false);
        };
        if !handle.is_enabled() {
            return Ok(false);
        }
        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(failed)?;
        Ok(true)
    }
}

fn to_native(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let native = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    native.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(failed)?;
        Ok(RtcDataChannel::wrap(dc))
    }

    async fn add_local_media(&self, media: &MediaHandle) -> Result<(), TransportError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            media.id().to_string(),
            "trends-d2d".to_owned(),
        ));
        self.connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(failed)?;
        *lock(&self.local_audio) = Some(LocalAudio {
            track,
            handle: media.clone(),
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.connection.create_offer(None).await.map_err(failed)?;
        self.connection
            .set_local_description(offer.clone())
            .await
            .map_err(failed)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.connection.create_answer(None).await.map_err(failed)?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(failed)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.connection
            .set_remote_description(to_native(desc)?)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.connection.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        lock(&self.events).take()
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            debug!("Error closing peer connection: {}", e);
        }
    }
}

// ============================================================================
// Transport and media
// ============================================================================

/// Creates `webrtc` peer connections with Opus registered
pub struct RtcTransport {
    api: API,
}

impl RtcTransport {
    pub fn new() -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(failed)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(failed)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl Transport for RtcTransport {
    async fn create_connection(&self, config: &RtcConfig) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let connection = self
            .api
            .new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(failed)?;
        Ok(RtcPeerConnection::wrap(connection))
    }
}

/// Hands out audio handles for the application's capture pipeline
#[derive(Default)]
pub struct RtcMediaSource {
    denied: std::sync::atomic::AtomicBool,
}

impl RtcMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the platform refused microphone access
    pub fn set_permission_denied(&self, denied: bool) {
        self.denied
            .store(denied, std::sync::atomic::Ordering::Relaxed);
    }
}

#[async_trait]
impl MediaSource for RtcMediaSource {
    async fn acquire_audio(&self) -> Result<MediaHandle, MediaError> {
        if self.denied.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(MediaError::PermissionDenied);
        }
        Ok(MediaHandle::new(
            format!("audio_{}", uuid::Uuid::new_v4().simple()),
            MediaKind::Audio,
        ))
    }
}
