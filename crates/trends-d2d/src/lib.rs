//! Device-to-device layer for Trends
//!
//! Direct peer connections for chat, file transfer and audio calls. Peers
//! meet through a shared document store used only for signaling; once the
//! `d2d` data channel is open all traffic flows peer to peer.
//!
//! # Overview
//!
//! - **Signaling**: offer, answer and ICE candidates exchanged through any
//!   [`SignalingStore`], with invitations in a per-peer inbox
//! - **Protocol**: JSON envelopes on the data channel; file chunks as a
//!   header envelope followed by one binary frame
//! - **Transfers**: 16 KiB chunks with send-side backpressure
//! - **Calls**: optional audio track on the same connection
//!
//! # Example
//!
//! ```rust,no_run
//! use trends_d2d::{D2dClient, D2dConfig, MemorySignalingStore, MockMediaSource, MockNetwork,
//!     MockTransport, PeerContext};
//!
//! # async fn run() -> Result<(), trends_d2d::D2dError> {
//! let network = MockNetwork::new();
//! let ctx = PeerContext::new(
//!     "alice",
//!     MemorySignalingStore::new(),
//!     MockTransport::new(&network),
//!     MockMediaSource::new(),
//!     D2dConfig::default(),
//! );
//! let client = D2dClient::new(ctx);
//! let _invitations = client.start().await?;
//! client.start_chat("bob").await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod mock;
pub mod peer;
pub mod registry;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod signaling;
pub mod store;
pub mod transfer;
pub mod transport;
pub mod types;

pub use call::{call_status_for, CallSession, CallState, CallStatus};
pub use client::{ClientEvent, D2dClient, IgnoreReason, Invitation};
pub use codec::{
    chunk_envelope_id, complete_envelope_id, ChunkMeta, CodecError, DedupWindow, Envelope,
    FrameDecoder, FramingError, IdGenerator, Inbound, Message, MessageKind,
};
pub use config::{get_config_path, get_trends_dir, BusyPolicy, D2dConfig, SessionConfig, TransferConfig};
pub use error::D2dError;
pub use mock::{
    MemorySignalingStore, MockDataChannel, MockMediaSource, MockNetwork, MockPeerConnection,
    MockTransport,
};
pub use peer::{PeerConnectionManager, PeerContext, PeerEvent, EVENT_BACKLOG};
pub use registry::PeerRegistry;
#[cfg(feature = "webrtc")]
pub use rtc::{RtcMediaSource, RtcPeerConnection, RtcTransport};
pub use signaling::SignalingClient;
pub use store::{Document, SignalingStore, StoreError, Watch};
pub use transfer::{
    chunk_count, progress_percent, Backpressure, FileSource, ReceivedFile, TransferEngine,
    TransferError,
};
pub use transport::{
    ChannelEvent, ConnectionEvent, DataChannel, Frame, MediaError, MediaHandle, MediaKind,
    MediaSource, PeerConnection, RtcConfig, Transport, TransportError, TransportState,
};
pub use types::*;
