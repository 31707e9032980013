//! Error taxonomy of the D2D layer

use thiserror::Error;

use crate::store::StoreError;
use crate::transfer::TransferError;
use crate::transport::TransportError;
use crate::types::ConnectionStatus;

/// Errors surfaced by managers, the registry and the client API
#[derive(Debug, Error)]
pub enum D2dError {
    /// Store unreachable or write rejected. Retryable.
    #[error("Signaling failure: {0}")]
    Signaling(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Data channel not open")]
    ChannelNotOpen,

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Signaling record {0} has no offer")]
    MissingOffer(String),

    #[error("Manager for {peer} is {status:?} and cannot start a new attempt")]
    InvalidState {
        peer: String,
        status: ConnectionStatus,
    },

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("No session with peer {0}")]
    NoSession(String),
}

impl D2dError {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Signaling(_) | Self::Transport(_))
    }
}
