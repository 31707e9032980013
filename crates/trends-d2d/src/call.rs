//! Call Session Adapter
//!
//! Turns a manager's connection statuses into call statuses, and keeps
//! mute, speaker and duration state for the UI.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;

use crate::peer::{PeerConnectionManager, PeerEvent};
use crate::registry::PeerRegistry;
use crate::types::ConnectionStatus;

/// UI-facing call status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    /// We are ringing the remote peer
    Outgoing,
    /// The remote peer is calling us
    Incoming,
    Connected,
    Ended,
}

/// Map a connection status onto the call status that follows `current`
pub fn call_status_for(current: CallStatus, status: ConnectionStatus) -> CallStatus {
    if current == CallStatus::Ended {
        return CallStatus::Ended;
    }
    match status {
        ConnectionStatus::Connecting => match current {
            CallStatus::Idle => CallStatus::Outgoing,
            other => other,
        },
        ConnectionStatus::Connected => CallStatus::Connected,
        ConnectionStatus::Disconnected | ConnectionStatus::Failed => CallStatus::Ended,
        ConnectionStatus::Idle => match current {
            CallStatus::Idle => CallStatus::Idle,
            _ => CallStatus::Ended,
        },
    }
}

/// Snapshot of a call
#[derive(Debug, Clone)]
pub struct CallState {
    pub status: CallStatus,
    pub remote_peer_id: String,
    pub muted: bool,
    pub speaker_on: bool,
    /// Local microphone is attached
    pub local_audio: bool,
    /// Remote audio track arrived
    pub remote_audio: bool,
    connected_at: Option<Instant>,
    ended_at: Option<Instant>,
}

impl CallState {
    fn new(remote_peer_id: String, status: CallStatus) -> Self {
        Self {
            status,
            remote_peer_id,
            muted: false,
            speaker_on: false,
            local_audio: false,
            remote_audio: false,
            connected_at: None,
            ended_at: None,
        }
    }

    /// Time spent connected
    pub fn duration(&self) -> Duration {
        match self.connected_at {
            Some(start) => self.ended_at.unwrap_or_else(Instant::now) - start,
            None => Duration::ZERO,
        }
    }
}

/// One call with one peer.
///
/// The session owns the manager's event queue while it lives; every event
/// is handed back from [`CallSession::next_event`] after the call state
/// has been updated.
pub struct CallSession {
    manager: Arc<PeerConnectionManager>,
    registry: Arc<PeerRegistry>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    state: CallState,
    ring_deadline: Option<Instant>,
}

impl CallSession {
    pub(crate) fn new(
        manager: Arc<PeerConnectionManager>,
        registry: Arc<PeerRegistry>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        direction: CallStatus,
        ring_timeout: Option<Duration>,
    ) -> Self {
        let mut state = CallState::new(manager.remote_peer_id().to_string(), direction);
        state.local_audio = manager.local_media().is_some();
        let ring_deadline = match direction {
            CallStatus::Outgoing => ring_timeout.map(|t| Instant::now() + t),
            _ => None,
        };
        Self {
            manager,
            registry,
            events,
            state,
            ring_deadline,
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn status(&self) -> CallStatus {
        self.state.status
    }

    pub fn manager(&self) -> &Arc<PeerConnectionManager> {
        &self.manager
    }

    /// Fold one manager event into the call state
    pub fn apply(&mut self, event: &PeerEvent) {
        match event {
            PeerEvent::StatusChanged(status) => {
                let next = call_status_for(self.state.status, *status);
                if next == self.state.status {
                    return;
                }
                match next {
                    CallStatus::Connected => {
                        self.state.connected_at.get_or_insert_with(Instant::now);
                        self.ring_deadline = None;
                        self.state.local_audio = self.manager.local_media().is_some();
                    }
                    CallStatus::Ended => self.mark_ended(),
                    _ => {}
                }
                self.state.status = next;
            }
            PeerEvent::RemoteMedia(_) => self.state.remote_audio = true,
            PeerEvent::MediaDegraded(_) => self.state.local_audio = false,
            _ => {}
        }
    }

    fn mark_ended(&mut self) {
        self.state.status = CallStatus::Ended;
        self.state.ended_at.get_or_insert_with(Instant::now);
        self.ring_deadline = None;
        self.registry.remove_if_same(&self.manager);
    }

    /// Next manager event. Returns `None` once the call has ended and no
    /// events remain. An unanswered outgoing call is ended when the ring
    /// timeout passes.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        if self.state.status == CallStatus::Ended {
            let event = self.events.try_recv().ok()?;
            self.apply(&event);
            return Some(event);
        }
        let event = match self.ring_deadline {
            Some(deadline) => {
                tokio::select! {
                    event = self.events.recv() => event,
                    _ = tokio::time::sleep_until(deadline) => {
                        info!("No answer from {}, ending call", self.state.remote_peer_id);
                        self.end().await;
                        self.events.try_recv().ok()
                    }
                }
            }
            None => self.events.recv().await,
        };
        if let Some(event) = &event {
            self.apply(event);
        }
        event
    }

    /// Mute or unmute the microphone. Returns the new muted state.
    pub fn toggle_mute(&mut self) -> bool {
        if let Some(media) = self.manager.local_media() {
            let muted = !self.state.muted;
            media.set_enabled(!muted);
            self.state.muted = muted;
        }
        self.state.muted
    }

    /// Flip audio output routing. Returns the new speaker state.
    pub fn toggle_speaker(&mut self) -> bool {
        self.state.speaker_on = !self.state.speaker_on;
        self.state.speaker_on
    }

    /// Hang up: mark the signaling record ended and release the manager
    pub async fn end(&mut self) {
        if self.state.status == CallStatus::Ended {
            return;
        }
        info!("Ending call with {}", self.state.remote_peer_id);
        self.manager.hang_up().await;
        self.mark_ended();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        use CallStatus::*;
        assert_eq!(call_status_for(Idle, ConnectionStatus::Connecting), Outgoing);
        assert_eq!(call_status_for(Incoming, ConnectionStatus::Connecting), Incoming);
        assert_eq!(call_status_for(Outgoing, ConnectionStatus::Connected), Connected);
        assert_eq!(call_status_for(Connected, ConnectionStatus::Disconnected), Ended);
        assert_eq!(call_status_for(Outgoing, ConnectionStatus::Failed), Ended);
        assert_eq!(call_status_for(Connected, ConnectionStatus::Idle), Ended);
        assert_eq!(call_status_for(Idle, ConnectionStatus::Idle), Idle);
        assert_eq!(call_status_for(Ended, ConnectionStatus::Connected), Ended);
    }

    #[test]
    fn test_duration_zero_before_connect() {
        let state = CallState::new("bob".into(), CallStatus::Outgoing);
        assert_eq!(state.duration(), Duration::ZERO);
    }
}
