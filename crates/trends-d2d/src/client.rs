//! UI-facing D2D API
//!
//! [`D2dClient`] is what an application talks to: it listens on the local
//! inbox for invitations, resolves glare and busy situations, and routes
//! chat, file and call operations to the right [`PeerConnectionManager`].

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::{CallSession, CallStatus};
use crate::codec::{DedupWindow, Envelope};
use crate::config::BusyPolicy;
use crate::error::D2dError;
use crate::peer::{PeerConnectionManager, PeerContext};
use crate::registry::PeerRegistry;
use crate::signaling::{parse_record, SignalingClient};
use crate::store::from_document;
use crate::transfer::FileSource;
use crate::types::{
    inbox_path, is_polite_peer, ConnectionStatus, FileTransferState, InboxRecord, Role,
    SignalingStatus,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// An invitation read from our inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub signal_id: String,
    pub caller_id: String,
    pub with_audio: bool,
}

impl From<InboxRecord> for Invitation {
    fn from(record: InboxRecord) -> Self {
        Self {
            signal_id: record.signal_id,
            caller_id: record.caller_id,
            with_audio: record.with_audio,
        }
    }
}

/// Why an invitation was not surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Both sides called each other and we kept our own attempt
    Glare,
    /// A live connection with the caller already exists
    AlreadyConnected,
    /// Another call is ringing or in progress
    Busy,
}

/// Events from the inbox listener
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A call, or a chat when auto-answer is off, waiting for the user
    Incoming(Invitation),
    /// A chat invitation was answered automatically
    ChatAnswered { peer_id: String, signal_id: String },
    /// A ringing invitation was withdrawn in favour of a newer one
    Superseded(Invitation),
    /// The caller gave up on a ringing invitation before it was answered
    Withdrawn(Invitation),
    Ignored {
        invitation: Invitation,
        reason: IgnoreReason,
    },
}

struct ClientState {
    inbox_task: Option<JoinHandle<()>>,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
    seen: DedupWindow,
    ringing: Option<Invitation>,
    ring_watch: Option<JoinHandle<()>>,
}

/// Entry point for a local peer
pub struct D2dClient {
    ctx: Arc<PeerContext>,
    registry: Arc<PeerRegistry>,
    state: Mutex<ClientState>,
}

impl D2dClient {
    pub fn new(ctx: Arc<PeerContext>) -> Arc<Self> {
        let window = ctx.config().session.dedup_window;
        Arc::new(Self {
            registry: PeerRegistry::new(ctx.clone()),
            ctx,
            state: Mutex::new(ClientState {
                inbox_task: None,
                events: None,
                seen: DedupWindow::new(window),
                ringing: None,
                ring_watch: None,
            }),
        })
    }

    pub fn local_peer_id(&self) -> &str {
        self.ctx.local_peer_id()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    fn signaling(&self) -> &SignalingClient {
        self.ctx.signaling()
    }

    /// The call currently waiting for an answer, if any
    pub fn ringing(&self) -> Option<Invitation> {
        lock(&self.state).ringing.clone()
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(tx) = &lock(&self.state).events {
            let _ = tx.send(event);
        }
    }

    // ========================================================================
    // Inbox
    // ========================================================================

    /// Start listening for invitations. Calling again replaces the listener.
    pub async fn start(self: &Arc<Self>) -> Result<mpsc::UnboundedReceiver<ClientEvent>, D2dError> {
        let mut watch = self.signaling().watch_inbox(self.local_peer_id()).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let this = Arc::downgrade(self);
        let path = inbox_path(self.local_peer_id());
        let task = tokio::spawn(async move {
            while let Some(value) = watch.next().await {
                let Some(doc) = value else { continue };
                let Some(client) = this.upgrade() else { break };
                match from_document::<InboxRecord>(&path, doc) {
                    Ok(record) => client.handle_invitation(record.into()).await,
                    Err(e) => warn!("Skipping malformed invitation: {}", e),
                }
            }
        });

        let previous = {
            let mut state = lock(&self.state);
            state.events = Some(tx);
            state.inbox_task.replace(task)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("Listening for invitations to {}", self.local_peer_id());
        Ok(rx)
    }

    async fn handle_invitation(self: &Arc<Self>, invitation: Invitation) {
        let local = self.local_peer_id().to_string();
        if invitation.caller_id == local {
            debug!("Ignoring invitation from ourselves ({})", invitation.signal_id);
            return;
        }
        if !lock(&self.state).seen.observe(&invitation.signal_id) {
            debug!("Already handled invitation {}", invitation.signal_id);
            return;
        }
        if let Err(e) = self
            .signaling()
            .withdraw_invitation(&local, &invitation.signal_id)
            .await
        {
            warn!("Failed to clear inbox of {}: {}", local, e);
        }

        if let Some(existing) = self.registry.get_live(&invitation.caller_id) {
            let glare = existing.role() == Some(Role::Caller)
                && existing.status() == ConnectionStatus::Connecting;
            if invitation.with_audio && !existing.with_audio() {
                // The caller replaced its chat with a call; our side of the
                // chat may not have noticed the old link closing yet
                info!("{} upgraded the chat to a call", invitation.caller_id);
                self.registry.remove_if_same(&existing);
            } else if glare && is_polite_peer(&local, &invitation.caller_id) {
                info!(
                    "Both sides called {}; yielding to signal {}",
                    invitation.caller_id, invitation.signal_id
                );
                self.registry.remove_if_same(&existing);
            } else {
                let reason = if glare {
                    IgnoreReason::Glare
                } else {
                    IgnoreReason::AlreadyConnected
                };
                debug!(
                    "Ignoring invitation {} from {}: {:?}",
                    invitation.signal_id, invitation.caller_id, reason
                );
                self.emit(ClientEvent::Ignored { invitation, reason });
                return;
            }
        }

        if invitation.with_audio {
            self.ring(invitation).await;
        } else if self.ctx.config().session.auto_answer_chat {
            let manager = self.registry.get_or_create(&invitation.caller_id);
            match manager.answer(&invitation.signal_id).await {
                Ok(()) => self.emit(ClientEvent::ChatAnswered {
                    peer_id: invitation.caller_id,
                    signal_id: invitation.signal_id,
                }),
                Err(e) => warn!("Failed to answer {}: {}", invitation.caller_id, e),
            }
        } else {
            self.emit(ClientEvent::Incoming(invitation));
        }
    }

    /// Surface an incoming call, applying the busy policy
    async fn ring(self: &Arc<Self>, invitation: Invitation) {
        let in_call = self.registry.live_managers().iter().any(|m| m.with_audio());
        let ringing = self.ringing();

        if in_call || (ringing.is_some() && self.ctx.config().session.busy_policy == BusyPolicy::Reject) {
            info!("Busy; rejecting call from {}", invitation.caller_id);
            self.reject_signal(&invitation.signal_id).await;
            self.emit(ClientEvent::Ignored {
                invitation,
                reason: IgnoreReason::Busy,
            });
            return;
        }
        if let Some(previous) = ringing {
            info!(
                "Call from {} replaces ringing call from {}",
                invitation.caller_id, previous.caller_id
            );
            self.clear_ringing(&previous.signal_id);
            self.reject_signal(&previous.signal_id).await;
            self.emit(ClientEvent::Superseded(previous));
        }

        let watch = match self.signaling().watch_record(&invitation.signal_id).await {
            Ok(watch) => Some(watch),
            Err(e) => {
                warn!("Cannot watch ringing call {}: {}", invitation.signal_id, e);
                None
            }
        };
        lock(&self.state).ringing = Some(invitation.clone());
        info!("Incoming call from {}", invitation.caller_id);
        let signal_id = invitation.signal_id.clone();
        self.emit(ClientEvent::Incoming(invitation));

        if let Some(mut watch) = watch {
            let this = Arc::downgrade(self);
            let watched = signal_id.clone();
            let task = tokio::spawn(async move {
                while let Some(value) = watch.next().await {
                    let over = match value {
                        None => true,
                        Some(doc) => parse_record(&watched, doc).is_some_and(|r| {
                            matches!(r.status, SignalingStatus::Ended | SignalingStatus::Rejected)
                        }),
                    };
                    if !over {
                        continue;
                    }
                    let Some(client) = this.upgrade() else { break };
                    if let Some(invitation) = client.clear_ringing(&watched) {
                        info!("{} stopped calling", invitation.caller_id);
                        client.emit(ClientEvent::Withdrawn(invitation));
                    }
                    break;
                }
            });
            let mut state = lock(&self.state);
            let still_ringing = state.ringing.as_ref().map(|r| r.signal_id.as_str()) == Some(signal_id.as_str());
            if still_ringing {
                if let Some(previous) = state.ring_watch.replace(task) {
                    previous.abort();
                }
            } else {
                task.abort();
            }
        }
    }

    async fn reject_signal(&self, signal_id: &str) {
        if let Err(e) = self
            .signaling()
            .set_status(signal_id, SignalingStatus::Rejected)
            .await
        {
            warn!("Failed to reject {}: {}", signal_id, e);
        }
    }

    /// Stop ringing `signal_id`, returning the invitation if it was ringing
    fn clear_ringing(&self, signal_id: &str) -> Option<Invitation> {
        let (invitation, watch) = {
            let mut state = lock(&self.state);
            if state.ringing.as_ref().map(|r| r.signal_id.as_str()) != Some(signal_id) {
                return None;
            }
            (state.ringing.take(), state.ring_watch.take())
        };
        if let Some(watch) = watch {
            watch.abort();
        }
        invitation
    }

    // ========================================================================
    // Chat and files
    // ========================================================================

    /// Open a data-only session with `peer_id`, reusing a live one
    pub async fn start_chat(&self, peer_id: &str) -> Result<Arc<PeerConnectionManager>, D2dError> {
        let manager = self.registry.get_or_create(peer_id);
        if manager.is_fresh() {
            match manager.connect(false).await {
                Ok(_) => {}
                // Lost a race with another starter; the manager is already running
                Err(D2dError::InvalidState { .. }) if manager.is_live() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(manager)
    }

    /// Answer an invitation surfaced as [`ClientEvent::Incoming`] without audio
    pub async fn answer_chat(&self, invitation: &Invitation) -> Result<Arc<PeerConnectionManager>, D2dError> {
        let manager = self.registry.get_or_create(&invitation.caller_id);
        manager.answer(&invitation.signal_id).await?;
        Ok(manager)
    }

    /// Tear down the session with `peer_id`
    pub fn end_chat(&self, peer_id: &str) -> bool {
        self.registry.remove(peer_id)
    }

    fn session(&self, peer_id: &str) -> Result<Arc<PeerConnectionManager>, D2dError> {
        self.registry
            .get(peer_id)
            .ok_or_else(|| D2dError::NoSession(peer_id.to_string()))
    }

    pub async fn send_message(&self, peer_id: &str, text: &str) -> Result<Envelope, D2dError> {
        self.session(peer_id)?.send_chat(text).await
    }

    pub async fn send_typing(&self, peer_id: &str) -> Result<Envelope, D2dError> {
        self.session(peer_id)?.send_typing().await
    }

    pub async fn send_file(&self, peer_id: &str, source: FileSource) -> Result<FileTransferState, D2dError> {
        self.session(peer_id)?.send_file(source).await
    }

    pub async fn accept_file(&self, peer_id: &str, transfer_id: &str) -> Result<FileTransferState, D2dError> {
        self.session(peer_id)?.accept_file(transfer_id).await
    }

    pub async fn reject_file(&self, peer_id: &str, transfer_id: &str) -> Result<FileTransferState, D2dError> {
        self.session(peer_id)?.reject_file(transfer_id).await
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call `peer_id`. A live data-only session is replaced, since the call
    /// connection carries the data channel too.
    pub async fn start_call(&self, peer_id: &str, with_audio: bool) -> Result<CallSession, D2dError> {
        if let Some(existing) = self.registry.get_live(peer_id) {
            if existing.with_audio() {
                return Err(D2dError::InvalidState {
                    peer: peer_id.to_string(),
                    status: existing.status(),
                });
            }
            debug!("Replacing chat session with {} by a call", peer_id);
            existing.hang_up().await;
            self.registry.remove_if_same(&existing);
        }
        let manager = self.registry.get_or_create(peer_id);
        let events = manager.subscribe();
        manager.connect(with_audio).await?;
        Ok(CallSession::new(
            manager,
            self.registry.clone(),
            events,
            CallStatus::Outgoing,
            self.ctx.config().ring_timeout(),
        ))
    }

    /// Pick up a ringing call
    pub async fn answer_call(&self, invitation: &Invitation) -> Result<CallSession, D2dError> {
        self.clear_ringing(&invitation.signal_id);
        if let Some(existing) = self.registry.get_live(&invitation.caller_id) {
            debug!("Replacing session with {} by incoming call", invitation.caller_id);
            self.registry.remove_if_same(&existing);
        }
        let manager = self.registry.get_or_create(&invitation.caller_id);
        let events = manager.subscribe();
        manager.answer(&invitation.signal_id).await?;
        Ok(CallSession::new(
            manager,
            self.registry.clone(),
            events,
            CallStatus::Incoming,
            None,
        ))
    }

    /// Decline a ringing call
    pub async fn reject_call(&self, invitation: &Invitation) -> Result<(), D2dError> {
        self.clear_ringing(&invitation.signal_id);
        info!("Rejecting call from {}", invitation.caller_id);
        self.signaling()
            .set_status(&invitation.signal_id, SignalingStatus::Rejected)
            .await?;
        Ok(())
    }

    /// Stop listening and tear down every session
    pub fn shutdown(&self) {
        let (inbox, ring) = {
            let mut state = lock(&self.state);
            state.events = None;
            state.ringing = None;
            (state.inbox_task.take(), state.ring_watch.take())
        };
        for task in [inbox, ring].into_iter().flatten() {
            task.abort();
        }
        self.registry.cleanup_all();
        info!("D2D client {} shut down", self.local_peer_id());
    }
}

impl Drop for D2dClient {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        for task in [state.inbox_task.take(), state.ring_watch.take()].into_iter().flatten() {
            task.abort();
        }
    }
}
