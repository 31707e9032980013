//! Peer Connection Manager
//!
//! Owns the connection to one remote peer: offer/answer and ICE exchange
//! through the signaling store, the `d2d` data channel, optional local
//! audio, and the file transfers running over that channel.
//!
//! All I/O runs on tasks spawned by the manager. They report back through
//! a single queue of [`PeerEvent`]s obtained with [`PeerConnectionManager::subscribe`].

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{ChunkMeta, DedupWindow, Envelope, FrameDecoder, IdGenerator, Inbound, Message};
use crate::config::D2dConfig;
use crate::error::D2dError;
use crate::signaling::{parse_candidate, parse_record, SignalingClient};
use crate::store::{Document, SignalingStore, Watch};
use crate::transfer::{
    stream_chunks, ChunkSink, FileSource, OutgoingJob, ReceivedFile, TransferEngine, TransferError,
};
use crate::transport::{
    ChannelEvent, ConnectionEvent, DataChannel, MediaError, MediaHandle, MediaSource,
    PeerConnection, Transport, TransportError,
};
use crate::types::{
    candidates_path, now_millis, signal_id_for, unique_millis, ConnectionStatus, FileTransferState,
    IceCandidate, InboxRecord, Role, SdpKind, SessionDescription, SignalingRecord,
    SignalingStatus, DATA_CHANNEL_LABEL,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Everything a manager needs from its surroundings
pub struct PeerContext {
    local_peer_id: String,
    signaling: SignalingClient,
    transport: Arc<dyn Transport>,
    media: Arc<dyn MediaSource>,
    config: D2dConfig,
    ids: IdGenerator,
}

impl PeerContext {
    pub fn new(
        local_peer_id: impl Into<String>,
        store: Arc<dyn SignalingStore>,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaSource>,
        config: D2dConfig,
    ) -> Arc<Self> {
        let local_peer_id = local_peer_id.into();
        Arc::new(Self {
            ids: IdGenerator::new(&local_peer_id),
            local_peer_id,
            signaling: SignalingClient::new(store),
            transport,
            media,
            config,
        })
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    pub fn config(&self) -> &D2dConfig {
        &self.config
    }

    /// Fresh envelope id
    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }
}

/// Events published by a manager
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StatusChanged(ConnectionStatus),
    /// Chat, typing and ping envelopes, de-duplicated
    Message(Envelope),
    ChunkReceived {
        transfer_id: String,
        chunk_index: u32,
        len: usize,
    },
    Transfer(FileTransferState),
    FileReceived(ReceivedFile),
    RemoteMedia(MediaHandle),
    /// Local media could not be acquired; the session continues without it
    MediaDegraded(MediaError),
}

/// Events kept for a manager nobody has subscribed to yet. Older ones are
/// dropped first.
pub const EVENT_BACKLOG: usize = 512;

/// Single-subscriber event queue. Up to [`EVENT_BACKLOG`] events published
/// before the first subscription are kept for it.
struct EventBus {
    inner: Mutex<BusState>,
}

struct BusState {
    subscriber: Option<mpsc::UnboundedSender<PeerEvent>>,
    backlog: VecDeque<PeerEvent>,
}

impl EventBus {
    fn new() -> Self {
        Self {
            inner: Mutex::new(BusState {
                subscriber: None,
                backlog: VecDeque::new(),
            }),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.inner);
        for event in state.backlog.drain(..) {
            let _ = tx.send(event);
        }
        state.subscriber = Some(tx);
        rx
    }

    fn publish(&self, event: PeerEvent) {
        let mut state = lock(&self.inner);
        match &state.subscriber {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => {
                if state.backlog.len() >= EVENT_BACKLOG {
                    state.backlog.pop_front();
                }
                state.backlog.push_back(event);
            }
        }
    }
}

/// Serializes writers so a chunk header and its binary frame stay adjacent
pub struct ChannelWriter {
    channel: Arc<dyn DataChannel>,
    send_lock: tokio::sync::Mutex<()>,
}

impl ChannelWriter {
    fn new(channel: Arc<dyn DataChannel>) -> Self {
        Self {
            channel,
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn write_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = envelope
            .encode()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let _guard = self.send_lock.lock().await;
        self.channel.send_text(text).await
    }
}

#[async_trait]
impl ChunkSink for ChannelWriter {
    async fn buffered_amount(&self) -> usize {
        self.channel.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    async fn send_chunk(&self, meta: Envelope, data: Bytes) -> Result<(), TransportError> {
        let text = meta
            .encode()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let _guard = self.send_lock.lock().await;
        self.channel.send_text(text).await?;
        self.channel.send_binary(data).await
    }

    async fn send_envelope(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.write_envelope(&envelope).await
    }
}

struct Inner {
    status: ConnectionStatus,
    started: bool,
    disposed: bool,
    role: Option<Role>,
    with_audio: bool,
    signal_id: Option<String>,
    connection: Option<Arc<dyn PeerConnection>>,
    channel: Option<Arc<ChannelWriter>>,
    local_media: Option<MediaHandle>,
    remote_media: Option<MediaHandle>,
    media_degraded: bool,
    remote_applied: bool,
    answer_taken: bool,
    seen_candidates: HashSet<IceCandidate>,
    pending_candidates: Vec<IceCandidate>,
    tasks: Vec<JoinHandle<()>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            started: false,
            disposed: false,
            role: None,
            with_audio: false,
            signal_id: None,
            connection: None,
            channel: None,
            local_media: None,
            remote_media: None,
            media_degraded: false,
            remote_applied: false,
            answer_taken: false,
            seen_candidates: HashSet::new(),
            pending_candidates: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

/// Resources released by teardown
struct Released {
    tasks: Vec<JoinHandle<()>>,
    connection: Option<Arc<dyn PeerConnection>>,
    channel: Option<Arc<ChannelWriter>>,
    local_media: Option<MediaHandle>,
    signal_id: Option<String>,
    role: Option<Role>,
}

/// Manages the connection to one remote peer
pub struct PeerConnectionManager {
    remote_peer_id: String,
    ctx: Arc<PeerContext>,
    inner: Mutex<Inner>,
    engine: Mutex<TransferEngine>,
    bus: EventBus,
    this: Weak<PeerConnectionManager>,
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("remote_peer_id", &self.remote_peer_id)
            .finish_non_exhaustive()
    }
}

impl PeerConnectionManager {
    pub fn new(remote_peer_id: impl Into<String>, ctx: Arc<PeerContext>) -> Arc<Self> {
        let remote_peer_id = remote_peer_id.into();
        Arc::new_cyclic(|this| Self {
            remote_peer_id,
            ctx,
            inner: Mutex::new(Inner::new()),
            engine: Mutex::new(TransferEngine::new()),
            bus: EventBus::new(),
            this: this.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner).status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Connecting or Connected
    pub fn is_live(&self) -> bool {
        self.status().is_live()
    }

    /// Never started and not torn down
    pub fn is_fresh(&self) -> bool {
        let inner = lock(&self.inner);
        !inner.started && !inner.disposed
    }

    pub fn role(&self) -> Option<Role> {
        lock(&self.inner).role
    }

    pub fn signal_id(&self) -> Option<String> {
        lock(&self.inner).signal_id.clone()
    }

    pub fn with_audio(&self) -> bool {
        lock(&self.inner).with_audio
    }

    pub fn local_media(&self) -> Option<MediaHandle> {
        lock(&self.inner).local_media.clone()
    }

    pub fn remote_media(&self) -> Option<MediaHandle> {
        lock(&self.inner).remote_media.clone()
    }

    /// Audio was requested but could not be acquired
    pub fn is_media_degraded(&self) -> bool {
        lock(&self.inner).media_degraded
    }

    pub fn transfer(&self, transfer_id: &str) -> Option<FileTransferState> {
        lock(&self.engine).get(transfer_id)
    }

    pub fn transfers(&self) -> Vec<FileTransferState> {
        lock(&self.engine).list()
    }

    /// Take the event queue. A later call replaces the previous subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        self.bus.subscribe()
    }

    fn publish(&self, event: PeerEvent) {
        self.bus.publish(event);
    }

    fn publish_transfers(&self, states: Vec<FileTransferState>) {
        for state in states {
            self.publish(PeerEvent::Transfer(state));
        }
    }

    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    /// Call the remote peer. Returns the signal id of the attempt.
    pub async fn connect(&self, with_audio: bool) -> Result<String, D2dError> {
        let signal_id = signal_id_for(self.ctx.local_peer_id(), &self.remote_peer_id, unique_millis());
        self.begin(Role::Caller, with_audio, &signal_id)?;
        info!(
            "Connecting to {} (signal {}, audio: {})",
            self.remote_peer_id, signal_id, with_audio
        );
        match self.caller_setup(&signal_id, with_audio).await {
            Ok(()) => Ok(signal_id),
            Err(e) => Err(self.abort_setup(e)),
        }
    }

    /// Answer the attempt stored at `signals/{signal_id}`
    pub async fn answer(&self, signal_id: &str) -> Result<(), D2dError> {
        self.begin(Role::Callee, false, signal_id)?;
        info!("Answering {} (signal {})", self.remote_peer_id, signal_id);
        match self.callee_setup(signal_id).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort_setup(e)),
        }
    }

    fn begin(&self, role: Role, with_audio: bool, signal_id: &str) -> Result<(), D2dError> {
        {
            let mut inner = lock(&self.inner);
            if inner.disposed || inner.started || inner.status != ConnectionStatus::Idle {
                return Err(D2dError::InvalidState {
                    peer: self.remote_peer_id.clone(),
                    status: inner.status,
                });
            }
            inner.started = true;
            inner.role = Some(role);
            inner.with_audio = with_audio;
            inner.signal_id = Some(signal_id.to_string());
            inner.status = ConnectionStatus::Connecting;
        }
        self.publish(PeerEvent::StatusChanged(ConnectionStatus::Connecting));
        Ok(())
    }

    async fn caller_setup(&self, signal_id: &str, with_audio: bool) -> Result<(), D2dError> {
        let signaling = self.ctx.signaling();

        let connection = self
            .ctx
            .transport
            .create_connection(&self.ctx.config.rtc())
            .await?;
        self.attach_connection(connection.clone())?;

        let channel = connection.create_data_channel(DATA_CHANNEL_LABEL).await?;
        self.attach_channel(channel)?;

        if with_audio {
            self.acquire_media(&connection).await?;
        }

        let offer = connection.create_offer().await?;
        self.ensure_active()?;

        let record = SignalingRecord {
            offer,
            answer: None,
            caller_id: self.ctx.local_peer_id().to_string(),
            receiver_id: self.remote_peer_id.clone(),
            status: SignalingStatus::Pending,
            with_audio,
            created_at: now_millis(),
        };
        signaling.publish_record(signal_id, &record).await?;

        let invitation = InboxRecord {
            signal_id: signal_id.to_string(),
            caller_id: self.ctx.local_peer_id().to_string(),
            with_audio,
            timestamp: now_millis(),
        };
        signaling.write_inbox(&self.remote_peer_id, &invitation).await?;

        let record_watch = signaling.watch_record(signal_id).await?;
        self.spawn_record_watch(signal_id.to_string(), Role::Caller, record_watch);

        let candidates = signaling.watch_candidates(signal_id, Role::Callee).await?;
        self.spawn_candidate_watch(candidates_path(signal_id, Role::Callee), candidates);
        for candidate in signaling.list_candidates(signal_id, Role::Callee).await? {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    async fn callee_setup(&self, signal_id: &str) -> Result<(), D2dError> {
        let signaling = self.ctx.signaling();

        let record = signaling
            .read_record(signal_id)
            .await?
            .ok_or_else(|| D2dError::MissingOffer(signal_id.to_string()))?;
        if record.offer.kind != SdpKind::Offer || record.offer.sdp.is_empty() {
            return Err(D2dError::MissingOffer(signal_id.to_string()));
        }
        lock(&self.inner).with_audio = record.with_audio;

        let connection = self
            .ctx
            .transport
            .create_connection(&self.ctx.config.rtc())
            .await?;
        self.attach_connection(connection.clone())?;

        if record.with_audio {
            self.acquire_media(&connection).await?;
        }

        connection.set_remote_description(record.offer).await?;
        lock(&self.inner).answer_taken = true;
        self.mark_remote_applied(&connection).await;

        let answer = connection.create_answer().await?;
        self.ensure_active()?;

        let candidates = signaling.watch_candidates(signal_id, Role::Caller).await?;
        signaling.publish_answer(signal_id, &answer).await?;
        self.spawn_candidate_watch(candidates_path(signal_id, Role::Caller), candidates);
        for candidate in signaling.list_candidates(signal_id, Role::Caller).await? {
            self.apply_candidate(candidate).await;
        }

        let record_watch = signaling.watch_record(signal_id).await?;
        self.spawn_record_watch(signal_id.to_string(), Role::Callee, record_watch);
        Ok(())
    }

    /// Setup failed: tear down to Failed unless we were torn down already
    fn abort_setup(&self, err: D2dError) -> D2dError {
        if matches!(err, D2dError::Cancelled) {
            debug!("Setup with {} cancelled by teardown", self.remote_peer_id);
            return err;
        }
        warn!("Connection setup with {} failed: {}", self.remote_peer_id, err);
        self.teardown(ConnectionStatus::Failed);
        err
    }

    /// Still Connecting or Connected, i.e. not torn down mid-setup
    fn ensure_active(&self) -> Result<(), D2dError> {
        let inner = lock(&self.inner);
        if inner.disposed || !inner.status.is_live() {
            return Err(D2dError::Cancelled);
        }
        Ok(())
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut inner = lock(&self.inner);
        if inner.disposed {
            handle.abort();
        } else {
            inner.tasks.retain(|t| !t.is_finished());
            inner.tasks.push(handle);
        }
    }

    fn attach_connection(&self, connection: Arc<dyn PeerConnection>) -> Result<(), D2dError> {
        {
            let mut inner = lock(&self.inner);
            if inner.disposed {
                drop(inner);
                tokio::spawn(async move { connection.close().await });
                return Err(D2dError::Cancelled);
            }
            inner.connection = Some(connection.clone());
        }
        if let Some(events) = connection.take_events() {
            let this = self.this.clone();
            self.spawn_task(async move { pump_connection(this, events).await });
        }
        Ok(())
    }

    fn attach_channel(&self, channel: Arc<dyn DataChannel>) -> Result<(), D2dError> {
        let writer = Arc::new(ChannelWriter::new(channel.clone()));
        {
            let mut inner = lock(&self.inner);
            if inner.disposed {
                drop(inner);
                tokio::spawn(async move { channel.close().await });
                return Err(D2dError::Cancelled);
            }
            if inner.channel.is_some() {
                debug!("Ignoring extra data channel from {}", self.remote_peer_id);
                return Ok(());
            }
            inner.channel = Some(writer);
        }
        if let Some(events) = channel.take_events() {
            let this = self.this.clone();
            let window = self.ctx.config.session.dedup_window;
            self.spawn_task(async move { pump_channel(this, events, window).await });
        }
        Ok(())
    }

    async fn acquire_media(&self, connection: &Arc<dyn PeerConnection>) -> Result<(), D2dError> {
        match self.ctx.media.acquire_audio().await {
            Ok(handle) => {
                connection.add_local_media(&handle).await?;
                let mut inner = lock(&self.inner);
                if inner.disposed {
                    handle.stop();
                    return Err(D2dError::Cancelled);
                }
                inner.local_media = Some(handle);
            }
            Err(e) => {
                warn!(
                    "Continuing without local audio for {}: {}",
                    self.remote_peer_id, e
                );
                lock(&self.inner).media_degraded = true;
                self.publish(PeerEvent::MediaDegraded(e));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Remote description and candidates
    // ------------------------------------------------------------------

    /// Apply the answer once; later deliveries are ignored
    async fn apply_remote_answer(&self, answer: SessionDescription) {
        let connection = {
            let mut inner = lock(&self.inner);
            if inner.answer_taken || inner.disposed {
                return;
            }
            let Some(connection) = inner.connection.clone() else {
                return;
            };
            inner.answer_taken = true;
            connection
        };
        if connection.has_remote_description().await {
            debug!("Remote description already set for {}", self.remote_peer_id);
            self.mark_remote_applied(&connection).await;
            return;
        }
        if let Err(e) = connection.set_remote_description(answer).await {
            warn!("Failed to apply answer from {}: {}", self.remote_peer_id, e);
            self.teardown(ConnectionStatus::Failed);
            return;
        }
        debug!("Applied answer from {}", self.remote_peer_id);
        self.mark_remote_applied(&connection).await;
    }

    /// Flush candidates that arrived before the remote description
    async fn mark_remote_applied(&self, connection: &Arc<dyn PeerConnection>) {
        let pending = {
            let mut inner = lock(&self.inner);
            inner.remote_applied = true;
            std::mem::take(&mut inner.pending_candidates)
        };
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("Failed to add ICE candidate from {}: {}", self.remote_peer_id, e);
            }
        }
    }

    /// Apply a remote candidate once
    async fn apply_candidate(&self, candidate: IceCandidate) {
        let connection = {
            let mut inner = lock(&self.inner);
            if inner.disposed || !inner.seen_candidates.insert(candidate.clone()) {
                return;
            }
            if !inner.remote_applied {
                inner.pending_candidates.push(candidate);
                return;
            }
            match inner.connection.clone() {
                Some(connection) => connection,
                None => return,
            }
        };
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate from {}: {}", self.remote_peer_id, e);
        }
    }

    async fn publish_local_candidate(&self, candidate: IceCandidate) {
        let (signal_id, role) = {
            let inner = lock(&self.inner);
            match (inner.signal_id.clone(), inner.role) {
                (Some(signal_id), Some(role)) if !inner.disposed => (signal_id, role),
                _ => return,
            }
        };
        if let Err(e) = self
            .ctx
            .signaling()
            .append_candidate(&signal_id, role, &candidate)
            .await
        {
            warn!("Failed to publish ICE candidate for {}: {}", signal_id, e);
        }
    }

    fn spawn_record_watch(&self, signal_id: String, role: Role, mut watch: Watch<Option<Document>>) {
        let this = self.this.clone();
        self.spawn_task(async move {
            while let Some(value) = watch.next().await {
                let Some(doc) = value else { continue };
                let Some(manager) = this.upgrade() else { break };
                let Some(record) = parse_record(&signal_id, doc) else {
                    continue;
                };
                match record.status {
                    SignalingStatus::Rejected => {
                        info!("{} rejected signal {}", manager.remote_peer_id, signal_id);
                        manager.teardown(ConnectionStatus::Failed);
                        break;
                    }
                    SignalingStatus::Ended => {
                        info!("{} ended signal {}", manager.remote_peer_id, signal_id);
                        manager.teardown(ConnectionStatus::Disconnected);
                        break;
                    }
                    SignalingStatus::Pending | SignalingStatus::Connected => {}
                }
                if role == Role::Caller {
                    if let Some(answer) = record.answer {
                        manager.apply_remote_answer(answer).await;
                    }
                }
            }
        });
    }

    fn spawn_candidate_watch(&self, path: String, mut watch: Watch<Document>) {
        let this = self.this.clone();
        self.spawn_task(async move {
            while let Some(doc) = watch.next().await {
                let Some(manager) = this.upgrade() else { break };
                if let Some(candidate) = parse_candidate(&path, doc) {
                    manager.apply_candidate(candidate).await;
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalCandidate(candidate) => self.publish_local_candidate(candidate).await,
            ConnectionEvent::StateChanged(state) => {
                debug!("Transport to {} is {:?}", self.remote_peer_id, state);
                if state.is_lost() {
                    self.on_transport_lost();
                }
            }
            ConnectionEvent::DataChannel(channel) => {
                if channel.label() != DATA_CHANNEL_LABEL {
                    debug!("Ignoring data channel {:?} from {}", channel.label(), self.remote_peer_id);
                    return;
                }
                if let Err(e) = self.attach_channel(channel) {
                    debug!("Dropping data channel from {}: {}", self.remote_peer_id, e);
                }
            }
            ConnectionEvent::RemoteTrack(media) => {
                lock(&self.inner).remote_media = Some(media.clone());
                self.publish(PeerEvent::RemoteMedia(media));
            }
        }
    }

    fn on_channel_open(&self) {
        if self.transition(ConnectionStatus::Connected) {
            info!("Connected to {}", self.remote_peer_id);
        }
    }

    /// Transport or channel went away
    fn on_transport_lost(&self) {
        let next = match self.status() {
            ConnectionStatus::Connected => ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting => ConnectionStatus::Failed,
            _ => return,
        };
        if self.transition(next) {
            warn!("Lost connection to {} ({:?})", self.remote_peer_id, next);
            let failed = lock(&self.engine).fail_active();
            self.publish_transfers(failed);
        }
    }

    fn transition(&self, next: ConnectionStatus) -> bool {
        {
            let mut inner = lock(&self.inner);
            if inner.disposed || !inner.status.can_transition_to(next) {
                return false;
            }
            inner.status = next;
        }
        self.publish(PeerEvent::StatusChanged(next));
        true
    }

    // ------------------------------------------------------------------
    // Inbound protocol
    // ------------------------------------------------------------------

    fn dispatch(&self, envelope: Envelope) {
        match &envelope.message {
            Message::Chat { .. } | Message::Typing {} | Message::Ping {} => {
                self.publish(PeerEvent::Message(envelope));
            }
            Message::FileRequest {
                transfer_id,
                file_name,
                file_size,
                mime_type,
                total_chunks,
            } => {
                let result = lock(&self.engine).on_request(
                    transfer_id.clone(),
                    file_name.clone(),
                    *file_size,
                    mime_type.clone(),
                    *total_chunks,
                );
                match result {
                    Ok(state) => {
                        info!(
                            "{} offers {} ({} bytes)",
                            self.remote_peer_id, state.file_name, state.file_size
                        );
                        self.publish(PeerEvent::Transfer(state));
                    }
                    Err(e) => warn!("Ignoring file request from {}: {}", self.remote_peer_id, e),
                }
            }
            Message::FileAccept { transfer_id } => {
                let result = lock(&self.engine).on_accept(transfer_id);
                match result {
                    Ok((state, job)) => {
                        self.publish(PeerEvent::Transfer(state));
                        self.spawn_stream(job);
                    }
                    Err(e) => warn!("Ignoring file accept from {}: {}", self.remote_peer_id, e),
                }
            }
            Message::FileReject { transfer_id } => {
                let result = lock(&self.engine).on_reject(transfer_id);
                match result {
                    Ok(state) => self.publish(PeerEvent::Transfer(state)),
                    Err(e) => warn!("Ignoring file reject from {}: {}", self.remote_peer_id, e),
                }
            }
            Message::FileComplete {
                transfer_id,
                total_chunks,
            } => {
                let result = lock(&self.engine).on_complete(transfer_id, *total_chunks);
                match result {
                    Ok((state, file)) => {
                        self.publish(PeerEvent::Transfer(state));
                        if let Some(file) = file {
                            info!(
                                "Received {} ({} bytes) from {}",
                                file.file_name,
                                file.data.len(),
                                self.remote_peer_id
                            );
                            self.publish(PeerEvent::FileReceived(file));
                        }
                    }
                    Err(e) => warn!("Ignoring file complete from {}: {}", self.remote_peer_id, e),
                }
            }
            Message::FileChunkMeta { .. } => {
                debug!("Chunk header reached dispatch; framing should have consumed it");
            }
        }
    }

    fn on_chunk(&self, meta: ChunkMeta, data: Bytes) {
        let len = data.len();
        let result = {
            let mut engine = lock(&self.engine);
            engine
                .on_chunk(&meta.transfer_id, meta.chunk_index, data)
                .map_err(|e| (e, engine.get(&meta.transfer_id)))
        };
        match result {
            Ok(state) => {
                self.publish(PeerEvent::ChunkReceived {
                    transfer_id: meta.transfer_id,
                    chunk_index: meta.chunk_index,
                    len,
                });
                self.publish(PeerEvent::Transfer(state));
            }
            Err((e, state)) => {
                warn!("Dropping chunk from {}: {}", self.remote_peer_id, e);
                if let Some(state) = state.filter(|s| s.status.is_terminal()) {
                    self.publish(PeerEvent::Transfer(state));
                }
            }
        }
    }

    fn spawn_stream(&self, job: OutgoingJob) {
        let writer = lock(&self.inner).channel.clone();
        let Some(writer) = writer else {
            let failed = lock(&self.engine).fail(&job.transfer_id);
            self.publish_transfers(failed.into_iter().collect());
            return;
        };
        let this = self.this.clone();
        let backpressure = self.ctx.config.backpressure();
        self.spawn_task(async move {
            let progress = {
                let this = this.clone();
                let transfer_id = job.transfer_id.clone();
                move |sent: u64| {
                    if let Some(manager) = this.upgrade() {
                        let state = lock(&manager.engine).record_sent(&transfer_id, sent);
                        if let Some(state) = state {
                            manager.publish(PeerEvent::Transfer(state));
                        }
                    }
                }
            };
            let result = stream_chunks(&job, &*writer, &backpressure, progress).await;
            let Some(manager) = this.upgrade() else { return };
            let state = match result {
                Ok(chunks) => {
                    info!(
                        "Sent {} to {} in {} chunks",
                        job.source.name(),
                        manager.remote_peer_id,
                        chunks
                    );
                    lock(&manager.engine).finish_send(&job.transfer_id)
                }
                Err(TransferError::Cancelled(_)) => {
                    debug!("Transfer {} stopped", job.transfer_id);
                    None
                }
                Err(e) => {
                    warn!("Transfer to {} failed: {}", manager.remote_peer_id, e);
                    lock(&manager.engine).fail(&job.transfer_id)
                }
            };
            if let Some(state) = state {
                manager.publish(PeerEvent::Transfer(state));
            }
        });
    }

    // ------------------------------------------------------------------
    // Outbound protocol
    // ------------------------------------------------------------------

    /// Send an envelope. Returns `false` when the channel is not connected.
    pub async fn send(&self, envelope: Envelope) -> bool {
        let writer = {
            let inner = lock(&self.inner);
            if inner.status == ConnectionStatus::Connected {
                inner.channel.clone()
            } else {
                None
            }
        };
        let Some(writer) = writer else {
            warn!(
                "Dropping {:?} to {}: {}",
                envelope.kind(),
                self.remote_peer_id,
                D2dError::ChannelNotOpen
            );
            return false;
        };
        match writer.write_envelope(&envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Send to {} failed: {}", self.remote_peer_id, e);
                false
            }
        }
    }

    async fn send_message(&self, message: Message) -> Result<Envelope, D2dError> {
        let envelope = Envelope::new(self.ctx.next_id(), message);
        if self.send(envelope.clone()).await {
            Ok(envelope)
        } else {
            Err(D2dError::ChannelNotOpen)
        }
    }

    /// Send a chat message signed with the configured display name
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<Envelope, D2dError> {
        self.send_message(Message::Chat {
            text: text.into(),
            sender_name: self.ctx.config.session.display_name.clone(),
        })
        .await
    }

    pub async fn send_typing(&self) -> Result<Envelope, D2dError> {
        self.send_message(Message::Typing {}).await
    }

    pub async fn ping(&self) -> Result<Envelope, D2dError> {
        self.send_message(Message::Ping {}).await
    }

    /// Offer a file under a generated transfer id
    pub async fn send_file(&self, source: FileSource) -> Result<FileTransferState, D2dError> {
        let transfer_id = format!("file_{}", uuid::Uuid::new_v4().simple());
        self.send_file_as(transfer_id, source).await
    }

    /// Offer a file under `transfer_id`
    pub async fn send_file_as(
        &self,
        transfer_id: impl Into<String>,
        source: FileSource,
    ) -> Result<FileTransferState, D2dError> {
        if !self.is_connected() {
            return Err(D2dError::ChannelNotOpen);
        }
        let transfer_id = transfer_id.into();
        let (state, request) = lock(&self.engine).offer(transfer_id.clone(), source)?;
        self.publish(PeerEvent::Transfer(state.clone()));
        if let Err(e) = self.send_message(request).await {
            let failed = lock(&self.engine).fail(&transfer_id);
            self.publish_transfers(failed.into_iter().collect());
            return Err(e);
        }
        Ok(state)
    }

    /// Accept an incoming file
    pub async fn accept_file(&self, transfer_id: &str) -> Result<FileTransferState, D2dError> {
        if !self.is_connected() {
            return Err(D2dError::ChannelNotOpen);
        }
        let (state, reply) = lock(&self.engine).accept(transfer_id)?;
        self.publish(PeerEvent::Transfer(state.clone()));
        if let Err(e) = self.send_message(reply).await {
            let failed = lock(&self.engine).fail(transfer_id);
            self.publish_transfers(failed.into_iter().collect());
            return Err(e);
        }
        Ok(state)
    }

    /// Reject an incoming file. The rejection is final locally even if the
    /// reply cannot be delivered.
    pub async fn reject_file(&self, transfer_id: &str) -> Result<FileTransferState, D2dError> {
        let (state, reply) = lock(&self.engine).reject(transfer_id)?;
        self.publish(PeerEvent::Transfer(state.clone()));
        if self.send_message(reply).await.is_err() {
            debug!("Rejection of {} not delivered", transfer_id);
        }
        Ok(state)
    }

    /// Mark the signaling record ended, then tear down
    pub async fn hang_up(&self) {
        if let Some(signal_id) = self.signal_id() {
            if let Err(e) = self
                .ctx
                .signaling()
                .set_status(&signal_id, SignalingStatus::Ended)
                .await
            {
                warn!("Failed to mark {} ended: {}", signal_id, e);
            }
        }
        self.cleanup();
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Release everything and return to Idle. Idempotent and non-blocking;
    /// the manager cannot be reused afterwards.
    pub fn cleanup(&self) {
        self.teardown(ConnectionStatus::Idle);
    }

    fn teardown(&self, final_status: ConnectionStatus) {
        let (released, previous) = {
            let mut inner = lock(&self.inner);
            let previous = inner.status;
            let was_disposed = inner.disposed;
            // After a terminal teardown only the final move to Idle remains
            if was_disposed && (final_status != ConnectionStatus::Idle || previous == final_status) {
                return;
            }
            inner.disposed = true;
            inner.status = final_status;
            inner.pending_candidates.clear();
            let released = Released {
                tasks: std::mem::take(&mut inner.tasks),
                connection: inner.connection.take(),
                channel: inner.channel.take(),
                local_media: inner.local_media.take(),
                signal_id: if was_disposed {
                    None
                } else {
                    inner.signal_id.clone()
                },
                role: inner.role,
            };
            (released, previous)
        };

        for task in &released.tasks {
            task.abort();
        }
        if let Some(media) = &released.local_media {
            media.stop();
        }
        let failed = lock(&self.engine).fail_active();
        self.publish_transfers(failed);
        if previous != final_status {
            debug!("{} torn down: {:?} -> {:?}", self.remote_peer_id, previous, final_status);
            self.publish(PeerEvent::StatusChanged(final_status));
        }
        self.release(released);
    }

    /// Close transport objects and delete signaling state in the background
    fn release(&self, released: Released) {
        let Released {
            connection,
            channel,
            signal_id,
            role,
            ..
        } = released;
        if connection.is_none() && channel.is_none() && signal_id.is_none() {
            return;
        }
        let signaling = self.ctx.signaling().clone();
        let remote = self.remote_peer_id.clone();
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("No runtime to release resources for {}", remote);
                return;
            }
        };
        runtime.spawn(async move {
            if let Some(channel) = channel {
                channel.channel.close().await;
            }
            if let Some(connection) = connection {
                connection.close().await;
            }
            let Some(signal_id) = signal_id else { return };
            if let Err(e) = signaling.delete_record(&signal_id).await {
                warn!("Failed to delete signaling record {}: {}", signal_id, e);
            }
            if role == Some(Role::Caller) {
                if let Err(e) = signaling.withdraw_invitation(&remote, &signal_id).await {
                    warn!("Failed to withdraw invitation to {}: {}", remote, e);
                }
            }
        });
    }
}

async fn pump_connection(
    this: Weak<PeerConnectionManager>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = this.upgrade() else { break };
        manager.on_connection_event(event).await;
    }
}

async fn pump_channel(
    this: Weak<PeerConnectionManager>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    dedup_window: usize,
) {
    let mut decoder = FrameDecoder::new();
    let mut seen = DedupWindow::new(dedup_window);
    while let Some(event) = events.recv().await {
        let Some(manager) = this.upgrade() else { break };
        match event {
            ChannelEvent::Open => manager.on_channel_open(),
            ChannelEvent::Message(frame) => match decoder.feed(frame) {
                Ok(Some(Inbound::Envelope(envelope))) => {
                    if seen.observe(&envelope.id) {
                        manager.dispatch(envelope);
                    } else {
                        debug!("Duplicate envelope {} from {}", envelope.id, manager.remote_peer_id);
                    }
                }
                Ok(Some(Inbound::Chunk { meta, data })) => manager.on_chunk(meta, data),
                Ok(None) => {}
                Err(e) => warn!("Dropping frame from {}: {}", manager.remote_peer_id, e),
            },
            ChannelEvent::Closed => {
                manager.on_transport_lost();
                break;
            }
        }
    }
}
