//! Mock implementations for testing and simulation
//!
//! In-memory signaling store, transport, data channels and media source.
//! A [`MockNetwork`] links connections created by any number of
//! [`MockTransport`]s: the offer SDP carries a token, and applying the
//! matching answer on the caller establishes the link.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::store::{Document, SignalingStore, StoreError, Watch};
use crate::transport::{
    ChannelEvent, ConnectionEvent, DataChannel, Frame, MediaError, MediaHandle, MediaKind,
    MediaSource, PeerConnection, RtcConfig, Transport, TransportError, TransportState,
};
use crate::types::{IceCandidate, SdpKind, SessionDescription};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Memory Signaling Store
// ============================================================================

type DocWatchers = Vec<(u64, mpsc::UnboundedSender<Option<Document>>)>;
type CollectionWatchers = Vec<(u64, mpsc::UnboundedSender<Document>)>;

#[derive(Default)]
struct StoreState {
    docs: HashMap<String, Document>,
    collections: HashMap<String, Vec<(String, Document)>>,
    doc_watchers: HashMap<String, DocWatchers>,
    collection_watchers: HashMap<String, CollectionWatchers>,
    next_id: u64,
}

impl StoreState {
    fn notify_doc(&mut self, path: &str) {
        let value = self.docs.get(path).cloned();
        if let Some(watchers) = self.doc_watchers.get_mut(path) {
            watchers.retain(|(_, tx)| tx.send(value.clone()).is_ok());
        }
    }
}

/// In-memory signaling store with fault injection
#[derive(Default)]
pub struct MemorySignalingStore {
    state: Arc<Mutex<StoreState>>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemorySignalingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make put and append fail with `Unavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make delete fail with `Unavailable`
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Re-deliver the current value of a document to its watchers
    pub fn refire(&self, path: &str) {
        lock(&self.state).notify_doc(path);
    }

    /// Snapshot of a document
    pub fn document(&self, path: &str) -> Option<Document> {
        lock(&self.state).docs.get(path).cloned()
    }

    /// Number of items in a collection
    pub fn collection_len(&self, collection: &str) -> usize {
        lock(&self.state)
            .collections
            .get(collection)
            .map_or(0, |items| items.len())
    }

    /// Live document watchers on a path
    pub fn watcher_count(&self, path: &str) -> usize {
        let state = lock(&self.state);
        let docs = state.doc_watchers.get(path).map_or(0, |w| w.len());
        let items = state.collection_watchers.get(path).map_or(0, |w| w.len());
        docs + items
    }

    /// Every document path currently stored
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.state).docs.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingStore for MemorySignalingStore {
    async fn put(&self, path: &str, fields: Document) -> Result<(), StoreError> {
        self.check_write()?;
        let mut state = lock(&self.state);
        let doc = state.docs.entry(path.to_string()).or_default();
        for (k, v) in fields {
            doc.insert(k, v);
        }
        state.notify_doc(path);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        Ok(lock(&self.state).docs.get(path).cloned())
    }

    async fn watch(&self, path: &str) -> Result<Watch<Option<Document>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        let _ = tx.send(state.docs.get(path).cloned());
        state
            .doc_watchers
            .entry(path.to_string())
            .or_default()
            .push((id, tx));

        let weak: Weak<Mutex<StoreState>> = Arc::downgrade(&self.state);
        let path = path.to_string();
        Ok(Watch::new(rx, move || {
            if let Some(state) = weak.upgrade() {
                if let Some(watchers) = lock(&state).doc_watchers.get_mut(&path) {
                    watchers.retain(|(wid, _)| *wid != id);
                }
            }
        }))
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("deletes disabled".into()));
        }
        let mut state = lock(&self.state);
        let prefix = format!("{}/", path);
        state.collections.retain(|k, _| !k.starts_with(&prefix));
        if state.docs.remove(path).is_some() {
            state.notify_doc(path);
        }
        Ok(())
    }

    async fn append(&self, collection: &str, item: Document) -> Result<String, StoreError> {
        self.check_write()?;
        let mut state = lock(&self.state);
        state.next_id += 1;
        let item_id = format!("item{}", state.next_id);
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push((item_id.clone(), item.clone()));
        if let Some(watchers) = state.collection_watchers.get_mut(collection) {
            watchers.retain(|(_, tx)| tx.send(item.clone()).is_ok());
        }
        Ok(item_id)
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        Ok(lock(&self.state)
            .collections
            .get(collection)
            .map(|items| items.iter().map(|(_, doc)| doc.clone()).collect())
            .unwrap_or_default())
    }

    async fn watch_collection(&self, collection: &str) -> Result<Watch<Document>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state
            .collection_watchers
            .entry(collection.to_string())
            .or_default()
            .push((id, tx));

        let weak = Arc::downgrade(&self.state);
        let collection = collection.to_string();
        Ok(Watch::new(rx, move || {
            if let Some(state) = weak.upgrade() {
                if let Some(watchers) = lock(&state).collection_watchers.get_mut(&collection) {
                    watchers.retain(|(wid, _)| *wid != id);
                }
            }
        }))
    }
}

// ============================================================================
// Mock Data Channel
// ============================================================================

/// Mock data channel; one half of a linked pair
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    peer: Mutex<Weak<MockDataChannel>>,
    buffered: AtomicUsize,
    stall_after: Mutex<Option<usize>>,
    binary_sent: AtomicUsize,
    sent: Mutex<Vec<Frame>>,
}

impl MockDataChannel {
    fn new(label: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            peer: Mutex::new(Weak::new()),
            buffered: AtomicUsize::new(0),
            stall_after: Mutex::new(None),
            binary_sent: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Create a linked pair, both still closed
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new(label);
        let b = Self::new(label);
        *lock(&a.peer) = Arc::downgrade(&b);
        *lock(&b.peer) = Arc::downgrade(&a);
        (a, b)
    }

    /// Mark open and notify the local listener
    pub fn open(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(ChannelEvent::Open);
        }
    }

    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(ChannelEvent::Closed);
    }

    /// Simulated local send queue size
    pub fn set_buffered_amount(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    /// After `frames` more binary frames, report a full buffer until released
    pub fn stall_after_binary_frames(&self, frames: usize) {
        let sent = self.binary_sent.load(Ordering::SeqCst);
        *lock(&self.stall_after) = Some(sent + frames);
    }

    pub fn release_stall(&self) {
        *lock(&self.stall_after) = None;
    }

    /// Every frame sent through this half, in order
    pub fn sent_frames(&self) -> Vec<Frame> {
        lock(&self.sent).clone()
    }

    /// Deliver a raw frame to the remote half as if the peer sent it
    pub fn inject(&self, frame: Frame) -> Result<(), TransportError> {
        self.deliver(frame)
    }

    fn deliver(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }
        let peer = lock(&self.peer).upgrade().ok_or(TransportError::Closed)?;
        lock(&self.sent).push(frame.clone());
        peer.events_tx
            .send(ChannelEvent::Message(frame))
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.deliver(Frame::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.deliver(Frame::Binary(data))?;
        self.binary_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        if let Some(limit) = *lock(&self.stall_after) {
            if self.binary_sent.load(Ordering::SeqCst) >= limit {
                return usize::MAX;
            }
        }
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        lock(&self.events_rx).take()
    }

    async fn close(&self) {
        self.mark_closed();
        let peer = lock(&self.peer).upgrade();
        if let Some(peer) = peer {
            peer.mark_closed();
        }
    }
}

// ============================================================================
// Mock Network
// ============================================================================

struct OfferSlot {
    caller_events: mpsc::UnboundedSender<ConnectionEvent>,
    caller_media: Vec<MediaHandle>,
    callee_channel: Option<Arc<MockDataChannel>>,
}

struct AnswerSlot {
    callee_events: mpsc::UnboundedSender<ConnectionEvent>,
    callee_media: Vec<MediaHandle>,
}

/// Established link between two connections
struct Link {
    caller_events: mpsc::UnboundedSender<ConnectionEvent>,
    callee_events: mpsc::UnboundedSender<ConnectionEvent>,
    channel: Option<Arc<MockDataChannel>>,
}

#[derive(Default)]
struct NetworkState {
    offers: HashMap<String, OfferSlot>,
    answers: HashMap<String, AnswerSlot>,
    links: Vec<Link>,
}

/// Shared medium that links mock connections
#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<NetworkState>,
    fail_connections: AtomicBool,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `create_connection` fail
    pub fn set_fail_connections(&self, fail: bool) {
        self.fail_connections.store(fail, Ordering::SeqCst);
    }

    /// Links established so far
    pub fn established_links(&self) -> usize {
        lock(&self.state).links.len()
    }

    /// Drop every established link as if the network went away
    pub fn sever_all(&self) {
        let links = std::mem::take(&mut lock(&self.state).links);
        for link in links {
            let _ = link
                .caller_events
                .send(ConnectionEvent::StateChanged(TransportState::Disconnected));
            let _ = link
                .callee_events
                .send(ConnectionEvent::StateChanged(TransportState::Disconnected));
            if let Some(channel) = link.channel {
                channel.mark_closed();
                if let Some(peer) = lock(&channel.peer).upgrade() {
                    peer.mark_closed();
                }
            }
        }
    }
}

fn token_of(desc: &SessionDescription) -> Result<&str, TransportError> {
    desc.sdp
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| TransportError::InvalidDescription(desc.sdp.clone()))
}

/// Transport creating [`MockPeerConnection`]s on a shared network
pub struct MockTransport {
    network: Arc<MockNetwork>,
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl MockTransport {
    pub fn new(network: &Arc<MockNetwork>) -> Arc<Self> {
        Arc::new(Self {
            network: network.clone(),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// Connections created by this transport, oldest first
    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        lock(&self.connections).clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn create_connection(&self, _config: &RtcConfig) -> Result<Arc<dyn PeerConnection>, TransportError> {
        if self.network.fail_connections.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed("mock network down".into()));
        }
        let pc = MockPeerConnection::new(self.network.clone());
        lock(&self.connections).push(pc.clone());
        Ok(pc)
    }
}

// ============================================================================
// Mock Peer Connection
// ============================================================================

#[derive(Default)]
struct ConnectionState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    channel: Option<Arc<MockDataChannel>>,
    remote_half: Option<Arc<MockDataChannel>>,
    media: Vec<MediaHandle>,
    candidates: Vec<IceCandidate>,
    remote_description_sets: usize,
    closed: bool,
}

/// Mock peer connection
pub struct MockPeerConnection {
    id: u64,
    network: Arc<MockNetwork>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    state: Mutex<ConnectionState>,
}

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

impl MockPeerConnection {
    fn new(network: Arc<MockNetwork>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed),
            network,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(ConnectionState::default()),
        })
    }

    /// Caller-side channel half
    pub fn data_channel(&self) -> Option<Arc<MockDataChannel>> {
        lock(&self.state).channel.clone()
    }

    /// Remote candidates applied so far
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).candidates.clone()
    }

    /// How many times a remote description was set
    pub fn remote_description_sets(&self) -> usize {
        lock(&self.state).remote_description_sets
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn local_media(&self) -> Vec<MediaHandle> {
        lock(&self.state).media.clone()
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host", self.id, 40000 + self.id),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if lock(&self.state).closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

fn remote_track(media: &[MediaHandle]) -> Vec<MediaHandle> {
    media
        .iter()
        .map(|m| MediaHandle::new(format!("remote-{}", m.id()), m.kind()))
        .collect()
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.check_open()?;
        let (local, remote) = MockDataChannel::pair(label);
        let mut state = lock(&self.state);
        state.channel = Some(local.clone());
        state.remote_half = Some(remote);
        Ok(local)
    }

    async fn add_local_media(&self, media: &MediaHandle) -> Result<(), TransportError> {
        self.check_open()?;
        lock(&self.state).media.push(media.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        let token = uuid::Uuid::new_v4().simple().to_string();
        let desc = SessionDescription::offer(format!("mock-offer {}", token));
        {
            let mut state = lock(&self.state);
            state.local = Some(desc.clone());
            let slot = OfferSlot {
                caller_events: self.events_tx.clone(),
                caller_media: state.media.clone(),
                callee_channel: state.remote_half.clone(),
            };
            lock(&self.network.state).offers.insert(token, slot);
        }
        let _ = self
            .events_tx
            .send(ConnectionEvent::LocalCandidate(self.local_candidate()));
        Ok(desc)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        let mut state = lock(&self.state);
        let remote = state
            .remote
            .clone()
            .ok_or_else(|| TransportError::InvalidDescription("no remote offer".into()))?;
        let token = token_of(&remote)?.to_string();
        let desc = SessionDescription::answer(format!("mock-answer {}", token));
        state.local = Some(desc.clone());
        lock(&self.network.state).answers.insert(
            token,
            AnswerSlot {
                callee_events: self.events_tx.clone(),
                callee_media: state.media.clone(),
            },
        );
        drop(state);
        let _ = self
            .events_tx
            .send(ConnectionEvent::LocalCandidate(self.local_candidate()));
        Ok(desc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.check_open()?;
        let token = token_of(&desc)?.to_string();
        {
            let mut state = lock(&self.state);
            state.remote_description_sets += 1;
            state.remote = Some(desc.clone());
        }
        match desc.kind {
            SdpKind::Offer => {
                if !lock(&self.network.state).offers.contains_key(&token) {
                    return Err(TransportError::InvalidDescription(format!("unknown offer {}", token)));
                }
                Ok(())
            }
            SdpKind::Answer => {
                let caller_channel = lock(&self.state).channel.clone();
                let mut net = lock(&self.network.state);
                let offer = net.offers.remove(&token);
                let answer = net.answers.remove(&token);
                let (offer, answer) = match (offer, answer) {
                    (Some(o), Some(a)) => (o, a),
                    _ => {
                        return Err(TransportError::InvalidDescription(format!(
                            "unknown answer {}",
                            token
                        )))
                    }
                };

                let _ = offer
                    .caller_events
                    .send(ConnectionEvent::StateChanged(TransportState::Connected));
                let _ = answer
                    .callee_events
                    .send(ConnectionEvent::StateChanged(TransportState::Connected));
                for track in remote_track(&answer.callee_media) {
                    let _ = offer.caller_events.send(ConnectionEvent::RemoteTrack(track));
                }
                for track in remote_track(&offer.caller_media) {
                    let _ = answer.callee_events.send(ConnectionEvent::RemoteTrack(track));
                }
                if let Some(remote_half) = &offer.callee_channel {
                    let _ = answer
                        .callee_events
                        .send(ConnectionEvent::DataChannel(remote_half.clone()));
                    remote_half.open();
                }
                if let Some(channel) = &caller_channel {
                    channel.open();
                }
                debug!("mock link established for {}", token);
                net.links.push(Link {
                    caller_events: offer.caller_events,
                    callee_events: answer.callee_events,
                    channel: caller_channel,
                });
                Ok(())
            }
        }
    }

    async fn has_remote_description(&self) -> bool {
        lock(&self.state).remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = lock(&self.state);
        if state.remote.is_none() {
            return Err(TransportError::Candidate("no remote description".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        lock(&self.events_rx).take()
    }

    async fn close(&self) {
        let channel = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.channel.clone()
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
        let _ = self
            .events_tx
            .send(ConnectionEvent::StateChanged(TransportState::Closed));
    }
}

// ============================================================================
// Mock Media
// ============================================================================

/// Media source that grants or denies microphone access
#[derive(Default)]
pub struct MockMediaSource {
    deny: AtomicBool,
    acquired: AtomicUsize,
}

impl MockMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denying() -> Arc<Self> {
        let source = Self::default();
        source.deny.store(true, Ordering::SeqCst);
        Arc::new(source)
    }

    pub fn set_deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Successful acquisitions so far
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire_audio(&self) -> Result<MediaHandle, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MediaHandle::new(
            format!("mic-{}", uuid::Uuid::new_v4().simple()),
            MediaKind::Audio,
        ))
    }
}
