//! Shared harness: peers on one in-memory store and mock network

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use trends_d2d::{
    ClientEvent, ConnectionStatus, D2dClient, D2dConfig, Envelope, MemorySignalingStore,
    MockDataChannel, MockMediaSource, MockNetwork, MockTransport, PeerConnectionManager,
    PeerContext, PeerEvent,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub store: Arc<MemorySignalingStore>,
    pub network: Arc<MockNetwork>,
}

pub struct TestPeer {
    pub name: String,
    pub client: Arc<D2dClient>,
    pub transport: Arc<MockTransport>,
    pub media: Arc<MockMediaSource>,
    pub invitations: UnboundedReceiver<ClientEvent>,
}

impl TestPeer {
    /// Caller-side channel half of this peer's `n`-th connection
    pub fn channel(&self, n: usize) -> Arc<MockDataChannel> {
        self.transport.connections()[n]
            .data_channel()
            .expect("connection has no caller channel")
    }

    pub fn manager(&self, remote: &str) -> Arc<PeerConnectionManager> {
        self.client
            .registry()
            .get(remote)
            .unwrap_or_else(|| panic!("{} has no manager for {}", self.name, remote))
    }
}

pub fn test_config(name: &str) -> D2dConfig {
    let mut config = D2dConfig::default();
    config.session.display_name = name.to_string();
    config.transfer.backpressure_poll_ms = 5;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: MemorySignalingStore::new(),
            network: MockNetwork::new(),
        }
    }

    pub async fn peer(&self, name: &str) -> TestPeer {
        self.peer_with(name, test_config(name), MockMediaSource::new())
            .await
    }

    pub async fn peer_with(&self, name: &str, config: D2dConfig, media: Arc<MockMediaSource>) -> TestPeer {
        let transport = MockTransport::new(&self.network);
        let ctx = PeerContext::new(
            name,
            self.store.clone(),
            transport.clone(),
            media.clone(),
            config,
        );
        let client = D2dClient::new(ctx);
        let invitations = client.start().await.expect("inbox listener");
        TestPeer {
            name: name.to_string(),
            client,
            transport,
            media,
            invitations,
        }
    }
}

/// Poll `cond` until it holds or the wait runs out
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next event for which `pick` returns a value
pub async fn next_matching<E, T>(
    rx: &mut UnboundedReceiver<E>,
    what: &str,
    mut pick: impl FnMut(E) -> Option<T>,
) -> T {
    let step = async {
        while let Some(event) = rx.recv().await {
            if let Some(value) = pick(event) {
                return Some(value);
            }
        }
        None
    };
    match tokio::time::timeout(WAIT, step).await {
        Ok(Some(value)) => value,
        Ok(None) => panic!("stream closed while waiting for {}", what),
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

pub async fn next_envelope(rx: &mut UnboundedReceiver<PeerEvent>) -> Envelope {
    next_matching(rx, "envelope", |e| match e {
        PeerEvent::Message(envelope) => Some(envelope),
        _ => None,
    })
    .await
}

/// `caller` opens a chat with `callee` and both sides reach Connected.
/// Returns each side's manager with its event queue.
pub async fn connect_chat(
    caller: &mut TestPeer,
    callee: &mut TestPeer,
) -> (
    (Arc<PeerConnectionManager>, UnboundedReceiver<PeerEvent>),
    (Arc<PeerConnectionManager>, UnboundedReceiver<PeerEvent>),
) {
    let outgoing = caller
        .client
        .start_chat(&callee.name)
        .await
        .expect("start chat");
    let caller_events = outgoing.subscribe();

    next_matching(&mut callee.invitations, "chat answered", |e| match e {
        ClientEvent::ChatAnswered { .. } => Some(()),
        _ => None,
    })
    .await;
    let incoming = callee.manager(&caller.name);
    let callee_events = incoming.subscribe();

    eventually("both sides connected", || {
        outgoing.status() == ConnectionStatus::Connected && incoming.status() == ConnectionStatus::Connected
    })
    .await;
    ((outgoing, caller_events), (incoming, callee_events))
}
