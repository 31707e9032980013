//! In-process D2D loopback
//!
//! Usage:
//!   d2d-loopback [--message <text>] [--file <path>] [--config <path>] [-v]
//!
//! Runs two peers, alice and bob, over an in-memory signaling store and
//! mock transport: alice opens a chat, sends a message and optionally a
//! file, and bob answers, accepts and reports what arrived.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use trends_d2d::{
    ClientEvent, ConnectionStatus, D2dClient, D2dConfig, FileSource, MemorySignalingStore, Message, MockMediaSource,
    MockNetwork, MockTransport, PeerContext, PeerEvent, TransferDirection, TransferStatus,
};

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "d2d-loopback")]
#[command(about = "Exercise chat and file transfer between two in-process peers", long_about = None)]
struct Cli {
    /// Chat message alice sends to bob
    #[arg(long, default_value = "hello from alice")]
    message: String,

    /// File alice sends to bob after the message
    #[arg(long)]
    file: Option<PathBuf>,

    /// Config file (defaults to ~/.trends/d2d.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log protocol details
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "warn,trends_d2d=debug"
    } else {
        "warn,trends_d2d=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn client(
    name: &str,
    store: &Arc<MemorySignalingStore>,
    network: &Arc<MockNetwork>,
    config: &D2dConfig,
) -> Arc<D2dClient> {
    let mut config = config.clone();
    config.session.display_name = name.to_string();
    let ctx = PeerContext::new(
        name,
        store.clone(),
        MockTransport::new(network),
        MockMediaSource::new(),
        config,
    );
    D2dClient::new(ctx)
}

/// Wait until `pick` returns a value for one of the incoming events
async fn wait_for<T>(
    rx: &mut UnboundedReceiver<PeerEvent>,
    what: &str,
    mut pick: impl FnMut(PeerEvent) -> Option<T>,
) -> Result<T> {
    let step = async {
        while let Some(event) = rx.recv().await {
            debug!("event: {:?}", event);
            if let Some(value) = pick(event) {
                return Some(value);
            }
        }
        None
    };
    match tokio::time::timeout(STEP_TIMEOUT, step).await {
        Ok(Some(value)) => Ok(value),
        Ok(None) => bail!("event stream closed while waiting for {}", what),
        Err(_) => bail!("timed out waiting for {}", what),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => D2dConfig::load(path)?,
        None => D2dConfig::load_or_default(),
    };

    let store = MemorySignalingStore::new();
    let network = MockNetwork::new();
    let alice = client("alice", &store, &network, &config);
    let bob = client("bob", &store, &network, &config);

    let mut bob_invitations = bob.start().await?;
    let _alice_invitations = alice.start().await?;

    let to_bob = alice.start_chat("bob").await?;
    let mut alice_events = to_bob.subscribe();

    match tokio::time::timeout(STEP_TIMEOUT, bob_invitations.recv()).await {
        Ok(Some(ClientEvent::ChatAnswered { peer_id, signal_id })) => {
            info!("bob answered {} (signal {})", peer_id, signal_id);
        }
        Ok(Some(other)) => bail!("unexpected invitation event: {:?}", other),
        Ok(None) | Err(_) => bail!("bob never answered the invitation"),
    }
    let to_alice = bob
        .registry()
        .get("alice")
        .context("bob has no session with alice")?;
    let mut bob_events = to_alice.subscribe();

    wait_for(&mut alice_events, "alice connected", |e| {
        matches!(e, PeerEvent::StatusChanged(ConnectionStatus::Connected)).then_some(())
    })
    .await?;
    println!("connected: alice <-> bob");

    alice.send_message("bob", &cli.message).await?;
    let (text, sender) = wait_for(&mut bob_events, "chat message", |e| match e {
        PeerEvent::Message(envelope) => match envelope.message {
            Message::Chat { text, sender_name } => Some((text, sender_name)),
            _ => None,
        },
        _ => None,
    })
    .await?;
    println!("bob received from {}: {}", sender, text);

    if let Some(path) = &cli.file {
        let source = FileSource::from_path(path, "application/octet-stream")
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let offered = alice.send_file("bob", source).await?;
        println!(
            "alice offered {} ({} bytes, {} chunks)",
            offered.file_name, offered.file_size, offered.total_chunks
        );

        let transfer_id = wait_for(&mut bob_events, "file request", |e| match e {
            PeerEvent::Transfer(state)
                if state.direction == TransferDirection::Incoming
                    && state.status == TransferStatus::Pending =>
            {
                Some(state.transfer_id)
            }
            _ => None,
        })
        .await?;
        bob.accept_file("alice", &transfer_id).await?;

        let received = wait_for(&mut bob_events, "file data", |e| match e {
            PeerEvent::FileReceived(file) => Some(file),
            _ => None,
        })
        .await?;
        println!(
            "bob received {} ({} bytes)",
            received.file_name,
            received.data.len()
        );

        let sent = wait_for(&mut alice_events, "sender completion", |e| match e {
            PeerEvent::Transfer(state)
                if state.transfer_id == transfer_id && state.status.is_terminal() =>
            {
                Some(state)
            }
            _ => None,
        })
        .await?;
        println!("alice transfer finished: {:?} ({}%)", sent.status, sent.progress);
    }

    alice.shutdown();
    bob.shutdown();
    Ok(())
}
