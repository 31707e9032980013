//! File transfer over a connected pair

mod common;

use common::{connect_chat, eventually, next_matching, Harness, TestPeer};
use std::io::Write;
use tokio::sync::mpsc::UnboundedReceiver;
use trends_d2d::{
    ConnectionStatus, FileSource, FileTransferState, Frame, PeerEvent, ReceivedFile,
    TransferDirection, TransferStatus, CHUNK_SIZE,
};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn incoming_request(bob_events: &mut UnboundedReceiver<PeerEvent>) -> FileTransferState {
    next_matching(bob_events, "file request", |e| match e {
        PeerEvent::Transfer(state)
            if state.direction == TransferDirection::Incoming
                && state.status == TransferStatus::Pending =>
        {
            Some(state)
        }
        _ => None,
    })
    .await
}

/// Offer `data` from alice, accept on bob, and return what bob assembled
/// along with every transfer state bob observed.
async fn send_and_receive(
    alice: &TestPeer,
    bob: &TestPeer,
    bob_events: &mut UnboundedReceiver<PeerEvent>,
    source: FileSource,
) -> (FileTransferState, ReceivedFile, Vec<FileTransferState>) {
    let offered = alice.client.send_file("bob", source).await.unwrap();
    assert_eq!(offered.status, TransferStatus::Pending);
    assert_eq!(offered.direction, TransferDirection::Outgoing);

    let request = incoming_request(bob_events).await;
    assert_eq!(request.transfer_id, offered.transfer_id);
    assert_eq!(request.file_size, offered.file_size);
    assert_eq!(request.total_chunks, offered.total_chunks);

    bob.client
        .accept_file("alice", &request.transfer_id)
        .await
        .unwrap();

    let mut seen = Vec::new();
    let file = next_matching(bob_events, "received file", |e| match e {
        PeerEvent::Transfer(state) => {
            seen.push(state);
            None
        }
        PeerEvent::FileReceived(file) => Some(file),
        _ => None,
    })
    .await;
    (offered, file, seen)
}

#[tokio::test]
async fn test_file_roundtrip_at_chunk_boundaries() {
    let harness = Harness::new();
    let mut alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let ((to_bob, _), (_, mut bob_events)) = connect_chat(&mut alice, &mut bob).await;

    for len in [0, 1, CHUNK_SIZE, CHUNK_SIZE + 1, 6 * CHUNK_SIZE + 123] {
        let data = payload(len);
        let source = FileSource::from_bytes(format!("file-{}.bin", len), "application/octet-stream", data.clone());
        let (offered, file, seen) = send_and_receive(&alice, &bob, &mut bob_events, source).await;

        assert_eq!(offered.total_chunks as usize, len.div_ceil(CHUNK_SIZE), "len {}", len);
        assert_eq!(file.data.as_ref(), data.as_slice(), "len {}", len);
        assert_eq!(file.file_name, format!("file-{}.bin", len));
        assert_eq!(file.mime_type, "application/octet-stream");

        for state in &seen {
            if state.status != TransferStatus::Completed {
                assert!(state.progress <= 99, "progress {} before completion", state.progress);
            }
        }
        let last = seen.last().unwrap();
        assert_eq!(last.status, TransferStatus::Completed);
        assert_eq!(last.progress, 100);
        assert_eq!(last.bytes_transferred, len as u64);

        let transfer_id = offered.transfer_id.clone();
        eventually("sender completed", || {
            to_bob
                .transfer(&transfer_id)
                .is_some_and(|s| s.status == TransferStatus::Completed && s.progress == 100)
        })
        .await;
    }
}

#[tokio::test]
async fn test_chunk_frames_follow_their_headers() {
    let harness = Harness::new();
    let mut alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let (_, (_, mut bob_events)) = connect_chat(&mut alice, &mut bob).await;

    let data = payload(3 * CHUNK_SIZE - 10);
    let source = FileSource::from_bytes("three.bin", "application/octet-stream", data);
    send_and_receive(&alice, &bob, &mut bob_events, source).await;

    let frames = alice.channel(0).sent_frames();
    let mut headers = 0;
    for pair in frames.windows(2) {
        if let Frame::Text(text) = &pair[0] {
            if text.contains("\"file-chunk-meta\"") {
                headers += 1;
                assert!(matches!(pair[1], Frame::Binary(_)));
            }
        }
    }
    assert_eq!(headers, 3);
    let binaries: Vec<usize> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Binary(b) => Some(b.len()),
            Frame::Text(_) => None,
        })
        .collect();
    assert_eq!(binaries, vec![CHUNK_SIZE, CHUNK_SIZE, CHUNK_SIZE - 10]);
}

#[tokio::test]
async fn test_file_from_path() {
    let harness = Harness::new();
    let mut alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let (_, (_, mut bob_events)) = connect_chat(&mut alice, &mut bob).await;

    let data = payload(2 * CHUNK_SIZE + 7);
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&data).unwrap();
    tmp.flush().unwrap();

    let source = FileSource::from_path(tmp.path(), "image/png").await.unwrap();
    let (offered, file, _) = send_and_receive(&alice, &bob, &mut bob_events, source).await;
    assert_eq!(offered.file_size, data.len() as u64);
    assert_eq!(file.mime_type, "image/png");
    assert_eq!(file.data.as_ref(), data.as_slice());
}

#[tokio::test]
async fn test_reject_sends_no_chunks() {
    let harness = Harness::new();
    let mut alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let ((to_bob, mut alice_events), (to_alice, mut bob_events)) = connect_chat(&mut alice, &mut bob).await;

    let source = FileSource::from_bytes("nope.txt", "text/plain", payload(40_000));
    let offered = alice.client.send_file("bob", source).await.unwrap();
    let request = incoming_request(&mut bob_events).await;

    let rejected = bob
        .client
        .reject_file("alice", &request.transfer_id)
        .await
        .unwrap();
    assert_eq!(rejected.status, TransferStatus::Rejected);
    assert_eq!(rejected.bytes_transferred, 0);

    let state = next_matching(&mut alice_events, "sender sees rejection", |e| match e {
        PeerEvent::Transfer(state) if state.status == TransferStatus::Rejected => Some(state),
        _ => None,
    })
    .await;
    assert_eq!(state.transfer_id, offered.transfer_id);
    assert_eq!(state.bytes_transferred, 0);
    let sent = to_bob.transfer(&offered.transfer_id).unwrap();
    assert_eq!(sent.status, TransferStatus::Rejected);
    assert_eq!(sent.bytes_transferred, 0);
    let received = to_alice.transfer(&offered.transfer_id).unwrap();
    assert_eq!(received.status, TransferStatus::Rejected);
    assert_eq!(received.bytes_transferred, 0);

    let binaries = alice
        .channel(0)
        .sent_frames()
        .into_iter()
        .filter(|f| matches!(f, Frame::Binary(_)))
        .count();
    assert_eq!(binaries, 0);

    // A second decision on a finished transfer is refused
    assert!(bob.client.accept_file("alice", &request.transfer_id).await.is_err());
}

#[tokio::test]
async fn test_accept_unknown_transfer_fails() {
    let harness = Harness::new();
    let mut alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    connect_chat(&mut alice, &mut bob).await;

    assert!(bob.client.accept_file("alice", "file_missing").await.is_err());
}

#[tokio::test]
async fn test_disconnect_mid_transfer_fails_both_sides() {
    let harness = Harness::new();
    let mut alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let ((to_bob, _), (to_alice, mut bob_events)) = connect_chat(&mut alice, &mut bob).await;

    // Two chunks go out, then the channel reports a full buffer
    alice.channel(0).stall_after_binary_frames(2);

    let source = FileSource::from_bytes("big.bin", "application/octet-stream", payload(12 * CHUNK_SIZE));
    let offered = alice.client.send_file("bob", source).await.unwrap();
    let request = incoming_request(&mut bob_events).await;
    bob.client
        .accept_file("alice", &request.transfer_id)
        .await
        .unwrap();

    for expected in 0..2u32 {
        let index = next_matching(&mut bob_events, "chunk", |e| match e {
            PeerEvent::ChunkReceived { chunk_index, .. } => Some(chunk_index),
            _ => None,
        })
        .await;
        assert_eq!(index, expected);
    }

    harness.network.sever_all();

    let transfer_id = offered.transfer_id.clone();
    eventually("both transfers failed", || {
        let sent = to_bob.transfer(&transfer_id).map(|s| s.status);
        let received = to_alice.transfer(&transfer_id).map(|s| s.status);
        sent == Some(TransferStatus::Failed) && received == Some(TransferStatus::Failed)
    })
    .await;
    assert_eq!(to_bob.status(), ConnectionStatus::Disconnected);
    assert_eq!(to_alice.status(), ConnectionStatus::Disconnected);

    let partial = to_alice.transfer(&transfer_id).unwrap();
    assert_eq!(partial.bytes_transferred, 2 * CHUNK_SIZE as u64);
    assert!(partial.progress < 100);

    // Nothing was assembled from the partial data
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    while let Ok(event) = bob_events.try_recv() {
        assert!(!matches!(event, PeerEvent::FileReceived(_)), "partial file surfaced: {:?}", event);
    }
}

#[tokio::test]
async fn test_pending_offer_fails_on_disconnect() {
    let harness = Harness::new();
    let mut alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let ((to_bob, _), (to_alice, mut bob_events)) = connect_chat(&mut alice, &mut bob).await;

    let source = FileSource::from_bytes("later.txt", "text/plain", payload(10));
    let offered = alice.client.send_file("bob", source).await.unwrap();
    incoming_request(&mut bob_events).await;

    harness.network.sever_all();
    let transfer_id = offered.transfer_id.clone();
    eventually("pending offers failed", || {
        to_bob.transfer(&transfer_id).map(|s| s.status) == Some(TransferStatus::Failed)
            && to_alice.transfer(&transfer_id).map(|s| s.status) == Some(TransferStatus::Failed)
    })
    .await;
}

#[tokio::test]
async fn test_send_file_requires_connection() {
    let harness = Harness::new();
    let alice = harness.peer("alice").await;
    alice.client.start_chat("bob").await.unwrap();

    let source = FileSource::from_bytes("early.txt", "text/plain", payload(10));
    assert!(alice.client.send_file("bob", source).await.is_err());
}
