//! Call sessions, busy handling and media degradation

mod common;

use common::{eventually, next_matching, test_config, Harness, TestPeer, WAIT};
use std::time::Duration;
use trends_d2d::{
    signal_path, CallSession, CallStatus, ClientEvent, ConnectionStatus, IgnoreReason, Invitation,
    MockMediaSource,
};

async fn incoming_call(peer: &mut TestPeer) -> Invitation {
    next_matching(&mut peer.invitations, "incoming call", |e| match e {
        ClientEvent::Incoming(invitation) if invitation.with_audio => Some(invitation),
        _ => None,
    })
    .await
}

/// Drive `session` until `done` holds
async fn drive_until(session: &mut CallSession, what: &str, done: impl Fn(&CallSession) -> bool) {
    let step = async {
        while !done(session) {
            if session.next_event().await.is_none() {
                break;
            }
        }
    };
    let timed_out = tokio::time::timeout(WAIT, step).await.is_err();
    if timed_out || !done(session) {
        panic!("call never reached {} (status {:?})", what, session.status());
    }
}

async fn establish_call(alice: &TestPeer, bob: &mut TestPeer) -> (CallSession, CallSession) {
    let mut outgoing = alice.client.start_call("bob", true).await.unwrap();
    assert_eq!(outgoing.status(), CallStatus::Outgoing);

    let invitation = incoming_call(bob).await;
    assert_eq!(invitation.caller_id, "alice");
    assert_eq!(bob.client.ringing(), Some(invitation.clone()));

    let mut incoming = bob.client.answer_call(&invitation).await.unwrap();
    assert_eq!(incoming.status(), CallStatus::Incoming);
    assert!(bob.client.ringing().is_none());

    drive_until(&mut outgoing, "connected", |s| s.status() == CallStatus::Connected).await;
    drive_until(&mut incoming, "connected", |s| s.status() == CallStatus::Connected).await;
    (outgoing, incoming)
}

#[tokio::test]
async fn test_call_connects_with_audio_both_ways() {
    let harness = Harness::new();
    let alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;

    let (mut outgoing, mut incoming) = establish_call(&alice, &mut bob).await;
    drive_until(&mut outgoing, "remote audio", |s| s.state().remote_audio).await;
    drive_until(&mut incoming, "remote audio", |s| s.state().remote_audio).await;

    assert!(outgoing.state().local_audio);
    assert!(incoming.state().local_audio);
    assert_eq!(alice.media.acquired(), 1);
    assert_eq!(bob.media.acquired(), 1);
    assert_eq!(alice.transport.connections()[0].local_media().len(), 1);

    // The call connection carries chat as well
    alice.client.send_message("bob", "can you hear me").await.unwrap();
}

#[tokio::test]
async fn test_mute_and_speaker() {
    let harness = Harness::new();
    let alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let (mut outgoing, _incoming) = establish_call(&alice, &mut bob).await;

    let mic = outgoing.manager().local_media().unwrap();
    assert!(mic.is_enabled());
    assert!(outgoing.toggle_mute());
    assert!(!mic.is_enabled());
    assert!(!outgoing.toggle_mute());
    assert!(mic.is_enabled());

    assert!(outgoing.toggle_speaker());
    assert!(outgoing.state().speaker_on);
    assert!(!outgoing.toggle_speaker());
}

#[tokio::test]
async fn test_hang_up_ends_both_sides() {
    let harness = Harness::new();
    let alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let (mut outgoing, mut incoming) = establish_call(&alice, &mut bob).await;
    let mic = outgoing.manager().local_media().unwrap();

    outgoing.end().await;
    assert_eq!(outgoing.status(), CallStatus::Ended);
    assert!(mic.is_stopped());
    assert!(alice.client.registry().get("bob").is_none());

    drive_until(&mut incoming, "ended", |s| s.status() == CallStatus::Ended).await;
    eventually("bob released the call", || bob.client.registry().get("alice").is_none()).await;

    // Ending twice is harmless
    outgoing.end().await;
    assert_eq!(outgoing.status(), CallStatus::Ended);
}

#[tokio::test]
async fn test_duration_counts_connected_time() {
    let harness = Harness::new();
    let alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let (mut outgoing, _incoming) = establish_call(&alice, &mut bob).await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(outgoing.state().duration() >= Duration::from_millis(30));
    outgoing.end().await;
    let frozen = outgoing.state().duration();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(outgoing.state().duration(), frozen);
}

#[tokio::test]
async fn test_rejected_call_fails_caller() {
    let harness = Harness::new();
    let alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;

    let mut outgoing = alice.client.start_call("bob", true).await.unwrap();
    let invitation = incoming_call(&mut bob).await;
    bob.client.reject_call(&invitation).await.unwrap();
    assert!(bob.client.ringing().is_none());

    drive_until(&mut outgoing, "ended", |s| s.status() == CallStatus::Ended).await;
    assert_eq!(outgoing.manager().status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn test_busy_rejects_second_caller() {
    let harness = Harness::new();
    let alice = harness.peer("alice").await;
    let carol = harness.peer("carol").await;
    let mut bob = harness.peer("bob").await;

    let _from_alice = alice.client.start_call("bob", true).await.unwrap();
    let first = incoming_call(&mut bob).await;
    assert_eq!(first.caller_id, "alice");

    let mut from_carol = carol.client.start_call("bob", true).await.unwrap();
    let (invitation, reason) = next_matching(&mut bob.invitations, "busy", |e| match e {
        ClientEvent::Ignored { invitation, reason } => Some((invitation, reason)),
        _ => None,
    })
    .await;
    assert_eq!(invitation.caller_id, "carol");
    assert_eq!(reason, IgnoreReason::Busy);
    assert_eq!(bob.client.ringing(), Some(first));

    drive_until(&mut from_carol, "rejected", |s| s.status() == CallStatus::Ended).await;
}

#[tokio::test]
async fn test_replace_policy_supersedes_ringing_call() {
    let harness = Harness::new();
    let alice = harness.peer("alice").await;
    let carol = harness.peer("carol").await;
    let mut config = test_config("bob");
    config.session.busy_policy = trends_d2d::BusyPolicy::Replace;
    let mut bob = harness.peer_with("bob", config, MockMediaSource::new()).await;

    let mut from_alice = alice.client.start_call("bob", true).await.unwrap();
    incoming_call(&mut bob).await;
    let _from_carol = carol.client.start_call("bob", true).await.unwrap();

    let superseded = next_matching(&mut bob.invitations, "superseded", |e| match e {
        ClientEvent::Superseded(invitation) => Some(invitation),
        _ => None,
    })
    .await;
    assert_eq!(superseded.caller_id, "alice");
    let ringing = incoming_call(&mut bob).await;
    assert_eq!(ringing.caller_id, "carol");
    assert_eq!(bob.client.ringing(), Some(ringing));

    drive_until(&mut from_alice, "rejected", |s| s.status() == CallStatus::Ended).await;
}

#[tokio::test]
async fn test_denied_microphone_degrades_call() {
    let harness = Harness::new();
    let alice = harness.peer("alice").await;
    let mut bob = harness
        .peer_with("bob", test_config("bob"), MockMediaSource::denying())
        .await;

    let (mut outgoing, incoming) = establish_call(&alice, &mut bob).await;
    assert!(!incoming.state().local_audio);
    assert!(incoming.manager().is_media_degraded());
    assert!(incoming.manager().local_media().is_none());
    assert_eq!(incoming.manager().status(), ConnectionStatus::Connected);

    // Alice still gets the data channel and no remote track
    alice.client.send_message("bob", "muted?").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(20), outgoing.next_event()).await {}
    assert!(!outgoing.state().remote_audio);
}

#[tokio::test]
async fn test_call_replaces_chat_session() {
    let harness = Harness::new();
    let mut alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let ((chat, _), (bob_chat, _)) = common::connect_chat(&mut alice, &mut bob).await;

    let (mut outgoing, mut incoming) = establish_call(&alice, &mut bob).await;
    assert_eq!(chat.status(), ConnectionStatus::Idle);
    assert!(!bob_chat.is_live());
    assert!(alice.manager("bob").with_audio());
    assert!(bob.manager("alice").with_audio());
    drive_until(&mut outgoing, "remote audio", |s| s.state().remote_audio).await;
    drive_until(&mut incoming, "remote audio", |s| s.state().remote_audio).await;

    // A second call while one is live is refused
    assert!(alice.client.start_call("bob", true).await.is_err());
}

#[tokio::test]
async fn test_call_upgrades_chat_the_callee_still_sees_connected() {
    let harness = Harness::new();
    let mut alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let (_, (bob_chat, _)) = common::connect_chat(&mut alice, &mut bob).await;

    // Alice calls from a second device, so bob's chat link is still up
    // when the call invitation lands
    let alice_phone = harness.peer("alice").await;
    let mut outgoing = alice_phone.client.start_call("bob", true).await.unwrap();

    let invitation = incoming_call(&mut bob).await;
    assert_eq!(invitation.caller_id, "alice");
    assert!(!bob_chat.is_live());

    let mut incoming = bob.client.answer_call(&invitation).await.unwrap();
    drive_until(&mut outgoing, "connected", |s| s.status() == CallStatus::Connected).await;
    drive_until(&mut incoming, "connected", |s| s.status() == CallStatus::Connected).await;
    assert!(bob.manager("alice").with_audio());
}

#[tokio::test]
async fn test_caller_hang_up_stops_ringing() {
    let harness = Harness::new();
    let alice = harness.peer("alice").await;
    let carol = harness.peer("carol").await;
    let mut bob = harness.peer("bob").await;

    let mut from_alice = alice.client.start_call("bob", true).await.unwrap();
    let ringing = incoming_call(&mut bob).await;
    from_alice.end().await;

    let withdrawn = next_matching(&mut bob.invitations, "withdrawn", |e| match e {
        ClientEvent::Withdrawn(invitation) => Some(invitation),
        _ => None,
    })
    .await;
    assert_eq!(withdrawn, ringing);
    assert!(bob.client.ringing().is_none());

    // The next caller is not turned away as busy
    let _from_carol = carol.client.start_call("bob", true).await.unwrap();
    let next = incoming_call(&mut bob).await;
    assert_eq!(next.caller_id, "carol");
    assert_eq!(bob.client.ringing(), Some(next));
}

#[tokio::test]
async fn test_answered_call_is_not_withdrawn() {
    let harness = Harness::new();
    let alice = harness.peer("alice").await;
    let mut bob = harness.peer("bob").await;
    let (mut outgoing, mut incoming) = establish_call(&alice, &mut bob).await;

    outgoing.end().await;
    drive_until(&mut incoming, "ended", |s| s.status() == CallStatus::Ended).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    while let Ok(event) = bob.invitations.try_recv() {
        assert!(!matches!(event, ClientEvent::Withdrawn(_)), "unexpected {:?}", event);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let harness = Harness::new();
    let mut config = test_config("alice");
    config.session.ring_timeout_secs = 30;
    let alice = harness.peer_with("alice", config, MockMediaSource::new()).await;

    let mut outgoing = alice.client.start_call("bob", true).await.unwrap();
    let signal_id = outgoing.manager().signal_id().unwrap();
    while outgoing.next_event().await.is_some() {}

    assert_eq!(outgoing.status(), CallStatus::Ended);
    assert!(alice.client.registry().is_empty());
    eventually("record deleted", || {
        harness.store.document(&signal_path(&signal_id)).is_none()
    })
    .await;
}
