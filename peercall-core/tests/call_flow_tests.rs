//! End-to-end call flows between two managers over the in-memory bus

mod common;

use async_trait::async_trait;
use common::{
    eventually, party, party_with, party_with_provider, states_until, test_config, user, within,
};
use peercall_core::{
    CallError, CallEvent, CallId, CallManagerConfig, CallState, IceConfigError, IceServer,
    IceServerProvider, MediaKind, MemorySignalBus, PeerConnectionState, RemoteTrack,
    StaticMediaCapture,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn offer_answer_exchange_connects_both_sides() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    let bob = party("bob", &bus);
    let call_id = CallId::between(&alice.user, &bob.user);
    let mut alice_events = alice.manager.subscribe_events();
    let mut bob_events = bob.manager.subscribe_events();

    let (alice_media, alice_call) = alice
        .manager
        .start_call(bob.user.clone(), true)
        .await
        .unwrap();
    let (_bob_media, bob_call) = bob
        .manager
        .accept_call(alice.user.clone(), true)
        .await
        .unwrap();

    assert_eq!(alice_call.call_id(), &call_id);
    assert_eq!(bob_call.call_id(), &call_id);
    assert!(alice_media.has_video());

    assert_eq!(
        states_until(&mut alice_events, &call_id, CallState::Connected).await,
        vec![CallState::Connecting, CallState::Connected]
    );
    assert_eq!(
        states_until(&mut bob_events, &call_id, CallState::Connected).await,
        vec![CallState::Connecting, CallState::Connected]
    );
    assert_eq!(
        alice.manager.get_call_state(&call_id).await,
        Some(CallState::Connected)
    );

    let alice_peer = alice.factory.last();
    let bob_peer = bob.factory.last();
    assert_eq!(alice_peer.offers(), vec![false]);
    assert_eq!(bob_peer.answers(), 1);
    assert_eq!(alice_peer.premature_candidates(), 0);
    assert_eq!(bob_peer.premature_candidates(), 0);
}

#[tokio::test]
async fn call_id_is_shared_by_both_sides() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    let bob = party("bob", &bus);

    let (_, from_bob) = bob
        .manager
        .start_call(alice.user.clone(), false)
        .await
        .unwrap();
    let (_, from_alice) = alice
        .manager
        .accept_call(bob.user.clone(), false)
        .await
        .unwrap();

    assert_eq!(from_bob.call_id().as_str(), "alice_bob");
    assert_eq!(from_alice.call_id().as_str(), "alice_bob");
    within(from_bob.wait_for_state(CallState::Connected))
        .await
        .unwrap();
    within(from_alice.wait_for_state(CallState::Connected))
        .await
        .unwrap();
}

#[tokio::test]
async fn accept_picks_up_replayed_offer() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    let (_, alice_call) = alice
        .manager
        .start_call(user("bob"), false)
        .await
        .unwrap();
    assert!(eventually(|| !bus.stored(alice_call.call_id()).is_empty()).await);

    // Bob comes online after the offer and its candidates were stored
    tokio::time::sleep(Duration::from_millis(50)).await;
    let bob = party("bob", &bus);
    let (_, bob_call) = bob
        .manager
        .accept_call(alice.user.clone(), false)
        .await
        .unwrap();

    within(bob_call.wait_for_state(CallState::Connected))
        .await
        .unwrap();
    within(alice_call.wait_for_state(CallState::Connected))
        .await
        .unwrap();
}

#[tokio::test]
async fn remote_stream_handler_sees_track() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    let bob = party("bob", &bus);

    let streams = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = streams.clone();
    alice.manager.on_remote_stream(move |call_id, stream| {
        seen.lock().push((call_id.clone(), stream.clone()));
    });

    let (_, alice_call) = alice
        .manager
        .start_call(bob.user.clone(), false)
        .await
        .unwrap();
    bob.manager
        .accept_call(alice.user.clone(), false)
        .await
        .unwrap();
    within(alice_call.wait_for_state(CallState::Connected))
        .await
        .unwrap();

    assert!(eventually(|| !streams.lock().is_empty()).await);
    let (call_id, stream) = streams.lock()[0].clone();
    assert_eq!(&call_id, alice_call.call_id());
    assert_eq!(stream.tracks.len(), 1);
    assert!(!stream.has_video());
}

#[tokio::test]
async fn remote_tracks_append_or_replace_the_stream() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    let bob = party("bob", &bus);

    let streams = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = streams.clone();
    alice.manager.on_remote_stream(move |_, stream| {
        seen.lock().push(stream.clone());
    });

    let (_, alice_call) = alice
        .manager
        .start_call(bob.user.clone(), false)
        .await
        .unwrap();
    bob.manager
        .accept_call(alice.user.clone(), false)
        .await
        .unwrap();
    within(alice_call.wait_for_state(CallState::Connected))
        .await
        .unwrap();
    assert!(eventually(|| streams.lock().len() == 1).await);

    let peer = alice.factory.last();
    let first_stream = format!("{}-remote-stream", peer.name);

    // Same stream: the track is appended
    peer.emit_track(RemoteTrack {
        id: format!("{}-remote-video", peer.name),
        stream_id: first_stream.clone(),
        kind: MediaKind::Video,
    });
    assert!(eventually(|| streams.lock().len() == 2).await);
    let stream = streams.lock()[1].clone();
    assert_eq!(stream.id, first_stream);
    assert_eq!(stream.tracks.len(), 2);
    assert!(stream.has_video());

    // New stream: it replaces the previous one
    peer.emit_track(RemoteTrack {
        id: "screen-video".to_string(),
        stream_id: "screen-stream".to_string(),
        kind: MediaKind::Video,
    });
    assert!(eventually(|| streams.lock().len() == 3).await);
    let stream = streams.lock()[2].clone();
    assert_eq!(stream.id, "screen-stream");
    assert_eq!(stream.tracks.len(), 1);
    assert_eq!(stream.tracks[0].id, "screen-video");

    // One notification per track
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(streams.lock().len(), 3);
}

#[tokio::test]
async fn glare_converges_on_one_offer() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    let bob = party("bob", &bus);

    let (alice_result, bob_result) = tokio::join!(
        alice.manager.start_call(bob.user.clone(), false),
        bob.manager.start_call(alice.user.clone(), false),
    );
    let (_, alice_call) = alice_result.unwrap();
    let (_, bob_call) = bob_result.unwrap();

    within(alice_call.wait_for_state(CallState::Connected))
        .await
        .unwrap();
    within(bob_call.wait_for_state(CallState::Connected))
        .await
        .unwrap();

    let alice_peer = alice.factory.last();
    let bob_peer = bob.factory.last();
    assert_eq!(alice_peer.rollbacks(), 1, "lower id yields");
    assert_eq!(bob_peer.rollbacks(), 0);
    assert_eq!(alice_peer.answers(), 1);
    assert_eq!(bob_peer.answers(), 0);
}

#[tokio::test]
async fn end_call_closes_once_and_silences_session() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    let bob = party("bob", &bus);
    let (_, alice_call) = alice
        .manager
        .start_call(bob.user.clone(), false)
        .await
        .unwrap();
    bob.manager
        .accept_call(alice.user.clone(), false)
        .await
        .unwrap();
    within(alice_call.wait_for_state(CallState::Connected))
        .await
        .unwrap();

    let call_id = alice_call.call_id().clone();
    let mut events = alice.manager.subscribe_events();
    within(alice.manager.end_call(&call_id)).await;

    assert_eq!(alice_call.state(), CallState::Closed);
    assert_eq!(
        states_until(&mut events, &call_id, CallState::Closed).await,
        vec![CallState::Closed]
    );
    let peer = alice.factory.last();
    assert!(peer.is_closed());
    assert!(!peer.is_attached());
    assert!(bus.stored(&call_id).is_empty());

    // Second close and late primitive events change nothing
    within(alice.manager.end_call(&call_id)).await;
    within(alice_call.close()).await;
    peer.simulate(PeerConnectionState::Connected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(
        alice.manager.get_call_state(&call_id).await,
        Some(CallState::Closed)
    );
    assert!(alice.manager.active_calls().await.is_empty());
}

#[tokio::test]
async fn ending_unknown_call_is_noop() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    let call_id = CallId::between(&user("alice"), &user("zed"));
    within(alice.manager.end_call(&call_id)).await;
    assert_eq!(alice.manager.get_call_state(&call_id).await, None);
}

#[tokio::test]
async fn media_failure_rejects_start_and_closes() {
    let bus = MemorySignalBus::new();
    let alice = party_with(
        "alice",
        &bus,
        test_config(),
        true,
        StaticMediaCapture::denied(),
    );
    let call_id = CallId::between(&user("alice"), &user("bob"));
    let mut events = alice.manager.subscribe_events();

    let err = alice
        .manager
        .start_call(user("bob"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::MediaAcquisition(_)));

    assert_eq!(
        states_until(&mut events, &call_id, CallState::Closed).await,
        vec![CallState::Connecting, CallState::Failed, CallState::Closed]
    );
    assert_eq!(
        alice.manager.get_call_state(&call_id).await,
        Some(CallState::Closed)
    );
    assert!(alice.factory.last().is_closed());
    assert!(bus.stored(&call_id).is_empty());
}

#[tokio::test]
async fn peer_creation_failure_is_reported() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    alice
        .factory
        .fail_create
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = alice
        .manager
        .start_call(user("bob"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Negotiation(_)));
    assert!(alice.manager.active_calls().await.is_empty());
}

#[tokio::test]
async fn calling_yourself_is_rejected() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    let err = alice
        .manager
        .start_call(user("alice"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::InvalidParticipant(_)));
}

#[tokio::test]
async fn concurrent_call_limit_is_enforced() {
    let bus = MemorySignalBus::new();
    let config = CallManagerConfig {
        max_concurrent_calls: 1,
        ..test_config()
    };
    let alice = party_with(
        "alice",
        &bus,
        config,
        true,
        StaticMediaCapture::with_default_devices(),
    );

    alice
        .manager
        .start_call(user("bob"), false)
        .await
        .unwrap();
    let err = alice
        .manager
        .start_call(user("carol"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::LimitReached(1)));
}

#[tokio::test]
async fn new_session_retires_previous_one() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);

    let (_, first) = alice
        .manager
        .start_call(user("bob"), false)
        .await
        .unwrap();
    let (_, second) = alice
        .manager
        .start_call(user("bob"), false)
        .await
        .unwrap();

    assert_eq!(first.state(), CallState::Closed);
    assert!(first.is_closed());
    assert_eq!(second.state(), CallState::Connecting);

    let peers = alice.factory.peers();
    assert_eq!(peers.len(), 2);
    assert!(peers[0].is_closed());
    assert!(!peers[1].is_closed());
    assert_eq!(alice.manager.active_calls().await, vec![second.call_id().clone()]);
}

#[tokio::test]
async fn incoming_offer_is_announced() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    let bob = party("bob", &bus);
    bob.manager.watch_incoming().await.unwrap();
    let mut bob_events = bob.manager.subscribe_events();

    alice
        .manager
        .start_call(bob.user.clone(), false)
        .await
        .unwrap();

    let event = within(async {
        loop {
            if let Ok(event @ CallEvent::IncomingCall { .. }) = bob_events.recv().await {
                break event;
            }
        }
    })
    .await;
    match event {
        CallEvent::IncomingCall { call_id, from } => {
            assert_eq!(call_id.as_str(), "alice_bob");
            assert_eq!(from, alice.user);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let (_, bob_call) = bob
        .manager
        .accept_call(alice.user.clone(), false)
        .await
        .unwrap();
    within(bob_call.wait_for_state(CallState::Connected))
        .await
        .unwrap();
}

#[tokio::test]
async fn state_handler_sees_every_transition() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);
    let bob = party("bob", &bus);

    let states = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = states.clone();
    alice.manager.on_state_changed(move |_, state| {
        seen.lock().push(state);
    });

    let (_, call) = alice
        .manager
        .start_call(bob.user.clone(), false)
        .await
        .unwrap();
    bob.manager
        .accept_call(alice.user.clone(), false)
        .await
        .unwrap();
    within(call.wait_for_state(CallState::Connected))
        .await
        .unwrap();
    within(call.cancel()).await;

    assert_eq!(
        *states.lock(),
        vec![CallState::Connecting, CallState::Connected, CallState::Closed]
    );
}

#[tokio::test]
async fn shutdown_closes_all_sessions() {
    let bus = MemorySignalBus::new();
    let alice = party("alice", &bus);

    let (_, to_bob) = alice
        .manager
        .start_call(user("bob"), false)
        .await
        .unwrap();
    let (_, to_carol) = alice
        .manager
        .start_call(user("carol"), true)
        .await
        .unwrap();

    within(alice.manager.shutdown()).await;
    assert!(to_bob.is_closed());
    assert!(to_carol.is_closed());
    assert!(alice.factory.peers().iter().all(|p| p.is_closed()));
    assert!(alice.manager.active_calls().await.is_empty());
}

/// Provider that answers after a short delay
struct SlowProvider;

#[async_trait]
impl IceServerProvider for SlowProvider {
    async fn fetch(&self) -> Result<Vec<IceServer>, IceConfigError> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(vec![IceServer::stun("stun:stun.example.com:3478")])
    }
}

#[tokio::test]
async fn concurrent_opens_leave_one_live_session() {
    let bus = MemorySignalBus::new();
    let alice = party_with_provider("alice", &bus, Arc::new(SlowProvider));

    let (first, second) = tokio::join!(
        alice.manager.start_call(user("bob"), false),
        alice.manager.start_call(user("bob"), false),
    );
    assert!(first.is_ok() || second.is_ok());

    let live = || {
        alice
            .factory
            .peers()
            .iter()
            .filter(|p| !p.is_closed())
            .count()
    };
    assert!(eventually(|| live() == 1).await);
    assert_eq!(alice.factory.peers().len(), 2);
    assert_eq!(alice.manager.active_calls().await.len(), 1);

    // The survivor is the session the manager tracks
    let open: Vec<_> = [first, second]
        .into_iter()
        .filter_map(Result::ok)
        .map(|(_, handle)| handle)
        .filter(|handle| !handle.is_closed())
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].state(), CallState::Connecting);
}
