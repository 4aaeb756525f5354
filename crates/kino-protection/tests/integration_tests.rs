//! Integration tests for Kino Protection

use bytes::Bytes;
use kino_protection::{
    memory::{InMemoryKeyStore, InMemoryPlatform, InMemorySurface, SessionBehavior},
    ClearKeyKey, ClearKeyKeySet, EventReceiver, KeyMessageType, KeySystem, KeySystemAccess, KeySystemCandidate,
    KeySystemConfiguration, ProtectionConfig, ProtectionEvent, ProtectionModel, SessionToken, SessionType,
    TeardownState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_test::{assert_err, assert_ok};

// =============================================================================
// Helpers
// =============================================================================

const TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for the next event on `topic`, skipping everything else
async fn next_event(rx: &mut EventReceiver, topic: &str) -> ProtectionEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if event.topic() == topic {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {topic}"))
}

/// Collect every event up to and including the first one on `topic`
async fn events_until(rx: &mut EventReceiver, topic: &str) -> Vec<ProtectionEvent> {
    tokio::time::timeout(TIMEOUT, async {
        let mut events = Vec::new();
        loop {
            let event = rx.recv().await.expect("event bus closed");
            let done = event.topic() == topic;
            events.push(event);
            if done {
                return events;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {topic}"))
}

/// Let spawned tasks run, then assert nothing on `topic` arrived
async fn assert_no_event(rx: &mut EventReceiver, topic: &str) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    loop {
        match rx.try_recv() {
            Ok(event) => assert_ne!(event.topic(), topic, "unexpected {event}"),
            Err(TryRecvError::Empty) => return,
            Err(other) => panic!("receiver error: {other}"),
        }
    }
}

fn candidate(key_system: KeySystem) -> KeySystemCandidate {
    KeySystemCandidate::new(key_system, vec![KeySystemConfiguration::default()])
}

async fn negotiate(model: &ProtectionModel, rx: &mut EventReceiver, key_system: KeySystem) -> KeySystemAccess {
    model.request_key_system_access(vec![candidate(key_system)]);
    match next_event(rx, "key_system_access_complete").await {
        ProtectionEvent::KeySystemAccessComplete(Ok(access)) => access,
        other => panic!("negotiation failed: {other}"),
    }
}

/// Model with `key_system` negotiated and selected
async fn selected_model(
    store: InMemoryKeyStore,
    key_system: KeySystem,
) -> (ProtectionModel, EventReceiver, Arc<InMemoryKeyStore>) {
    let store = Arc::new(store);
    let platform = Arc::new(
        InMemoryPlatform::new()
            .with_key_store(store.clone())
            .accept(key_system),
    );
    let model = ProtectionModel::new(platform, ProtectionConfig::default());
    let mut rx = model.subscribe();

    let access = negotiate(&model, &mut rx, key_system).await;
    assert_ok!(model.select_key_system(access).await);
    match next_event(&mut rx, "key_system_selected").await {
        ProtectionEvent::KeySystemSelected(Ok(ks)) => assert_eq!(ks, key_system),
        other => panic!("selection failed: {other}"),
    }
    (model, rx, store)
}

async fn create_session(
    model: &ProtectionModel,
    rx: &mut EventReceiver,
    init_data: &'static [u8],
) -> SessionToken {
    assert_ok!(
        model
            .create_key_session(Bytes::from_static(init_data), SessionType::Temporary)
            .await
    );
    match next_event(rx, "key_session_created").await {
        ProtectionEvent::KeySessionCreated(Ok(token)) => token,
        other => panic!("session creation failed: {other}"),
    }
}

// =============================================================================
// Negotiation Tests
// =============================================================================

#[tokio::test]
async fn test_fallback_to_second_candidate() {
    let platform = Arc::new(InMemoryPlatform::new().accept(KeySystem::ClearKey));
    let model = ProtectionModel::new(platform.clone(), ProtectionConfig::default());
    let mut rx = model.subscribe();

    model.request_key_system_access(vec![candidate(KeySystem::Widevine), candidate(KeySystem::ClearKey)]);

    match next_event(&mut rx, "key_system_access_complete").await {
        ProtectionEvent::KeySystemAccessComplete(Ok(access)) => {
            assert_eq!(access.key_system(), KeySystem::ClearKey);
        }
        other => panic!("unexpected event: {other}"),
    }
    assert_eq!(platform.attempts(), vec![KeySystem::Widevine, KeySystem::ClearKey]);
    assert_no_event(&mut rx, "key_system_access_complete").await;
}

#[tokio::test]
async fn test_stops_at_first_success() {
    let platform = Arc::new(
        InMemoryPlatform::new()
            .accept(KeySystem::PlayReady)
            .accept(KeySystem::ClearKey),
    );
    let model = ProtectionModel::new(platform.clone(), ProtectionConfig::default());
    let mut rx = model.subscribe();

    model.request_key_system_access(vec![
        candidate(KeySystem::FairPlay),
        candidate(KeySystem::PlayReady),
        candidate(KeySystem::ClearKey),
    ]);

    let event = next_event(&mut rx, "key_system_access_complete").await;
    assert!(matches!(
        event,
        ProtectionEvent::KeySystemAccessComplete(Ok(ref access)) if access.key_system() == KeySystem::PlayReady
    ));
    assert_eq!(platform.attempts(), vec![KeySystem::FairPlay, KeySystem::PlayReady]);
}

#[tokio::test]
async fn test_all_candidates_rejected() {
    let platform = Arc::new(InMemoryPlatform::new());
    let model = ProtectionModel::new(platform.clone(), ProtectionConfig::default());
    let mut rx = model.subscribe();
    let systems = [KeySystem::Widevine, KeySystem::PlayReady, KeySystem::ClearKey];

    model.request_key_system_access(systems.iter().copied().map(candidate).collect());

    let event = next_event(&mut rx, "key_system_access_complete").await;
    assert_eq!(event.error(), Some("Key system access denied!"));
    assert_eq!(platform.attempts(), systems.to_vec());
    assert_no_event(&mut rx, "key_system_access_complete").await;
}

#[tokio::test]
async fn test_access_without_reported_configuration() {
    let platform = Arc::new(
        InMemoryPlatform::new()
            .accept(KeySystem::Widevine)
            .without_configuration(),
    );
    let model = ProtectionModel::new(platform, ProtectionConfig::default());
    let mut rx = model.subscribe();

    let access = negotiate(&model, &mut rx, KeySystem::Widevine).await;
    assert!(access.configuration().is_none());
}

#[test]
fn test_detect() {
    assert!(ProtectionModel::detect(&InMemoryPlatform::new()));
    assert!(!ProtectionModel::detect(&InMemoryPlatform::new().unsupported()));
}

// =============================================================================
// Selection & Surface Tests
// =============================================================================

#[tokio::test]
async fn test_selection_failure_leaves_model_unselected() {
    let platform = Arc::new(
        InMemoryPlatform::new()
            .accept(KeySystem::Widevine)
            .fail_key_store_creation(),
    );
    let model = ProtectionModel::new(platform, ProtectionConfig::default());
    let mut rx = model.subscribe();

    let access = negotiate(&model, &mut rx, KeySystem::Widevine).await;
    assert_ok!(model.select_key_system(access.clone()).await);

    let event = next_event(&mut rx, "key_system_selected").await;
    let error = event.error().expect("selection should fail");
    assert!(error.contains("com.widevine.alpha"));
    assert!(error.contains("InvalidStateError"));
    assert_eq!(model.key_system().await, None);

    // A failed selection does not block another attempt
    assert_ok!(model.select_key_system(access).await);
}

#[tokio::test]
async fn test_selection_attaches_key_store_to_surface() {
    let platform = Arc::new(InMemoryPlatform::new().accept(KeySystem::ClearKey));
    let model = ProtectionModel::new(platform, ProtectionConfig::default());
    let mut rx = model.subscribe();
    let surface = Arc::new(InMemorySurface::new());

    model.set_playback_surface(Some(surface.clone())).await;
    assert!(!surface.has_key_store());

    let access = negotiate(&model, &mut rx, KeySystem::ClearKey).await;
    assert_ok!(model.select_key_system(access).await);
    next_event(&mut rx, "key_system_selected").await;

    assert!(surface.has_key_store());
}

#[tokio::test]
async fn test_replacing_surface_detaches_previous() {
    let (model, _rx, _store) = selected_model(InMemoryKeyStore::new(), KeySystem::ClearKey).await;
    let first = Arc::new(InMemorySurface::new());
    let second = Arc::new(InMemorySurface::new());

    model.set_playback_surface(Some(first.clone())).await;
    assert!(first.has_key_store());
    assert_eq!(first.listener_count(), 1);

    model.set_playback_surface(Some(second.clone())).await;
    assert!(!first.has_key_store());
    assert_eq!(first.listener_count(), 0);
    assert!(second.has_key_store());
    assert_eq!(second.listener_count(), 1);
}

#[tokio::test]
async fn test_encrypted_surface_raises_need_key() {
    let model = ProtectionModel::new(Arc::new(InMemoryPlatform::new()), ProtectionConfig::default());
    let mut rx = model.subscribe();
    let surface = Arc::new(InMemorySurface::new());
    model.set_playback_surface(Some(surface.clone())).await;

    surface.encrypted(None, "cenc");
    surface.encrypted(Some(Bytes::from_static(b"pssh-box")), "cenc");

    match next_event(&mut rx, "need_key").await {
        ProtectionEvent::NeedKey(need) => {
            assert_eq!(need.init_data, Bytes::from_static(b"pssh-box"));
            assert_eq!(need.init_data_type, "cenc");
        }
        other => panic!("unexpected event: {other}"),
    }
    assert_no_event(&mut rx, "need_key").await;
}

#[tokio::test]
async fn test_server_certificate() {
    let (model, mut rx, store) = selected_model(InMemoryKeyStore::new(), KeySystem::Widevine).await;

    assert_ok!(model.set_server_certificate(Bytes::from_static(b"cert")).await);
    let event = next_event(&mut rx, "server_certificate_updated").await;
    assert!(!event.is_error());
    assert_eq!(store.certificates(), vec![Bytes::from_static(b"cert")]);

    let (model, mut rx, _) = selected_model(
        InMemoryKeyStore::new().fail_server_certificate(),
        KeySystem::Widevine,
    )
    .await;
    assert_ok!(model.set_server_certificate(Bytes::from_static(b"bad")).await);
    let event = next_event(&mut rx, "server_certificate_updated").await;
    assert_eq!(event.error(), Some("Error updating server certificate -- TypeError"));
}

// =============================================================================
// Precondition Tests
// =============================================================================

#[tokio::test]
async fn test_operations_before_selection_fail_immediately() {
    let platform = Arc::new(InMemoryPlatform::new().accept(KeySystem::ClearKey));
    let model = ProtectionModel::new(platform.clone(), ProtectionConfig::default());
    let mut rx = model.subscribe();

    // A token from another, selected model
    let (other, mut other_rx, _) = selected_model(InMemoryKeyStore::new(), KeySystem::ClearKey).await;
    let token = create_session(&other, &mut other_rx, b"init").await;

    let errors = vec![
        assert_err!(
            model
                .create_key_session(Bytes::from_static(b"init"), SessionType::Temporary)
                .await
        ),
        assert_err!(model.update_key_session(&token, Bytes::from_static(b"license")).await),
        assert_err!(model.load_key_session("persisted").await),
        assert_err!(model.remove_key_session(&token).await),
        assert_err!(model.close_key_session(&token).await),
        assert_err!(model.set_server_certificate(Bytes::from_static(b"cert")).await),
    ];
    for error in errors {
        assert!(error.is_precondition(), "{error}");
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert!(platform.key_store().sessions().is_empty());
}

// =============================================================================
// Session Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_create_session_records_init_data_and_type() {
    let (model, mut rx, _) = selected_model(InMemoryKeyStore::new(), KeySystem::ClearKey).await;

    assert_ok!(
        model
            .create_key_session(Bytes::from_static(b"X"), SessionType::Temporary)
            .await
    );
    let events = events_until(&mut rx, "key_session_created").await;
    let token = match events.last() {
        Some(ProtectionEvent::KeySessionCreated(Ok(token))) => token.clone(),
        other => panic!("unexpected event: {other:?}"),
    };

    assert_eq!(token.init_data(), Some(&Bytes::from_static(b"X")));
    assert_eq!(token.session_type(), SessionType::Temporary);
    assert_eq!(model.session_count().await, 1);

    // The license request raised while generating is routed through the token
    let message = events.iter().find_map(|e| match e {
        ProtectionEvent::KeyMessage(msg) => Some(msg.clone()),
        _ => None,
    });
    let message = message.expect("license request message");
    assert_eq!(message.session, token);
    assert_eq!(message.message_type, KeyMessageType::LicenseRequest);
}

#[tokio::test]
async fn test_create_session_failure_unregisters() {
    let store = InMemoryKeyStore::new().with_session_behavior(SessionBehavior {
        fail_generate_request: true,
        ..Default::default()
    });
    let (model, mut rx, store) = selected_model(store, KeySystem::Widevine).await;

    assert_ok!(
        model
            .create_key_session(Bytes::from_static(b"init"), SessionType::Temporary)
            .await
    );
    let event = next_event(&mut rx, "key_session_created").await;
    assert_eq!(event.error(), Some("Error generating key request -- InvalidStateError"));
    assert_eq!(model.session_count().await, 0);
    assert_eq!(store.sessions()[0].listener_count(), 0);
}

#[tokio::test]
async fn test_clearkey_update_sends_jwk() {
    let (model, mut rx, store) = selected_model(InMemoryKeyStore::new(), KeySystem::ClearKey).await;
    let token = create_session(&model, &mut rx, b"init").await;

    let keys = ClearKeyKeySet::new(vec![ClearKeyKey::new(vec![1, 2, 3], vec![4, 5, 6])]);
    assert_ok!(model.update_key_session(&token, keys).await);

    match next_event(&mut rx, "key_statuses_changed").await {
        ProtectionEvent::KeyStatusesChanged(changed) => {
            assert_eq!(changed, token);
            assert!(!changed.key_statuses().is_empty());
        }
        other => panic!("unexpected event: {other}"),
    }

    let updates = store.sessions()[0].updates();
    let jwk: serde_json::Value = serde_json::from_slice(&updates[0]).unwrap();
    assert_eq!(jwk["keys"][0]["kid"], "AQID");
    assert_eq!(jwk["keys"][0]["k"], "BAUG");
}

#[tokio::test]
async fn test_update_failure_keeps_session() {
    let store = InMemoryKeyStore::new().with_session_behavior(SessionBehavior {
        fail_update: true,
        ..Default::default()
    });
    let (model, mut rx, _) = selected_model(store, KeySystem::Widevine).await;
    let token = create_session(&model, &mut rx, b"init").await;

    assert_ok!(model.update_key_session(&token, Bytes::from_static(b"license")).await);
    match next_event(&mut rx, "key_error").await {
        ProtectionEvent::KeyError(err) => {
            assert_eq!(err.session, token);
            assert_eq!(err.error, "Error sending update() message! InvalidStateError");
        }
        other => panic!("unexpected event: {other}"),
    }
    assert_eq!(model.session_count().await, 1);
}

#[tokio::test]
async fn test_keyset_update_rejected_for_widevine() {
    let (model, mut rx, store) = selected_model(InMemoryKeyStore::new(), KeySystem::Widevine).await;
    let token = create_session(&model, &mut rx, b"init").await;

    let keys = ClearKeyKeySet::new(vec![ClearKeyKey::new(b"kid".to_vec(), b"key".to_vec())]);
    assert_ok!(model.update_key_session(&token, keys).await);

    let event = next_event(&mut rx, "key_error").await;
    assert!(event.is_error());
    assert!(store.sessions()[0].updates().is_empty());
}

#[tokio::test]
async fn test_load_session_outcomes() {
    let store = InMemoryKeyStore::new().with_persisted_session("saved-1");
    let (model, mut rx, store) = selected_model(store, KeySystem::Widevine).await;

    assert_ok!(model.load_key_session("saved-1").await);
    match next_event(&mut rx, "key_session_created").await {
        ProtectionEvent::KeySessionCreated(Ok(token)) => {
            assert_eq!(token.session_id(), "saved-1");
            assert!(token.init_data().is_none());
            assert_eq!(token.session_type(), SessionType::PersistentLicense);
        }
        other => panic!("unexpected event: {other}"),
    }

    assert_ok!(model.load_key_session("missing").await);
    let event = next_event(&mut rx, "key_session_created").await;
    assert_eq!(event.error(), Some("Could not load session! Invalid Session ID (missing)"));

    store.set_session_behavior(SessionBehavior {
        fail_load: true,
        ..Default::default()
    });
    assert_ok!(model.load_key_session("saved-1").await);
    let event = next_event(&mut rx, "key_session_created").await;
    assert_eq!(event.error(), Some("Could not load session (saved-1)! InvalidStateError"));

    assert_eq!(model.session_count().await, 1);
}

#[tokio::test]
async fn test_all_init_data_in_creation_order() {
    let store = InMemoryKeyStore::new().with_persisted_session("saved");
    let (model, mut rx, _) = selected_model(store, KeySystem::ClearKey).await;

    create_session(&model, &mut rx, b"first").await;
    assert_ok!(model.load_key_session("saved").await);
    next_event(&mut rx, "key_session_created").await;
    create_session(&model, &mut rx, b"second").await;

    assert_eq!(model.session_count().await, 3);
    assert_eq!(
        model.all_init_data().await,
        vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
    );
}

#[tokio::test]
async fn test_remove_session() {
    let (model, mut rx, store) = selected_model(InMemoryKeyStore::new(), KeySystem::Widevine).await;
    let token = create_session(&model, &mut rx, b"init").await;

    assert_ok!(model.remove_key_session(&token).await);
    match next_event(&mut rx, "key_session_removed").await {
        ProtectionEvent::KeySessionRemoved(Ok(id)) => assert_eq!(id, token.session_id()),
        other => panic!("unexpected event: {other}"),
    }

    store.set_session_behavior(SessionBehavior {
        fail_remove: true,
        ..Default::default()
    });
    let failing = create_session(&model, &mut rx, b"other").await;
    assert_ok!(model.remove_key_session(&failing).await);
    let event = next_event(&mut rx, "key_session_removed").await;
    let error = event.error().expect("removal should fail");
    assert!(error.starts_with(&format!("Error removing session ({})", failing.session_id())));

    // Removal never unregisters the token
    assert_eq!(model.session_count().await, 2);
}

#[tokio::test]
async fn test_close_waits_for_platform_closed_signal() {
    let store = InMemoryKeyStore::new().with_session_behavior(SessionBehavior {
        defer_closed: true,
        ..Default::default()
    });
    let (model, mut rx, store) = selected_model(store, KeySystem::ClearKey).await;
    let token = create_session(&model, &mut rx, b"init").await;

    assert_ok!(model.close_key_session(&token).await);
    assert_no_event(&mut rx, "key_session_closed").await;
    assert_eq!(model.session_count().await, 1);

    store.sessions()[0].signal_closed();
    match next_event(&mut rx, "key_session_closed").await {
        ProtectionEvent::KeySessionClosed(Ok(id)) => assert_eq!(id, token.session_id()),
        other => panic!("unexpected event: {other}"),
    }
    assert_eq!(model.session_count().await, 0);
    assert!(token.is_removed());
}

#[tokio::test]
async fn test_close_failure_removes_immediately() {
    let store = InMemoryKeyStore::new().with_session_behavior(SessionBehavior {
        fail_close: true,
        ..Default::default()
    });
    let (model, mut rx, store) = selected_model(store, KeySystem::ClearKey).await;
    let token = create_session(&model, &mut rx, b"init").await;
    create_session(&model, &mut rx, b"other").await;

    assert_ok!(model.close_key_session(&token).await);
    let event = next_event(&mut rx, "key_session_closed").await;
    let error = event.error().expect("close should fail");
    assert_eq!(error, format!("Error closing session ({}) InvalidStateError", token.session_id()));
    assert_eq!(model.session_count().await, 1);

    // A late closed signal for the same session changes nothing
    store.sessions()[0].signal_closed();
    assert_no_event(&mut rx, "key_session_closed").await;
    assert_eq!(model.session_count().await, 1);
}

#[tokio::test]
async fn test_platform_initiated_close() {
    let (model, mut rx, store) = selected_model(InMemoryKeyStore::new(), KeySystem::Widevine).await;
    create_session(&model, &mut rx, b"a").await;
    let survivor = create_session(&model, &mut rx, b"b").await;

    store.sessions()[0].signal_closed();
    next_event(&mut rx, "key_session_closed").await;

    assert_eq!(model.sessions().await, vec![survivor]);
}

// =============================================================================
// Teardown Tests
// =============================================================================

#[tokio::test]
async fn test_teardown_without_sessions_is_synchronous() {
    let (model, mut rx, _) = selected_model(InMemoryKeyStore::new(), KeySystem::ClearKey).await;

    assert_ok!(model.teardown().await);

    assert!(matches!(rx.try_recv(), Ok(ProtectionEvent::TeardownComplete)));
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(model.teardown_state().await, TeardownState::Complete);
}

#[tokio::test]
async fn test_teardown_with_mixed_close_outcomes() {
    let (model, mut rx, store) = selected_model(InMemoryKeyStore::new(), KeySystem::ClearKey).await;
    let surface = Arc::new(InMemorySurface::new());
    model.set_playback_surface(Some(surface.clone())).await;

    create_session(&model, &mut rx, b"one").await;
    store.set_session_behavior(SessionBehavior {
        fail_close: true,
        ..Default::default()
    });
    create_session(&model, &mut rx, b"two").await;
    store.set_session_behavior(SessionBehavior::default());
    create_session(&model, &mut rx, b"three").await;
    assert_eq!(model.session_count().await, 3);

    assert_ok!(model.teardown().await);
    let events = events_until(&mut rx, "teardown_complete").await;

    // Sessions that closed cleanly report it; the failed close is absorbed
    let closed = events
        .iter()
        .filter(|e| matches!(e, ProtectionEvent::KeySessionClosed(Ok(_))))
        .count();
    assert_eq!(closed, 2);
    assert!(events.iter().all(|e| !e.is_error()));

    assert_eq!(model.session_count().await, 0);
    assert!(!surface.has_key_store());
    assert_eq!(surface.listener_count(), 0);
    assert_eq!(model.key_system().await, None);
    assert_eq!(model.teardown_state().await, TeardownState::Complete);
    assert_no_event(&mut rx, "teardown_complete").await;
}

#[tokio::test]
async fn test_teardown_cannot_overlap() {
    let store = InMemoryKeyStore::new().with_session_behavior(SessionBehavior {
        defer_closed: true,
        ..Default::default()
    });
    let (model, mut rx, store) = selected_model(store, KeySystem::ClearKey).await;
    create_session(&model, &mut rx, b"one").await;
    create_session(&model, &mut rx, b"two").await;

    assert_ok!(model.teardown().await);
    let err = assert_err!(model.teardown().await);
    assert_eq!(err.error_code(), "TEARDOWN_IN_PROGRESS");
    assert_eq!(model.teardown_state().await, TeardownState::Draining);

    // One session closing is not enough
    store.sessions()[0].signal_closed();
    assert_no_event(&mut rx, "teardown_complete").await;

    store.sessions()[1].signal_closed();
    next_event(&mut rx, "teardown_complete").await;
    assert_eq!(model.session_count().await, 0);
}

#[tokio::test]
async fn test_model_reusable_after_teardown() {
    let (model, mut rx, _) = selected_model(InMemoryKeyStore::new(), KeySystem::ClearKey).await;
    create_session(&model, &mut rx, b"one").await;

    assert_ok!(model.teardown().await);
    next_event(&mut rx, "teardown_complete").await;

    let access = negotiate(&model, &mut rx, KeySystem::ClearKey).await;
    assert_ok!(model.select_key_system(access).await);
    next_event(&mut rx, "key_system_selected").await;
    assert_eq!(model.key_system().await, Some(KeySystem::ClearKey));
}

#[tokio::test]
async fn test_create_session_rejected_while_draining() {
    let store = InMemoryKeyStore::new().with_session_behavior(SessionBehavior {
        defer_closed: true,
        ..Default::default()
    });
    let (model, mut rx, store) = selected_model(store, KeySystem::ClearKey).await;
    let token = create_session(&model, &mut rx, b"one").await;

    assert_ok!(model.teardown().await);

    let err = assert_err!(
        model
            .create_key_session(Bytes::from_static(b"late"), SessionType::Temporary)
            .await
    );
    assert_eq!(err.error_code(), "TEARDOWN_IN_PROGRESS");
    let err = assert_err!(model.load_key_session("persisted").await);
    assert_eq!(err.error_code(), "TEARDOWN_IN_PROGRESS");
    assert_err!(model.update_key_session(&token, Bytes::from_static(b"license")).await);
    assert_err!(model.set_server_certificate(Bytes::from_static(b"cert")).await);
    assert_no_event(&mut rx, "key_session_created").await;
    assert_eq!(store.sessions().len(), 1);

    store.sessions()[0].signal_closed();
    next_event(&mut rx, "teardown_complete").await;
    assert_eq!(model.session_count().await, 0);
    assert!(model.all_init_data().await.is_empty());
    assert_eq!(model.key_system().await, None);
}

// =============================================================================
// Event Delivery Tests
// =============================================================================

#[tokio::test]
async fn test_burst_of_sessions_reaches_slow_subscriber() {
    let (model, mut rx, _) = selected_model(InMemoryKeyStore::new(), KeySystem::ClearKey).await;

    for _ in 0..150 {
        assert_ok!(
            model
                .create_key_session(Bytes::from_static(b"init"), SessionType::Temporary)
                .await
        );
    }
    // Let every request resolve before anything is drained
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(model.session_count().await, 150);

    for _ in 0..150 {
        match next_event(&mut rx, "key_session_created").await {
            ProtectionEvent::KeySessionCreated(Ok(_)) => {}
            other => panic!("unexpected event: {other}"),
        }
    }
    assert_no_event(&mut rx, "key_session_created").await;
}
