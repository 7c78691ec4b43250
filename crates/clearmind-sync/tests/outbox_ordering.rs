//! Outbox replay: ordering, retries, permanent failures and the driver
//!
//! ## What These Tests Verify
//!
//! - Per-record FIFO survives a transient failure on the first entry
//! - A drain with nothing queued makes no remote calls
//! - Permanent rejections drop the entry and leave the record pending
//! - Timeouts count as transient
//! - Concurrent drains never overlap
//! - The bounded outbox drops the oldest record's whole chain
//! - Entries are only delivered while their owner is signed in
//! - The background driver drains when connectivity returns

mod common;

use std::time::Duration;

use chrono::Utc;
use clearmind_sync::sync::SyncMethod;
use clearmind_sync::{
    ChatMessage, GatewayError, NetworkStatus, NewChatSession, RecordKey, SyncEvent, SyncState,
};
use common::{drain_events, engine, engine_with, test_config, ScriptedGateway, EMAIL, PASSWORD};
use tempfile::tempdir;

fn unavailable() -> GatewayError {
    GatewayError::Unavailable {
        status: 503,
        detail: "maintenance".into(),
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_update_never_overtakes_create() {
    let temp = tempdir().unwrap();
    let gateway = ScriptedGateway::new();
    let engine = engine(&temp, gateway.clone(), NetworkStatus::Offline);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();

    let first = engine.save_thought("first", vec![], vec![]).unwrap();
    engine
        .edit_thought(first.id, "first, revised", vec![], vec![])
        .unwrap();
    let second = engine.save_thought("second", vec![], vec![]).unwrap();

    engine.network().report(NetworkStatus::Online);
    gateway.script_deliveries([Err(unavailable())]);

    let result = engine.sync_now().await.unwrap();
    assert_eq!(result.applied, 1);
    assert_eq!(result.retained_for_retry, 2);
    assert_eq!(result.failed, 0);

    // The create failed, its update was held back, the other record flowed.
    let seen: Vec<_> = gateway
        .deliveries()
        .into_iter()
        .map(|d| (d.record, d.method))
        .collect();
    assert_eq!(
        seen,
        vec![
            (RecordKey::Thought(first.id), SyncMethod::Create),
            (RecordKey::Thought(second.id), SyncMethod::Create),
        ]
    );

    let queued = engine.pending_entries().unwrap();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].attempts, 1);
    assert_eq!(queued[1].attempts, 0, "skipped entries are not attempts");

    let result = engine.sync_now().await.unwrap();
    assert_eq!(result.applied, 2);

    let tail: Vec<_> = gateway.deliveries()[2..]
        .iter()
        .map(|d| (d.record.clone(), d.method))
        .collect();
    assert_eq!(
        tail,
        vec![
            (RecordKey::Thought(first.id), SyncMethod::Create),
            (RecordKey::Thought(first.id), SyncMethod::Update),
        ]
    );

    // Retried create reuses its idempotency key.
    let deliveries = gateway.deliveries();
    assert_eq!(deliveries[0].idempotency_key, deliveries[2].idempotency_key);

    let thoughts = engine.list_thoughts(None).unwrap();
    assert!(thoughts.iter().all(|t| t.sync_state == SyncState::Applied));
}

#[tokio::test]
async fn test_second_drain_makes_no_calls() {
    let temp = tempdir().unwrap();
    let gateway = ScriptedGateway::new();
    let engine = engine(&temp, gateway.clone(), NetworkStatus::Online);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();

    engine.complete_exercise("thought-record").unwrap();
    engine.save_thought("one", vec![], vec![]).unwrap();

    let first = engine.sync_now().await.unwrap();
    assert_eq!(first.applied, 2);
    let calls = gateway.delivery_count();

    let second = engine.sync_now().await.unwrap();
    assert_eq!(second.attempted(), 0);
    assert_eq!(gateway.delivery_count(), calls);
}

#[tokio::test]
async fn test_record_stays_pending_until_last_entry_applies() {
    let temp = tempdir().unwrap();
    let gateway = ScriptedGateway::new();
    let engine = engine(&temp, gateway.clone(), NetworkStatus::Online);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();

    let thought = engine.save_thought("draft", vec![], vec![]).unwrap();
    engine
        .edit_thought(thought.id, "final", vec![], vec![])
        .unwrap();
    gateway.script_deliveries([Ok(()), Err(unavailable())]);

    let result = engine.sync_now().await.unwrap();
    assert_eq!(result.applied, 1);
    assert_eq!(result.retained_for_retry, 1);
    assert_eq!(
        engine.list_thoughts(None).unwrap()[0].sync_state,
        SyncState::Pending
    );
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_conflict_on_chat_session_drops_entry() {
    let temp = tempdir().unwrap();
    let gateway = ScriptedGateway::new();
    let engine = engine(&temp, gateway.clone(), NetworkStatus::Online);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();

    let started = Utc::now();
    let mut draft = NewChatSession::new(started, started + chrono::Duration::minutes(12));
    draft
        .messages
        .push(ChatMessage::new("user", "I can't sleep", started));
    draft.summary = "Worry about work".into();
    let session = engine.save_chat_session(draft).unwrap();

    let mut events = engine.subscribe();
    gateway.script_deliveries([Err(GatewayError::Rejected {
        status: 409,
        detail: "Session already exists".into(),
    })]);

    let result = engine.sync_now().await.unwrap();
    assert_eq!(result.failed, 1);
    assert_eq!(engine.pending_count().unwrap(), 0);

    let failure = drain_events(&mut events)
        .into_iter()
        .find(|e| matches!(e, SyncEvent::SyncFailure { .. }))
        .expect("sync failure event");
    match failure {
        SyncEvent::SyncFailure {
            record,
            status,
            method,
            ..
        } => {
            assert_eq!(record, RecordKey::ChatSession(session.id.clone()));
            assert_eq!(status, Some(409));
            assert_eq!(method, SyncMethod::Create);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let sessions = engine.list_chat_sessions(None).unwrap();
    assert_eq!(sessions[0].sync_state, SyncState::Pending);

    // The dropped upload can be queued again by hand.
    let entry = engine
        .resync(&RecordKey::ChatSession(session.id.clone()))
        .unwrap();
    assert_eq!(entry.resource_path(), "/chat/sessions");
}

#[tokio::test]
async fn test_unauthorized_delivery_is_retained() {
    let temp = tempdir().unwrap();
    let gateway = ScriptedGateway::new();
    let engine = engine(&temp, gateway.clone(), NetworkStatus::Online);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();
    engine.save_thought("needs a token", vec![], vec![]).unwrap();

    gateway.script_deliveries([Err(GatewayError::Unauthorized("expired".into()))]);
    let result = engine.sync_now().await.unwrap();

    assert_eq!(result.retained_for_retry, 1);
    assert_eq!(engine.pending_count().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_delivery_times_out_as_transient() {
    let temp = tempdir().unwrap();
    let gateway = ScriptedGateway::new();
    let mut config = test_config(&temp);
    config.request_timeout_secs = 1;
    let engine = engine_with(config, gateway.clone(), NetworkStatus::Offline);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();
    engine.save_thought("slow network", vec![], vec![]).unwrap();

    engine.network().report(NetworkStatus::Online);
    gateway.set_delivery_delay(Duration::from_secs(60));
    let mut events = engine.subscribe();

    let result = engine.sync_now().await.unwrap();
    assert_eq!(result.retained_for_retry, 1);
    assert_eq!(engine.pending_count().unwrap(), 1);
    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::EntryRetained { attempts: 1, .. })));
}

// ============================================================================
// Concurrency and capacity
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_drain_is_a_no_op() {
    let temp = tempdir().unwrap();
    let gateway = ScriptedGateway::new();
    let engine = engine(&temp, gateway.clone(), NetworkStatus::Offline);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();
    engine.save_thought("one", vec![], vec![]).unwrap();

    gateway.set_delivery_delay(Duration::from_millis(200));
    let owner = engine.current_user().map(|user| user.id);
    let (a, b) = futures::future::join(
        engine.outbox().drain(gateway.as_ref(), owner, None),
        engine.outbox().drain(gateway.as_ref(), owner, None),
    )
    .await;

    assert!(a.skipped_busy ^ b.skipped_busy, "exactly one drain runs");
    assert_eq!(a.applied + b.applied, 1);
    assert_eq!(gateway.delivery_count(), 1);
    assert!(!engine.outbox().is_draining());
}

#[tokio::test]
async fn test_full_outbox_evicts_oldest() {
    let temp = tempdir().unwrap();
    let mut config = test_config(&temp);
    config.outbox_capacity = 2;
    let engine = engine_with(config, ScriptedGateway::new(), NetworkStatus::Offline);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();
    let mut events = engine.subscribe();

    let first = engine.save_thought("one", vec![], vec![]).unwrap();
    engine.save_thought("two", vec![], vec![]).unwrap();
    engine.save_thought("three", vec![], vec![]).unwrap();

    let queued = engine.pending_entries().unwrap();
    assert_eq!(queued.len(), 2);
    assert!(queued
        .iter()
        .all(|e| e.record != RecordKey::Thought(first.id)));

    let evicted: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::EntryEvicted { record, .. } => Some(record),
            _ => None,
        })
        .collect();
    assert_eq!(evicted, vec![RecordKey::Thought(first.id)]);

    // The thought itself is kept; only its upload was dropped.
    assert_eq!(engine.list_thoughts(None).unwrap().len(), 3);
}

#[tokio::test]
async fn test_eviction_drops_the_whole_record_chain() {
    let temp = tempdir().unwrap();
    let gateway = ScriptedGateway::new();
    let mut config = test_config(&temp);
    config.outbox_capacity = 2;
    let engine = engine_with(config, gateway.clone(), NetworkStatus::Offline);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();
    let mut events = engine.subscribe();

    let first = engine.save_thought("one", vec![], vec![]).unwrap();
    engine
        .edit_thought(first.id, "one, revised", vec![], vec![])
        .unwrap();
    let second = engine.save_thought("two", vec![], vec![]).unwrap();

    // The update must not outlive the create it depends on.
    let queued: Vec<_> = engine
        .pending_entries()
        .unwrap()
        .into_iter()
        .map(|e| (e.record, e.method))
        .collect();
    assert_eq!(
        queued,
        vec![(RecordKey::Thought(second.id), SyncMethod::Create)]
    );

    let evicted: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::EntryEvicted { record, .. } => Some(record),
            _ => None,
        })
        .collect();
    assert_eq!(
        evicted,
        vec![RecordKey::Thought(first.id), RecordKey::Thought(first.id)]
    );

    engine.network().report(NetworkStatus::Online);
    let result = engine.sync_now().await.unwrap();
    assert_eq!(result.applied, 1);

    let seen: Vec<_> = gateway
        .deliveries()
        .into_iter()
        .map(|d| (d.record, d.method))
        .collect();
    assert_eq!(
        seen,
        vec![(RecordKey::Thought(second.id), SyncMethod::Create)]
    );

    let thoughts = engine.list_thoughts(None).unwrap();
    let dropped = thoughts.iter().find(|t| t.id == first.id).unwrap();
    assert_eq!(dropped.sync_state, SyncState::Pending);

    // A resync queues a fresh create carrying the latest text.
    engine.resync(&RecordKey::Thought(first.id)).unwrap();
    engine.sync_now().await.unwrap();
    let last = gateway.deliveries().pop().unwrap();
    assert_eq!(last.record, RecordKey::Thought(first.id));
    assert_eq!(last.method, SyncMethod::Create);

    let thoughts = engine.list_thoughts(None).unwrap();
    assert!(thoughts.iter().all(|t| t.sync_state == SyncState::Applied));
}

// ============================================================================
// Ownership
// ============================================================================

#[tokio::test]
async fn test_entries_only_travel_under_their_owners_session() {
    const ALICE: &str = "alice@example.com";
    const BOB: &str = "bob@example.com";

    let temp = tempdir().unwrap();
    let gateway = ScriptedGateway::new();
    let engine = engine(&temp, gateway.clone(), NetworkStatus::Offline);

    engine.register(ALICE, PASSWORD, None).await.unwrap();
    let private = engine.save_thought("alice's entry", vec![], vec![]).unwrap();
    engine.logout();

    engine.network().report(NetworkStatus::Online);
    engine.register(BOB, PASSWORD, None).await.unwrap();
    assert!(engine.session().credential().is_some());

    let result = engine.sync_now().await.unwrap();
    assert_eq!(result.applied, 0);
    assert_eq!(result.retained_for_retry, 1);
    assert_eq!(gateway.delivery_count(), 0);
    assert_eq!(engine.pending_count().unwrap(), 1);

    // Once alice is back, her entry goes out with her own token.
    engine.logout();
    gateway.add_account(ALICE, PASSWORD);
    engine.login(ALICE, PASSWORD).await.unwrap();
    let token = engine.session().credential().unwrap().access_token.clone();

    let result = engine.sync_now().await.unwrap();
    assert_eq!(result.applied, 1);
    let deliveries = gateway.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].record, RecordKey::Thought(private.id));
    assert_eq!(deliveries[0].bearer.as_deref(), Some(token.as_str()));
    assert_eq!(engine.pending_count().unwrap(), 0);
}

// ============================================================================
// Background driver
// ============================================================================

#[tokio::test]
async fn test_driver_drains_on_reconnect() {
    let temp = tempdir().unwrap();
    let gateway = ScriptedGateway::new();
    let engine = engine(&temp, gateway.clone(), NetworkStatus::Offline);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();
    engine.save_thought("queued while offline", vec![], vec![]).unwrap();

    let mut events = engine.subscribe();
    let driver = engine.spawn_sync_driver();
    engine.network().report(NetworkStatus::Online);

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let SyncEvent::DrainFinished { applied, .. } = events.recv().await.unwrap() {
                return applied;
            }
        }
    })
    .await
    .expect("drain after reconnect");
    assert_eq!(finished, 1);

    driver.shutdown().await;
    assert_eq!(engine.pending_count().unwrap(), 0);
    assert_eq!(gateway.delivery_count(), 1);
}

#[tokio::test]
async fn test_driver_shutdown_waits_for_drain() {
    let temp = tempdir().unwrap();
    let gateway = ScriptedGateway::new();
    let engine = engine(&temp, gateway.clone(), NetworkStatus::Offline);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();
    engine.save_thought("slow", vec![], vec![]).unwrap();
    gateway.set_delivery_delay(Duration::from_millis(300));

    let mut events = engine.subscribe();
    let driver = engine.spawn_sync_driver();
    engine.network().report(NetworkStatus::Online);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if matches!(events.recv().await.unwrap(), SyncEvent::DrainStarted { .. }) {
                return;
            }
        }
    })
    .await
    .expect("drain started");

    driver.shutdown().await;
    assert_eq!(gateway.delivery_count(), 1);
    assert_eq!(engine.pending_count().unwrap(), 0);
    assert!(!engine.outbox().is_draining());
}
