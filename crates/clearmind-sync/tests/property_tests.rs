//! Property-based tests for the local store
//!
//! Uses proptest to check store invariants over arbitrary sequences of
//! journal mutations, on both backends, and that the engine's offline
//! journaling is unaffected by connectivity changing underneath it.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clearmind_sync::network::StaticProbe;
use clearmind_sync::storage::{DocumentStore, RedbStore};
use clearmind_sync::sync::SyncMethod;
use clearmind_sync::{
    Batch, Draft, LocalId, LocalStore, NetworkStatus, NewThought, Record, RecordFilter, RecordKey,
    RecordKind, User,
};
use common::{ScriptedGateway, EMAIL, PASSWORD};
use proptest::prelude::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Strategy Generators
// ============================================================================

/// Operations a user can perform on their thoughts
#[derive(Debug, Clone)]
enum JournalOp {
    Add(String),
    Edit(usize, String), // Index into live thoughts
    Delete(usize),       // Index into live thoughts
}

fn text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 ]{1,60}").expect("valid regex")
}

fn journal_ops_strategy(max_ops: usize) -> impl Strategy<Value = Vec<JournalOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => text_strategy().prop_map(JournalOp::Add),
            1 => (0..50usize, text_strategy()).prop_map(|(i, t)| JournalOp::Edit(i, t)),
            1 => (0..50usize).prop_map(JournalOp::Delete),
        ],
        0..max_ops,
    )
}

fn open(temp: &TempDir, embedded: bool) -> Arc<dyn LocalStore> {
    if embedded {
        Arc::new(RedbStore::open(temp.path().join("prop.redb"), 10_000).unwrap())
    } else {
        Arc::new(DocumentStore::open(temp.path().join("prop.json"), 10_000).unwrap())
    }
}

fn seed_user(store: &dyn LocalStore) -> LocalId {
    let user = User {
        id: store.reserve_id(RecordKind::User).unwrap(),
        remote_id: None,
        email: "prop@example.com".into(),
        display_name: "Prop".into(),
        password_hash: "$argon2id$placeholder".into(),
        created_at: Utc::now(),
    };
    store.put(Record::User(user.clone()).into()).unwrap();
    user.id
}

/// Apply `ops` with outbox entries; return the expected live texts by id and
/// the number of intents queued.
fn run_ops(
    store: &dyn LocalStore,
    owner: LocalId,
    ops: &[JournalOp],
) -> (BTreeMap<LocalId, String>, usize, Vec<LocalId>) {
    let mut live: BTreeMap<LocalId, String> = BTreeMap::new();
    let mut issued = Vec::new();
    let mut queued = 0;

    for op in ops {
        match op {
            JournalOp::Add(text) => {
                let draft = Draft::Thought(NewThought {
                    owner_id: owner,
                    text: text.clone(),
                    distortions: vec![],
                    reframes: vec![],
                    created_at: Utc::now(),
                });
                let record = store
                    .apply(Batch::new().put(draft, true))
                    .unwrap()
                    .into_record()
                    .unwrap();
                let id = record.key().local_id().unwrap();
                live.insert(id, text.clone());
                issued.push(id);
                queued += 1;
            }
            JournalOp::Edit(index, text) => {
                let Some(id) = live.keys().nth(index % live.len().max(1)).copied() else {
                    continue;
                };
                let Record::Thought(mut thought) = store.get(&RecordKey::Thought(id)).unwrap()
                else {
                    panic!("thought {} has the wrong kind", id);
                };
                thought.text = text.clone();
                store
                    .apply(Batch::new().put(Record::Thought(thought), true))
                    .unwrap();
                live.insert(id, text.clone());
                queued += 1;
            }
            JournalOp::Delete(index) => {
                let Some(id) = live.keys().nth(index % live.len().max(1)).copied() else {
                    continue;
                };
                store
                    .apply(Batch::new().delete(RecordKey::Thought(id), owner, true))
                    .unwrap();
                live.remove(&id);
                queued += 1;
            }
        }
    }

    (live, queued, issued)
}

/// What an engine run leaves behind: the expected live texts, the stored
/// texts and the queued `(record, method)` pairs.
type JournalRun = (
    BTreeMap<LocalId, String>,
    BTreeMap<LocalId, String>,
    Vec<(RecordKey, SyncMethod)>,
);

/// Drive `ops` through a signed-in engine. With `flapping`, a reachability
/// poller and a task toggling the monitor run for the whole sequence.
async fn journal_through_engine(ops: &[JournalOp], flapping: bool) -> JournalRun {
    let temp = TempDir::new().unwrap();
    let engine = common::engine(&temp, ScriptedGateway::new(), NetworkStatus::Offline);
    engine.register(EMAIL, PASSWORD, None).await.unwrap();

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    if flapping {
        tasks.push(engine.network().spawn_probe(
            Arc::new(StaticProbe(Some(NetworkStatus::Online))),
            Duration::from_millis(1),
            cancel.clone(),
        ));
        let network = engine.network().clone();
        let stop = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut online = false;
            while !stop.is_cancelled() {
                online = !online;
                network.report(if online {
                    NetworkStatus::Online
                } else {
                    NetworkStatus::Offline
                });
                tokio::task::yield_now().await;
            }
        }));
    }

    let mut live: BTreeMap<LocalId, String> = BTreeMap::new();
    for op in ops {
        match op {
            JournalOp::Add(text) => {
                let thought = engine.save_thought(text, vec![], vec![]).unwrap();
                live.insert(thought.id, text.clone());
            }
            JournalOp::Edit(index, text) => {
                let Some(id) = live.keys().nth(index % live.len().max(1)).copied() else {
                    continue;
                };
                engine.edit_thought(id, text, vec![], vec![]).unwrap();
                live.insert(id, text.clone());
            }
            JournalOp::Delete(index) => {
                let Some(id) = live.keys().nth(index % live.len().max(1)).copied() else {
                    continue;
                };
                engine.delete_thought(id).unwrap();
                live.remove(&id);
            }
        }
        tokio::task::yield_now().await;
    }

    cancel.cancel();
    for task in tasks {
        task.await.unwrap();
    }

    let stored = engine
        .list_thoughts(None)
        .unwrap()
        .into_iter()
        .map(|t| (t.id, t.text))
        .collect();
    let queued = engine
        .pending_entries()
        .unwrap()
        .into_iter()
        .map(|e| (e.record, e.method))
        .collect();
    (live, stored, queued)
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The store holds exactly the live thoughts, with their latest text
    #[test]
    fn store_matches_model(ops in journal_ops_strategy(30), embedded in any::<bool>()) {
        let temp = TempDir::new().unwrap();
        let store = open(&temp, embedded);
        let owner = seed_user(store.as_ref());

        let (live, _, _) = run_ops(store.as_ref(), owner, &ops);

        let stored: BTreeMap<LocalId, String> = store
            .query(owner, &RecordFilter::new(RecordKind::Thought))
            .unwrap()
            .into_iter()
            .filter_map(Record::into_thought)
            .map(|t| (t.id, t.text))
            .collect();
        prop_assert_eq!(stored, live);
    }

    /// Every sync write queues exactly one entry, in strictly increasing order
    #[test]
    fn every_write_is_queued_in_order(ops in journal_ops_strategy(30), embedded in any::<bool>()) {
        let temp = TempDir::new().unwrap();
        let store = open(&temp, embedded);
        let owner = seed_user(store.as_ref());

        let (_, queued, _) = run_ops(store.as_ref(), owner, &ops);

        let entries = store.outbox_entries().unwrap();
        prop_assert_eq!(entries.len(), queued);
        prop_assert!(entries.windows(2).all(|w| w[0].id < w[1].id));
    }

    /// Ids are handed out in increasing order and never repeat, even across deletions
    #[test]
    fn ids_are_monotonic(ops in journal_ops_strategy(40), embedded in any::<bool>()) {
        let temp = TempDir::new().unwrap();
        let store = open(&temp, embedded);
        let owner = seed_user(store.as_ref());

        let (_, _, issued) = run_ops(store.as_ref(), owner, &ops);

        prop_assert!(issued.windows(2).all(|w| w[0] < w[1]));
        let expected: Vec<LocalId> = (1..=issued.len() as u64).map(LocalId).collect();
        prop_assert_eq!(issued, expected);
    }

    /// Connectivity flapping mid-sequence changes neither the journal nor the queue
    #[test]
    fn offline_journal_ignores_network_flapping(ops in journal_ops_strategy(20)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (expected, quiet_stored, quiet_queued) =
            runtime.block_on(journal_through_engine(&ops, false));
        let (_, flapping_stored, flapping_queued) =
            runtime.block_on(journal_through_engine(&ops, true));

        prop_assert_eq!(&quiet_stored, &expected);
        prop_assert_eq!(flapping_stored, quiet_stored);
        prop_assert_eq!(flapping_queued, quiet_queued);
    }
}
