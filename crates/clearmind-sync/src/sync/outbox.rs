//! Durable queue of remote write intents and the drain loop that replays it.
//!
//! ## Ordering
//!
//! Entries are replayed in enqueue order. Once an entry for a record is
//! retained (transient failure), every later entry of the same record is
//! skipped for the rest of the drain, so an update never overtakes the create
//! it depends on. Entries of other records keep flowing.
//!
//! ## Ownership
//!
//! Every entry remembers the local user whose mutation produced it. A drain
//! only delivers the signed-in user's entries, with that user's credential;
//! entries of anyone else stay queued until their owner signs in again.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::gateway::{Credential, GatewayError, RemoteGateway};
use crate::storage::{Batch, BatchOutcome, LocalStore, WriteOp};
use crate::types::{LocalId, Record, RecordKey, RecordKind};

use super::events::SyncEvent;

/// Position of an entry in the outbox. Strictly increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutboxId(pub u64);

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote resource collection an entry is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Thoughts,
    ExerciseCompletions,
    ChatSessions,
}

impl Endpoint {
    /// Collection path relative to the API base URL.
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Thoughts => "/thoughts",
            Endpoint::ExerciseCompletions => "/exercises/completed",
            Endpoint::ChatSessions => "/chat/sessions",
        }
    }

    /// Users are not replicated through the outbox.
    pub fn for_kind(kind: RecordKind) -> Option<Self> {
        match kind {
            RecordKind::User => None,
            RecordKind::Thought => Some(Endpoint::Thoughts),
            RecordKind::ExerciseCompletion => Some(Endpoint::ExerciseCompletions),
            RecordKind::ChatSession => Some(Endpoint::ChatSessions),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMethod {
    Create,
    Update,
    Delete,
}

impl fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMethod::Create => f.write_str("create"),
            SyncMethod::Update => f.write_str("update"),
            SyncMethod::Delete => f.write_str("delete"),
        }
    }
}

/// A write intent before it is assigned an outbox position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub endpoint: Endpoint,
    pub method: SyncMethod,
    pub record: RecordKey,
    /// User whose mutation produced the write
    pub owner: LocalId,
    /// JSON body sent to the remote service (empty for deletes)
    pub payload: Vec<u8>,
}

impl PendingWrite {
    /// Capture the persisted shape of `record` as a create or update body.
    ///
    /// Returns `None` for records that are not replicated (users).
    pub fn snapshot(record: &Record, method: SyncMethod) -> SyncResult<Option<Self>> {
        let Some(endpoint) = Endpoint::for_kind(record.kind()) else {
            return Ok(None);
        };
        let mut body = match record {
            Record::User(_) => return Ok(None),
            Record::Thought(t) => serde_json::to_value(t)?,
            Record::ExerciseCompletion(e) => serde_json::to_value(e)?,
            Record::ChatSession(s) => serde_json::to_value(s)?,
        };
        // Sync state is local bookkeeping, the server never sees it.
        if let Value::Object(map) = &mut body {
            map.remove("syncState");
        }
        Ok(Some(Self {
            endpoint,
            method,
            record: record.key(),
            owner: record.owner_id(),
            payload: serde_json::to_vec(&body)?,
        }))
    }

    pub fn deletion(key: &RecordKey, owner: LocalId) -> Option<Self> {
        Endpoint::for_kind(key.kind()).map(|endpoint| Self {
            endpoint,
            method: SyncMethod::Delete,
            record: key.clone(),
            owner,
            payload: Vec::new(),
        })
    }
}

/// A queued remote write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxId,
    pub endpoint: Endpoint,
    pub method: SyncMethod,
    pub record: RecordKey,
    pub owner: LocalId,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub attempts: u32,
}

impl OutboxEntry {
    /// Value of the `Idempotency-Key` header.
    ///
    /// A create is keyed by the record's local id alone. Updates and deletes
    /// are distinct writes to the same record, so they also carry the entry id.
    pub fn idempotency_key(&self) -> String {
        match self.method {
            SyncMethod::Create => self.record.idempotency_key(),
            SyncMethod::Update | SyncMethod::Delete => {
                format!("{}#{}", self.record.idempotency_key(), self.id)
            }
        }
    }

    /// Path of the request relative to the API base URL.
    pub fn resource_path(&self) -> String {
        match self.method {
            SyncMethod::Create => self.endpoint.path().to_string(),
            SyncMethod::Update | SyncMethod::Delete => {
                format!("{}/{}", self.endpoint.path(), resource_id(&self.record))
            }
        }
    }
}

fn resource_id(key: &RecordKey) -> String {
    match key {
        RecordKey::ChatSession(id) => id.to_string(),
        other => other
            .local_id()
            .map(|id| id.to_string())
            .unwrap_or_default(),
    }
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainResult {
    /// Entries the remote service confirmed
    pub applied: usize,
    /// Entries dropped after a permanent failure
    pub failed: usize,
    /// Entries left queued for a later drain, including entries of users
    /// other than the one signed in
    pub retained_for_retry: usize,
    /// Another drain was already running; nothing was attempted
    pub skipped_busy: bool,
}

impl DrainResult {
    fn busy() -> Self {
        Self {
            skipped_busy: true,
            ..Self::default()
        }
    }

    pub fn attempted(&self) -> usize {
        self.applied + self.failed + self.retained_for_retry
    }
}

/// Clears the in-flight flag when a drain finishes.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outbox front-end: enqueues intents and replays them through a gateway.
pub struct Outbox {
    store: Arc<dyn LocalStore>,
    events: broadcast::Sender<SyncEvent>,
    request_timeout: Duration,
    draining: AtomicBool,
}

impl Outbox {
    pub fn new(
        store: Arc<dyn LocalStore>,
        events: broadcast::Sender<SyncEvent>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            events,
            request_timeout,
            draining: AtomicBool::new(false),
        }
    }

    /// Queue a standalone write intent.
    pub fn enqueue(&self, write: PendingWrite) -> SyncResult<OutboxEntry> {
        let outcome = self.store.apply(Batch::new().enqueue(write))?;
        self.publish_evictions(&outcome);
        outcome
            .enqueued
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::InvalidOperation("enqueue produced no entry".into()))
    }

    /// Queued entries in replay order.
    pub fn pending(&self) -> SyncResult<Vec<OutboxEntry>> {
        self.store.outbox_entries()
    }

    pub fn len(&self) -> SyncResult<usize> {
        self.store.outbox_len()
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// When a drain pass last ran to completion over a non-empty outbox.
    pub fn last_synced_at(&self) -> SyncResult<Option<DateTime<Utc>>> {
        self.store.last_synced_at()
    }

    /// Report entries a committed batch pushed out of the queue.
    pub fn publish_evictions(&self, outcome: &BatchOutcome) {
        for entry in &outcome.evicted {
            let _ = self.events.send(SyncEvent::EntryEvicted {
                entry_id: entry.id,
                record: entry.record.clone(),
            });
        }
    }

    /// Replay every queued entry of `owner` once, authenticated with
    /// `credential`. Without an owner nothing is delivered.
    ///
    /// Never fails: per-entry problems are reported through events and the
    /// returned counts. Returns immediately if another drain is in flight.
    pub async fn drain(
        &self,
        gateway: &dyn RemoteGateway,
        owner: Option<LocalId>,
        credential: Option<&Credential>,
    ) -> DrainResult {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress");
            return DrainResult::busy();
        }
        let _guard = DrainGuard(&self.draining);

        let entries = match self.store.outbox_entries() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Failed to read outbox");
                return DrainResult::default();
            }
        };
        if entries.is_empty() {
            debug!("Outbox empty, nothing to drain");
            return DrainResult::default();
        }

        info!(pending = entries.len(), "Draining outbox");
        let _ = self.events.send(SyncEvent::DrainStarted {
            pending: entries.len(),
        });

        let mut result = DrainResult::default();
        let mut blocked: HashSet<RecordKey> = HashSet::new();

        for entry in entries {
            if owner != Some(entry.owner) {
                debug!(
                    entry_id = %entry.id,
                    owner = %entry.owner,
                    "Entry belongs to another user, leaving it queued"
                );
                result.retained_for_retry += 1;
                continue;
            }
            if blocked.contains(&entry.record) {
                result.retained_for_retry += 1;
                continue;
            }

            let delivery =
                match tokio::time::timeout(self.request_timeout, gateway.deliver(&entry, credential))
                    .await
                {
                    Ok(delivery) => delivery,
                    Err(_) => Err(GatewayError::Timeout(self.request_timeout)),
                };

            match delivery {
                Ok(()) => {
                    if let Err(e) = self.store.apply(Batch::new().push(WriteOp::Acknowledge(entry.id)))
                    {
                        // The entry stays queued; the server dedupes the redelivery.
                        error!(entry_id = %entry.id, error = %e, "Failed to acknowledge entry");
                        blocked.insert(entry.record.clone());
                        result.retained_for_retry += 1;
                        continue;
                    }
                    debug!(entry_id = %entry.id, record = %entry.record, "Entry applied");
                    result.applied += 1;
                    let _ = self.events.send(SyncEvent::EntryApplied {
                        entry_id: entry.id,
                        record: entry.record,
                    });
                }
                // An auth failure says nothing about the entry itself.
                Err(e) if e.is_transient() || matches!(e, GatewayError::Unauthorized(_)) => {
                    if let Err(store_err) =
                        self.store.apply(Batch::new().push(WriteOp::RecordAttempt(entry.id)))
                    {
                        error!(entry_id = %entry.id, error = %store_err, "Failed to record attempt");
                    }
                    debug!(
                        entry_id = %entry.id,
                        record = %entry.record,
                        error = %e,
                        "Delivery failed, retaining entry"
                    );
                    result.retained_for_retry += 1;
                    blocked.insert(entry.record.clone());
                    let _ = self.events.send(SyncEvent::EntryRetained {
                        entry_id: entry.id,
                        record: entry.record,
                        attempts: entry.attempts.saturating_add(1),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        entry_id = %entry.id,
                        endpoint = %entry.endpoint,
                        method = %entry.method,
                        status = ?e.status(),
                        error = %e,
                        "Remote rejected entry, dropping it"
                    );
                    if let Err(store_err) =
                        self.store.apply(Batch::new().push(WriteOp::Discard(entry.id)))
                    {
                        error!(entry_id = %entry.id, error = %store_err, "Failed to discard entry");
                    }
                    result.failed += 1;
                    let _ = self.events.send(SyncEvent::SyncFailure {
                        entry_id: entry.id,
                        record: entry.record,
                        endpoint: entry.endpoint,
                        method: entry.method,
                        status: e.status(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Err(e) = self
            .store
            .apply(Batch::new().push(WriteOp::MarkSynced(Utc::now())))
        {
            error!(error = %e, "Failed to record sync time");
        }
        info!(
            applied = result.applied,
            failed = result.failed,
            retained = result.retained_for_retry,
            "Drain finished"
        );
        let _ = self.events.send(SyncEvent::DrainFinished {
            applied: result.applied,
            failed: result.failed,
            retained_for_retry: result.retained_for_retry,
        });
        result
    }
}
