//! Local persistence for users, journal records, the outbox and the session
//! marker.
//!
//! Two backends implement [`LocalStore`]:
//! - [`RedbStore`]: embedded ACID database (preferred)
//! - [`DocumentStore`]: a single JSON document replaced wholesale on every
//!   commit, for runtimes where the embedded engine cannot be opened
//!
//! Writes go through one primitive, [`LocalStore::apply`], which commits a
//! [`Batch`] atomically. Entity writes, outbox bookkeeping and session
//! changes that belong together travel in the same batch, so they are either
//! all durable or none are. Both backends share the batch semantics in
//! `batch.rs`; they differ only in how tables are read and written.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{BackendPreference, EngineConfig};
use crate::error::{SyncError, SyncResult};
use crate::sync::{OutboxEntry, OutboxId, PendingWrite};
use crate::types::{Entity, LocalId, Record, RecordFilter, RecordKey, RecordKind, RemoteId, User};

mod batch;
mod document;
mod redb_store;

pub use document::DocumentStore;
pub use redb_store::RedbStore;

/// Which backend is serving a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Embedded,
    Document,
}

/// Durable record of which identity is active on this device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMarker {
    LocalOnly {
        user_id: LocalId,
    },
    Linked {
        user_id: LocalId,
        remote_id: RemoteId,
        access_token: String,
    },
}

impl SessionMarker {
    pub fn user_id(&self) -> LocalId {
        match self {
            SessionMarker::LocalOnly { user_id } | SessionMarker::Linked { user_id, .. } => {
                *user_id
            }
        }
    }
}

impl std::fmt::Debug for SessionMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMarker::LocalOnly { user_id } => {
                f.debug_struct("LocalOnly").field("user_id", user_id).finish()
            }
            SessionMarker::Linked {
                user_id, remote_id, ..
            } => f
                .debug_struct("Linked")
                .field("user_id", user_id)
                .field("remote_id", remote_id)
                .finish_non_exhaustive(),
        }
    }
}

/// One write inside a [`Batch`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a draft or write an existing record. With `sync`, the record is
    /// marked pending and a create/update intent is queued.
    Put { entity: Entity, sync: bool },
    /// Remove a record owned by `owner`. With `sync`, a delete intent is queued.
    Delete {
        key: RecordKey,
        owner: LocalId,
        sync: bool,
    },
    /// Queue a remote write intent.
    Enqueue(PendingWrite),
    /// The remote service confirmed the entry: drop it and mark the record
    /// applied once nothing else is queued for it.
    Acknowledge(OutboxId),
    /// Drop the entry without touching the record.
    Discard(OutboxId),
    /// Count a failed delivery attempt.
    RecordAttempt(OutboxId),
    /// Replace (or clear) the current-session marker.
    SetSession(Option<SessionMarker>),
    /// Record when a drain pass last completed.
    MarkSynced(DateTime<Utc>),
}

/// Ordered list of writes committed atomically.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<WriteOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn put(self, entity: impl Into<Entity>, sync: bool) -> Self {
        self.push(WriteOp::Put {
            entity: entity.into(),
            sync,
        })
    }

    pub fn delete(self, key: RecordKey, owner: LocalId, sync: bool) -> Self {
        self.push(WriteOp::Delete { key, owner, sync })
    }

    pub fn enqueue(self, write: PendingWrite) -> Self {
        self.push(WriteOp::Enqueue(write))
    }

    pub fn set_session(self, marker: Option<SessionMarker>) -> Self {
        self.push(WriteOp::SetSession(marker))
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// What a committed batch produced.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Records as persisted by `Put`, in batch order
    pub records: Vec<Record>,
    /// Outbox entries created by this batch
    pub enqueued: Vec<OutboxEntry>,
    /// Oldest entries dropped to respect the outbox capacity
    pub evicted: Vec<OutboxEntry>,
}

impl BatchOutcome {
    /// The single record of a one-`Put` batch.
    pub fn into_record(self) -> SyncResult<Record> {
        self.records
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::InvalidOperation("batch persisted no record".into()))
    }
}

/// Transactional local persistence shared by every component.
pub trait LocalStore: Send + Sync {
    fn backend(&self) -> StoreBackend;

    /// Commit every op in `batch` or none of them.
    fn apply(&self, batch: Batch) -> SyncResult<BatchOutcome>;

    /// Allocate the next id of a counter-keyed table without writing a record.
    fn reserve_id(&self, kind: RecordKind) -> SyncResult<LocalId>;

    fn get(&self, key: &RecordKey) -> SyncResult<Record>;

    fn query(&self, owner: LocalId, filter: &RecordFilter) -> SyncResult<Vec<Record>>;

    fn find_user_by_email(&self, email: &str) -> SyncResult<Option<User>>;

    /// All queued entries in enqueue order.
    fn outbox_entries(&self) -> SyncResult<Vec<OutboxEntry>>;

    fn session_marker(&self) -> SyncResult<Option<SessionMarker>>;

    /// When a drain pass last completed, if ever.
    fn last_synced_at(&self) -> SyncResult<Option<DateTime<Utc>>>;

    fn put(&self, entity: Entity) -> SyncResult<Record> {
        self.apply(Batch::new().put(entity, false))?.into_record()
    }

    fn delete(&self, key: &RecordKey, owner: LocalId) -> SyncResult<()> {
        self.apply(Batch::new().delete(key.clone(), owner, false))?;
        Ok(())
    }

    fn enqueue(&self, write: PendingWrite) -> SyncResult<OutboxEntry> {
        self.apply(Batch::new().enqueue(write))?
            .enqueued
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::InvalidOperation("enqueue produced no entry".into()))
    }

    fn outbox_len(&self) -> SyncResult<usize> {
        Ok(self.outbox_entries()?.len())
    }
}

/// Open the configured backend, falling back to the document store when
/// `Auto` is requested and the embedded engine cannot be opened.
pub fn open_store(config: &EngineConfig) -> SyncResult<Arc<dyn LocalStore>> {
    let capacity = config.outbox_capacity;
    match config.backend {
        BackendPreference::Embedded => {
            Ok(Arc::new(RedbStore::open(config.database_path(), capacity)?))
        }
        BackendPreference::Document => {
            Ok(Arc::new(DocumentStore::open(config.document_path(), capacity)?))
        }
        BackendPreference::Auto => match RedbStore::open(config.database_path(), capacity) {
            Ok(store) => {
                info!(path = ?config.database_path(), "Opened embedded store");
                Ok(Arc::new(store))
            }
            Err(e) => {
                warn!(error = %e, "Embedded store unavailable, using document store");
                Ok(Arc::new(DocumentStore::open(config.document_path(), capacity)?))
            }
        },
    }
}
