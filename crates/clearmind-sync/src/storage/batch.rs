//! Batch semantics shared by both storage backends.
//!
//! A backend exposes its tables through [`TableSet`] for the duration of one
//! transaction; [`apply_batch`] enforces ownership, email uniqueness, id
//! allocation and the outbox bound on top of it. If any op fails the caller
//! discards the transaction, so nothing from the batch becomes durable.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::sync::{OutboxEntry, OutboxId, PendingWrite, SyncMethod};
use crate::types::{
    Draft, Entity, ExerciseCompletion, LocalId, Record, RecordKey, RecordKind, SyncState, Thought,
};

use super::{BatchOutcome, SessionMarker, WriteOp};

/// Named id counters. Counters only grow, so ids are never reused even after
/// the highest record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sequence {
    Users,
    Thoughts,
    ExerciseCompletions,
    Outbox,
}

impl Sequence {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Sequence::Users => "users",
            Sequence::Thoughts => "thoughts",
            Sequence::ExerciseCompletions => "exercise_completions",
            Sequence::Outbox => "outbox",
        }
    }

    pub(crate) fn for_kind(kind: RecordKind) -> Option<Self> {
        match kind {
            RecordKind::User => Some(Sequence::Users),
            RecordKind::Thought => Some(Sequence::Thoughts),
            RecordKind::ExerciseCompletion => Some(Sequence::ExerciseCompletions),
            RecordKind::ChatSession => None,
        }
    }
}

/// Table access inside one open write transaction.
pub(crate) trait TableSet {
    /// Current high-water mark of a counter (0 if never used).
    fn sequence(&self, seq: Sequence) -> SyncResult<u64>;
    fn set_sequence(&mut self, seq: Sequence, value: u64) -> SyncResult<()>;

    fn load(&self, key: &RecordKey) -> SyncResult<Option<Record>>;
    fn save(&mut self, record: &Record) -> SyncResult<()>;
    fn remove(&mut self, key: &RecordKey) -> SyncResult<()>;

    fn user_for_email(&self, email: &str) -> SyncResult<Option<LocalId>>;
    fn index_email(&mut self, email: &str, id: LocalId) -> SyncResult<()>;
    fn unindex_email(&mut self, email: &str) -> SyncResult<()>;

    fn entry(&self, id: OutboxId) -> SyncResult<Option<OutboxEntry>>;
    fn save_entry(&mut self, entry: &OutboxEntry) -> SyncResult<()>;
    fn remove_entry(&mut self, id: OutboxId) -> SyncResult<()>;
    fn oldest_entry(&self) -> SyncResult<Option<OutboxEntry>>;
    fn entry_count(&self) -> SyncResult<u64>;
    /// Queued entries of one record, oldest first.
    fn entries_for(&self, key: &RecordKey) -> SyncResult<Vec<OutboxEntry>>;

    fn set_session(&mut self, marker: Option<&SessionMarker>) -> SyncResult<()>;
    fn set_last_synced(&mut self, at: DateTime<Utc>) -> SyncResult<()>;
}

pub(crate) fn next_id<T: TableSet>(tables: &mut T, seq: Sequence) -> SyncResult<u64> {
    let next = tables.sequence(seq)? + 1;
    tables.set_sequence(seq, next)?;
    Ok(next)
}

pub(crate) fn apply_batch<T: TableSet>(
    tables: &mut T,
    ops: Vec<WriteOp>,
    outbox_capacity: usize,
) -> SyncResult<BatchOutcome> {
    let mut outcome = BatchOutcome::default();

    for op in ops {
        match op {
            WriteOp::Put { entity, sync } => {
                let record = match entity {
                    Entity::New(draft) => insert_draft(tables, draft, sync, &mut outcome)?,
                    Entity::Existing(record) => {
                        write_existing(tables, record, sync, &mut outcome)?
                    }
                };
                for evicted in enforce_capacity(tables, outbox_capacity)? {
                    outcome.evicted.push(evicted);
                }
                outcome.records.push(record);
            }
            WriteOp::Delete { key, owner, sync } => {
                delete_record(tables, &key, owner)?;
                if sync {
                    if let Some(write) = PendingWrite::deletion(&key, owner) {
                        enqueue(tables, write, &mut outcome)?;
                    }
                }
                for evicted in enforce_capacity(tables, outbox_capacity)? {
                    outcome.evicted.push(evicted);
                }
            }
            WriteOp::Enqueue(write) => {
                enqueue(tables, write, &mut outcome)?;
                for evicted in enforce_capacity(tables, outbox_capacity)? {
                    outcome.evicted.push(evicted);
                }
            }
            WriteOp::Acknowledge(id) => acknowledge(tables, id)?,
            WriteOp::Discard(id) => {
                if tables.entry(id)?.is_none() {
                    debug!(entry_id = %id, "Discarded entry already gone");
                }
                tables.remove_entry(id)?;
            }
            WriteOp::RecordAttempt(id) => {
                if let Some(mut entry) = tables.entry(id)? {
                    entry.attempts = entry.attempts.saturating_add(1);
                    tables.save_entry(&entry)?;
                }
            }
            WriteOp::SetSession(marker) => tables.set_session(marker.as_ref())?,
            WriteOp::MarkSynced(at) => tables.set_last_synced(at)?,
        }
    }

    Ok(outcome)
}

fn insert_draft<T: TableSet>(
    tables: &mut T,
    draft: Draft,
    sync: bool,
    outcome: &mut BatchOutcome,
) -> SyncResult<Record> {
    let record = match draft {
        Draft::Thought(new) => {
            require_user(tables, new.owner_id)?;
            let id = next_id(tables, Sequence::Thoughts)?;
            Record::Thought(Thought {
                id: LocalId(id),
                owner_id: new.owner_id,
                text: new.text,
                distortions: new.distortions,
                reframes: new.reframes,
                created_at: new.created_at,
                sync_state: SyncState::Pending,
            })
        }
        Draft::ExerciseCompletion(new) => {
            require_user(tables, new.owner_id)?;
            let id = next_id(tables, Sequence::ExerciseCompletions)?;
            Record::ExerciseCompletion(ExerciseCompletion {
                id: LocalId(id),
                owner_id: new.owner_id,
                exercise_id: new.exercise_id,
                completed_at: new.completed_at,
                sync_state: SyncState::Pending,
            })
        }
        Draft::ChatSession(mut session) => {
            require_user(tables, session.owner_id)?;
            let key = RecordKey::ChatSession(session.id.clone());
            if tables.load(&key)?.is_some() {
                return Err(SyncError::Validation(format!("{} already exists", key)));
            }
            session.sync_state = SyncState::Pending;
            Record::ChatSession(session)
        }
    };

    tables.save(&record)?;
    if sync {
        if let Some(write) = PendingWrite::snapshot(&record, SyncMethod::Create)? {
            enqueue(tables, write, outcome)?;
        }
    }
    Ok(record)
}

fn write_existing<T: TableSet>(
    tables: &mut T,
    mut record: Record,
    sync: bool,
    outcome: &mut BatchOutcome,
) -> SyncResult<Record> {
    let key = record.key();
    let existing = tables.load(&key)?;

    match &existing {
        Some(current) if current.owner_id() != record.owner_id() => {
            return Err(SyncError::NotFound(key.to_string()));
        }
        Some(_) => {}
        None => {
            // Writing an absent record is only allowed for ids this store
            // handed out (see `LocalStore::reserve_id`).
            if let Some(seq) = Sequence::for_kind(key.kind()) {
                let id = key.local_id().map(LocalId::get).unwrap_or_default();
                if id == 0 || id > tables.sequence(seq)? {
                    return Err(SyncError::InvalidOperation(format!(
                        "{} was never allocated",
                        key
                    )));
                }
            }
            if !matches!(record, Record::User(_)) {
                require_user(tables, record.owner_id())?;
            }
        }
    }

    if let Record::User(user) = &record {
        if let Some(other) = tables.user_for_email(&user.email)? {
            if other != user.id {
                return Err(SyncError::DuplicateEmail(user.email.clone()));
            }
        }
        if let Some(Record::User(previous)) = &existing {
            if previous.email != user.email {
                tables.unindex_email(&previous.email)?;
            }
        }
        tables.index_email(&user.email, user.id)?;
    }

    if sync {
        record.set_sync_state(SyncState::Pending);
    }
    tables.save(&record)?;

    if sync {
        let method = if existing.is_some() {
            SyncMethod::Update
        } else {
            SyncMethod::Create
        };
        if let Some(write) = PendingWrite::snapshot(&record, method)? {
            enqueue(tables, write, outcome)?;
        }
    }
    Ok(record)
}

fn delete_record<T: TableSet>(tables: &mut T, key: &RecordKey, owner: LocalId) -> SyncResult<()> {
    let existing = tables
        .load(key)?
        .filter(|r| r.owner_id() == owner)
        .ok_or_else(|| SyncError::NotFound(key.to_string()))?;

    if let Record::User(user) = &existing {
        tables.unindex_email(&user.email)?;
    }
    tables.remove(key)
}

fn require_user<T: TableSet>(tables: &T, owner: LocalId) -> SyncResult<()> {
    match tables.load(&RecordKey::User(owner))? {
        Some(_) => Ok(()),
        None => Err(SyncError::NotFound(RecordKey::User(owner).to_string())),
    }
}

fn enqueue<T: TableSet>(
    tables: &mut T,
    write: PendingWrite,
    outcome: &mut BatchOutcome,
) -> SyncResult<()> {
    let id = OutboxId(next_id(tables, Sequence::Outbox)?);
    let entry = OutboxEntry {
        id,
        endpoint: write.endpoint,
        method: write.method,
        record: write.record,
        owner: write.owner,
        payload: write.payload,
        enqueued_at: Utc::now(),
        attempts: 0,
    };
    tables.save_entry(&entry)?;
    outcome.enqueued.push(entry);
    Ok(())
}

fn acknowledge<T: TableSet>(tables: &mut T, id: OutboxId) -> SyncResult<()> {
    let Some(entry) = tables.entry(id)? else {
        debug!(entry_id = %id, "Acknowledged entry already gone");
        return Ok(());
    };
    tables.remove_entry(id)?;

    if entry.method == SyncMethod::Delete || !tables.entries_for(&entry.record)?.is_empty() {
        return Ok(());
    }
    if let Some(mut record) = tables.load(&entry.record)? {
        record.set_sync_state(SyncState::Applied);
        tables.save(&record)?;
    }
    Ok(())
}

fn enforce_capacity<T: TableSet>(tables: &mut T, capacity: usize) -> SyncResult<Vec<OutboxEntry>> {
    let mut evicted = Vec::new();
    let capacity = capacity.max(1) as u64;
    while tables.entry_count()? > capacity {
        let Some(oldest) = tables.oldest_entry()? else {
            break;
        };
        // Later writes of a record depend on its earlier ones, so the record's
        // whole chain goes. The record itself stays pending for a resync.
        for entry in tables.entries_for(&oldest.record)? {
            warn!(
                entry_id = %entry.id,
                record = %entry.record,
                method = %entry.method,
                "Outbox full, dropping entry"
            );
            tables.remove_entry(entry.id)?;
            evicted.push(entry);
        }
    }
    Ok(evicted)
}
