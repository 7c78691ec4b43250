//! Embedded backend on redb.
//!
//! Entities are stored as JSON (their analysis fields are free-form JSON),
//! outbox entries and the session marker as postcard.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{
    Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::sync::{OutboxEntry, OutboxId};
use crate::types::{LocalId, Record, RecordFilter, RecordKey, RecordKind, User};

use super::batch::{apply_batch, next_id, Sequence, TableSet};
use super::{Batch, BatchOutcome, LocalStore, SessionMarker, StoreBackend};

const SEQUENCES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");
const USERS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("users");
const USER_EMAIL_INDEX: TableDefinition<&str, u64> = TableDefinition::new("user_email_index");
const THOUGHTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("thoughts");
const EXERCISES_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("exercise_completions");
const CHAT_SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("chat_sessions");
const OUTBOX_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("outbox");
const SESSION_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("session");
/// Sync bookkeeping, timestamps as Unix milliseconds.
const META_TABLE: TableDefinition<&str, i64> = TableDefinition::new("meta");

/// There is only one active session per device, stored with a fixed key.
const SESSION_KEY: &str = "current";
const LAST_SYNCED_KEY: &str = "last_synced_at";

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
    outbox_capacity: usize,
}

impl RedbStore {
    /// Open (or create) the database at `path` and make sure every table exists.
    pub fn open(path: impl AsRef<Path>, outbox_capacity: usize) -> SyncResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SEQUENCES_TABLE)?;
            let _ = write_txn.open_table(USERS_TABLE)?;
            let _ = write_txn.open_table(USER_EMAIL_INDEX)?;
            let _ = write_txn.open_table(THOUGHTS_TABLE)?;
            let _ = write_txn.open_table(EXERCISES_TABLE)?;
            let _ = write_txn.open_table(CHAT_SESSIONS_TABLE)?;
            let _ = write_txn.open_table(OUTBOX_TABLE)?;
            let _ = write_txn.open_table(SESSION_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        debug!(?path, "Opened redb store");
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            outbox_capacity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_kind(&self, kind: RecordKind) -> SyncResult<Vec<Record>> {
        let read_txn = self.db.begin_read()?;
        let mut records = Vec::new();
        match kind {
            RecordKind::User => {
                let table = read_txn.open_table(USERS_TABLE)?;
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    records.push(Record::User(decode_json(value.value())?));
                }
            }
            RecordKind::Thought => {
                let table = read_txn.open_table(THOUGHTS_TABLE)?;
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    records.push(Record::Thought(decode_json(value.value())?));
                }
            }
            RecordKind::ExerciseCompletion => {
                let table = read_txn.open_table(EXERCISES_TABLE)?;
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    records.push(Record::ExerciseCompletion(decode_json(value.value())?));
                }
            }
            RecordKind::ChatSession => {
                let table = read_txn.open_table(CHAT_SESSIONS_TABLE)?;
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    records.push(Record::ChatSession(decode_json(value.value())?));
                }
            }
        }
        Ok(records)
    }
}

impl LocalStore for RedbStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Embedded
    }

    fn apply(&self, batch: Batch) -> SyncResult<BatchOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut tables = RedbTables::open(&write_txn)?;
            apply_batch(&mut tables, batch.into_ops(), self.outbox_capacity)?
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    fn reserve_id(&self, kind: RecordKind) -> SyncResult<LocalId> {
        let seq = Sequence::for_kind(kind).ok_or_else(|| {
            SyncError::InvalidOperation(format!("{} ids are not allocated", kind))
        })?;
        let write_txn = self.db.begin_write()?;
        let id = {
            let mut tables = RedbTables::open(&write_txn)?;
            next_id(&mut tables, seq)?
        };
        write_txn.commit()?;
        Ok(LocalId(id))
    }

    fn get(&self, key: &RecordKey) -> SyncResult<Record> {
        let read_txn = self.db.begin_read()?;
        let record = match key {
            RecordKey::User(id) => {
                let table = read_txn.open_table(USERS_TABLE)?;
                let value = table.get(id.0)?;
                value
                    .map(|v| decode_json(v.value()).map(Record::User))
                    .transpose()?
            }
            RecordKey::Thought(id) => {
                let table = read_txn.open_table(THOUGHTS_TABLE)?;
                let value = table.get(id.0)?;
                value
                    .map(|v| decode_json(v.value()).map(Record::Thought))
                    .transpose()?
            }
            RecordKey::ExerciseCompletion(id) => {
                let table = read_txn.open_table(EXERCISES_TABLE)?;
                let value = table.get(id.0)?;
                value
                    .map(|v| decode_json(v.value()).map(Record::ExerciseCompletion))
                    .transpose()?
            }
            RecordKey::ChatSession(id) => {
                let table = read_txn.open_table(CHAT_SESSIONS_TABLE)?;
                let value = table.get(id.as_str())?;
                value
                    .map(|v| decode_json(v.value()).map(Record::ChatSession))
                    .transpose()?
            }
        };
        record.ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    fn query(&self, owner: LocalId, filter: &RecordFilter) -> SyncResult<Vec<Record>> {
        Ok(filter.select(owner, self.read_kind(filter.kind)?))
    }

    fn find_user_by_email(&self, email: &str) -> SyncResult<Option<User>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(USER_EMAIL_INDEX)?;
        let Some(id) = index.get(email)?.map(|v| v.value()) else {
            return Ok(None);
        };
        let users = read_txn.open_table(USERS_TABLE)?;
        let value = users.get(id)?;
        value.map(|v| decode_json(v.value())).transpose()
    }

    fn outbox_entries(&self) -> SyncResult<Vec<OutboxEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_TABLE)?;
        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            entries.push(postcard::from_bytes(value.value())?);
        }
        Ok(entries)
    }

    fn outbox_len(&self) -> SyncResult<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn session_marker(&self) -> SyncResult<Option<SessionMarker>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSION_TABLE)?;
        let value = table.get(SESSION_KEY)?;
        match value {
            Some(v) => Ok(Some(postcard::from_bytes(v.value())?)),
            None => Ok(None),
        }
    }

    fn last_synced_at(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        let millis = table.get(LAST_SYNCED_KEY)?.map(|v| v.value());
        Ok(millis.and_then(DateTime::<Utc>::from_timestamp_millis))
    }
}

/// All tables of one write transaction.
struct RedbTables<'txn> {
    sequences: Table<'txn, &'static str, u64>,
    users: Table<'txn, u64, &'static [u8]>,
    emails: Table<'txn, &'static str, u64>,
    thoughts: Table<'txn, u64, &'static [u8]>,
    exercises: Table<'txn, u64, &'static [u8]>,
    chat_sessions: Table<'txn, &'static str, &'static [u8]>,
    outbox: Table<'txn, u64, &'static [u8]>,
    session: Table<'txn, &'static str, &'static [u8]>,
    meta: Table<'txn, &'static str, i64>,
}

impl<'txn> RedbTables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> SyncResult<Self> {
        Ok(Self {
            sequences: txn.open_table(SEQUENCES_TABLE)?,
            users: txn.open_table(USERS_TABLE)?,
            emails: txn.open_table(USER_EMAIL_INDEX)?,
            thoughts: txn.open_table(THOUGHTS_TABLE)?,
            exercises: txn.open_table(EXERCISES_TABLE)?,
            chat_sessions: txn.open_table(CHAT_SESSIONS_TABLE)?,
            outbox: txn.open_table(OUTBOX_TABLE)?,
            session: txn.open_table(SESSION_TABLE)?,
            meta: txn.open_table(META_TABLE)?,
        })
    }

    fn numeric_table(&self, kind: RecordKind) -> Option<&Table<'txn, u64, &'static [u8]>> {
        match kind {
            RecordKind::User => Some(&self.users),
            RecordKind::Thought => Some(&self.thoughts),
            RecordKind::ExerciseCompletion => Some(&self.exercises),
            RecordKind::ChatSession => None,
        }
    }

    fn numeric_table_mut(
        &mut self,
        kind: RecordKind,
    ) -> Option<&mut Table<'txn, u64, &'static [u8]>> {
        match kind {
            RecordKind::User => Some(&mut self.users),
            RecordKind::Thought => Some(&mut self.thoughts),
            RecordKind::ExerciseCompletion => Some(&mut self.exercises),
            RecordKind::ChatSession => None,
        }
    }
}

impl TableSet for RedbTables<'_> {
    fn sequence(&self, seq: Sequence) -> SyncResult<u64> {
        Ok(self.sequences.get(seq.name())?.map(|v| v.value()).unwrap_or(0))
    }

    fn set_sequence(&mut self, seq: Sequence, value: u64) -> SyncResult<()> {
        self.sequences.insert(seq.name(), value)?;
        Ok(())
    }

    fn load(&self, key: &RecordKey) -> SyncResult<Option<Record>> {
        let bytes = match (key, self.numeric_table(key.kind())) {
            (RecordKey::ChatSession(id), _) => self
                .chat_sessions
                .get(id.as_str())?
                .map(|v| v.value().to_vec()),
            (_, Some(table)) => {
                let id = key.local_id().map(LocalId::get).unwrap_or_default();
                table.get(id)?.map(|v| v.value().to_vec())
            }
            (_, None) => None,
        };
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let record = match key.kind() {
            RecordKind::User => Record::User(decode_json(&bytes)?),
            RecordKind::Thought => Record::Thought(decode_json(&bytes)?),
            RecordKind::ExerciseCompletion => Record::ExerciseCompletion(decode_json(&bytes)?),
            RecordKind::ChatSession => Record::ChatSession(decode_json(&bytes)?),
        };
        Ok(Some(record))
    }

    fn save(&mut self, record: &Record) -> SyncResult<()> {
        let bytes = match record {
            Record::User(u) => encode_json(u)?,
            Record::Thought(t) => encode_json(t)?,
            Record::ExerciseCompletion(e) => encode_json(e)?,
            Record::ChatSession(s) => encode_json(s)?,
        };
        match record {
            Record::ChatSession(s) => {
                self.chat_sessions.insert(s.id.as_str(), bytes.as_slice())?;
            }
            _ => {
                let id = record.key().local_id().map(LocalId::get).unwrap_or_default();
                if let Some(table) = self.numeric_table_mut(record.kind()) {
                    table.insert(id, bytes.as_slice())?;
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, key: &RecordKey) -> SyncResult<()> {
        match key {
            RecordKey::ChatSession(id) => {
                self.chat_sessions.remove(id.as_str())?;
            }
            _ => {
                let id = key.local_id().map(LocalId::get).unwrap_or_default();
                if let Some(table) = self.numeric_table_mut(key.kind()) {
                    table.remove(id)?;
                }
            }
        }
        Ok(())
    }

    fn user_for_email(&self, email: &str) -> SyncResult<Option<LocalId>> {
        Ok(self.emails.get(email)?.map(|v| LocalId(v.value())))
    }

    fn index_email(&mut self, email: &str, id: LocalId) -> SyncResult<()> {
        self.emails.insert(email, id.0)?;
        Ok(())
    }

    fn unindex_email(&mut self, email: &str) -> SyncResult<()> {
        self.emails.remove(email)?;
        Ok(())
    }

    fn entry(&self, id: OutboxId) -> SyncResult<Option<OutboxEntry>> {
        let bytes = self.outbox.get(id.0)?.map(|v| v.value().to_vec());
        bytes
            .map(|b| postcard::from_bytes(&b).map_err(Into::into))
            .transpose()
    }

    fn save_entry(&mut self, entry: &OutboxEntry) -> SyncResult<()> {
        let bytes = postcard::to_allocvec(entry)?;
        self.outbox.insert(entry.id.0, bytes.as_slice())?;
        Ok(())
    }

    fn remove_entry(&mut self, id: OutboxId) -> SyncResult<()> {
        self.outbox.remove(id.0)?;
        Ok(())
    }

    fn oldest_entry(&self) -> SyncResult<Option<OutboxEntry>> {
        let bytes = self.outbox.first()?.map(|(_, v)| v.value().to_vec());
        bytes
            .map(|b| postcard::from_bytes(&b).map_err(Into::into))
            .transpose()
    }

    fn entry_count(&self) -> SyncResult<u64> {
        Ok(self.outbox.len()?)
    }

    fn entries_for(&self, key: &RecordKey) -> SyncResult<Vec<OutboxEntry>> {
        let mut entries = Vec::new();
        for item in self.outbox.iter()? {
            let (_, value) = item?;
            let entry: OutboxEntry = postcard::from_bytes(value.value())?;
            if &entry.record == key {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn set_session(&mut self, marker: Option<&SessionMarker>) -> SyncResult<()> {
        match marker {
            Some(marker) => {
                let bytes = postcard::to_allocvec(marker)?;
                self.session.insert(SESSION_KEY, bytes.as_slice())?;
            }
            None => {
                self.session.remove(SESSION_KEY)?;
            }
        }
        Ok(())
    }

    fn set_last_synced(&mut self, at: DateTime<Utc>) -> SyncResult<()> {
        self.meta.insert(LAST_SYNCED_KEY, at.timestamp_millis())?;
        Ok(())
    }
}

fn encode_json<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Batch;
    use crate::types::{Draft, Entity, NewThought};
    use tempfile::TempDir;

    fn create_test_store() -> (RedbStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let store = RedbStore::open(&db_path, 100).unwrap();
        (store, temp_dir)
    }

    fn seed_user(store: &RedbStore) -> LocalId {
        let id = store.reserve_id(RecordKind::User).unwrap();
        store
            .put(Entity::Existing(Record::User(User {
                id,
                remote_id: None,
                email: "a@x.com".into(),
                display_name: "A".into(),
                password_hash: "hash".into(),
                created_at: Utc::now(),
            })))
            .unwrap();
        id
    }

    #[test]
    fn test_store_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/to/test.redb");
        assert!(RedbStore::open(&db_path, 10).is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_data_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");

        let thought_id = {
            let store = RedbStore::open(&db_path, 10).unwrap();
            let owner = seed_user(&store);
            let draft = Draft::Thought(NewThought {
                owner_id: owner,
                text: "nobody listens to me".into(),
                distortions: vec![],
                reframes: vec![],
                created_at: Utc::now(),
            });
            let outcome = store.apply(Batch::new().put(draft, true)).unwrap();
            outcome.records[0].key()
        };

        let store = RedbStore::open(&db_path, 10).unwrap();
        assert!(store.get(&thought_id).is_ok());
        assert_eq!(store.outbox_len().unwrap(), 1);
        assert!(store.find_user_by_email("a@x.com").unwrap().is_some());
    }

    #[test]
    fn test_session_marker_roundtrip() {
        let (store, _temp) = create_test_store();
        let owner = seed_user(&store);

        assert!(store.session_marker().unwrap().is_none());
        store
            .apply(Batch::new().set_session(Some(SessionMarker::LocalOnly { user_id: owner })))
            .unwrap();
        assert_eq!(
            store.session_marker().unwrap(),
            Some(SessionMarker::LocalOnly { user_id: owner })
        );

        store.apply(Batch::new().set_session(None)).unwrap();
        assert!(store.session_marker().unwrap().is_none());
    }
}
