//! Fallback backend: the whole store as one JSON document.
//!
//! Every commit works on a copy of the in-memory document, writes the copy to
//! a temporary file, fsyncs it and renames it over the previous version. The
//! in-memory document is only swapped after the rename succeeds, so a failed
//! batch leaves both disk and memory untouched.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::sync::{OutboxEntry, OutboxId};
use crate::types::{
    ChatSession, ExerciseCompletion, LocalId, Record, RecordFilter, RecordKey, RecordKind,
    Thought, User,
};

use super::batch::{apply_batch, next_id, Sequence, TableSet};
use super::{Batch, BatchOutcome, LocalStore, SessionMarker, StoreBackend};

const DOCUMENT_VERSION: u32 = 1;

/// Serialized form of the entire store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreDocument {
    version: u32,
    sequences: BTreeMap<String, u64>,
    users: BTreeMap<u64, User>,
    user_emails: BTreeMap<String, u64>,
    thoughts: BTreeMap<u64, Thought>,
    exercise_completions: BTreeMap<u64, ExerciseCompletion>,
    chat_sessions: BTreeMap<String, ChatSession>,
    outbox: BTreeMap<u64, OutboxEntry>,
    session: Option<SessionMarker>,
    last_synced_at: Option<DateTime<Utc>>,
}

impl StoreDocument {
    fn records(&self, kind: RecordKind) -> Vec<Record> {
        match kind {
            RecordKind::User => self.users.values().cloned().map(Record::User).collect(),
            RecordKind::Thought => self.thoughts.values().cloned().map(Record::Thought).collect(),
            RecordKind::ExerciseCompletion => self
                .exercise_completions
                .values()
                .cloned()
                .map(Record::ExerciseCompletion)
                .collect(),
            RecordKind::ChatSession => self
                .chat_sessions
                .values()
                .cloned()
                .map(Record::ChatSession)
                .collect(),
        }
    }
}

impl TableSet for StoreDocument {
    fn sequence(&self, seq: Sequence) -> SyncResult<u64> {
        Ok(self.sequences.get(seq.name()).copied().unwrap_or(0))
    }

    fn set_sequence(&mut self, seq: Sequence, value: u64) -> SyncResult<()> {
        self.sequences.insert(seq.name().to_string(), value);
        Ok(())
    }

    fn load(&self, key: &RecordKey) -> SyncResult<Option<Record>> {
        Ok(match key {
            RecordKey::User(id) => self.users.get(&id.0).cloned().map(Record::User),
            RecordKey::Thought(id) => self.thoughts.get(&id.0).cloned().map(Record::Thought),
            RecordKey::ExerciseCompletion(id) => self
                .exercise_completions
                .get(&id.0)
                .cloned()
                .map(Record::ExerciseCompletion),
            RecordKey::ChatSession(id) => self
                .chat_sessions
                .get(id.as_str())
                .cloned()
                .map(Record::ChatSession),
        })
    }

    fn save(&mut self, record: &Record) -> SyncResult<()> {
        match record.clone() {
            Record::User(u) => {
                self.users.insert(u.id.0, u);
            }
            Record::Thought(t) => {
                self.thoughts.insert(t.id.0, t);
            }
            Record::ExerciseCompletion(e) => {
                self.exercise_completions.insert(e.id.0, e);
            }
            Record::ChatSession(s) => {
                self.chat_sessions.insert(s.id.0.clone(), s);
            }
        }
        Ok(())
    }

    fn remove(&mut self, key: &RecordKey) -> SyncResult<()> {
        match key {
            RecordKey::User(id) => {
                self.users.remove(&id.0);
            }
            RecordKey::Thought(id) => {
                self.thoughts.remove(&id.0);
            }
            RecordKey::ExerciseCompletion(id) => {
                self.exercise_completions.remove(&id.0);
            }
            RecordKey::ChatSession(id) => {
                self.chat_sessions.remove(id.as_str());
            }
        }
        Ok(())
    }

    fn user_for_email(&self, email: &str) -> SyncResult<Option<LocalId>> {
        Ok(self.user_emails.get(email).copied().map(LocalId))
    }

    fn index_email(&mut self, email: &str, id: LocalId) -> SyncResult<()> {
        self.user_emails.insert(email.to_string(), id.0);
        Ok(())
    }

    fn unindex_email(&mut self, email: &str) -> SyncResult<()> {
        self.user_emails.remove(email);
        Ok(())
    }

    fn entry(&self, id: OutboxId) -> SyncResult<Option<OutboxEntry>> {
        Ok(self.outbox.get(&id.0).cloned())
    }

    fn save_entry(&mut self, entry: &OutboxEntry) -> SyncResult<()> {
        self.outbox.insert(entry.id.0, entry.clone());
        Ok(())
    }

    fn remove_entry(&mut self, id: OutboxId) -> SyncResult<()> {
        self.outbox.remove(&id.0);
        Ok(())
    }

    fn oldest_entry(&self) -> SyncResult<Option<OutboxEntry>> {
        Ok(self.outbox.values().next().cloned())
    }

    fn entry_count(&self) -> SyncResult<u64> {
        Ok(self.outbox.len() as u64)
    }

    fn entries_for(&self, key: &RecordKey) -> SyncResult<Vec<OutboxEntry>> {
        Ok(self
            .outbox
            .values()
            .filter(|e| &e.record == key)
            .cloned()
            .collect())
    }

    fn set_session(&mut self, marker: Option<&SessionMarker>) -> SyncResult<()> {
        self.session = marker.cloned();
        Ok(())
    }

    fn set_last_synced(&mut self, at: DateTime<Utc>) -> SyncResult<()> {
        self.last_synced_at = Some(at);
        Ok(())
    }
}

/// Local store kept as a single JSON file.
pub struct DocumentStore {
    path: PathBuf,
    doc: Mutex<StoreDocument>,
    outbox_capacity: usize,
}

impl DocumentStore {
    /// Load the document at `path`, or start empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>, outbox_capacity: usize) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let doc = if path.exists() {
            let raw = std::fs::read(&path)?;
            let doc: StoreDocument = serde_json::from_slice(&raw)?;
            if doc.version > DOCUMENT_VERSION {
                return Err(SyncError::Storage(format!(
                    "document version {} is newer than supported {}",
                    doc.version, DOCUMENT_VERSION
                )));
            }
            doc
        } else {
            StoreDocument {
                version: DOCUMENT_VERSION,
                ..StoreDocument::default()
            }
        };

        debug!(?path, "Opened document store");
        Ok(Self {
            path,
            doc: Mutex::new(doc),
            outbox_capacity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file on disk with `doc`.
    fn persist(&self, doc: &StoreDocument) -> SyncResult<()> {
        let bytes = serde_json::to_vec(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            warn!(error = %e, path = ?self.path, "Failed to replace document");
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Run `f` on a copy of the document and commit the copy if `f` succeeds.
    fn commit<R>(&self, f: impl FnOnce(&mut StoreDocument) -> SyncResult<R>) -> SyncResult<R> {
        let mut doc = self.doc.lock();
        let mut next = doc.clone();
        let result = f(&mut next)?;
        next.version = DOCUMENT_VERSION;
        self.persist(&next)?;
        *doc = next;
        Ok(result)
    }
}

impl LocalStore for DocumentStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Document
    }

    fn apply(&self, batch: Batch) -> SyncResult<BatchOutcome> {
        let capacity = self.outbox_capacity;
        self.commit(|doc| apply_batch(doc, batch.into_ops(), capacity))
    }

    fn reserve_id(&self, kind: RecordKind) -> SyncResult<LocalId> {
        let seq = Sequence::for_kind(kind).ok_or_else(|| {
            SyncError::InvalidOperation(format!("{} ids are not allocated", kind))
        })?;
        self.commit(|doc| next_id(doc, seq).map(LocalId))
    }

    fn get(&self, key: &RecordKey) -> SyncResult<Record> {
        self.doc
            .lock()
            .load(key)?
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    fn query(&self, owner: LocalId, filter: &RecordFilter) -> SyncResult<Vec<Record>> {
        let records = self.doc.lock().records(filter.kind);
        Ok(filter.select(owner, records))
    }

    fn find_user_by_email(&self, email: &str) -> SyncResult<Option<User>> {
        let doc = self.doc.lock();
        Ok(doc
            .user_emails
            .get(email)
            .and_then(|id| doc.users.get(id))
            .cloned())
    }

    fn outbox_entries(&self) -> SyncResult<Vec<OutboxEntry>> {
        Ok(self.doc.lock().outbox.values().cloned().collect())
    }

    fn outbox_len(&self) -> SyncResult<usize> {
        Ok(self.doc.lock().outbox.len())
    }

    fn session_marker(&self) -> SyncResult<Option<SessionMarker>> {
        Ok(self.doc.lock().session.clone())
    }

    fn last_synced_at(&self) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.doc.lock().last_synced_at)
    }
}
