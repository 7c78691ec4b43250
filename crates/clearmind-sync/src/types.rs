//! Core domain types for the ClearMind journal
//!
//! Every entity is keyed by a locally generated identifier so it can be
//! created while offline. Analysis output (distortions, reframes, action
//! items, annotation payloads) is kept as opaque JSON: the engine stores and
//! forwards it without interpreting it.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Locally generated numeric identifier, monotonic per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub u64);

impl LocalId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned by the remote service to a confirmed account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chat sessions are addressed by their start time rather than a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatSessionId(pub String);

impl ChatSessionId {
    /// Derive the id from the session's start timestamp (millisecond precision).
    pub fn from_started_at(started_at: DateTime<Utc>) -> Self {
        Self(format!("session-{}", started_at.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether the remote service has acknowledged the latest local state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Pending,
    Applied,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Pending => f.write_str("pending"),
            SyncState::Applied => f.write_str("applied"),
        }
    }
}

/// A journal user. Local-only until `remote_id` is set.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: LocalId,
    #[serde(default)]
    pub remote_id: Option<RemoteId>,
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_linked(&self) -> bool {
        self.remote_id.is_some()
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("remote_id", &self.remote_id)
            .field("email", &self.email)
            .field("display_name", &self.display_name)
            .field("password_hash", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// An analyzed thought with its distortions and reframes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thought {
    pub id: LocalId,
    pub owner_id: LocalId,
    pub text: String,
    #[serde(default)]
    pub distortions: Vec<Value>,
    #[serde(default)]
    pub reframes: Vec<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sync_state: SyncState,
}

/// Record of a finished CBT exercise. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseCompletion {
    pub id: LocalId,
    pub owner_id: LocalId,
    pub exercise_id: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub sync_state: SyncState,
}

/// Kind of sub-record that can be attached to a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    DistortionAnalysis,
    ActionPlan,
    Reminder,
}

/// Append-only annotation on a single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAnnotation {
    pub kind: AnnotationKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub annotations: Vec<MessageAnnotation>,
}

impl ChatMessage {
    pub fn new(
        role: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp,
            annotations: Vec::new(),
        }
    }
}

/// A finished coaching conversation and its summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: ChatSessionId,
    pub owner_id: LocalId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub themes: BTreeSet<String>,
    #[serde(default)]
    pub emotions: BTreeSet<String>,
    #[serde(default)]
    pub action_items: Vec<Value>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub sync_state: SyncState,
}

/// Entity tables held by the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    User,
    Thought,
    ExerciseCompletion,
    ChatSession,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::User => "user",
            RecordKind::Thought => "thought",
            RecordKind::ExerciseCompletion => "exercise",
            RecordKind::ChatSession => "chat_session",
        };
        f.write_str(name)
    }
}

/// Primary key of any stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKey {
    User(LocalId),
    Thought(LocalId),
    ExerciseCompletion(LocalId),
    ChatSession(ChatSessionId),
}

impl RecordKey {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordKey::User(_) => RecordKind::User,
            RecordKey::Thought(_) => RecordKind::Thought,
            RecordKey::ExerciseCompletion(_) => RecordKind::ExerciseCompletion,
            RecordKey::ChatSession(_) => RecordKind::ChatSession,
        }
    }

    /// Numeric id for counter-keyed tables.
    pub fn local_id(&self) -> Option<LocalId> {
        match self {
            RecordKey::User(id) | RecordKey::Thought(id) | RecordKey::ExerciseCompletion(id) => {
                Some(*id)
            }
            RecordKey::ChatSession(_) => None,
        }
    }

    /// Key the server uses to dedupe repeated deliveries of the same record.
    pub fn idempotency_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::User(id) => write!(f, "user:{}", id),
            RecordKey::Thought(id) => write!(f, "thought:{}", id),
            RecordKey::ExerciseCompletion(id) => write!(f, "exercise:{}", id),
            RecordKey::ChatSession(id) => write!(f, "chat_session:{}", id),
        }
    }
}

/// Any persisted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    User(User),
    Thought(Thought),
    ExerciseCompletion(ExerciseCompletion),
    ChatSession(ChatSession),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::User(u) => RecordKey::User(u.id),
            Record::Thought(t) => RecordKey::Thought(t.id),
            Record::ExerciseCompletion(e) => RecordKey::ExerciseCompletion(e.id),
            Record::ChatSession(s) => RecordKey::ChatSession(s.id.clone()),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.key().kind()
    }

    /// The user that owns this record. A user owns itself.
    pub fn owner_id(&self) -> LocalId {
        match self {
            Record::User(u) => u.id,
            Record::Thought(t) => t.owner_id,
            Record::ExerciseCompletion(e) => e.owner_id,
            Record::ChatSession(s) => s.owner_id,
        }
    }

    /// Timestamp used for newest-first ordering.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::User(u) => u.created_at,
            Record::Thought(t) => t.created_at,
            Record::ExerciseCompletion(e) => e.completed_at,
            Record::ChatSession(s) => s.ended_at,
        }
    }

    /// Users are not replicated through the outbox and have no sync state.
    pub fn sync_state(&self) -> Option<SyncState> {
        match self {
            Record::User(_) => None,
            Record::Thought(t) => Some(t.sync_state),
            Record::ExerciseCompletion(e) => Some(e.sync_state),
            Record::ChatSession(s) => Some(s.sync_state),
        }
    }

    pub fn set_sync_state(&mut self, state: SyncState) {
        match self {
            Record::User(_) => {}
            Record::Thought(t) => t.sync_state = state,
            Record::ExerciseCompletion(e) => e.sync_state = state,
            Record::ChatSession(s) => s.sync_state = state,
        }
    }

    pub fn into_user(self) -> Option<User> {
        match self {
            Record::User(u) => Some(u),
            _ => None,
        }
    }

    pub fn into_thought(self) -> Option<Thought> {
        match self {
            Record::Thought(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_exercise_completion(self) -> Option<ExerciseCompletion> {
        match self {
            Record::ExerciseCompletion(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_chat_session(self) -> Option<ChatSession> {
        match self {
            Record::ChatSession(s) => Some(s),
            _ => None,
        }
    }
}

/// A thought that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewThought {
    pub owner_id: LocalId,
    pub text: String,
    pub distortions: Vec<Value>,
    pub reframes: Vec<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExerciseCompletion {
    pub owner_id: LocalId,
    pub exercise_id: String,
    pub completed_at: DateTime<Utc>,
}

/// A finished conversation as handed over by the chat surface. The owner and
/// id are filled in when it is saved.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChatSession {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
    pub themes: BTreeSet<String>,
    pub emotions: BTreeSet<String>,
    pub action_items: Vec<Value>,
    pub summary: String,
}

impl NewChatSession {
    pub fn new(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            ended_at,
            messages: Vec::new(),
            themes: BTreeSet::new(),
            emotions: BTreeSet::new(),
            action_items: Vec::new(),
            summary: String::new(),
        }
    }
}

/// Entity data for an insert; the store assigns the identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Draft {
    Thought(NewThought),
    ExerciseCompletion(NewExerciseCompletion),
    /// Chat sessions carry their own time-derived id; inserting an
    /// existing id is rejected because sessions are immutable.
    ChatSession(ChatSession),
}

/// Input to `LocalStore::put`.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    New(Draft),
    Existing(Record),
}

impl From<Draft> for Entity {
    fn from(draft: Draft) -> Self {
        Entity::New(draft)
    }
}

impl From<Record> for Entity {
    fn from(record: Record) -> Self {
        Entity::Existing(record)
    }
}

/// Selection criteria for `LocalStore::query`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFilter {
    pub kind: RecordKind,
    pub pending_only: bool,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            pending_only: false,
            since: None,
            limit: None,
        }
    }

    pub fn pending_only(mut self) -> Self {
        self.pending_only = true;
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filter `records` down to this owner's matches, newest first.
    pub(crate) fn select(&self, owner: LocalId, records: Vec<Record>) -> Vec<Record> {
        let mut selected: Vec<Record> = records
            .into_iter()
            .filter(|r| r.kind() == self.kind && r.owner_id() == owner)
            .filter(|r| !self.pending_only || r.sync_state() == Some(SyncState::Pending))
            .filter(|r| self.since.map_or(true, |since| r.timestamp() >= since))
            .collect();

        selected.sort_by(|a, b| {
            b.timestamp()
                .cmp(&a.timestamp())
                .then_with(|| b.key().cmp(&a.key()))
        });

        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Occurrence count of one distortion across a user's thoughts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistortionCount {
    pub name: String,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn thought(id: u64, owner: u64, secs: i64, state: SyncState) -> Record {
        Record::Thought(Thought {
            id: LocalId(id),
            owner_id: LocalId(owner),
            text: format!("thought {}", id),
            distortions: vec![],
            reframes: vec![],
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            sync_state: state,
        })
    }

    #[test]
    fn test_record_key_display_is_idempotency_key() {
        assert_eq!(RecordKey::Thought(LocalId(7)).idempotency_key(), "thought:7");
        let sid = ChatSessionId("session-1700000000000".into());
        assert_eq!(
            RecordKey::ChatSession(sid).to_string(),
            "chat_session:session-1700000000000"
        );
    }

    #[test]
    fn test_chat_session_id_is_derived_from_start_time() {
        let started = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(
            ChatSessionId::from_started_at(started).as_str(),
            "session-1700000000123"
        );
    }

    #[test]
    fn test_filter_orders_newest_first_and_scopes_owner() {
        let records = vec![
            thought(1, 1, 100, SyncState::Applied),
            thought(2, 1, 300, SyncState::Pending),
            thought(3, 2, 200, SyncState::Pending),
            thought(4, 1, 200, SyncState::Pending),
        ];

        let all = RecordFilter::new(RecordKind::Thought).select(LocalId(1), records.clone());
        let ids: Vec<_> = all.iter().map(|r| r.key()).collect();
        assert_eq!(
            ids,
            vec![
                RecordKey::Thought(LocalId(2)),
                RecordKey::Thought(LocalId(4)),
                RecordKey::Thought(LocalId(1)),
            ]
        );

        let pending = RecordFilter::new(RecordKind::Thought)
            .pending_only()
            .limit(1)
            .select(LocalId(1), records);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key(), RecordKey::Thought(LocalId(2)));
    }

    #[test]
    fn test_user_debug_redacts_hash() {
        let user = User {
            id: LocalId(1),
            remote_id: None,
            email: "a@x.com".into(),
            display_name: "A".into(),
            password_hash: "$argon2id$secret".into(),
            created_at: Utc::now(),
        };
        assert!(!format!("{:?}", user).contains("secret"));
    }
}
