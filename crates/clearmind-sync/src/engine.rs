//! ClearMind engine - the main API surface
//!
//! Single entry point for hosts. Owns the local store, the network monitor,
//! the identity resolver, the outbox and the event channel.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  SyncEngine                                                      │
//! │  ├── IdentityResolver: who is acting (unauth / local / linked)   │
//! │  ├── LocalStore: users, journal records, outbox, session marker  │
//! │  ├── Outbox: queued remote writes, drained through the gateway   │
//! │  └── NetworkMonitor: reachability, triggers reconnect drains     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every journal mutation resolves its owner from the current session and
//! commits the entity write together with its outbox entry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{HttpGateway, RemoteGateway};
use crate::identity::{CredentialHasher, IdentityMode, IdentityResolver, SessionState};
use crate::network::{NetworkMonitor, Subscription, TcpProbe};
use crate::storage::{open_store, Batch, BatchOutcome, LocalStore, StoreBackend};
use crate::sync::{
    DrainContext, DrainResult, Outbox, OutboxEntry, PendingWrite, SyncDriver, SyncEvent,
    SyncMethod, EVENT_CHANNEL_CAPACITY,
};
use crate::types::{
    AnnotationKind, ChatSession, ChatSessionId, DistortionCount, Draft, ExerciseCompletion,
    LocalId, MessageAnnotation, NewChatSession, NewExerciseCompletion, NewThought, Record,
    RecordFilter, RecordKey, RecordKind, SyncState, Thought, User,
};

/// Thoughts returned by `list_thoughts` when no limit is given
pub const DEFAULT_THOUGHT_LIMIT: usize = 100;

/// Chat sessions returned by `list_chat_sessions` when no limit is given
pub const DEFAULT_SESSION_LIMIT: usize = 50;

/// The main ClearMind engine
///
/// # Example
///
/// ```ignore
/// use clearmind_sync::{EngineConfig, NetworkMonitor, SyncEngine};
///
/// let engine = SyncEngine::open(EngineConfig::new("~/.clearmind"), NetworkMonitor::default())?;
/// engine.restore_session().await;
/// engine.register("me@example.com", "long enough", None).await?;
/// engine.save_thought("Nothing ever works out", vec![], vec![])?;
/// let driver = engine.spawn_sync_driver();
/// ```
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn LocalStore>,
    network: NetworkMonitor,
    gateway: Arc<dyn RemoteGateway>,
    identity: Arc<IdentityResolver>,
    outbox: Arc<Outbox>,
    /// Event broadcast channel shared with the resolver and outbox
    event_tx: broadcast::Sender<SyncEvent>,
    /// Forwards monitor transitions as `NetworkChanged` events
    _network_subscription: Subscription,
}

impl SyncEngine {
    /// Open the configured store and talk to the configured API over HTTP.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` for an invalid configuration and a storage
    /// error if neither backend can be opened.
    pub fn open(config: EngineConfig, network: NetworkMonitor) -> SyncResult<Self> {
        config.validate()?;
        info!(data_dir = ?config.data_dir, api = %config.api_base_url, "Initializing SyncEngine");

        let gateway = Arc::new(HttpGateway::new(
            &config.api_base_url,
            config.request_timeout(),
        )?);
        let store = open_store(&config)?;
        Self::with_parts(config, store, gateway, network)
    }

    /// Assemble an engine from explicit components.
    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn LocalStore>,
        gateway: Arc<dyn RemoteGateway>,
        network: NetworkMonitor,
    ) -> SyncResult<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let hasher = CredentialHasher::new(config.hashing)?;

        let identity = Arc::new(IdentityResolver::new(
            store.clone(),
            gateway.clone(),
            network.clone(),
            hasher,
            config.request_timeout(),
            event_tx.clone(),
        ));
        let outbox = Arc::new(Outbox::new(
            store.clone(),
            event_tx.clone(),
            config.request_timeout(),
        ));

        let network_tx = event_tx.clone();
        let network_subscription = network.subscribe(move |status| {
            let _ = network_tx.send(SyncEvent::NetworkChanged { status });
        });

        debug!(backend = ?store.backend(), "SyncEngine ready");
        Ok(Self {
            config,
            store,
            network,
            gateway,
            identity,
            outbox,
            event_tx,
            _network_subscription: network_subscription,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn backend(&self) -> StoreBackend {
        self.store.backend()
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn identity(&self) -> &Arc<IdentityResolver> {
        &self.identity
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Subscribe to drain, identity and network events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Commit a batch and report any outbox evictions it caused.
    fn commit(&self, batch: Batch) -> SyncResult<BatchOutcome> {
        let outcome = self.store.apply(batch)?;
        self.outbox.publish_evictions(&outcome);
        Ok(outcome)
    }

    /// Load a record owned by `owner`. Records of other users read as missing.
    fn owned(&self, key: &RecordKey, owner: LocalId) -> SyncResult<Record> {
        let record = self.store.get(key)?;
        if record.owner_id() != owner {
            return Err(SyncError::NotFound(key.to_string()));
        }
        Ok(record)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Rebuild the session persisted by a previous run. Never fails.
    pub async fn restore_session(&self) -> SessionState {
        self.identity.restore_session().await
    }

    /// Create an account; linked when the API is reachable, local otherwise.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::DuplicateEmail` if the email is taken and
    /// `SyncError::Validation` for a malformed email or short password.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> SyncResult<SessionState> {
        self.identity.register(email, password, name).await
    }

    /// Sign in, remotely first when online.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidCredentials` for a wrong password and
    /// `SyncError::UserNotFound` when offline and the email is unknown here.
    pub async fn login(&self, email: &str, password: &str) -> SyncResult<SessionState> {
        self.identity.login(email, password).await
    }

    /// Sign out. Journal data stays on the device.
    pub fn logout(&self) {
        self.identity.logout();
    }

    pub fn session(&self) -> SessionState {
        self.identity.current()
    }

    pub fn identity_mode(&self) -> IdentityMode {
        self.identity.mode()
    }

    pub fn current_user(&self) -> Option<User> {
        self.identity.current_user()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Thought Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save an analyzed thought and queue it for upload.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Unauthenticated` without an active session and
    /// `SyncError::Validation` for empty text.
    pub fn save_thought(
        &self,
        text: &str,
        distortions: Vec<Value>,
        reframes: Vec<Value>,
    ) -> SyncResult<Thought> {
        let owner_id = self.identity.owner_id()?;
        let text = require_text(text)?;

        let draft = Draft::Thought(NewThought {
            owner_id,
            text,
            distortions,
            reframes,
            created_at: Utc::now(),
        });
        let record = self.commit(Batch::new().put(draft, true))?.into_record()?;
        debug!(record = %record.key(), "Thought saved");
        into_kind(record, Record::into_thought)
    }

    /// Replace the text and analysis of one of the user's thoughts.
    pub fn edit_thought(
        &self,
        id: LocalId,
        text: &str,
        distortions: Vec<Value>,
        reframes: Vec<Value>,
    ) -> SyncResult<Thought> {
        let owner_id = self.identity.owner_id()?;
        let text = require_text(text)?;

        let mut thought = into_kind(
            self.owned(&RecordKey::Thought(id), owner_id)?,
            Record::into_thought,
        )?;
        thought.text = text;
        thought.distortions = distortions;
        thought.reframes = reframes;

        let record = self
            .commit(Batch::new().put(Record::Thought(thought), true))?
            .into_record()?;
        debug!(record = %record.key(), "Thought edited");
        into_kind(record, Record::into_thought)
    }

    pub fn delete_thought(&self, id: LocalId) -> SyncResult<()> {
        let owner_id = self.identity.owner_id()?;
        self.commit(Batch::new().delete(RecordKey::Thought(id), owner_id, true))?;
        debug!(thought_id = %id, "Thought deleted");
        Ok(())
    }

    /// The user's thoughts, newest first.
    pub fn list_thoughts(&self, limit: Option<usize>) -> SyncResult<Vec<Thought>> {
        let owner_id = self.identity.owner_id()?;
        let filter =
            RecordFilter::new(RecordKind::Thought).limit(limit.unwrap_or(DEFAULT_THOUGHT_LIMIT));
        Ok(self
            .store
            .query(owner_id, &filter)?
            .into_iter()
            .filter_map(Record::into_thought)
            .collect())
    }

    /// How often each distortion was identified across all of the user's
    /// thoughts, most frequent first.
    pub fn distortion_stats(&self) -> SyncResult<Vec<DistortionCount>> {
        let owner_id = self.identity.owner_id()?;
        let thoughts = self
            .store
            .query(owner_id, &RecordFilter::new(RecordKind::Thought))?;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for thought in thoughts.into_iter().filter_map(Record::into_thought) {
            for distortion in &thought.distortions {
                if let Some(name) = distortion_name(distortion) {
                    *counts.entry(name).or_default() += 1;
                }
            }
        }

        let mut stats: Vec<DistortionCount> = counts
            .into_iter()
            .map(|(name, count)| DistortionCount { name, count })
            .collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        Ok(stats)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Exercise Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Record that the user finished an exercise.
    pub fn complete_exercise(&self, exercise_id: &str) -> SyncResult<ExerciseCompletion> {
        let owner_id = self.identity.owner_id()?;
        let exercise_id = exercise_id.trim();
        if exercise_id.is_empty() {
            return Err(SyncError::Validation("exercise id is empty".into()));
        }

        let draft = Draft::ExerciseCompletion(NewExerciseCompletion {
            owner_id,
            exercise_id: exercise_id.to_string(),
            completed_at: Utc::now(),
        });
        let record = self.commit(Batch::new().put(draft, true))?.into_record()?;
        debug!(record = %record.key(), exercise_id, "Exercise completed");
        into_kind(record, Record::into_exercise_completion)
    }

    /// Every completion of the user, newest first.
    pub fn list_completed_exercises(&self) -> SyncResult<Vec<ExerciseCompletion>> {
        let owner_id = self.identity.owner_id()?;
        Ok(self
            .store
            .query(owner_id, &RecordFilter::new(RecordKind::ExerciseCompletion))?
            .into_iter()
            .filter_map(Record::into_exercise_completion)
            .collect())
    }

    pub fn delete_exercise_completion(&self, id: LocalId) -> SyncResult<()> {
        let owner_id = self.identity.owner_id()?;
        self.commit(Batch::new().delete(RecordKey::ExerciseCompletion(id), owner_id, true))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Chat Session Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a finished conversation. Its id is derived from `started_at`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Validation` if the session ends before it starts or
    /// a session with the same start time already exists.
    pub fn save_chat_session(&self, draft: NewChatSession) -> SyncResult<ChatSession> {
        let owner_id = self.identity.owner_id()?;
        if draft.ended_at < draft.started_at {
            return Err(SyncError::Validation(
                "chat session ends before it starts".into(),
            ));
        }

        let session = ChatSession {
            id: ChatSessionId::from_started_at(draft.started_at),
            owner_id,
            started_at: draft.started_at,
            ended_at: draft.ended_at,
            messages: draft.messages,
            themes: draft.themes,
            emotions: draft.emotions,
            action_items: draft.action_items,
            summary: draft.summary,
            sync_state: SyncState::Pending,
        };
        let record = self
            .commit(Batch::new().put(Draft::ChatSession(session), true))?
            .into_record()?;
        debug!(record = %record.key(), "Chat session saved");
        into_kind(record, Record::into_chat_session)
    }

    /// Attach an annotation to message `index` of a stored session.
    ///
    /// Annotations are append-only; the session's messages are otherwise
    /// left untouched.
    pub fn annotate_message(
        &self,
        session_id: &ChatSessionId,
        index: usize,
        kind: AnnotationKind,
        payload: Value,
    ) -> SyncResult<ChatSession> {
        let owner_id = self.identity.owner_id()?;
        let mut session = into_kind(
            self.owned(&RecordKey::ChatSession(session_id.clone()), owner_id)?,
            Record::into_chat_session,
        )?;

        let message_count = session.messages.len();
        let message = session.messages.get_mut(index).ok_or_else(|| {
            SyncError::Validation(format!(
                "message {} out of range ({} messages)",
                index, message_count
            ))
        })?;
        message.annotations.push(MessageAnnotation {
            kind,
            payload,
            created_at: Utc::now(),
        });

        let record = self
            .commit(Batch::new().put(Record::ChatSession(session), true))?
            .into_record()?;
        debug!(record = %record.key(), index, ?kind, "Message annotated");
        into_kind(record, Record::into_chat_session)
    }

    /// The user's chat sessions, most recently ended first.
    pub fn list_chat_sessions(&self, limit: Option<usize>) -> SyncResult<Vec<ChatSession>> {
        let owner_id = self.identity.owner_id()?;
        let filter = RecordFilter::new(RecordKind::ChatSession)
            .limit(limit.unwrap_or(DEFAULT_SESSION_LIMIT));
        Ok(self
            .store
            .query(owner_id, &filter)?
            .into_iter()
            .filter_map(Record::into_chat_session)
            .collect())
    }

    pub fn delete_chat_session(&self, id: &ChatSessionId) -> SyncResult<()> {
        let owner_id = self.identity.owner_id()?;
        self.commit(Batch::new().delete(RecordKey::ChatSession(id.clone()), owner_id, true))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync Operations
    // ═══════════════════════════════════════════════════════════════════════

    fn drain_context(&self) -> DrainContext {
        DrainContext {
            outbox: self.outbox.clone(),
            gateway: self.gateway.clone(),
            identity: self.identity.clone(),
        }
    }

    /// Drain the outbox now with the current credential.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Connectivity` while the monitor reports offline.
    pub async fn sync_now(&self) -> SyncResult<DrainResult> {
        if !self.network.is_online() {
            return Err(SyncError::Connectivity("network is offline".into()));
        }
        Ok(self.drain_context().drain_once().await)
    }

    /// Queue a fresh create for a record whose earlier upload was dropped.
    ///
    /// Only records that are still pending and have nothing queued qualify.
    pub fn resync(&self, key: &RecordKey) -> SyncResult<OutboxEntry> {
        let owner_id = self.identity.owner_id()?;
        let record = self.owned(key, owner_id)?;

        match record.sync_state() {
            Some(SyncState::Pending) => {}
            Some(SyncState::Applied) => {
                return Err(SyncError::InvalidOperation(format!(
                    "{} is already applied",
                    key
                )))
            }
            None => {
                return Err(SyncError::InvalidOperation(format!(
                    "{} is not replicated",
                    key
                )))
            }
        }
        if self.outbox.pending()?.iter().any(|entry| &entry.record == key) {
            return Err(SyncError::InvalidOperation(format!(
                "{} already has queued writes",
                key
            )));
        }

        let write = PendingWrite::snapshot(&record, SyncMethod::Create)?
            .ok_or_else(|| SyncError::InvalidOperation(format!("{} is not replicated", key)))?;
        let entry = self.outbox.enqueue(write)?;
        info!(record = %key, entry_id = %entry.id, "Record re-queued for sync");
        Ok(entry)
    }

    /// Start the background drain task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sync_driver(&self) -> SyncDriver {
        SyncDriver::spawn(
            self.drain_context(),
            self.network.clone(),
            self.config.drain_interval(),
        )
    }

    /// Poll the API host for reachability until `cancel` fires.
    pub fn spawn_reachability_probe(
        &self,
        cancel: CancellationToken,
    ) -> SyncResult<JoinHandle<()>> {
        let probe = TcpProbe::from_base_url(&self.config.api_base_url, self.config.request_timeout())?;
        Ok(self
            .network
            .spawn_probe(Arc::new(probe), self.config.probe_interval(), cancel))
    }

    /// Number of queued outbox entries
    pub fn pending_count(&self) -> SyncResult<usize> {
        self.outbox.len()
    }

    pub fn pending_entries(&self) -> SyncResult<Vec<OutboxEntry>> {
        self.outbox.pending()
    }

    /// When a drain last ran over queued entries, across restarts.
    pub fn last_synced_at(&self) -> SyncResult<Option<DateTime<Utc>>> {
        self.outbox.last_synced_at()
    }
}

fn require_text(text: &str) -> SyncResult<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SyncError::Validation("thought text is empty".into()));
    }
    Ok(text.to_string())
}

fn into_kind<T>(record: Record, convert: fn(Record) -> Option<T>) -> SyncResult<T> {
    let key = record.key();
    convert(record).ok_or_else(|| SyncError::NotFound(key.to_string()))
}

/// Distortions are either plain names or objects with a `name` (or `id`).
fn distortion_name(value: &Value) -> Option<String> {
    match value {
        Value::String(name) => Some(name.clone()),
        Value::Object(map) => map
            .get("name")
            .or_else(|| map.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
