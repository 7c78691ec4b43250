//! Identity resolution: which user is acting, and how they are known
//!
//! ## Session states
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Unauthenticated ── register/login (local) ──▶ LocalOnly(user)  │
//! │         │                                          │            │
//! │         └──── register/login (remote) ──▶ Linked(user, remote)  │
//! │                                                                 │
//! │  logout: any state ──▶ Unauthenticated (data is kept)           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The in-memory [`SessionState`] is owned by [`IdentityResolver`]; the
//! durable counterpart is the store's [`SessionMarker`]. Every transition
//! that links an account writes the mirror user row and the marker in one
//! batch.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::gateway::{
    AuthResponse, Credential, GatewayError, LoginRequest, RegisterRequest, RemoteGateway,
};
use crate::network::NetworkMonitor;
use crate::storage::{Batch, LocalStore, SessionMarker};
use crate::sync::SyncEvent;
use crate::types::{Entity, LocalId, Record, RecordKey, RecordKind, RemoteId, User};

mod password;
mod strategy;

pub use password::CredentialHasher;
pub use strategy::{plan, select, AttemptOutcome, AuthRoute};

/// Shortest password accepted at registration.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Coarse view of [`SessionState`] for events and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    Unauthenticated,
    LocalOnly,
    Linked,
}

impl fmt::Display for IdentityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityMode::Unauthenticated => f.write_str("unauthenticated"),
            IdentityMode::LocalOnly => f.write_str("local-only"),
            IdentityMode::Linked => f.write_str("linked"),
        }
    }
}

/// The identity governing the current session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unauthenticated,
    /// Known only on this device (offline registration or offline login)
    LocalOnly(User),
    /// Confirmed by the remote service
    Linked {
        user: User,
        remote_id: RemoteId,
        credential: Credential,
    },
}

impl SessionState {
    pub fn mode(&self) -> IdentityMode {
        match self {
            SessionState::Unauthenticated => IdentityMode::Unauthenticated,
            SessionState::LocalOnly(_) => IdentityMode::LocalOnly,
            SessionState::Linked { .. } => IdentityMode::Linked,
        }
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            SessionState::Unauthenticated => None,
            SessionState::LocalOnly(user) | SessionState::Linked { user, .. } => Some(user),
        }
    }

    pub fn credential(&self) -> Option<&Credential> {
        match self {
            SessionState::Linked { credential, .. } => Some(credential),
            _ => None,
        }
    }
}

/// Trim and lowercase an email, rejecting obviously malformed input.
pub fn normalize_email(email: &str) -> SyncResult<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(SyncError::Validation(format!("invalid email: {}", email))),
    }
}

fn validate_password(password: &str) -> SyncResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(SyncError::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn default_display_name(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}

/// Decides and tracks who the acting user is.
pub struct IdentityResolver {
    store: Arc<dyn LocalStore>,
    gateway: Arc<dyn RemoteGateway>,
    network: NetworkMonitor,
    hasher: CredentialHasher,
    request_timeout: Duration,
    state: RwLock<SessionState>,
    /// Set by `logout` until the next sign-in, so a marker that could not be
    /// cleared is never restored.
    logged_out: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl IdentityResolver {
    pub fn new(
        store: Arc<dyn LocalStore>,
        gateway: Arc<dyn RemoteGateway>,
        network: NetworkMonitor,
        hasher: CredentialHasher,
        request_timeout: Duration,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            gateway,
            network,
            hasher,
            request_timeout,
            state: RwLock::new(SessionState::Unauthenticated),
            logged_out: AtomicBool::new(false),
            events,
        }
    }

    pub fn current(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn mode(&self) -> IdentityMode {
        self.state.read().mode()
    }

    pub fn current_user(&self) -> Option<User> {
        self.state.read().user().cloned()
    }

    /// The signed-in user, or `Unauthenticated`.
    pub fn require_user(&self) -> SyncResult<User> {
        self.current_user().ok_or(SyncError::Unauthenticated)
    }

    pub fn credential(&self) -> Option<Credential> {
        self.state.read().credential().cloned()
    }

    fn set_state(&self, state: SessionState) {
        let mode = state.mode();
        let user_id = state.user().map(|u| u.id);
        *self.state.write() = state;
        info!(%mode, user_id = ?user_id, "Identity changed");
        let _ = self.events.send(SyncEvent::IdentityChanged { mode, user_id });
    }

    /// Run a remote call under the request timeout.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.request_timeout)),
        }
    }

    /// Create an account, remotely when reachable and locally otherwise.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> SyncResult<SessionState> {
        let email = normalize_email(email)?;
        validate_password(password)?;
        let name = name.map(str::trim).filter(|n| !n.is_empty());

        let routes = plan(self.network.current_status());
        let state = select(&routes, |route| {
            self.register_via(route, &email, password, name)
        })
        .await?;
        self.logged_out.store(false, Ordering::Release);
        self.set_state(state.clone());
        Ok(state)
    }

    async fn register_via(
        &self,
        route: AuthRoute,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> AttemptOutcome<SessionState> {
        match route {
            AuthRoute::Remote => {
                let request = RegisterRequest {
                    email: email.to_string(),
                    password: password.to_string(),
                    name: name.map(str::to_string),
                };
                match self.call(self.gateway.register(&request)).await {
                    Ok(auth) => {
                        AttemptOutcome::settled(self.link_account(email, password, &auth).await)
                    }
                    Err(e) if e.is_transient() => AttemptOutcome::TransientFailure(e.into()),
                    Err(GatewayError::Rejected { status, detail })
                        if status == 409 || detail.to_lowercase().contains("already") =>
                    {
                        let duplicate = SyncError::DuplicateEmail(email.to_string());
                        AttemptOutcome::PermanentFailure(duplicate)
                    }
                    Err(e) => AttemptOutcome::PermanentFailure(e.into()),
                }
            }
            AuthRoute::Local => {
                AttemptOutcome::settled(self.register_local(email, password, name).await)
            }
        }
    }

    async fn register_local(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> SyncResult<SessionState> {
        if self.store.find_user_by_email(email)?.is_some() {
            return Err(SyncError::DuplicateEmail(email.to_string()));
        }

        let password_hash = self.hasher.hash(password).await?;
        let id = self.store.reserve_id(RecordKind::User)?;
        let user = User {
            id,
            remote_id: None,
            email: email.to_string(),
            display_name: name
                .map(str::to_string)
                .unwrap_or_else(|| default_display_name(email)),
            password_hash,
            created_at: Utc::now(),
        };

        self.store.apply(
            Batch::new()
                .put(Entity::Existing(Record::User(user.clone())), false)
                .set_session(Some(SessionMarker::LocalOnly { user_id: id })),
        )?;
        info!(user_id = %id, "Registered local-only account");
        Ok(SessionState::LocalOnly(user))
    }

    /// Mirror a confirmed remote account locally and mark it as the session.
    async fn link_account(
        &self,
        email: &str,
        password: &str,
        auth: &AuthResponse,
    ) -> SyncResult<SessionState> {
        let password_hash = self.hasher.hash(password).await?;
        let remote_id = auth.user.id.clone();

        let user = match self.store.find_user_by_email(email)? {
            Some(mut existing) => {
                existing.remote_id = Some(remote_id.clone());
                existing.password_hash = password_hash;
                if let Some(name) = auth.user.name.as_deref().filter(|n| !n.is_empty()) {
                    existing.display_name = name.to_string();
                }
                existing
            }
            None => User {
                id: self.store.reserve_id(RecordKind::User)?,
                remote_id: Some(remote_id.clone()),
                email: email.to_string(),
                display_name: auth
                    .user
                    .name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| default_display_name(email)),
                password_hash,
                created_at: Utc::now(),
            },
        };

        let marker = SessionMarker::Linked {
            user_id: user.id,
            remote_id: remote_id.clone(),
            access_token: auth.access_token.clone(),
        };
        self.store.apply(
            Batch::new()
                .put(Entity::Existing(Record::User(user.clone())), false)
                .set_session(Some(marker)),
        )?;
        info!(user_id = %user.id, %remote_id, "Linked account");

        Ok(SessionState::Linked {
            user,
            remote_id,
            credential: auth.credential(),
        })
    }

    /// Sign in, remotely when reachable; falls back to the local hash only
    /// when the remote service cannot be reached.
    pub async fn login(&self, email: &str, password: &str) -> SyncResult<SessionState> {
        let email = normalize_email(email)?;

        let routes = plan(self.network.current_status());
        let state = select(&routes, |route| self.login_via(route, &email, password)).await?;
        self.logged_out.store(false, Ordering::Release);
        self.set_state(state.clone());
        Ok(state)
    }

    async fn login_via(
        &self,
        route: AuthRoute,
        email: &str,
        password: &str,
    ) -> AttemptOutcome<SessionState> {
        match route {
            AuthRoute::Remote => {
                let request = LoginRequest {
                    email: email.to_string(),
                    password: password.to_string(),
                };
                match self.call(self.gateway.login(&request)).await {
                    Ok(auth) => {
                        AttemptOutcome::settled(self.link_account(email, password, &auth).await)
                    }
                    Err(e) if e.is_transient() => AttemptOutcome::TransientFailure(e.into()),
                    Err(GatewayError::Unauthorized(_)) => {
                        AttemptOutcome::PermanentFailure(SyncError::InvalidCredentials)
                    }
                    Err(e) => AttemptOutcome::PermanentFailure(e.into()),
                }
            }
            AuthRoute::Local => AttemptOutcome::settled(self.login_local(email, password).await),
        }
    }

    async fn login_local(&self, email: &str, password: &str) -> SyncResult<SessionState> {
        let user = self
            .store
            .find_user_by_email(email)?
            .ok_or_else(|| SyncError::UserNotFound(email.to_string()))?;

        if !self.hasher.verify(password, &user.password_hash).await? {
            return Err(SyncError::InvalidCredentials);
        }

        // A cached link for this user survives so it can be refreshed later.
        let keep_link = matches!(
            self.store.session_marker()?,
            Some(SessionMarker::Linked { user_id, .. }) if user_id == user.id
        );
        if !keep_link {
            self.store.apply(
                Batch::new().set_session(Some(SessionMarker::LocalOnly { user_id: user.id })),
            )?;
        }
        info!(user_id = %user.id, "Signed in locally");
        Ok(SessionState::LocalOnly(user))
    }

    /// Rebuild the session from the persisted marker. Never fails: anything
    /// unexpected yields `Unauthenticated`.
    pub async fn restore_session(&self) -> SessionState {
        let state = match self.try_restore().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Session restore failed");
                SessionState::Unauthenticated
            }
        };
        self.set_state(state.clone());
        state
    }

    async fn try_restore(&self) -> SyncResult<SessionState> {
        if self.logged_out.load(Ordering::Acquire) {
            self.store.apply(Batch::new().set_session(None))?;
            return Ok(SessionState::Unauthenticated);
        }

        let Some(marker) = self.store.session_marker()? else {
            return Ok(SessionState::Unauthenticated);
        };

        let user = match self.store.get(&RecordKey::User(marker.user_id())) {
            Ok(Record::User(user)) => user,
            Ok(_) | Err(SyncError::NotFound(_)) => {
                warn!(user_id = %marker.user_id(), "Session marker points at a missing user");
                return Ok(SessionState::Unauthenticated);
            }
            Err(e) => return Err(e),
        };

        match marker {
            SessionMarker::LocalOnly { .. } => Ok(SessionState::LocalOnly(user)),
            SessionMarker::Linked {
                remote_id,
                access_token,
                ..
            } => {
                if !self.network.is_online() {
                    return Ok(SessionState::LocalOnly(user));
                }
                let credential = Credential::new(access_token);
                match self.call(self.gateway.me(&credential)).await {
                    Ok(_) => Ok(SessionState::Linked {
                        user,
                        remote_id,
                        credential,
                    }),
                    Err(e) if e.is_transient() => {
                        info!(error = %e, "Could not verify cached credential, keeping it");
                        Ok(SessionState::Linked {
                            user,
                            remote_id,
                            credential,
                        })
                    }
                    Err(e) => {
                        info!(error = %e, "Cached credential rejected, continuing locally");
                        Ok(SessionState::LocalOnly(user))
                    }
                }
            }
        }
    }

    /// Upgrade a local-only session back to linked when a cached credential
    /// exists for the same user. Called when connectivity returns.
    pub async fn refresh_on_reconnect(&self) {
        let Some(user_id) = (match &*self.state.read() {
            SessionState::LocalOnly(user) => Some(user.id),
            _ => None,
        }) else {
            return;
        };

        let linked = matches!(
            self.store.session_marker(),
            Ok(Some(SessionMarker::Linked { user_id: marked, .. })) if marked == user_id
        );
        if linked && self.network.is_online() {
            self.restore_session().await;
        }
    }

    /// Forget the active identity. Local data is kept.
    ///
    /// Always succeeds in memory. If the persisted marker cannot be cleared,
    /// restores in this process stay signed out and retry the clear.
    pub fn logout(&self) {
        self.logged_out.store(true, Ordering::Release);
        if let Err(e) = self.store.apply(Batch::new().set_session(None)) {
            error!(error = %e, "Failed to clear persisted session");
        }
        self.set_state(SessionState::Unauthenticated);
    }

    /// The owner id for a mutation by the current user.
    pub fn owner_id(&self) -> SyncResult<LocalId> {
        Ok(self.require_user()?.id)
    }
}
