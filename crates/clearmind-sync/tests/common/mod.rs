//! Shared fixtures for integration tests
//!
//! [`ScriptedGateway`] stands in for the journal API: it keeps an in-memory
//! account table, logs every delivery, and answers deliveries from a script
//! of queued responses (success once the script runs out).

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clearmind_sync::gateway::{AuthResponse, LoginRequest, RegisterRequest, RemoteUser};
use clearmind_sync::sync::SyncMethod;
use clearmind_sync::{
    open_store, Credential, EngineConfig, GatewayError, HashingParams, NetworkMonitor,
    NetworkStatus, OutboxEntry, RecordKey, RemoteGateway, RemoteId, SyncEngine, SyncEvent,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// One delivery as the server saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub method: SyncMethod,
    pub path: String,
    pub idempotency_key: String,
    pub record: RecordKey,
    pub bearer: Option<String>,
}

struct Account {
    password: String,
    user: RemoteUser,
}

#[derive(Default)]
struct GatewayState {
    accounts: HashMap<String, Account>,
    tokens: HashMap<String, RemoteId>,
    next_user: u64,
    unreachable: bool,
    delivery_script: VecDeque<Result<(), GatewayError>>,
    delivery_delay: Option<Duration>,
    deliveries: Vec<Delivery>,
    auth_calls: usize,
}

#[derive(Default)]
pub struct ScriptedGateway {
    state: Mutex<GatewayState>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a server-side account.
    pub fn add_account(&self, email: &str, password: &str) {
        let mut state = self.state.lock();
        state.next_user += 1;
        let user = RemoteUser {
            id: RemoteId::new(format!("user-{}", state.next_user)),
            email: email.to_string(),
            name: None,
        };
        state.accounts.insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user,
            },
        );
    }

    /// Every call fails as a connectivity error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Invalidate every issued token.
    pub fn revoke_tokens(&self) {
        self.state.lock().tokens.clear();
    }

    /// Answer the next deliveries with these results, in order.
    pub fn script_deliveries(&self, results: impl IntoIterator<Item = Result<(), GatewayError>>) {
        self.state.lock().delivery_script.extend(results);
    }

    /// Hold every delivery for `delay` before answering.
    pub fn set_delivery_delay(&self, delay: Duration) {
        self.state.lock().delivery_delay = Some(delay);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().deliveries.clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.state.lock().deliveries.len()
    }

    /// Register, login and `/auth/me` calls seen so far
    pub fn auth_calls(&self) -> usize {
        self.state.lock().auth_calls
    }

    fn issue(state: &mut GatewayState, user: &RemoteUser) -> AuthResponse {
        let token = format!("token-{}-{}", user.id, state.tokens.len() + 1);
        state.tokens.insert(token.clone(), user.id.clone());
        AuthResponse {
            access_token: token,
            user: user.clone(),
        }
    }

    fn unreachable() -> GatewayError {
        GatewayError::Connectivity("connection refused".into())
    }
}

#[async_trait]
impl RemoteGateway for ScriptedGateway {
    async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, GatewayError> {
        let mut state = self.state.lock();
        state.auth_calls += 1;
        if state.unreachable {
            return Err(Self::unreachable());
        }
        if state.accounts.contains_key(&request.email) {
            return Err(GatewayError::Rejected {
                status: 400,
                detail: "Email already registered".into(),
            });
        }
        state.next_user += 1;
        let user = RemoteUser {
            id: RemoteId::new(format!("user-{}", state.next_user)),
            email: request.email.clone(),
            name: request.name.clone(),
        };
        state.accounts.insert(
            request.email.clone(),
            Account {
                password: request.password.clone(),
                user: user.clone(),
            },
        );
        Ok(Self::issue(&mut state, &user))
    }

    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, GatewayError> {
        let mut state = self.state.lock();
        state.auth_calls += 1;
        if state.unreachable {
            return Err(Self::unreachable());
        }
        let user = match state.accounts.get(&request.email) {
            Some(account) if account.password == request.password => account.user.clone(),
            _ => {
                return Err(GatewayError::Unauthorized(
                    "Invalid email or password".into(),
                ))
            }
        };
        Ok(Self::issue(&mut state, &user))
    }

    async fn me(&self, credential: &Credential) -> Result<RemoteUser, GatewayError> {
        let mut state = self.state.lock();
        state.auth_calls += 1;
        if state.unreachable {
            return Err(Self::unreachable());
        }
        let remote_id = state
            .tokens
            .get(&credential.access_token)
            .cloned()
            .ok_or_else(|| GatewayError::Unauthorized("Could not validate credentials".into()))?;
        state
            .accounts
            .values()
            .find(|a| a.user.id == remote_id)
            .map(|a| a.user.clone())
            .ok_or_else(|| GatewayError::Unauthorized("User not found".into()))
    }

    async fn deliver(
        &self,
        entry: &OutboxEntry,
        credential: Option<&Credential>,
    ) -> Result<(), GatewayError> {
        let delay = self.state.lock().delivery_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.unreachable {
            return Err(Self::unreachable());
        }
        state.deliveries.push(Delivery {
            method: entry.method,
            path: entry.resource_path(),
            idempotency_key: entry.idempotency_key(),
            record: entry.record.clone(),
            bearer: credential.map(|c| c.access_token.clone()),
        });
        state.delivery_script.pop_front().unwrap_or(Ok(()))
    }
}

/// Config with the cheapest hashing so tests stay fast.
pub fn test_config(temp: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::new(temp.path());
    config.hashing = HashingParams::minimal();
    config
}

pub fn engine_with(
    config: EngineConfig,
    gateway: Arc<ScriptedGateway>,
    status: NetworkStatus,
) -> SyncEngine {
    let store = open_store(&config).unwrap();
    SyncEngine::with_parts(config, store, gateway, NetworkMonitor::new(Some(status))).unwrap()
}

pub fn engine(temp: &TempDir, gateway: Arc<ScriptedGateway>, status: NetworkStatus) -> SyncEngine {
    engine_with(test_config(temp), gateway, status)
}

/// Events currently buffered in `rx`, without waiting.
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub const EMAIL: &str = "writer@example.com";
pub const PASSWORD: &str = "correct horse";
