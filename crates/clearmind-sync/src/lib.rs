//! ClearMind Sync Library
//!
//! Offline-first identity and synchronization engine for the ClearMind
//! thought journal.
//!
//! ## Overview
//!
//! Journal records (thoughts, exercise completions, chat sessions) are always
//! written to a local store first. Each write also queues an outbox entry,
//! and the outbox is replayed against the remote journal API whenever the
//! device is online. The user is either known only on this device or linked
//! to a server account; both work offline.
//!
//! ## Core Principles
//!
//! - **Local-first**: every operation except a remote drain works offline
//! - **Atomic writes**: an entity and its outbox entry commit together
//! - **At-most-once application**: deliveries carry an idempotency key and
//!   entries leave the outbox only after the server confirms them
//! - **Per-record ordering**: an update never overtakes its create
//!
//! ## Quick Start
//!
//! ```ignore
//! use clearmind_sync::{EngineConfig, NetworkMonitor, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = SyncEngine::open(EngineConfig::new("~/.clearmind"), NetworkMonitor::default())?;
//!     engine.restore_session().await;
//!
//!     engine.login("me@example.com", "correct horse").await?;
//!     engine.save_thought("I ruin everything", vec![], vec![])?;
//!
//!     let result = engine.sync_now().await?;
//!     println!("applied {} entries", result.applied);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod logging;
pub mod network;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use config::{BackendPreference, EngineConfig, HashingParams};
pub use engine::SyncEngine;
pub use error::{ErrorKind, SyncError, SyncResult};
pub use gateway::{Credential, GatewayError, HttpGateway, RemoteGateway};
pub use identity::{IdentityMode, IdentityResolver, SessionState};
pub use logging::LoggingBuilder;
pub use network::{ConnectionType, NetworkMonitor, NetworkStatus, ReachabilityProbe};
pub use storage::{open_store, Batch, LocalStore, SessionMarker, StoreBackend};
pub use sync::{DrainResult, OutboxEntry, SyncDriver, SyncEvent};
pub use types::*;
