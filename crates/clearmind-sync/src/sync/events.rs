//! Notifications about outbox, identity and connectivity activity
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncEvent                                                      │
//! │  ├── DrainStarted / DrainFinished: one drain pass               │
//! │  ├── EntryApplied: remote service confirmed an entry            │
//! │  ├── EntryRetained: transient failure, kept for the next drain  │
//! │  ├── SyncFailure: permanent failure, entry dropped              │
//! │  ├── EntryEvicted: outbox full, oldest entry dropped            │
//! │  ├── IdentityChanged: session state moved                       │
//! │  └── NetworkChanged: reachability transition                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use crate::identity::IdentityMode;
use crate::network::NetworkStatus;
use crate::types::{LocalId, RecordKey};

use super::outbox::{Endpoint, OutboxId, SyncMethod};

/// Default capacity for the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A drain pass began with this many queued entries
    DrainStarted { pending: usize },
    /// The remote service confirmed an entry
    EntryApplied {
        entry_id: OutboxId,
        record: RecordKey,
    },
    /// Delivery failed transiently; the entry stays queued
    EntryRetained {
        entry_id: OutboxId,
        record: RecordKey,
        /// Failed attempts including this one
        attempts: u32,
        reason: String,
    },
    /// The remote service rejected an entry; it was removed from the outbox
    /// and its record keeps its pending state
    SyncFailure {
        entry_id: OutboxId,
        record: RecordKey,
        endpoint: Endpoint,
        method: SyncMethod,
        /// HTTP status, when the failure came with one
        status: Option<u16>,
        message: String,
    },
    /// The outbox exceeded its capacity and dropped its oldest entry
    EntryEvicted {
        entry_id: OutboxId,
        record: RecordKey,
    },
    /// A drain pass completed
    DrainFinished {
        applied: usize,
        failed: usize,
        retained_for_retry: usize,
    },
    /// The active identity changed
    IdentityChanged {
        mode: IdentityMode,
        user_id: Option<LocalId>,
    },
    /// Reachability changed
    NetworkChanged { status: NetworkStatus },
}

impl SyncEvent {
    /// Record the event is about, if any
    pub fn record(&self) -> Option<&RecordKey> {
        match self {
            SyncEvent::EntryApplied { record, .. }
            | SyncEvent::EntryRetained { record, .. }
            | SyncEvent::SyncFailure { record, .. }
            | SyncEvent::EntryEvicted { record, .. } => Some(record),
            SyncEvent::DrainStarted { .. }
            | SyncEvent::DrainFinished { .. }
            | SyncEvent::IdentityChanged { .. }
            | SyncEvent::NetworkChanged { .. } => None,
        }
    }
}
