//! Replication of local writes to the remote journal API
//!
//! - [`Outbox`]: durable FIFO of write intents and the drain loop
//! - [`SyncDriver`]: background task draining on reconnect and on a timer
//! - [`SyncEvent`]: broadcast notifications about drains, identity and network

mod driver;
mod events;
mod outbox;

pub use driver::{DrainContext, SyncDriver};
pub use events::{SyncEvent, EVENT_CHANNEL_CAPACITY};
pub use outbox::{
    DrainResult, Endpoint, Outbox, OutboxEntry, OutboxId, PendingWrite, SyncMethod,
};
