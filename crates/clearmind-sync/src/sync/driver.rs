//! Background task that drains the outbox
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncDriver task                                                │
//! │  ├── network watch: drain on every Offline -> Online transition │
//! │  ├── interval tick: drain periodically while Online             │
//! │  └── cancellation: stop after the current drain completes      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Drains run inside the `select!` arm bodies, so cancellation is only
//! observed between drains and a drain is never interrupted.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::RemoteGateway;
use crate::identity::IdentityResolver;
use crate::network::NetworkMonitor;

use super::outbox::{DrainResult, Outbox};

/// Everything a drain pass needs.
#[derive(Clone)]
pub struct DrainContext {
    pub outbox: Arc<Outbox>,
    pub gateway: Arc<dyn RemoteGateway>,
    pub identity: Arc<IdentityResolver>,
}

impl DrainContext {
    /// Refresh a linked session that was restored offline, then drain the
    /// signed-in user's entries once with whatever credential the session
    /// holds.
    pub async fn drain_once(&self) -> DrainResult {
        self.identity.refresh_on_reconnect().await;
        let session = self.identity.current();
        let owner = session.user().map(|user| user.id);
        self.outbox
            .drain(self.gateway.as_ref(), owner, session.credential())
            .await
    }
}

/// Handle to a running background drain task.
pub struct SyncDriver {
    task_handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl SyncDriver {
    /// Spawn the driver on the current tokio runtime.
    pub fn spawn(context: DrainContext, network: NetworkMonitor, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_handle = tokio::spawn(async move {
            Self::run(context, network, interval, token).await;
        });
        info!(interval_secs = interval.as_secs(), "Sync driver started");
        Self {
            task_handle,
            cancel,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task_handle.is_finished()
    }

    /// Stop the driver, waiting for an in-flight drain to complete.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task_handle.await {
            warn!(error = %e, "Sync driver task ended abnormally");
        }
        info!("Sync driver stopped");
    }

    async fn run(
        context: DrainContext,
        network: NetworkMonitor,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut status_rx = network.watch();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Entries may be left over from a previous run.
        if status_rx.borrow_and_update().is_online() {
            context.drain_once().await;
        }

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                changed = status_rx.changed() => {
                    if changed.is_err() {
                        debug!("Network monitor dropped, stopping driver");
                        break;
                    }
                    let status = *status_rx.borrow_and_update();
                    if status.is_online() {
                        debug!("Reachability restored, draining");
                        context.drain_once().await;
                    }
                }

                _ = ticker.tick() => {
                    if network.is_online() {
                        context.drain_once().await;
                    }
                }
            }
        }

        debug!("Sync driver task ended");
    }
}
