//! Connectivity tracking
//!
//! [`NetworkMonitor`] holds the current reachability and notifies listeners
//! when it changes. Status is pushed in by the host (`report`) or pulled from
//! a [`ReachabilityProbe`] on an interval (`spawn_probe`). Listeners are
//! either synchronous callbacks ([`NetworkMonitor::subscribe`]) or async
//! tasks holding a `watch` receiver ([`NetworkMonitor::watch`]).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub fn is_online(self) -> bool {
        self == NetworkStatus::Online
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkStatus::Online => f.write_str("online"),
            NetworkStatus::Offline => f.write_str("offline"),
        }
    }
}

/// Kind of link the platform reports alongside reachability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    None,
    #[default]
    Unknown,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionType::Wifi => "wifi",
            ConnectionType::Cellular => "cellular",
            ConnectionType::Ethernet => "ethernet",
            ConnectionType::None => "none",
            ConnectionType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

type StatusCallback = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

struct MonitorInner {
    status_tx: watch::Sender<NetworkStatus>,
    /// Serializes transitions so callbacks observe them in order.
    transition: Mutex<()>,
    connection_type: Mutex<ConnectionType>,
    subscribers: Mutex<Vec<(u64, StatusCallback)>>,
    next_subscriber: AtomicU64,
}

/// Shared connectivity state. Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    /// Create a monitor. Without an initial platform signal it assumes Online.
    pub fn new(initial: Option<NetworkStatus>) -> Self {
        let (status_tx, _) = watch::channel(initial.unwrap_or(NetworkStatus::Online));
        Self {
            inner: Arc::new(MonitorInner {
                status_tx,
                transition: Mutex::new(()),
                connection_type: Mutex::new(ConnectionType::Unknown),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn current_status(&self) -> NetworkStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current_status().is_online()
    }

    /// Last link type the platform reported; `Unknown` until it reports one.
    pub fn connection_type(&self) -> ConnectionType {
        *self.inner.connection_type.lock()
    }

    /// Record an observed status. Listeners run only if the status changed.
    ///
    /// Callbacks run on the reporting thread and must not call `report`.
    pub fn report(&self, status: NetworkStatus) -> bool {
        let _transition = self.inner.transition.lock();
        let changed = self.inner.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if !changed {
            return false;
        }

        info!(%status, "Network status changed");
        let callbacks: Vec<StatusCallback> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(status);
        }
        true
    }

    /// Record a raw platform signal; an unavailable signal counts as Online.
    pub fn report_signal(&self, connected: Option<bool>) -> bool {
        let status = match connected {
            Some(false) => NetworkStatus::Offline,
            Some(true) | None => NetworkStatus::Online,
        };
        self.report(status)
    }

    /// Record a platform status event carrying both reachability and link type.
    pub fn report_connection(&self, connected: Option<bool>, connection: ConnectionType) -> bool {
        let previous = std::mem::replace(&mut *self.inner.connection_type.lock(), connection);
        if previous != connection {
            debug!(%connection, "Connection type changed");
        }
        self.report_signal(connected)
    }

    /// Register a callback for status transitions.
    ///
    /// The callback stays registered until the returned [`Subscription`] is
    /// dropped or unsubscribed.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(NetworkStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, Arc::new(callback)));
        debug!(subscriber = id, "Network subscriber added");
        Subscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Receiver for async consumers; `changed()` resolves on each transition.
    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Poll `probe` every `interval` and report the result until cancelled.
    pub fn spawn_probe(
        &self,
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let status = probe.check().await.unwrap_or(NetworkStatus::Online);
                        monitor.report(status);
                    }
                }
            }
            debug!("Reachability probe stopped");
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Registration of a status callback. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    monitor: Weak<MonitorInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.monitor.upgrade() {
            inner.subscribers.lock().retain(|(id, _)| *id != self.id);
            debug!(subscriber = self.id, "Network subscriber removed");
        }
    }
}

/// Source of platform reachability.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// `None` when the platform cannot tell.
    async fn check(&self) -> Option<NetworkStatus>;
}

/// Considers the network reachable when a TCP connection to the API host
/// succeeds within the timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Probe the host and port of an API base URL.
    pub fn from_base_url(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let url = reqwest::Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("api_base_url: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| SyncError::Config(format!("{} has no host", base_url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| SyncError::Config(format!("{} has no port", base_url)))?;
        Ok(Self::new(format!("{}:{}", host, port), timeout))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn check(&self) -> Option<NetworkStatus> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => Some(NetworkStatus::Online),
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "Probe connect failed");
                Some(NetworkStatus::Offline)
            }
            Err(_) => {
                debug!(addr = %self.addr, "Probe timed out");
                Some(NetworkStatus::Offline)
            }
        }
    }
}

/// Fixed answer, for hosts that push status through `report` themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub Option<NetworkStatus>);

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn check(&self) -> Option<NetworkStatus> {
        self.0
    }
}
