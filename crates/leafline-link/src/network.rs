//! Device connectivity tracking.
//!
//! One [`NetworkObserver`] is shared by every channel in the process. The
//! platform layer feeds it with [`NetworkObserver::update`]; channels only
//! read from it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::LinkError;

/// Kind of link the device is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    /// Wi-Fi.
    Wifi,
    /// Mobile data.
    Cellular,
    /// Wired.
    Ethernet,
    /// Some other link (VPN, bluetooth tethering, ...).
    Other,
    /// No link at all.
    None,
    /// Not reported yet.
    Unknown,
}

/// Point-in-time connectivity snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// A link is up.
    pub is_connected: bool,
    /// The internet is reachable over that link; `None` when not yet probed.
    pub is_reachable: Option<bool>,
    /// Link type.
    pub kind: NetworkKind,
    /// The link is metered.
    pub is_expensive: bool,
}

impl NetworkStatus {
    /// Status before the platform has reported anything. Assumed connected so
    /// channels do not park on startup.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            is_connected: true,
            is_reachable: None,
            kind: NetworkKind::Unknown,
            is_expensive: false,
        }
    }

    /// A connected, reachable link of the given kind.
    #[must_use]
    pub const fn online(kind: NetworkKind) -> Self {
        Self {
            is_connected: true,
            is_reachable: Some(true),
            kind,
            is_expensive: matches!(kind, NetworkKind::Cellular),
        }
    }

    /// No link.
    #[must_use]
    pub const fn offline() -> Self {
        Self {
            is_connected: false,
            is_reachable: Some(false),
            kind: NetworkKind::None,
            is_expensive: false,
        }
    }

    /// Mark the link as metered or not.
    #[must_use]
    pub const fn with_expensive(mut self, expensive: bool) -> Self {
        self.is_expensive = expensive;
        self
    }

    /// Whether `other` differs in a field subscribers care about
    /// (kind, connectivity, reachability).
    #[must_use]
    pub fn differs_observably(&self, other: &Self) -> bool {
        self.kind != other.kind
            || self.is_connected != other.is_connected
            || self.is_reachable != other.is_reachable
    }

    /// Coarse quality classification.
    #[must_use]
    pub const fn quality(&self) -> NetworkQuality {
        if !self.is_connected || matches!(self.is_reachable, Some(false)) {
            NetworkQuality::Offline
        } else if self.is_expensive || matches!(self.kind, NetworkKind::Cellular) {
            NetworkQuality::Constrained
        } else {
            NetworkQuality::Good
        }
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Coarse link quality for gating bandwidth-heavy work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkQuality {
    /// No usable connectivity.
    Offline,
    /// Metered or mobile link.
    Constrained,
    /// Unmetered link.
    Good,
}

type StatusCallback = Arc<dyn Fn(&NetworkStatus) + Send + Sync>;

/// Handle returned by [`NetworkObserver::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkSubscription(u64);

/// Process-wide connectivity observer.
pub struct NetworkObserver {
    tx: watch::Sender<NetworkStatus>,
    listeners: RwLock<Vec<(u64, StatusCallback)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for NetworkObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkObserver")
            .field("current", &*self.tx.borrow())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl Default for NetworkObserver {
    fn default() -> Self {
        Self::new(NetworkStatus::unknown())
    }
}

impl NetworkObserver {
    /// Create an observer with an initial status.
    #[must_use]
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Current status.
    #[must_use]
    pub fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    /// Current quality classification.
    #[must_use]
    pub fn quality(&self) -> NetworkQuality {
        self.current().quality()
    }

    /// Report a new status from the platform.
    ///
    /// Returns `true` if subscribers were notified. A report that only
    /// changes `is_expensive` is stored but not announced.
    pub fn update(&self, status: NetworkStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            let observable = current.differs_observably(&status);
            *current = status;
            observable
        });

        if changed {
            debug!(
                connected = status.is_connected,
                reachable = ?status.is_reachable,
                kind = ?status.kind,
                "network status changed"
            );
            let listeners: Vec<(u64, StatusCallback)> = self.listeners.read().clone();
            for (id, callback) in listeners {
                if catch_unwind(AssertUnwindSafe(|| callback(&status))).is_err() {
                    error!(subscription = id, "network listener panicked");
                }
            }
        }

        changed
    }

    /// Be called back on every observable change.
    pub fn subscribe<F>(&self, callback: F) -> NetworkSubscription
    where
        F: Fn(&NetworkStatus) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(callback)));
        NetworkSubscription(id)
    }

    /// Stop a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, subscription: NetworkSubscription) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != subscription.0);
        listeners.len() != before
    }

    /// A receiver that wakes on every observable change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    /// Wait until the device is connected.
    ///
    /// Resolves immediately when already connected.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectivityTimeout`] if `timeout` elapses first.
    pub async fn wait_for_connectivity(&self, timeout: Duration) -> Result<NetworkStatus, LinkError> {
        let mut rx = self.tx.subscribe();
        let wait = async {
            rx.wait_for(|status| status.is_connected)
                .await
                .map(|status| *status)
                .map_err(|_| LinkError::ChannelClosed)
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| LinkError::ConnectivityTimeout(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_default_status_is_optimistic() {
        let observer = NetworkObserver::default();
        let status = observer.current();
        assert!(status.is_connected);
        assert_eq!(status.is_reachable, None);
        assert_eq!(status.kind, NetworkKind::Unknown);
    }

    #[test]
    fn test_quality_classification() {
        assert_eq!(NetworkStatus::offline().quality(), NetworkQuality::Offline);
        assert_eq!(
            NetworkStatus::online(NetworkKind::Cellular).quality(),
            NetworkQuality::Constrained
        );
        assert_eq!(
            NetworkStatus::online(NetworkKind::Wifi).quality(),
            NetworkQuality::Good
        );
        assert_eq!(
            NetworkStatus::online(NetworkKind::Wifi)
                .with_expensive(true)
                .quality(),
            NetworkQuality::Constrained
        );
        let unreachable = NetworkStatus {
            is_reachable: Some(false),
            ..NetworkStatus::online(NetworkKind::Wifi)
        };
        assert_eq!(unreachable.quality(), NetworkQuality::Offline);
    }

    #[test]
    fn test_update_suppresses_duplicates() {
        let observer = NetworkObserver::new(NetworkStatus::online(NetworkKind::Wifi));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        observer.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!observer.update(NetworkStatus::online(NetworkKind::Wifi)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(observer.update(NetworkStatus::offline()));
        assert!(!observer.update(NetworkStatus::offline()));
        assert!(observer.update(NetworkStatus::online(NetworkKind::Cellular)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_expensive_flag_alone_is_stored_silently() {
        let observer = NetworkObserver::new(NetworkStatus::online(NetworkKind::Wifi));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        observer.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let metered = NetworkStatus::online(NetworkKind::Wifi).with_expensive(true);
        assert!(!observer.update(metered));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(observer.current().is_expensive);
    }

    #[test]
    fn test_unsubscribe() {
        let observer = NetworkObserver::new(NetworkStatus::online(NetworkKind::Wifi));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let sub = observer.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(observer.unsubscribe(sub));
        assert!(!observer.unsubscribe(sub));

        observer.update(NetworkStatus::offline());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let observer = NetworkObserver::new(NetworkStatus::online(NetworkKind::Wifi));
        let calls = Arc::new(AtomicUsize::new(0));
        observer.subscribe(|_| panic!("listener bug"));
        let calls_clone = Arc::clone(&calls);
        observer.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        observer.update(NetworkStatus::offline());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_for_connectivity_immediate() {
        let observer = NetworkObserver::new(NetworkStatus::online(NetworkKind::Ethernet));
        let status = observer
            .wait_for_connectivity(Duration::from_secs(1))
            .await
            .expect("already connected");
        assert_eq!(status.kind, NetworkKind::Ethernet);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connectivity_resolves_on_change() {
        let observer = Arc::new(NetworkObserver::new(NetworkStatus::offline()));
        let waiter = {
            let observer = Arc::clone(&observer);
            tokio::spawn(async move { observer.wait_for_connectivity(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        observer.update(NetworkStatus::online(NetworkKind::Wifi));

        let status = waiter.await.expect("join").expect("should resolve");
        assert!(status.is_connected);
        assert_eq!(status.kind, NetworkKind::Wifi);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connectivity_times_out() {
        let observer = NetworkObserver::new(NetworkStatus::offline());
        let result = observer.wait_for_connectivity(Duration::from_secs(3)).await;
        assert!(matches!(result, Err(LinkError::ConnectivityTimeout(d)) if d == Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_watch_sees_changes() {
        let observer = NetworkObserver::new(NetworkStatus::online(NetworkKind::Wifi));
        let mut rx = observer.watch();
        observer.update(NetworkStatus::offline());
        rx.changed().await.expect("sender alive");
        assert!(!rx.borrow_and_update().is_connected);
    }
}
