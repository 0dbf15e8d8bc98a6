//! Heartbeat/keepalive mechanism.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Whether to probe at all.
    pub enabled: bool,
    /// Interval between probes.
    #[serde(rename = "interval_ms", with = "crate::config::duration_ms")]
    pub interval: Duration,
    /// Consecutive unanswered probes before the connection is considered dead.
    pub max_missed_probes: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            max_missed_probes: 1,
        }
    }
}

impl HeartbeatConfig {
    /// Heartbeats turned off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// What the heartbeat task asks of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatSignal {
    /// Send a ping now.
    Probe {
        /// Monitor that raised the signal.
        generation: u64,
    },
    /// Too many probes went unanswered.
    Dead {
        /// Monitor that raised the signal.
        generation: u64,
        /// Consecutive unanswered probes.
        missed: u32,
    },
}

impl HeartbeatSignal {
    pub(crate) const fn generation(self) -> u64 {
        match self {
            Self::Probe { generation } | Self::Dead { generation, .. } => generation,
        }
    }
}

/// Handle for one running heartbeat monitor.
///
/// Dropping the handle stops the monitor.
#[derive(Debug)]
pub(crate) struct HeartbeatHandle {
    generation: u64,
    awaiting_pong: Arc<AtomicBool>,
    missed: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Start a monitor; the first probe goes out one interval from now.
    pub(crate) fn start(
        config: &HeartbeatConfig,
        generation: u64,
        tx: mpsc::UnboundedSender<HeartbeatSignal>,
    ) -> Self {
        let awaiting_pong = Arc::new(AtomicBool::new(false));
        let missed = Arc::new(AtomicU32::new(0));
        let interval = config.interval;
        let max_missed = config.max_missed_probes.max(1);

        let task = {
            let awaiting_pong = Arc::clone(&awaiting_pong);
            let missed = Arc::clone(&missed);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    ticker.tick().await;

                    if awaiting_pong.swap(true, Ordering::SeqCst) {
                        let missed_now = missed.fetch_add(1, Ordering::SeqCst) + 1;
                        if missed_now >= max_missed {
                            let _ = tx.send(HeartbeatSignal::Dead {
                                generation,
                                missed: missed_now,
                            });
                            break;
                        }
                    }

                    if tx.send(HeartbeatSignal::Probe { generation }).is_err() {
                        break;
                    }
                }
            })
        };

        Self {
            generation,
            awaiting_pong,
            missed,
            task,
        }
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    /// Consecutive unanswered probes so far.
    pub(crate) fn missed_probes(&self) -> u32 {
        self.missed.load(Ordering::SeqCst)
    }

    /// Reset the missed counter (call when a pong arrives).
    pub(crate) fn record_pong(&self) {
        self.awaiting_pong.store(false, Ordering::SeqCst);
        self.missed.store(0, Ordering::SeqCst);
    }

    /// Stop the monitor.
    pub(crate) fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(interval_secs: u64, max_missed_probes: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            enabled: true,
            interval: Duration::from_secs(interval_secs),
            max_missed_probes,
        }
    }

    #[test]
    fn test_heartbeat_config_default() {
        let config = HeartbeatConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.max_missed_probes, 1);
        assert!(!HeartbeatConfig::disabled().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_probe_after_one_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let _handle = HeartbeatHandle::start(&config(10, 3), 7, tx);

        let signal = rx.recv().await.expect("probe");
        assert_eq!(signal, HeartbeatSignal::Probe { generation: 7 });
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probes_declare_dead() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = HeartbeatHandle::start(&config(10, 2), 1, tx);

        assert!(matches!(rx.recv().await, Some(HeartbeatSignal::Probe { .. })));
        assert!(matches!(rx.recv().await, Some(HeartbeatSignal::Probe { .. })));
        assert_eq!(handle.missed_probes(), 1);
        assert_eq!(
            rx.recv().await,
            Some(HeartbeatSignal::Dead {
                generation: 1,
                missed: 2
            })
        );
        // The task ends after declaring the connection dead.
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_monitor_alive() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = HeartbeatHandle::start(&config(10, 1), 3, tx);

        for _ in 0..5 {
            let signal = rx.recv().await.expect("signal");
            assert_eq!(signal, HeartbeatSignal::Probe { generation: 3 });
            handle.record_pong();
        }
        assert_eq!(handle.missed_probes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_silences_monitor() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = HeartbeatHandle::start(&config(10, 1), 1, tx);
        handle.stop();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_monitor() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(HeartbeatHandle::start(&config(10, 1), 1, tx));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_signal_generation() {
        assert_eq!(HeartbeatSignal::Probe { generation: 4 }.generation(), 4);
        assert_eq!(
            HeartbeatSignal::Dead {
                generation: 9,
                missed: 1
            }
            .generation(),
            9
        );
    }
}
