use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Prober;
use crate::model::NetworkQuality;

#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    pub interval: Duration,
    /// A probe still running after this long counts as failed
    pub timeout: Duration,
    /// Round trips at or under this grade the link as fast
    pub fast_threshold: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            fast_threshold: Duration::from_millis(400),
        }
    }
}

struct Inner {
    quality: watch::Sender<NetworkQuality>,
    online: AtomicBool,
    probe_now: Notify,
}

/// Process-wide connection quality reading.
///
/// Connectivity transitions come in through [`NetworkMonitor::set_connectivity`];
/// probing refines an online link into slow or fast. Consumers read
/// [`NetworkMonitor::current`] or hold a [`watch::Receiver`] from
/// [`NetworkMonitor::subscribe`]. Clones share state.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Inner>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let initial = if initially_online {
            NetworkQuality::OnlineSlow
        } else {
            NetworkQuality::Offline
        };
        let (quality, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                quality,
                online: AtomicBool::new(initially_online),
                probe_now: Notify::new(),
            }),
        }
    }

    pub fn current(&self) -> NetworkQuality {
        *self.inner.quality.borrow()
    }

    /// Receiver that observes every quality change. Dropping it unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<NetworkQuality> {
        self.inner.quality.subscribe()
    }

    /// Feed a connectivity signal from the platform.
    ///
    /// Going offline is published at once. Coming online publishes
    /// `OnlineSlow` and asks the probe task for an immediate measurement.
    pub fn set_connectivity(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if online {
            self.publish(|q| {
                if *q == NetworkQuality::Offline {
                    *q = NetworkQuality::OnlineSlow;
                }
            });
            if !was_online {
                self.inner.probe_now.notify_one();
            }
        } else {
            self.publish(|q| *q = NetworkQuality::Offline);
        }
    }

    /// Grade an online link from a probe round trip. `None` means the probe
    /// failed or timed out. Ignored while offline.
    pub fn record_probe(&self, round_trip: Option<Duration>, fast_threshold: Duration) {
        if !self.inner.online.load(Ordering::SeqCst) {
            return;
        }
        let graded = match round_trip {
            Some(rtt) if rtt <= fast_threshold => NetworkQuality::OnlineFast,
            _ => NetworkQuality::OnlineSlow,
        };
        self.publish(|q| *q = graded);
    }

    /// Run one probe and publish its grade.
    pub async fn probe_once<P: Prober>(&self, prober: &P, config: &ProbeConfig) -> NetworkQuality {
        if !self.inner.online.load(Ordering::SeqCst) {
            return NetworkQuality::Offline;
        }

        let started = Instant::now();
        let round_trip = match tokio::time::timeout(config.timeout, prober.probe()).await {
            Ok(Ok(())) => Some(started.elapsed()),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Network probe failed");
                None
            }
            Err(_) => {
                tracing::debug!(timeout_ms = config.timeout.as_millis() as u64, "Network probe timed out");
                None
            }
        };

        self.record_probe(round_trip, config.fast_threshold);
        self.current()
    }

    /// Probe every `config.interval` (and right after coming online) until
    /// the returned handle is cancelled or dropped.
    pub fn spawn_probing<P: Prober>(&self, prober: Arc<P>, config: ProbeConfig) -> ProbeHandle {
        let token = CancellationToken::new();
        let monitor = self.clone();
        let cancel = token.clone();

        let task = tokio::spawn(async move {
            loop {
                monitor.probe_once(prober.as_ref(), &config).await;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.interval) => {}
                    _ = monitor.inner.probe_now.notified() => {}
                }
            }
            tracing::debug!("Network probing stopped");
        });

        ProbeHandle {
            token,
            task: Some(task),
        }
    }

    fn publish(&self, modify: impl FnOnce(&mut NetworkQuality)) {
        let mut previous = None;
        self.inner.quality.send_if_modified(|q| {
            let before = *q;
            modify(q);
            if *q != before {
                previous = Some(before);
                true
            } else {
                false
            }
        });
        if let Some(from) = previous {
            tracing::info!(from = %from, to = %self.current(), "Network quality changed");
        }
    }
}

/// Owner of a spawned probe loop. Dropping it stops probing.
pub struct ProbeHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ProbeHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
