//! Background media prefetch around the visible window.
//!
//! Fast links prefetch generously in both directions; slow links fetch only
//! a couple of items ahead of the viewer, nearest first and one at a time;
//! offline nothing is scheduled. All downloads share one semaphore so
//! prefetch never starves user-initiated requests.

use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::api::MediaSource;
use crate::model::{FeedItem, NetworkQuality};
use crate::network::NetworkMonitor;
use crate::storage::{CacheStore, MediaOutcome};
use crate::util::validate_media_url;

#[derive(Debug, Clone, Copy)]
pub struct PrefetchConfig {
    /// Items prefetched on each side of the window on a fast link
    pub lookahead_fast: usize,
    /// Items prefetched after the window on a slow link
    pub lookahead_slow: usize,
    pub concurrency: usize,
    /// How long a failed URL is left alone
    pub failure_cooldown: Duration,
    pub failure_memory: usize,
    pub allow_private_hosts: bool,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            lookahead_fast: 8,
            lookahead_slow: 2,
            concurrency: 3,
            failure_cooldown: Duration::from_secs(300),
            failure_memory: 256,
            allow_private_hosts: false,
        }
    }
}

/// Indices of items worth prefetching for `visible` in a feed of `len`
/// items, highest priority first.
pub fn plan(
    quality: NetworkQuality,
    visible: Range<usize>,
    len: usize,
    config: &PrefetchConfig,
) -> Vec<usize> {
    let start = visible.start.min(len);
    let end = visible.end.clamp(start, len);

    match quality {
        NetworkQuality::Offline => Vec::new(),
        NetworkQuality::OnlineSlow => (end..(end + config.lookahead_slow).min(len)).collect(),
        NetworkQuality::OnlineFast => {
            let ahead = end..(end + config.lookahead_fast).min(len);
            let behind = (start.saturating_sub(config.lookahead_fast)..start).rev();
            ahead.chain(behind).collect()
        }
    }
}

/// Handles to the downloads started by one `schedule_window` call.
#[derive(Debug)]
pub struct PrefetchBatch {
    /// URLs handed to download tasks, in priority order
    pub scheduled: Vec<String>,
    handles: Vec<JoinHandle<Vec<(String, MediaOutcome)>>>,
}

impl PrefetchBatch {
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Wait for every download in the batch.
    pub async fn join(self) -> Vec<(String, MediaOutcome)> {
        let mut outcomes = Vec::with_capacity(self.scheduled.len());
        for handle in self.handles {
            match handle.await {
                Ok(batch) => outcomes.extend(batch),
                Err(e) => tracing::warn!(error = %e, "Prefetch task panicked"),
            }
        }
        outcomes
    }
}

pub struct PrefetchManager<S: MediaSource> {
    store: CacheStore,
    source: Arc<S>,
    monitor: NetworkMonitor,
    config: PrefetchConfig,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    failed: Arc<Mutex<LruCache<String, Instant>>>,
}

impl<S: MediaSource> PrefetchManager<S> {
    pub fn new(
        store: CacheStore,
        source: Arc<S>,
        monitor: NetworkMonitor,
        config: PrefetchConfig,
    ) -> Self {
        let memory = NonZeroUsize::new(config.failure_memory.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            source,
            monitor,
            config,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            failed: Arc::new(Mutex::new(LruCache::new(memory))),
        }
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    /// Schedule media downloads for the items around `visible`.
    ///
    /// Re-scheduling is cheap: URLs already cached, in flight, or recently
    /// failed are skipped.
    pub fn schedule_window(&self, visible: Range<usize>, items: &[FeedItem]) -> PrefetchBatch {
        let quality = self.monitor.current();
        let indices = plan(quality, visible, items.len(), &self.config);

        let mut urls: Vec<String> = Vec::new();
        for url in indices.iter().flat_map(|&i| items[i].prefetchable_media()) {
            if urls.iter().any(|u| u == url) {
                continue;
            }
            if let Err(e) = validate_media_url(url, self.config.allow_private_hosts) {
                tracing::debug!(url = %url, error = %e, "Skipping media URL");
                continue;
            }
            if self.recently_failed(url) || !self.claim(url) {
                continue;
            }
            urls.push(url.to_string());
        }

        if urls.is_empty() {
            return PrefetchBatch {
                scheduled: urls,
                handles: Vec::new(),
            };
        }

        tracing::debug!(quality = %quality, count = urls.len(), "Scheduling media prefetch");

        let handles = if quality == NetworkQuality::OnlineSlow {
            // One at a time, nearest first
            let worker = self.worker();
            let queue = urls.clone();
            vec![tokio::spawn(async move {
                let mut outcomes = Vec::with_capacity(queue.len());
                for url in queue {
                    let outcome = worker.fetch(&url).await;
                    outcomes.push((url, outcome));
                }
                outcomes
            })]
        } else {
            urls.iter()
                .map(|url| {
                    let worker = self.worker();
                    let url = url.clone();
                    tokio::spawn(async move {
                        let outcome = worker.fetch(&url).await;
                        vec![(url, outcome)]
                    })
                })
                .collect()
        };

        PrefetchBatch {
            scheduled: urls,
            handles,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn claim(&self, url: &str) -> bool {
        self.in_flight
            .lock()
            .map(|mut set| set.insert(url.to_string()))
            .unwrap_or(false)
    }

    fn recently_failed(&self, url: &str) -> bool {
        let Ok(mut failed) = self.failed.lock() else {
            return false;
        };
        let expired = match failed.get(url) {
            Some(at) => at.elapsed() >= self.config.failure_cooldown,
            None => return false,
        };
        if expired {
            failed.pop(url);
        }
        !expired
    }

    fn worker(&self) -> Worker<S> {
        Worker {
            store: self.store.clone(),
            source: self.source.clone(),
            permits: self.permits.clone(),
            in_flight: self.in_flight.clone(),
            failed: self.failed.clone(),
        }
    }
}

struct Worker<S> {
    store: CacheStore,
    source: Arc<S>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    failed: Arc<Mutex<LruCache<String, Instant>>>,
}

impl<S: MediaSource> Worker<S> {
    async fn fetch(&self, url: &str) -> MediaOutcome {
        let outcome = match self.permits.acquire().await {
            Ok(_permit) => match self.store.prefetch_media(self.source.as_ref(), url).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Could not store prefetched media");
                    MediaOutcome::Failed(e.to_string())
                }
            },
            Err(_) => MediaOutcome::Failed("prefetch shut down".to_string()),
        };

        if let MediaOutcome::Failed(_) = outcome {
            if let Ok(mut failed) = self.failed.lock() {
                failed.put(url.to_string(), Instant::now());
            }
        }
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(url);
        }
        outcome
    }
}
