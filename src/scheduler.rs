//! Per-domain polite scheduling over a persistent queue store.
//!
//! Requests are partitioned into one FIFO bucket per hostname, and a
//! priority queue scores each non-empty bucket with the wall-clock time at
//! which that domain may next be polled. `pop` only yields a request whose
//! domain is ready; when the earliest domain is still in the future it
//! tells the dispatcher how long to wait. Admission goes through the
//! robots policy, so disallowed URLs never reach a bucket.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;

use crate::dispatcher::{Counters, FetchQueue, Fetcher, FetcherConfig, Pop};
use crate::error::Result;
use crate::request::FetchRequest;
use crate::robots::RobotsPolicy;
use crate::store::QueueStore;
use crate::transport::Transport;

/// Priority queue of domain readiness times.
pub const PLD_QUEUE: &str = "plds";
/// Staging FIFO shared with external producers.
pub const STAGING_QUEUE: &str = "request";
/// Prefix of per-domain bucket names.
pub const DOMAIN_PREFIX: &str = "domain:";

/// How many staged requests one `pop` may pull in.
const GROW_BATCH: usize = 10_000;

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Domain-aware queue discipline for the dispatcher.
pub struct PoliteScheduler<S: QueueStore> {
    store: Arc<S>,
    robots: Arc<dyn RobotsPolicy>,
    delay: Duration,
    pool_size: usize,
    user_agent: String,
    counters: Arc<Counters>,
    /// Domains with a transfer in flight from this process. A domain's
    /// priority entry is its dispatch token: `pop` takes it, and only
    /// `on_done` may hand it back, so one domain never has two transfers
    /// running at once.
    in_flight_domains: DashSet<String>,
}

impl<S: QueueStore> PoliteScheduler<S> {
    /// Build a scheduler over `store`, resuming any domain buckets left by
    /// a prior run: every `domain:*` key is scored immediately ready.
    pub fn new(
        store: Arc<S>,
        robots: Arc<dyn RobotsPolicy>,
        config: &FetcherConfig,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        for key in store.scan(DOMAIN_PREFIX)? {
            tracing::debug!(domain = %key, "Resuming persisted bucket");
            store.priority_push(PLD_QUEUE, &key, 0.0)?;
        }
        Ok(Self {
            store,
            robots,
            delay: config.delay,
            pool_size: config.pool_size,
            user_agent: config.user_agent.clone(),
            counters,
            in_flight_domains: DashSet::new(),
        })
    }

    /// Delay before this domain may be polled again: nothing for a fully
    /// cached transfer, otherwise whatever robots.txt asks for, otherwise
    /// the configured fixed delay.
    fn crawl_delay(&self, req: &FetchRequest) -> Duration {
        if req.cached {
            return Duration::ZERO;
        }
        self.robots
            .crawl_delay(&req.url, &self.user_agent)
            .unwrap_or(self.delay)
    }
}

impl<S: QueueStore> FetchQueue for PoliteScheduler<S> {
    fn push(&self, req: FetchRequest) -> usize {
        if !req.exempt && !self.robots.allowed(&req.url, &self.user_agent) {
            tracing::debug!(url = %req.url, "Request blocked by robots.txt");
            return 0;
        }
        let key = req.domain_key();
        // Score the domain ready now, unless its token is held by an
        // in-flight transfer or a pending readiness is already on the
        // books.
        if self.store.fifo_len(&key).unwrap_or(0) == 0 && !self.in_flight_domains.contains(&key) {
            if let Err(e) = self.store.priority_push_if_absent(PLD_QUEUE, &key, now_secs()) {
                tracing::error!(domain = %key, error = %e, "Failed to score domain");
                return 0;
            }
        }
        if let Err(e) = self.store.fifo_push(&key, req) {
            tracing::error!(domain = %key, error = %e, "Failed to enqueue request");
            return 0;
        }
        self.counters.add_remaining(1);
        1
    }

    fn pop(&self) -> Pop {
        if self.store.priority_len(PLD_QUEUE).unwrap_or(0) < self.pool_size {
            self.grow(GROW_BATCH);
        }
        let now = now_secs();
        loop {
            let (_, ready_at) = match self.store.priority_peek(PLD_QUEUE) {
                Ok(Some(entry)) => entry,
                Ok(None) => return Pop::Empty,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to peek domain queue");
                    return Pop::Empty;
                }
            };
            if ready_at > now {
                return Pop::Wait(Duration::from_secs_f64(ready_at - now));
            }
            let key = match self.store.priority_pop(PLD_QUEUE) {
                Ok(Some(key)) => key,
                Ok(None) => return Pop::Empty,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to pop domain queue");
                    return Pop::Empty;
                }
            };
            match self.store.fifo_pop(&key) {
                Ok(Some(req)) => {
                    self.in_flight_domains.insert(key);
                    return Pop::Ready(req);
                }
                // Bucket drained (e.g. by an external consumer of the
                // shared store): drop the entry and try the next domain.
                Ok(None) => {
                    tracing::debug!(domain = %key, "Empty bucket, dropping domain entry");
                    continue;
                }
                Err(e) => {
                    tracing::error!(domain = %key, error = %e, "Failed to pop bucket");
                    continue;
                }
            }
        }
    }

    /// Pull staged requests into domain buckets, robots checks included.
    fn grow(&self, upto: usize) -> usize {
        let mut count = 0;
        while count < upto {
            match self.store.fifo_pop(STAGING_QUEUE) {
                Ok(Some(req)) => count += self.push(req),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to pop staging queue");
                    break;
                }
            }
        }
        count
    }

    /// Return the domain's dispatch token, scored for its next poll.
    fn on_done(&self, req: &FetchRequest) {
        let key = req.domain_key();
        self.in_flight_domains.remove(&key);
        let ready_at = now_secs() + self.crawl_delay(req).as_secs_f64();
        if let Err(e) = self.store.priority_push(PLD_QUEUE, &key, ready_at) {
            tracing::error!(domain = %key, error = %e, "Failed to re-score domain");
        }
    }
}

impl<S: QueueStore + 'static, T: Transport + 'static> Fetcher<PoliteScheduler<S>, T> {
    /// Wire a polite scheduler over `store` into a fetch engine.
    pub fn polite(
        store: Arc<S>,
        robots: Arc<dyn RobotsPolicy>,
        transport: Arc<T>,
        config: FetcherConfig,
    ) -> Result<Self> {
        let counters = Arc::new(Counters::default());
        let scheduler = Arc::new(PoliteScheduler::new(store, robots, &config, counters.clone())?);
        Ok(Fetcher::new(scheduler, transport, config, counters))
    }
}
