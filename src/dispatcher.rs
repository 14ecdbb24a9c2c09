//! Bounded-pool dispatcher with lifecycle accounting.
//!
//! The dispatcher pulls requests from a pluggable queue discipline
//! ([`FetchQueue`]), keeps at most `pool_size` transfers in flight, and
//! runs the fixed completion chain for each one: request hooks first, then
//! the fetcher-level [`FetchEvents`], then accounting. A periodic growth
//! timer lets the queue discipline pull staged work in when the pool is
//! under-utilized, and a single wake timer re-arms dispatch when no domain
//! is ready yet.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, Result};
use crate::request::{Completion, FetchRequest};
use crate::servicer::{connect_target, Servicer};
use crate::transport::Transport;

/// Configuration for the fetch engine.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Maximum number of requests in flight at once.
    pub pool_size: usize,

    /// Fixed inter-request delay per domain, used when the robots policy
    /// reports none. Zeroed for fully cached transfers.
    pub delay: Duration,

    /// Period of the growth timer; growth fires only after this much
    /// push-free idleness.
    pub grow_interval: Duration,

    /// User-agent presented to servers and to the robots policy.
    pub user_agent: String,

    /// Stop the run loop once in-flight and remaining both reach zero.
    pub stop_when_done: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            delay: Duration::from_secs(2),
            grow_interval: Duration::from_secs(5),
            user_agent: "stagger/0.1".to_string(),
            stop_when_done: false,
        }
    }
}

/// Snapshot of the dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterState {
    /// Requests whose connect was submitted and whose done hook has not
    /// yet run.
    pub in_flight: usize,
    /// Requests that finished, successfully or not.
    pub processed: usize,
    /// Accepted requests not yet finished.
    pub remaining: usize,
}

/// The dispatcher counters, shared with the queue discipline so that
/// acceptance can be accounted where it happens.
#[derive(Default)]
pub struct Counters {
    inner: Mutex<CounterState>,
}

impl Counters {
    pub fn snapshot(&self) -> CounterState {
        *self.inner.lock()
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, CounterState> {
        self.inner.lock()
    }

    pub(crate) fn add_remaining(&self, n: usize) {
        self.inner.lock().remaining += n;
    }
}

/// What a queue discipline's `pop` produced.
#[derive(Debug)]
pub enum Pop {
    /// A request ready to dispatch now.
    Ready(FetchRequest),
    /// Nothing ready yet; the earliest candidate becomes ready after this
    /// long. The dispatcher arms a single wake timer.
    Wait(Duration),
    /// Nothing queued at all.
    Empty,
}

/// Queue discipline feeding the dispatcher.
///
/// Implementations account accepted requests in the shared [`Counters`]
/// (`remaining`) from `push`, so that staged work pulled in by `grow` is
/// counted exactly once.
pub trait FetchQueue: Send + Sync {
    /// Offer a request; returns how many were accepted (0 or 1).
    fn push(&self, req: FetchRequest) -> usize;

    /// Offer several requests; returns how many were accepted.
    fn extend(&self, reqs: Vec<FetchRequest>) -> usize {
        reqs.into_iter().map(|r| self.push(r)).sum()
    }

    /// Produce the next dispatchable request, or say why there is none.
    fn pop(&self) -> Pop;

    /// Pull up to `upto` staged requests in; returns how many arrived.
    fn grow(&self, _upto: usize) -> usize {
        0
    }

    /// A request from this queue finished; re-arm whatever schedule state
    /// it held.
    fn on_done(&self, _req: &FetchRequest) {}
}

/// Plain FIFO discipline with no politeness, the simplest thing the
/// dispatcher can run against.
pub struct FifoQueue {
    queue: Mutex<std::collections::VecDeque<FetchRequest>>,
    counters: Arc<Counters>,
}

impl FifoQueue {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            queue: Mutex::new(std::collections::VecDeque::new()),
            counters,
        }
    }
}

impl FetchQueue for FifoQueue {
    fn push(&self, req: FetchRequest) -> usize {
        self.queue.lock().push_back(req);
        self.counters.add_remaining(1);
        1
    }

    fn pop(&self) -> Pop {
        match self.queue.lock().pop_front() {
            Some(req) => Pop::Ready(req),
            None => Pop::Empty,
        }
    }
}

/// Fetcher-level lifecycle events, run after the request's own hooks.
pub trait FetchEvents: Send + Sync {
    fn on_success(&self, _req: &FetchRequest) {}
    fn on_error(&self, _req: &FetchRequest, _error: &FetchError) {}
    fn on_done(&self, _req: &FetchRequest) {}
}

/// Events implementation that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvents;

impl FetchEvents for NoEvents {}

trait HandleOps: Send + Sync {
    fn push(&self, req: FetchRequest) -> usize;
    fn extend(&self, reqs: Vec<FetchRequest>) -> usize;
    fn counters(&self) -> CounterState;
    fn shutdown(&self);
}

/// Cheap handle onto a running [`Fetcher`], passed to request hooks so
/// they can re-push work (retry policies live in user hooks, not in the
/// core) or stop the engine.
#[derive(Clone)]
pub struct FetcherHandle {
    ops: Arc<dyn HandleOps>,
}

impl FetcherHandle {
    pub fn push(&self, req: FetchRequest) -> usize {
        self.ops.push(req)
    }

    pub fn extend(&self, reqs: Vec<FetchRequest>) -> usize {
        self.ops.extend(reqs)
    }

    pub fn counters(&self) -> CounterState {
        self.ops.counters()
    }

    pub fn shutdown(&self) {
        self.ops.shutdown()
    }
}

/// The fetch engine: bounded pool over a queue discipline and a transport.
pub struct Fetcher<Q: FetchQueue, T: Transport> {
    queue: Arc<Q>,
    transport: Arc<T>,
    events: Arc<dyn FetchEvents>,
    config: FetcherConfig,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    wake: Mutex<Option<JoinHandle<()>>>,
    grow_deadline: Mutex<tokio::time::Instant>,
}

impl<Q: FetchQueue + 'static, T: Transport + 'static> Fetcher<Q, T> {
    pub fn new(queue: Arc<Q>, transport: Arc<T>, config: FetcherConfig, counters: Arc<Counters>) -> Self {
        let grow_deadline = tokio::time::Instant::now() + config.grow_interval;
        Self {
            queue,
            transport,
            events: Arc::new(NoEvents),
            config,
            counters,
            cancel: CancellationToken::new(),
            wake: Mutex::new(None),
            grow_deadline: Mutex::new(grow_deadline),
        }
    }

    /// Replace the fetcher-level lifecycle events.
    pub fn with_events(mut self, events: Arc<dyn FetchEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    pub fn counters(&self) -> CounterState {
        self.counters.snapshot()
    }

    /// Accepted requests not yet finished.
    pub fn remaining(&self) -> usize {
        self.counters.snapshot().remaining
    }

    /// A handle suitable for request hooks.
    pub fn handle(self: &Arc<Self>) -> FetcherHandle {
        FetcherHandle {
            ops: Arc::new(self.clone()),
        }
    }

    /// Offer one request. Returns how many were accepted (robots policy
    /// may reject). Defers the growth timer and serves the pool.
    pub fn push(self: &Arc<Self>, req: FetchRequest) -> usize {
        let accepted = self.queue.push(req);
        self.defer_grow();
        if accepted > 0 {
            self.serve_next();
        }
        accepted
    }

    /// Offer several requests; returns how many were accepted.
    pub fn extend(self: &Arc<Self>, reqs: Vec<FetchRequest>) -> usize {
        let accepted = self.queue.extend(reqs);
        self.defer_grow();
        if accepted > 0 {
            self.serve_next();
        }
        accepted
    }

    /// Run until shutdown (or exhaustion with `stop_when_done`).
    #[tracing::instrument(skip(self))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!(
            pool_size = self.config.pool_size,
            user_agent = %self.config.user_agent,
            "Fetcher starting"
        );

        let grow_task = tokio::spawn({
            let this = self.clone();
            async move { this.grow_loop().await }
        });

        self.serve_next();
        self.cancel.cancelled().await;

        grow_task.abort();
        if let Some(handle) = self.wake.lock().take() {
            handle.abort();
        }
        tracing::info!("Fetcher stopped");
        Ok(())
    }

    /// Spawn `run` onto the current runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.clone().run())
    }

    /// Stop the run loop. In-flight transfers are abandoned with their
    /// tasks when the runtime drops them.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Fill free pool slots from the queue discipline.
    pub fn serve_next(self: &Arc<Self>) {
        loop {
            {
                let mut counters = self.counters.lock();
                if counters.in_flight >= self.config.pool_size {
                    return;
                }
                // Reserve the slot before popping so the pool bound holds
                // across concurrent callers.
                counters.in_flight += 1;
            }
            match self.queue.pop() {
                Pop::Ready(req) => {
                    self.clear_wake();
                    self.dispatch(req);
                }
                Pop::Wait(delay) => {
                    self.counters.lock().in_flight -= 1;
                    self.arm_wake(delay);
                    return;
                }
                Pop::Empty => {
                    self.counters.lock().in_flight -= 1;
                    return;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, req: FetchRequest) {
        if let Err(error) = connect_target(&req) {
            // Nothing to service; drop the request without touching
            // others, handing the queue its schedule state back.
            tracing::error!(url = %req.url, %error, "Unable to request");
            {
                let mut counters = self.counters.lock();
                counters.in_flight -= 1;
                counters.remaining = counters.remaining.saturating_sub(1);
            }
            self.queue.on_done(&req);
            return;
        }

        tracing::debug!(id = %req.id, url = %req.url, "Requesting");
        let this = self.clone();
        let abandoned = req.clone();
        tokio::spawn(async move {
            // Keeps accounting and schedule state sane if a hook panics
            // mid-transaction.
            let guard = scopeguard::guard(this.clone(), |fetcher| {
                {
                    let mut counters = fetcher.counters.lock();
                    counters.in_flight -= 1;
                    counters.remaining = counters.remaining.saturating_sub(1);
                }
                fetcher.queue.on_done(&abandoned);
            });

            let servicer = Servicer::new(this.transport.clone(), this.config.user_agent.clone());
            let (req, completion) = servicer.run(req).await;

            let this = scopeguard::ScopeGuard::into_inner(guard);
            this.finish(req, completion);
        });
    }

    /// Completion chain: request hooks, then events, then accounting, then
    /// schedule re-arm, then another serve pass.
    fn finish(self: &Arc<Self>, req: FetchRequest, completion: Completion) {
        let handle = self.handle();
        let hooks = req.hooks();

        match &completion {
            Completion::Success { status, body } => {
                tracing::info!(url = %req.url, status, elapsed = ?req.elapsed, "Fetched");
                if let Err(e) = hooks.on_success(&req, body, &handle) {
                    tracing::error!(url = %req.url, error = %e, "on_success hook failed");
                }
                self.events.on_success(&req);
            }
            Completion::Error { error } => {
                tracing::warn!(url = %req.url, %error, elapsed = ?req.elapsed, "Fetch failed");
                if let Err(e) = hooks.on_error(&req, error, &handle) {
                    tracing::error!(url = %req.url, error = %e, "on_error hook failed");
                }
                self.events.on_error(&req, error);
            }
        }

        if let Err(e) = hooks.on_done(&req, &completion, &handle) {
            tracing::error!(url = %req.url, error = %e, "on_done hook failed");
        }

        let state = {
            let mut counters = self.counters.lock();
            counters.in_flight -= 1;
            counters.processed += 1;
            counters.remaining = counters.remaining.saturating_sub(1);
            *counters
        };
        tracing::info!(
            processed = state.processed,
            remaining = state.remaining,
            in_flight = state.in_flight,
            "Request finished"
        );

        self.queue.on_done(&req);
        self.events.on_done(&req);

        if self.config.stop_when_done && state.in_flight == 0 && state.remaining == 0 {
            tracing::info!("All requests processed, stopping");
            self.cancel.cancel();
        } else {
            self.serve_next();
        }
    }

    fn arm_wake(self: &Arc<Self>, delay: Duration) {
        let mut wake = self.wake.lock();
        if wake.is_some() {
            return;
        }
        tracing::debug!(wait = ?delay, "No domain ready, arming wake timer");
        let this = self.clone();
        *wake = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            *this.wake.lock() = None;
            this.serve_next();
        }));
    }

    fn clear_wake(&self) {
        if let Some(handle) = self.wake.lock().take() {
            handle.abort();
        }
    }

    fn defer_grow(&self) {
        *self.grow_deadline.lock() = tokio::time::Instant::now() + self.config.grow_interval;
    }

    async fn grow_loop(self: Arc<Self>) {
        loop {
            let deadline = *self.grow_deadline.lock();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    let target = *self.grow_deadline.lock();
                    let now = tokio::time::Instant::now();
                    if now < target {
                        // Deferred by a push while we slept.
                        continue;
                    }
                    let spare = {
                        let counters = self.counters.lock();
                        self.config.pool_size.saturating_sub(counters.in_flight)
                    };
                    let grew = self.queue.grow(spare);
                    if grew > 0 {
                        tracing::debug!(grew, "Growth timer pulled staged requests");
                        self.serve_next();
                    }
                    *self.grow_deadline.lock() = now + self.config.grow_interval;
                }
            }
        }
    }
}

impl<Q: FetchQueue + 'static, T: Transport + 'static> HandleOps for Arc<Fetcher<Q, T>> {
    fn push(&self, req: FetchRequest) -> usize {
        Fetcher::push(self, req)
    }

    fn extend(&self, reqs: Vec<FetchRequest>) -> usize {
        Fetcher::extend(self, reqs)
    }

    fn counters(&self) -> CounterState {
        self.counters.snapshot()
    }

    fn shutdown(&self) {
        Fetcher::shutdown(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LegResponse, MockTransport};

    fn fetcher(
        transport: Arc<MockTransport>,
        config: FetcherConfig,
    ) -> Arc<Fetcher<FifoQueue, MockTransport>> {
        let counters = Arc::new(Counters::default());
        let queue = Arc::new(FifoQueue::new(counters.clone()));
        Arc::new(Fetcher::new(queue, transport, config, counters))
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_push_counts_remaining_and_processes() {
        let transport = Arc::new(MockTransport::new());
        transport.add_response("http://a.example/1", Ok(LegResponse::ok(b"one")));

        let fetcher = fetcher(transport.clone(), FetcherConfig::default());
        assert_eq!(fetcher.push(FetchRequest::new("http://a.example/1").unwrap()), 1);
        assert_eq!(fetcher.remaining(), 1);

        let handle = fetcher.spawn();
        assert!(wait_until(Duration::from_secs(5), || fetcher.counters().processed == 1).await);
        let state = fetcher.counters();
        assert_eq!(state.in_flight, 0);
        assert_eq!(state.remaining, 0);
        fetcher.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pool_bound_is_respected() {
        let transport = Arc::new(MockTransport::new());
        let mut reqs = Vec::new();
        for i in 0..8 {
            let url = format!("http://d{i}.example/page");
            transport.add_response_with_delay(
                &url,
                Ok(LegResponse::ok(b"x")),
                Duration::from_millis(100),
            );
            reqs.push(FetchRequest::new(&url).unwrap());
        }

        let fetcher = fetcher(
            transport.clone(),
            FetcherConfig {
                pool_size: 3,
                ..FetcherConfig::default()
            },
        );
        assert_eq!(fetcher.extend(reqs), 8);

        let handle = fetcher.spawn();
        assert!(wait_until(Duration::from_secs(5), || fetcher.counters().processed == 8).await);
        assert!(transport.max_in_flight() <= 3);
        fetcher.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_done_ends_run() {
        let transport = Arc::new(MockTransport::new());
        transport.add_response("http://a.example/only", Ok(LegResponse::ok(b"x")));

        let fetcher = fetcher(
            transport,
            FetcherConfig {
                stop_when_done: true,
                ..FetcherConfig::default()
            },
        );
        fetcher.push(FetchRequest::new("http://a.example/only").unwrap());

        let run = fetcher.spawn();
        let finished = tokio::time::timeout(Duration::from_secs(5), run).await;
        assert!(finished.is_ok(), "run loop should stop once drained");
    }

    #[tokio::test]
    async fn test_transport_failure_counts_as_processed() {
        let transport = Arc::new(MockTransport::new());
        // No scripted response: the mock errors, standing in for a
        // transport failure.
        let fetcher = fetcher(transport, FetcherConfig::default());
        fetcher.push(FetchRequest::new("http://unreachable.example/x").unwrap());

        let handle = fetcher.spawn();
        assert!(wait_until(Duration::from_secs(5), || fetcher.counters().processed == 1).await);
        assert_eq!(fetcher.counters().remaining, 0);
        fetcher.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_scheme_dropped_without_dispatch() {
        let transport = Arc::new(MockTransport::new());
        let fetcher = fetcher(transport.clone(), FetcherConfig::default());
        fetcher.push(FetchRequest::new("ftp://a.example/file").unwrap());

        let handle = fetcher.spawn();
        // The drop path runs synchronously inside serve_next; in-flight
        // must return to zero and nothing reaches the transport.
        assert!(wait_until(Duration::from_secs(2), || {
            let c = fetcher.counters();
            c.in_flight == 0 && c.remaining == 0
        })
        .await);
        assert_eq!(transport.call_count(), 0);
        fetcher.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_hook_repush_via_handle() {
        use crate::request::{FetchHooks, FetchRequest};
        use std::sync::atomic::{AtomicUsize, Ordering};

        // Retries once from on_error, the way a caller-side retry policy
        // would.
        struct RetryOnce {
            attempts: AtomicUsize,
        }

        impl FetchHooks for RetryOnce {
            fn on_error(
                &self,
                req: &FetchRequest,
                _error: &FetchError,
                fetcher: &FetcherHandle,
            ) -> crate::error::Result<()> {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    fetcher.push(req.clone());
                }
                Ok(())
            }
        }

        let transport = Arc::new(MockTransport::new());
        transport.add_response(
            "http://flaky.example/x",
            Err(FetchError::Internal(anyhow::anyhow!("connection reset"))),
        );
        transport.add_response("http://flaky.example/x", Ok(LegResponse::ok(b"ok")));

        let fetcher = fetcher(transport.clone(), FetcherConfig::default());
        let hooks = Arc::new(RetryOnce {
            attempts: AtomicUsize::new(0),
        });
        fetcher.push(
            FetchRequest::new("http://flaky.example/x")
                .unwrap()
                .with_hooks(hooks.clone()),
        );

        let handle = fetcher.spawn();
        assert!(wait_until(Duration::from_secs(5), || fetcher.counters().processed == 2).await);
        assert_eq!(hooks.attempts.load(Ordering::SeqCst), 1);
        fetcher.shutdown();
        handle.await.unwrap().unwrap();
    }
}
