//! Request object and its hook contract.
//!
//! A [`FetchRequest`] bundles everything needed to retrieve one URL plus a
//! set of user-overridable event hooks. Hooks fire in a fixed order over the
//! life of a transfer: `on_url` (once per leg, including the initial URL),
//! then `on_headers`, then `on_status`, then either `on_success` or
//! `on_error`, then `on_done`. A hook that returns an error is logged and
//! suppressed, with one exception: the distinguished preemption error built
//! by [`preempt`], which cancels the transfer cleanly.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::dispatcher::FetcherHandle;
use crate::error::{FetchError, Result};

/// Unique identifier for a request, used for log correlation.
pub type RequestId = Uuid;

/// Build the distinguished user-preemption error.
///
/// Returning this from `on_url`, `on_headers`, or `on_status` cancels the
/// transfer: the servicer tears the connection down quietly and reports a
/// single `on_error` with this as the cause.
pub fn preempt(reason: impl Into<String>) -> FetchError {
    FetchError::Preempted(reason.into())
}

/// How a transfer ended, delivered to `on_done` after the success or error
/// hook has run.
#[derive(Debug)]
pub enum Completion {
    /// Body retrieved; `status` is the final leg's HTTP status.
    Success { status: u16, body: Vec<u8> },
    /// Transfer failed; includes user preemption.
    Error { error: FetchError },
}

/// User-overridable event hooks for one request.
///
/// All methods have default implementations, so an implementor only writes
/// the events it cares about. Hooks run on the fetcher's tasks and must not
/// block on I/O.
pub trait FetchHooks: Send + Sync {
    /// A leg of the transfer is starting at `url`. Fires for the initial
    /// URL and again for every redirect target.
    fn on_url(&self, req: &FetchRequest, url: &Url) -> Result<()> {
        if *url != req.url {
            tracing::debug!(from = %req.url, to = %url, "URL set");
        }
        Ok(())
    }

    /// Response headers for the final leg arrived.
    fn on_headers(&self, _req: &FetchRequest, _headers: &HeaderMap) -> Result<()> {
        Ok(())
    }

    /// HTTP version, status code and reason for the final leg.
    fn on_status(&self, req: &FetchRequest, version: &str, status: u16, message: &str) -> Result<()> {
        if status != 200 {
            tracing::error!(url = %req.url, version, status, message, "Non-200 status");
        }
        Ok(())
    }

    /// The body was retrieved.
    fn on_success(&self, _req: &FetchRequest, _body: &[u8], _fetcher: &FetcherHandle) -> Result<()> {
        Ok(())
    }

    /// The transfer failed. `error` is the preemption cause when the user
    /// cancelled from a hook.
    fn on_error(&self, _req: &FetchRequest, _error: &FetchError, _fetcher: &FetcherHandle) -> Result<()> {
        Ok(())
    }

    /// Always runs last, after `on_success` or `on_error`.
    fn on_done(&self, _req: &FetchRequest, _completion: &Completion, _fetcher: &FetcherHandle) -> Result<()> {
        Ok(())
    }
}

/// Hooks implementation that only performs the default logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl FetchHooks for DefaultHooks {}

fn default_hooks() -> Arc<dyn FetchHooks> {
    Arc::new(DefaultHooks)
}

/// A single URL to retrieve, with transfer policy and mutable statistics.
///
/// The URL's fragment is stripped at construction. While enqueued the
/// request is owned by the scheduler; while in flight it is owned by exactly
/// one servicer; it is released after the `on_done` hook. Hooks are not
/// serialized: a request loaded from a persistent store carries
/// [`DefaultHooks`] until new hooks are attached.
#[derive(Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Identifier used in logs.
    pub id: RequestId,
    /// Final URL, fragment-stripped.
    pub url: Url,
    /// Optional payload; presence turns the request into a POST.
    pub body: Option<Vec<u8>>,
    /// Per-request proxy. Wins over the `<scheme>_proxy` environment.
    pub proxy: Option<Url>,
    /// Per-leg transfer timeout.
    pub timeout: Duration,
    /// Follow redirect responses.
    pub follow_redirects: bool,
    /// Redirect legs allowed before the transfer fails.
    pub redirect_limit: u32,
    /// Admission-exempt requests skip the robots.txt check (robots.txt
    /// fetches themselves).
    pub exempt: bool,
    /// HTTP status of the final leg; 0 until one arrives.
    pub status: u16,
    /// True iff every leg of the last transfer was served from the proxy
    /// cache.
    pub cached: bool,
    /// When the current leg started; refreshed on every URL event.
    #[serde(skip)]
    started_at: Option<Instant>,
    /// Wall time of the finished transfer.
    #[serde(skip)]
    pub elapsed: Option<Duration>,
    #[serde(skip, default = "default_hooks")]
    hooks: Arc<dyn FetchHooks>,
}

impl FetchRequest {
    /// Create a request for `url`, stripping any fragment.
    pub fn new(url: &str) -> Result<Self> {
        let mut url = Url::parse(url.trim())?;
        url.set_fragment(None);
        Ok(Self {
            id: Uuid::new_v4(),
            url,
            body: None,
            proxy: None,
            timeout: Duration::from_secs(45),
            follow_redirects: true,
            redirect_limit: 10,
            exempt: false,
            status: 0,
            cached: true,
            started_at: None,
            elapsed: None,
            hooks: default_hooks(),
        })
    }

    /// Attach a POST payload.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Route this request through `proxy`, overriding the environment.
    pub fn with_proxy(mut self, proxy: Url) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Replace the per-leg timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the redirect policy.
    pub fn with_redirects(mut self, follow: bool, limit: u32) -> Self {
        self.follow_redirects = follow;
        self.redirect_limit = limit;
        self
    }

    /// Attach event hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn FetchHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The hooks attached to this request.
    pub fn hooks(&self) -> Arc<dyn FetchHooks> {
        self.hooks.clone()
    }

    /// Scheduling partition key: `domain:<hostname>`.
    ///
    /// The full hostname, subdomains included; the alias leaves room to
    /// switch the partition scheme later.
    pub fn domain_key(&self) -> String {
        format!("domain:{}", self.url.host_str().unwrap_or_default())
    }

    /// Reset per-transfer state at the start of a transaction.
    pub(crate) fn begin(&mut self) {
        self.cached = true;
        self.elapsed = None;
        self.mark_start();
    }

    /// Refresh the start marker; called on every URL event.
    pub(crate) fn mark_start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Record elapsed time at the end of a transaction.
    pub(crate) fn finish_timing(&mut self) {
        self.elapsed = self.started_at.map(|t| t.elapsed());
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("cached", &self.cached)
            .field("exempt", &self.exempt)
            .finish_non_exhaustive()
    }
}
