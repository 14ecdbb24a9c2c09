//! Robots.txt admission policy.
//!
//! The scheduler consults two synchronous predicates before admitting a
//! URL; everything else about robots.txt (fetching, parsing, user-agent
//! matching) is the oracle's own business. [`RobotsCache`] is a verdict
//! cache fed out-of-band: [`robots_request`] builds an admission-exempt
//! fetch whose hooks record a verdict for the host when it completes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use url::Url;

use crate::error::{FetchError, Result};
use crate::request::{FetchHooks, FetchRequest};

/// Synchronous admission predicates consulted by the scheduler.
pub trait RobotsPolicy: Send + Sync {
    /// May `agent` fetch `url`?
    fn allowed(&self, url: &Url, agent: &str) -> bool;

    /// Host-requested delay between fetches, when the policy knows one.
    fn crawl_delay(&self, url: &Url, agent: &str) -> Option<Duration>;
}

/// Policy that admits everything, for deployments that enforce robots.txt
/// elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl RobotsPolicy for AllowAll {
    fn allowed(&self, _url: &Url, _agent: &str) -> bool {
        true
    }

    fn crawl_delay(&self, _url: &Url, _agent: &str) -> Option<Duration> {
        None
    }
}

/// Per-host verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    AllowAll,
    DenyAll,
}

struct HostEntry {
    verdict: Verdict,
    delay: Option<Duration>,
    recorded_at: Instant,
}

/// Verdict cache with a TTL.
///
/// A host with no live verdict is reported as disallowed until one is
/// recorded, so callers should issue a [`robots_request`] for new hosts and
/// re-push their URLs once the verdict lands.
pub struct RobotsCache {
    hosts: DashMap<String, HostEntry>,
    ttl: Duration,
}

impl RobotsCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(3 * 3600))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            hosts: DashMap::new(),
            ttl,
        }
    }

    /// Record a verdict for `host`.
    pub fn record(&self, host: &str, verdict: Verdict, delay: Option<Duration>) {
        self.hosts.insert(
            host.to_string(),
            HostEntry {
                verdict,
                delay,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Digest a robots.txt response into a verdict for `host`.
    ///
    /// 401/403 mean the host forbids crawling outright; any other non-200
    /// is treated as "no robots.txt". Bodies are only inspected for the
    /// degenerate blanket-deny form and a crawl-delay directive; nuanced
    /// per-path rules belong to a richer policy implementation.
    pub fn digest(&self, host: &str, status: u16, body: &[u8]) {
        let (verdict, delay) = match status {
            401 | 403 => (Verdict::DenyAll, None),
            200 => parse_degenerate(body),
            _ => {
                tracing::warn!(host, status, "No robots.txt");
                (Verdict::AllowAll, None)
            }
        };
        self.record(host, verdict, delay);
    }

    fn live_entry(&self, host: &str) -> Option<(Verdict, Option<Duration>)> {
        let entry = self.hosts.get(host)?;
        if entry.recorded_at.elapsed() > self.ttl {
            return None;
        }
        Some((entry.verdict, entry.delay))
    }
}

impl Default for RobotsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RobotsPolicy for RobotsCache {
    fn allowed(&self, url: &Url, _agent: &str) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        match self.live_entry(host) {
            Some((Verdict::AllowAll, _)) => true,
            // No verdict yet counts as disallowed.
            _ => false,
        }
    }

    fn crawl_delay(&self, url: &Url, _agent: &str) -> Option<Duration> {
        let host = url.host_str()?;
        self.live_entry(host).and_then(|(_, delay)| delay)
    }
}

fn parse_degenerate(body: &[u8]) -> (Verdict, Option<Duration>) {
    let text = String::from_utf8_lossy(body);
    let mut verdict = Verdict::AllowAll;
    let mut delay = None;
    for line in text.lines() {
        let line = line.trim().to_ascii_lowercase();
        if line == "disallow: /" {
            verdict = Verdict::DenyAll;
        } else if let Some(rest) = line.strip_prefix("crawl-delay:") {
            if let Ok(secs) = rest.trim().parse::<f64>() {
                delay = Some(Duration::from_secs_f64(secs));
            }
        }
    }
    (verdict, delay)
}

struct RobotsVerdictHooks {
    cache: Arc<RobotsCache>,
}

impl FetchHooks for RobotsVerdictHooks {
    fn on_status(&self, req: &FetchRequest, _version: &str, status: u16, _message: &str) -> Result<()> {
        if status != 200 {
            tracing::warn!(url = %req.url, status, "robots.txt fetch returned non-200");
        }
        Ok(())
    }

    fn on_success(
        &self,
        req: &FetchRequest,
        body: &[u8],
        _fetcher: &crate::dispatcher::FetcherHandle,
    ) -> Result<()> {
        if let Some(host) = req.url.host_str() {
            self.cache.digest(host, req.status, body);
        }
        Ok(())
    }

    fn on_error(
        &self,
        req: &FetchRequest,
        error: &FetchError,
        _fetcher: &crate::dispatcher::FetcherHandle,
    ) -> Result<()> {
        // Unreachable robots.txt is treated as absent.
        tracing::warn!(url = %req.url, error = %error, "robots.txt fetch failed, allowing host");
        if let Some(host) = req.url.host_str() {
            self.cache.record(host, Verdict::AllowAll, None);
        }
        Ok(())
    }
}

/// Build the admission-exempt request that fetches `/robots.txt` for the
/// host of `url` and records the verdict in `cache` when it completes.
pub fn robots_request(url: &Url, cache: Arc<RobotsCache>) -> Result<FetchRequest> {
    let mut robots_url = url.clone();
    robots_url.set_path("/robots.txt");
    robots_url.set_query(None);
    robots_url.set_fragment(None);

    let mut req = FetchRequest::new(robots_url.as_str())?
        .with_hooks(Arc::new(RobotsVerdictHooks { cache }));
    req.exempt = true;
    Ok(req)
}
