//! Persistent queue contract backing the scheduler.
//!
//! The scheduler keeps all of its pending work in named containers owned by
//! an external store: one FIFO per domain bucket (`domain:<hostname>`), the
//! shared staging FIFO (`request`), and one priority queue (`plds`) scored
//! by domain readiness time. All operations are short and non-blocking; a
//! networked implementation is expected to front its backend with its own
//! connection handling.
//!
//! Hooks do not survive serialization: [`encode`]/[`decode`] define the
//! wire form persistent backends use, and a decoded request carries
//! [`DefaultHooks`](crate::request::DefaultHooks) until new hooks are
//! attached.

use crate::error::Result;
use crate::request::FetchRequest;

pub mod in_memory;

pub use in_memory::InMemoryStore;

/// Wire encoding for a queued request.
pub fn encode(req: &FetchRequest) -> Result<String> {
    Ok(serde_json::to_string(req)?)
}

/// Decode a request from its wire form. Hooks come back as defaults.
pub fn decode(raw: &str) -> Result<FetchRequest> {
    Ok(serde_json::from_str(raw)?)
}

/// Named FIFO and priority-queue containers over opaque requests.
///
/// Scores are wall-clock seconds since the Unix epoch, so readiness
/// survives process restarts. Implementations must tolerate concurrent
/// consumers; the scheduler only promises that one request per domain is
/// ever in flight from this process.
pub trait QueueStore: Send + Sync {
    /// Append to the named FIFO.
    fn fifo_push(&self, name: &str, req: FetchRequest) -> Result<()>;

    /// Pop the oldest entry of the named FIFO, if any.
    fn fifo_pop(&self, name: &str) -> Result<Option<FetchRequest>>;

    /// Number of entries in the named FIFO.
    fn fifo_len(&self, name: &str) -> Result<usize>;

    /// Insert `member` with `score`, replacing any previous score.
    fn priority_push(&self, name: &str, member: &str, score: f64) -> Result<()>;

    /// Insert `member` with `score` only if it has no score yet; returns
    /// whether it was inserted. Keeps a pending readiness time from being
    /// reset by a fresh push into a drained bucket.
    fn priority_push_if_absent(&self, name: &str, member: &str, score: f64) -> Result<bool>;

    /// The member with the smallest score, without removing it.
    fn priority_peek(&self, name: &str) -> Result<Option<(String, f64)>>;

    /// Remove and return the member with the smallest score.
    fn priority_pop(&self, name: &str) -> Result<Option<String>>;

    /// Number of members in the named priority queue.
    fn priority_len(&self, name: &str) -> Result<usize>;

    /// Names of non-empty FIFOs starting with `prefix`, used at scheduler
    /// construction to resume work from a prior run.
    fn scan(&self, prefix: &str) -> Result<Vec<String>>;
}
