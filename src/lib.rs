//! Polite, high-concurrency URL fetching.
//!
//! This crate is the transport layer of a crawler: a per-domain scheduled
//! fetch engine. Requests stream in, and the engine drives concurrent
//! HTTP(S) retrievals while enforcing a bounded in-flight pool, a minimum
//! inter-request delay per domain, and robots.txt admission. Completed
//! transfers report back through per-request hooks (`on_url`, `on_headers`,
//! `on_status`, `on_success`, `on_error`, `on_done`).
//!
//! Pending work lives in a [`QueueStore`]: one FIFO bucket per domain, a
//! staging FIFO shared with external producers, and a priority queue
//! scoring when each domain may next be polled. The in-memory store works
//! for single-process use; a networked implementation of the same trait
//! lets several processes share one frontier.
//!
//! # Example
//! ```no_run
//! use stagger::{
//!     AllowAll, FetchRequest, Fetcher, FetcherConfig, InMemoryStore, ReqwestTransport,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let transport = Arc::new(ReqwestTransport::new());
//!     let config = FetcherConfig {
//!         pool_size: 100,
//!         stop_when_done: true,
//!         ..FetcherConfig::default()
//!     };
//!
//!     let fetcher = Arc::new(Fetcher::polite(
//!         store,
//!         Arc::new(AllowAll),
//!         transport,
//!         config,
//!     )?);
//!
//!     fetcher.push(FetchRequest::new("http://example.com/")?);
//!     fetcher.push(FetchRequest::new("http://example.org/")?);
//!
//!     fetcher.clone().run().await?;
//!     Ok(())
//! }
//! ```

pub mod dispatcher;
pub mod error;
pub mod request;
pub mod robots;
pub mod scheduler;
pub mod servicer;
pub mod store;
pub mod transport;

// Re-export the types most users touch, so `use stagger::Fetcher` works
// without spelling out module paths.
pub use dispatcher::{
    CounterState, Counters, FetchEvents, FetchQueue, Fetcher, FetcherConfig, FetcherHandle,
    FifoQueue, NoEvents, Pop,
};
pub use error::{FetchError, Result};
pub use request::{preempt, Completion, DefaultHooks, FetchHooks, FetchRequest, RequestId};
pub use robots::{robots_request, AllowAll, RobotsCache, RobotsPolicy, Verdict};
pub use scheduler::{PoliteScheduler, DOMAIN_PREFIX, PLD_QUEUE, STAGING_QUEUE};
pub use servicer::Servicer;
pub use store::{InMemoryStore, QueueStore};
pub use transport::{LegRequest, LegResponse, MockCall, MockTransport, ReqwestTransport, Transport};
