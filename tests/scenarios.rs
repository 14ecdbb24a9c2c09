//! End-to-end scheduling behavior against a scripted transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use url::Url;

use stagger::{
    preempt, robots_request, AllowAll, Completion, FetchError, FetchHooks, FetchRequest, Fetcher,
    FetcherConfig, FetcherHandle, InMemoryStore, LegResponse, MockTransport, PoliteScheduler,
    QueueStore, RobotsCache, RobotsPolicy, PLD_QUEUE,
};

type PoliteFetcher = Fetcher<PoliteScheduler<InMemoryStore>, MockTransport>;

fn fetcher(
    store: Arc<InMemoryStore>,
    robots: Arc<dyn RobotsPolicy>,
    transport: Arc<MockTransport>,
    config: FetcherConfig,
) -> Arc<PoliteFetcher> {
    Arc::new(Fetcher::polite(store, robots, transport, config).unwrap())
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn dispatch_time(transport: &MockTransport, url: &str) -> Instant {
    transport
        .calls()
        .iter()
        .find(|c| c.url.as_str() == url)
        .unwrap_or_else(|| panic!("{url} was never dispatched"))
        .at
}

#[derive(Default)]
struct Record {
    successes: usize,
    errors: Vec<String>,
    preemptions: usize,
    dones: usize,
    cached: Option<bool>,
}

/// Hooks that record the callback sequence, optionally preempting from
/// `on_headers`.
struct Probe {
    record: Arc<Mutex<Record>>,
    preempt_in_headers: bool,
}

impl Probe {
    fn new(record: Arc<Mutex<Record>>) -> Self {
        Self {
            record,
            preempt_in_headers: false,
        }
    }
}

impl FetchHooks for Probe {
    fn on_headers(
        &self,
        _req: &FetchRequest,
        _headers: &reqwest::header::HeaderMap,
    ) -> stagger::Result<()> {
        if self.preempt_in_headers {
            return Err(preempt("content not wanted"));
        }
        Ok(())
    }

    fn on_success(
        &self,
        _req: &FetchRequest,
        _body: &[u8],
        _fetcher: &FetcherHandle,
    ) -> stagger::Result<()> {
        self.record.lock().successes += 1;
        Ok(())
    }

    fn on_error(
        &self,
        _req: &FetchRequest,
        error: &FetchError,
        _fetcher: &FetcherHandle,
    ) -> stagger::Result<()> {
        let mut record = self.record.lock();
        record.errors.push(error.to_string());
        if error.is_preemption() {
            record.preemptions += 1;
        }
        Ok(())
    }

    fn on_done(
        &self,
        req: &FetchRequest,
        _completion: &Completion,
        _fetcher: &FetcherHandle,
    ) -> stagger::Result<()> {
        let mut record = self.record.lock();
        record.dones += 1;
        record.cached = Some(req.cached);
        Ok(())
    }
}

#[tokio::test]
async fn test_respects_per_domain_delay() {
    let transport = Arc::new(MockTransport::new());
    transport.add_response("http://a.example/1", Ok(LegResponse::ok(b"one")));
    transport.add_response("http://a.example/2", Ok(LegResponse::ok(b"two")));

    let fetcher = fetcher(
        Arc::new(InMemoryStore::new()),
        Arc::new(AllowAll),
        transport.clone(),
        FetcherConfig {
            pool_size: 4,
            delay: Duration::from_millis(600),
            ..FetcherConfig::default()
        },
    );
    fetcher.push(FetchRequest::new("http://a.example/1").unwrap());
    fetcher.push(FetchRequest::new("http://a.example/2").unwrap());

    let handle = fetcher.spawn();
    assert!(wait_until(Duration::from_secs(10), || fetcher.counters().processed == 2).await);
    fetcher.shutdown();
    handle.await.unwrap().unwrap();

    let gap = dispatch_time(&transport, "http://a.example/2")
        .duration_since(dispatch_time(&transport, "http://a.example/1"));
    assert!(gap >= Duration::from_millis(400), "dispatch gap was {gap:?}");
    // Same domain never runs two transfers at once.
    assert_eq!(transport.max_in_flight(), 1);
}

#[tokio::test]
async fn test_interleaves_across_domains() {
    let transport = Arc::new(MockTransport::new());
    for url in [
        "http://a.example/1",
        "http://b.example/1",
        "http://a.example/2",
        "http://b.example/2",
    ] {
        transport.add_response(url, Ok(LegResponse::ok(b"x")));
    }

    let fetcher = fetcher(
        Arc::new(InMemoryStore::new()),
        Arc::new(AllowAll),
        transport.clone(),
        FetcherConfig {
            pool_size: 4,
            delay: Duration::from_millis(600),
            ..FetcherConfig::default()
        },
    );
    fetcher.extend(vec![
        FetchRequest::new("http://a.example/1").unwrap(),
        FetchRequest::new("http://b.example/1").unwrap(),
        FetchRequest::new("http://a.example/2").unwrap(),
        FetchRequest::new("http://b.example/2").unwrap(),
    ]);

    let handle = fetcher.spawn();
    assert!(wait_until(Duration::from_secs(10), || fetcher.counters().processed == 4).await);
    fetcher.shutdown();
    handle.await.unwrap().unwrap();

    let a1 = dispatch_time(&transport, "http://a.example/1");
    let b1 = dispatch_time(&transport, "http://b.example/1");
    let a2 = dispatch_time(&transport, "http://a.example/2");
    let b2 = dispatch_time(&transport, "http://b.example/2");
    let t0 = a1.min(b1);

    // First wave runs in parallel, second wave only after the delay.
    assert!(b1.duration_since(t0) < Duration::from_millis(300));
    assert!(a1.duration_since(t0) < Duration::from_millis(300));
    assert!(a2.duration_since(t0) >= Duration::from_millis(400));
    assert!(b2.duration_since(t0) >= Duration::from_millis(400));
}

#[tokio::test]
async fn test_cache_hit_skips_the_delay() {
    let proxy = Url::parse("http://cache.local:3128").unwrap();

    let transport = Arc::new(MockTransport::new());
    // One-redirect transfer with a proxy hit on both legs.
    transport.add_response(
        "http://a.example/1",
        Ok(LegResponse::redirect("/2").header("x-cache", "HIT from cache.local")),
    );
    transport.add_response(
        "http://a.example/2",
        Ok(LegResponse::ok(b"cached").header("x-cache", "HIT from cache.local")),
    );
    transport.add_response("http://a.example/3", Ok(LegResponse::ok(b"later")));

    let fetcher = fetcher(
        Arc::new(InMemoryStore::new()),
        Arc::new(AllowAll),
        transport.clone(),
        FetcherConfig {
            pool_size: 4,
            // Long enough that only a zero delay lets the second request
            // through quickly.
            delay: Duration::from_secs(10),
            ..FetcherConfig::default()
        },
    );

    let record = Arc::new(Mutex::new(Record::default()));
    fetcher.push(
        FetchRequest::new("http://a.example/1")
            .unwrap()
            .with_proxy(proxy)
            .with_hooks(Arc::new(Probe::new(record.clone()))),
    );
    fetcher.push(FetchRequest::new("http://a.example/3").unwrap());

    let handle = fetcher.spawn();
    // Both finish fast because the cached transfer re-arms the domain
    // with no gap.
    assert!(wait_until(Duration::from_secs(3), || fetcher.counters().processed == 2).await);
    fetcher.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(record.lock().cached, Some(true));
}

#[tokio::test]
async fn test_preemption_surfaces_one_error_and_one_done() {
    let transport = Arc::new(MockTransport::new());
    transport.add_response("http://a.example/big", Ok(LegResponse::ok(b"payload")));

    let fetcher = fetcher(
        Arc::new(InMemoryStore::new()),
        Arc::new(AllowAll),
        transport.clone(),
        FetcherConfig::default(),
    );

    let record = Arc::new(Mutex::new(Record::default()));
    let mut probe = Probe::new(record.clone());
    probe.preempt_in_headers = true;
    fetcher.push(
        FetchRequest::new("http://a.example/big")
            .unwrap()
            .with_hooks(Arc::new(probe)),
    );

    let handle = fetcher.spawn();
    assert!(wait_until(Duration::from_secs(5), || record.lock().dones == 1).await);
    fetcher.shutdown();
    handle.await.unwrap().unwrap();

    let record = record.lock();
    assert_eq!(record.preemptions, 1);
    assert_eq!(record.errors.len(), 1);
    assert_eq!(record.successes, 0);
    assert_eq!(record.dones, 1);

    let state = fetcher.counters();
    assert_eq!(state.in_flight, 0);
    assert_eq!(state.processed, 1);
}

#[tokio::test]
async fn test_robots_disallowed_url_is_rejected_at_push() {
    let transport = Arc::new(MockTransport::new());
    // No verdict recorded: the cache reports disallowed.
    let fetcher = fetcher(
        Arc::new(InMemoryStore::new()),
        Arc::new(RobotsCache::new()),
        transport.clone(),
        FetcherConfig::default(),
    );

    let accepted = fetcher.push(FetchRequest::new("http://blocked.example/x").unwrap());
    assert_eq!(accepted, 0);
    assert_eq!(fetcher.counters().remaining, 0);

    let handle = fetcher.spawn();
    tokio::time::sleep(Duration::from_millis(200)).await;
    fetcher.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn test_resumes_persisted_buckets_on_construction() {
    let store = Arc::new(InMemoryStore::new());
    // Simulate requests left behind by a prior run, stored in wire form.
    for url in ["http://a.example/1", "http://b.example/1"] {
        let raw = stagger::store::encode(&FetchRequest::new(url).unwrap()).unwrap();
        let req = stagger::store::decode(&raw).unwrap();
        store.fifo_push(&req.domain_key(), req).unwrap();
    }

    let transport = Arc::new(MockTransport::new());
    transport.add_response("http://a.example/1", Ok(LegResponse::ok(b"a")));
    transport.add_response("http://b.example/1", Ok(LegResponse::ok(b"b")));

    let fetcher = fetcher(
        store.clone(),
        Arc::new(AllowAll),
        transport.clone(),
        FetcherConfig::default(),
    );
    // Construction scored both persisted domains as immediately ready.
    assert_eq!(store.priority_len(PLD_QUEUE).unwrap(), 2);

    let handle = fetcher.spawn();
    assert!(wait_until(Duration::from_secs(2), || fetcher.counters().processed == 2).await);
    fetcher.shutdown();
    handle.await.unwrap().unwrap();

    // Both dispatched in the first wave, not serialized behind a delay.
    let a = dispatch_time(&transport, "http://a.example/1");
    let b = dispatch_time(&transport, "http://b.example/1");
    let gap = a.max(b).duration_since(a.min(b));
    assert!(gap < Duration::from_millis(300), "first wave gap was {gap:?}");
}

#[tokio::test]
async fn test_single_domain_never_overlaps_even_with_zero_delay() {
    let transport = Arc::new(MockTransport::new());
    for i in 0..3 {
        let url = format!("http://a.example/{i}");
        transport.add_response_with_delay(
            &url,
            Ok(LegResponse::ok(b"x")),
            Duration::from_millis(100),
        );
    }

    let fetcher = fetcher(
        Arc::new(InMemoryStore::new()),
        Arc::new(AllowAll),
        transport.clone(),
        FetcherConfig {
            pool_size: 8,
            delay: Duration::ZERO,
            ..FetcherConfig::default()
        },
    );
    for i in 0..3 {
        fetcher.push(FetchRequest::new(&format!("http://a.example/{i}")).unwrap());
    }

    let handle = fetcher.spawn();
    assert!(wait_until(Duration::from_secs(5), || fetcher.counters().processed == 3).await);
    fetcher.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(transport.max_in_flight(), 1);
}

#[tokio::test]
async fn test_robots_fetch_unlocks_a_host() {
    let robots = Arc::new(RobotsCache::new());

    let transport = Arc::new(MockTransport::new());
    transport.add_response(
        "http://new.example/robots.txt",
        Ok(LegResponse::ok(b"User-agent: *\nDisallow:\n")),
    );
    transport.add_response("http://new.example/page", Ok(LegResponse::ok(b"content")));

    let fetcher = fetcher(
        Arc::new(InMemoryStore::new()),
        robots.clone(),
        transport.clone(),
        FetcherConfig::default(),
    );

    let page = FetchRequest::new("http://new.example/page").unwrap();
    // Until a verdict lands, the page is refused admission.
    assert_eq!(fetcher.push(page.clone()), 0);

    let handle = fetcher.spawn();
    fetcher.push(robots_request(&page.url, robots).unwrap());
    assert!(wait_until(Duration::from_secs(5), || fetcher.counters().processed == 1).await);

    // Verdict recorded: the same page is now accepted and fetched.
    assert_eq!(fetcher.push(page), 1);
    assert!(wait_until(Duration::from_secs(5), || fetcher.counters().processed == 2).await);
    fetcher.shutdown();
    handle.await.unwrap().unwrap();
}
