//! HTTP transport abstraction for executing one leg of a transfer.
//!
//! The servicer owns the redirect loop, so a [`Transport`] executes exactly
//! one request/response exchange and never follows redirects itself. The
//! abstraction keeps the engine testable: [`ReqwestTransport`] talks to the
//! network, [`MockTransport`] serves scripted responses.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, LOCATION, USER_AGENT};
use reqwest::Method;
use url::Url;

use crate::error::Result;

/// One leg of a transfer: an absolute target plus connection policy.
#[derive(Debug, Clone)]
pub struct LegRequest {
    /// Absolute target URL.
    pub url: Url,
    /// Connect via this proxy, presenting `url` as the request line.
    pub proxy: Option<Url>,
    /// Payload; presence makes the leg a POST.
    pub body: Option<Vec<u8>>,
    /// User-agent header value.
    pub user_agent: String,
    /// Transfer timeout for this leg.
    pub timeout: Duration,
}

/// Response to a single leg.
#[derive(Debug, Clone)]
pub struct LegResponse {
    /// e.g. "HTTP/1.1"
    pub version: String,
    pub status: u16,
    /// Status reason phrase.
    pub message: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl LegResponse {
    /// A plain 200 response.
    pub fn ok(body: &[u8]) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status: 200,
            message: "OK".to_string(),
            headers: HeaderMap::new(),
            body: body.to_vec(),
        }
    }

    /// An empty-bodied response with the given status.
    pub fn with_status(status: u16, message: &str) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            message: message.to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// A 302 redirect to `location`.
    pub fn redirect(location: &str) -> Self {
        Self::with_status(302, "Found").header("location", location)
    }

    /// Append a header. Panics on a malformed value; intended for test
    /// scripting.
    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers
            .append(name, value.parse().expect("valid header value"));
        self
    }

    /// The redirect target, if this response is a redirect.
    pub fn redirect_location(&self) -> Option<String> {
        if !(300..400).contains(&self.status) {
            return None;
        }
        self.headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }
}

/// Trait for executing one HTTP leg.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute the leg, connecting via `leg.proxy` when set.
    ///
    /// # Errors
    /// Returns an error on network failure, timeout, or an invalid target.
    async fn execute(&self, leg: &LegRequest) -> Result<LegResponse>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Production transport backed by reqwest.
///
/// Clients are built with redirects disabled (the servicer drives the
/// redirect loop) and TLS verification left at reqwest's defaults. One
/// client is cached per proxy endpoint.
pub struct ReqwestTransport {
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&Url>) -> Result<reqwest::Client> {
        let key = proxy.map(|p| p.as_str().to_string()).unwrap_or_default();
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }
        let client = builder.build()?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[tracing::instrument(skip(self, leg), fields(url = %leg.url))]
    async fn execute(&self, leg: &LegRequest) -> Result<LegResponse> {
        let client = self.client_for(leg.proxy.as_ref())?;
        let method = if leg.body.is_some() {
            Method::POST
        } else {
            Method::GET
        };

        let mut request = client
            .request(method, leg.url.clone())
            .header(USER_AGENT, leg.user_agent.as_str())
            .timeout(leg.timeout);
        if let Some(body) = &leg.body {
            request = request.body(body.clone());
        }

        let response = request.send().await?;
        let version = format!("{:?}", response.version());
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        tracing::debug!(status = status.as_u16(), body_len = body.len(), "Leg completed");

        Ok(LegResponse {
            version,
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}

// ============================================================================
// Scripted implementation for tests
// ============================================================================

/// Record of a call made to [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockCall {
    pub url: Url,
    pub proxy: Option<Url>,
    pub user_agent: String,
    /// When the leg was dispatched; lets tests assert scheduling timelines.
    pub at: Instant,
}

struct Scripted {
    result: Result<LegResponse>,
    delay: Option<Duration>,
}

/// Scripted transport for tests.
///
/// Responses are keyed by the absolute leg URL and returned in FIFO order,
/// so a URL can be scripted with a redirect leg followed by a final leg.
pub struct MockTransport {
    responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue a response for `url`.
    pub fn add_response(&self, url: &str, result: Result<LegResponse>) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(Scripted {
                result,
                delay: None,
            });
    }

    /// Queue a response for `url` that takes `delay` to arrive, for
    /// exercising concurrency limits.
    pub fn add_response_with_delay(&self, url: &str, result: Result<LegResponse>, delay: Duration) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(Scripted {
                result,
                delay: Some(delay),
            });
    }

    /// All calls made so far, in dispatch order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Legs currently being serviced.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrently serviced legs.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_for(&self, url: &str) -> Option<Scripted> {
        self.responses.lock().get_mut(url)?.pop_front()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, leg: &LegRequest) -> Result<LegResponse> {
        self.calls.lock().push(MockCall {
            url: leg.url.clone(),
            proxy: leg.proxy.clone(),
            user_agent: leg.user_agent.clone(),
            at: Instant::now(),
        });
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = scopeguard::guard((), |_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let scripted = self.next_for(leg.url.as_str());
        let result = match scripted {
            Some(scripted) => {
                if let Some(delay) = scripted.delay {
                    tokio::time::sleep(delay).await;
                }
                scripted.result
            }
            None => Err(crate::error::FetchError::Internal(anyhow::anyhow!(
                "no mock response configured for {}",
                leg.url
            ))),
        };
        drop(guard);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leg(url: &str) -> LegRequest {
        LegRequest {
            url: Url::parse(url).unwrap(),
            proxy: None,
            body: None,
            user_agent: "stagger-test/0.1".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_mock_responses_fifo_per_url() {
        let mock = MockTransport::new();
        mock.add_response("http://a.example/x", Ok(LegResponse::redirect("/y")));
        mock.add_response("http://a.example/x", Ok(LegResponse::ok(b"second")));

        let first = mock.execute(&leg("http://a.example/x")).await.unwrap();
        assert_eq!(first.redirect_location().as_deref(), Some("/y"));

        let second = mock.execute(&leg("http://a.example/x")).await.unwrap();
        assert_eq!(second.body, b"second");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_unconfigured_url_errors() {
        let mock = MockTransport::new();
        assert!(mock.execute(&leg("http://nowhere.example/")).await.is_err());
    }

    #[test]
    fn test_redirect_location_only_for_3xx() {
        let resp = LegResponse::ok(b"").header("location", "/elsewhere");
        assert_eq!(resp.redirect_location(), None);
        let resp = LegResponse::redirect("/elsewhere");
        assert_eq!(resp.redirect_location().as_deref(), Some("/elsewhere"));
    }

    #[tokio::test]
    async fn test_reqwest_transport_against_local_server() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("user-agent", "stagger-test/0.1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-cache", "MISS from nowhere")
                    .set_body_bytes(b"hello".to_vec()),
            )
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new();
        let resp = transport
            .execute(&leg(&format!("{}/page", server.uri())))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello");
        assert!(resp.headers.contains_key("x-cache"));
    }

    #[tokio::test]
    async fn test_reqwest_transport_does_not_follow_redirects() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/from"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/to"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new();
        let resp = transport
            .execute(&leg(&format!("{}/from", server.uri())))
            .await
            .unwrap();
        assert_eq!(resp.status, 302);
        assert_eq!(resp.redirect_location().as_deref(), Some("/to"));
    }
}
