//! Drives a single HTTP transaction and feeds the request's hooks.
//!
//! The servicer owns the redirect loop: it resolves each new URL against
//! the previous one, re-consults proxy configuration per leg, accumulates
//! the cache-hit flag across legs, and translates the distinguished
//! preemption error from a hook into a clean teardown.

use std::sync::Arc;

use reqwest::header::HeaderMap;
use url::Url;

use crate::error::{FetchError, Result};
use crate::request::{Completion, FetchHooks, FetchRequest};
use crate::transport::{LegRequest, Transport};

/// Pick the proxy for one leg: the request's own proxy wins, otherwise the
/// `<scheme>_proxy` environment variable (interpreted as a full URL).
pub(crate) fn resolve_proxy(url: &Url, req: &FetchRequest) -> Result<Option<Url>> {
    if let Some(proxy) = &req.proxy {
        return Ok(Some(proxy.clone()));
    }
    let var = format!("{}_proxy", url.scheme());
    match std::env::var(&var) {
        Ok(raw) if !raw.is_empty() => Ok(Some(Url::parse(&raw)?)),
        _ => Ok(None),
    }
}

/// Validate the connect target for a request before it is put in flight.
pub(crate) fn connect_target(req: &FetchRequest) -> Result<Option<Url>> {
    match req.url.scheme() {
        "http" | "https" => {}
        other => return Err(FetchError::UnsupportedScheme(other.to_string())),
    }
    resolve_proxy(&req.url, req)
}

/// True when the joined `x-cache` headers carry `HIT from <proxy_host>`.
///
/// Repeated header values are joined with `;` before the substring check,
/// matching squid-style caches that append one value per hop.
fn cache_hit(headers: &HeaderMap, proxy_host: &str) -> bool {
    let joined = headers
        .get_all("x-cache")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(";");
    joined.contains(&format!("HIT from {proxy_host}"))
}

/// Services one request end-to-end against a [`Transport`].
pub struct Servicer<T: Transport> {
    transport: Arc<T>,
    user_agent: String,
}

impl<T: Transport> Servicer<T> {
    pub fn new(transport: Arc<T>, user_agent: String) -> Self {
        Self {
            transport,
            user_agent,
        }
    }

    /// Drive the transaction to completion. Consumes and returns the
    /// request so callers get the updated statistics back alongside the
    /// completion event.
    pub async fn run(&self, mut req: FetchRequest) -> (FetchRequest, Completion) {
        req.begin();
        let outcome = self.drive(&mut req).await;
        req.finish_timing();
        match outcome {
            Ok(body) => {
                let status = req.status;
                (req, Completion::Success { status, body })
            }
            Err(error) => (req, Completion::Error { error }),
        }
    }

    async fn drive(&self, req: &mut FetchRequest) -> Result<Vec<u8>> {
        let hooks = req.hooks();
        let mut current = req.url.clone();
        let mut redirects: u32 = 0;

        loop {
            req.mark_start();
            self.fire_url(req, &hooks, &current)?;

            let proxy = resolve_proxy(&current, req)?;
            let leg = LegRequest {
                url: current.clone(),
                proxy: proxy.clone(),
                body: req.body.clone(),
                user_agent: self.user_agent.clone(),
                timeout: req.timeout,
            };
            let response = self.transport.execute(&leg).await?;

            // A transfer is cached only if every leg was a proxy hit.
            let hit = proxy
                .as_ref()
                .and_then(|p| p.host_str())
                .map(|host| cache_hit(&response.headers, host))
                .unwrap_or(false);
            req.cached = req.cached && hit;

            if req.follow_redirects {
                if let Some(location) = response.redirect_location() {
                    redirects += 1;
                    if redirects > req.redirect_limit {
                        return Err(FetchError::TooManyRedirects(req.redirect_limit));
                    }
                    // Redirect targets can lack a host; resolve against the
                    // leg that produced them.
                    current = current.join(&location)?;
                    continue;
                }
            }

            req.status = response.status;
            self.fire_headers(req, &hooks, &response.headers)?;
            self.fire_status(req, &hooks, &response.version, response.status, &response.message)?;
            return Ok(response.body);
        }
    }

    fn fire_url(&self, req: &FetchRequest, hooks: &Arc<dyn FetchHooks>, url: &Url) -> Result<()> {
        match hooks.on_url(req, url) {
            Ok(()) => Ok(()),
            Err(e) if e.is_preemption() => {
                tracing::info!(url = %req.url, reason = %e, "Transfer preempted in on_url");
                Err(e)
            }
            Err(e) => {
                tracing::error!(url = %req.url, error = %e, "on_url hook failed");
                Ok(())
            }
        }
    }

    fn fire_headers(
        &self,
        req: &FetchRequest,
        hooks: &Arc<dyn FetchHooks>,
        headers: &HeaderMap,
    ) -> Result<()> {
        match hooks.on_headers(req, headers) {
            Ok(()) => Ok(()),
            Err(e) if e.is_preemption() => {
                tracing::info!(url = %req.url, reason = %e, "Transfer preempted in on_headers");
                Err(e)
            }
            Err(e) => {
                tracing::error!(url = %req.url, error = %e, "on_headers hook failed");
                Ok(())
            }
        }
    }

    fn fire_status(
        &self,
        req: &FetchRequest,
        hooks: &Arc<dyn FetchHooks>,
        version: &str,
        status: u16,
        message: &str,
    ) -> Result<()> {
        match hooks.on_status(req, version, status, message) {
            Ok(()) => Ok(()),
            Err(e) if e.is_preemption() => {
                tracing::info!(url = %req.url, reason = %e, "Transfer preempted in on_status");
                Err(e)
            }
            Err(e) => {
                tracing::error!(url = %req.url, error = %e, "on_status hook failed");
                Ok(())
            }
        }
    }
}
