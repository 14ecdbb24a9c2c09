//! Fetch a list of URLs politely from the command line.
//!
//!   cargo run --example fetch_urls -- urls.txt
//!   cargo run --example fetch_urls -- --pool-size 100 --delay-ms 1000 urls.txt
//!
//! One URL per line. With `--obey-robots`, each host's robots.txt is
//! fetched up front and disallowed hosts are skipped.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use stagger::{
    robots_request, AllowAll, FetchRequest, Fetcher, FetcherConfig, InMemoryStore,
    ReqwestTransport, RobotsCache, RobotsPolicy,
};

/// Polite URL fetcher
#[derive(Parser)]
#[command(name = "fetch_urls")]
#[command(about = "Fetch a list of URLs with per-domain politeness", long_about = None)]
struct Cli {
    /// File with one URL per line
    urls: std::path::PathBuf,

    /// Maximum concurrent transfers
    #[arg(long, default_value = "10")]
    pool_size: usize,

    /// Per-domain delay between requests, in milliseconds
    #[arg(long, default_value = "2000")]
    delay_ms: u64,

    /// Fetch robots.txt per host and honor it
    #[arg(long)]
    obey_robots: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("stagger=debug,info")
        .init();

    let cli = Cli::parse();
    let raw = std::fs::read_to_string(&cli.urls)
        .with_context(|| format!("reading {}", cli.urls.display()))?;

    let config = FetcherConfig {
        pool_size: cli.pool_size,
        delay: std::time::Duration::from_millis(cli.delay_ms),
        stop_when_done: true,
        ..FetcherConfig::default()
    };

    let transport = Arc::new(ReqwestTransport::new());

    let mut requests = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        requests.push(FetchRequest::new(line)?);
    }

    let robots_cache = Arc::new(RobotsCache::new());
    let robots: Arc<dyn RobotsPolicy> = if cli.obey_robots {
        // Collect verdicts first so admission has something to consult.
        let mut hosts = HashSet::new();
        let mut probes = Vec::new();
        for req in &requests {
            if hosts.insert(req.url.host_str().unwrap_or_default().to_string()) {
                probes.push(robots_request(&req.url, robots_cache.clone())?);
            }
        }
        if !probes.is_empty() {
            let prefetch = Arc::new(Fetcher::polite(
                Arc::new(InMemoryStore::new()),
                robots_cache.clone(),
                transport.clone(),
                config.clone(),
            )?);
            prefetch.extend(probes);
            prefetch.clone().run().await?;
        }
        robots_cache
    } else {
        Arc::new(AllowAll)
    };

    let fetcher = Arc::new(Fetcher::polite(
        Arc::new(InMemoryStore::new()),
        robots,
        transport,
        config,
    )?);

    let total = requests.len();
    let accepted = fetcher.extend(requests);
    println!("Accepted {accepted}/{total} requests");

    if accepted > 0 {
        fetcher.clone().run().await?;
    }

    let state = fetcher.counters();
    println!("Done: processed {} requests", state.processed);
    Ok(())
}
