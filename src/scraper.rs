//! Periodic page-text harvesting: one independent task per configured
//! source, each scraping its URL list and handing extracted addresses
//! to subscribers.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use url::Url;

use crate::extractor::extract_proxies;
use crate::utils::http::{build_get, default_scraper_headers, send_direct};
use crate::utils::shutdown::register_for_shutdown;

const MAX_ATTEMPTS: u32 = 3;

/// Matches a `{page:START-END}` or `[page:START-END]` template token
/// embedded anywhere in a source URL.
static PAGE_TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{page:(-?\d+)-(-?\d+)\}|\[page:(-?\d+)-(-?\d+)\]").unwrap());

/// Expand a `{page}`/`[page]` numeric-range template into one concrete URL
/// per integer in the range (inclusive, descending ranges allowed, e.g.
/// `[page:10-1]`). A URL with no template token expands to itself.
fn expand_page_template(url: &str) -> Vec<String> {
    let Some(caps) = PAGE_TEMPLATE.captures(url) else {
        return vec![url.to_string()];
    };
    let whole = caps.get(0).unwrap();
    let (start, end) = match (caps.get(1), caps.get(2)) {
        (Some(s), Some(e)) => (s.as_str(), e.as_str()),
        _ => (caps.get(3).unwrap().as_str(), caps.get(4).unwrap().as_str()),
    };
    let (start, end): (i64, i64) = match (start.parse(), end.parse()) {
        (Ok(s), Ok(e)) => (s, e),
        _ => return vec![url.to_string()],
    };
    let range: Vec<i64> = if start <= end {
        (start..=end).collect()
    } else {
        (end..=start).rev().collect()
    };
    range
        .into_iter()
        .map(|i| format!("{}{}{}", &url[..whole.start()], i, &url[whole.end()..]))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub sleep_time: Duration,
    pub spider_timeout: Duration,
    pub scrap_interval: Duration,
}

pub struct Scraper {
    sources: HashMap<String, Vec<String>>,
    config: ScraperConfig,
    subscribers: Mutex<Vec<mpsc::Sender<Vec<String>>>>,
}

impl Scraper {
    /// Expands each source's URL list's `{page}`/`[page]` templates at
    /// construction time, matching §6's "expanded at load" contract.
    pub fn new(sources: HashMap<String, Vec<String>>, config: ScraperConfig) -> Self {
        let sources = sources
            .into_iter()
            .map(|(name, urls)| {
                let expanded = urls.iter().flat_map(|u| expand_page_template(u)).collect();
                (name, expanded)
            })
            .collect();
        Self {
            sources,
            config,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber; each scrape pass for each source sends its
    /// extracted address list to every current subscriber.
    pub async fn subscribe(&self) -> mpsc::Receiver<Vec<String>> {
        let (tx, rx) = mpsc::channel(32);
        self.subscribers.lock().await.push(tx);
        rx
    }

    async fn publish(&self, addresses: Vec<String>) {
        if addresses.is_empty() {
            return;
        }
        let mut subs = self.subscribers.lock().await;
        subs.retain(|tx| !tx.is_closed());
        for tx in subs.iter() {
            let _ = tx.send(addresses.clone()).await;
        }
    }

    /// Spawn one independent long-running task per source; a failing
    /// source never blocks the others.
    pub fn open(self: std::sync::Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.sources
            .keys()
            .cloned()
            .map(|name| {
                let this = self.clone();
                tokio::spawn(async move { this.run_source(name).await })
            })
            .collect()
    }

    async fn run_source(&self, name: String) {
        let urls = match self.sources.get(&name) {
            Some(u) => u.clone(),
            None => return,
        };
        let mut shutdown_rx = register_for_shutdown(format!("scraper:{}", name)).await;

        loop {
            let pass_start = Instant::now();
            for url in &urls {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("scraper source {} shutting down", name);
                        return;
                    }
                    _ = tokio::time::sleep(self.config.sleep_time) => {}
                }
                let body = self.fetch_with_retries(url).await;
                if let Some(text) = body {
                    let addresses = extract_proxies(&text);
                    debug!("source {} url {} yielded {} addresses", name, url, addresses.len());
                    self.publish(addresses).await;
                }
            }

            let elapsed = pass_start.elapsed();
            let remaining = self.config.scrap_interval.saturating_sub(elapsed);
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("scraper source {} shutting down", name);
                    return;
                }
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    async fn fetch_with_retries(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?.to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);

        for attempt in 1..=MAX_ATTEMPTS {
            let req = build_get(url, &host, &default_scraper_headers());
            match send_direct(&host, port, &req, self.config.spider_timeout).await {
                Ok(resp) if resp.is_success() => {
                    return Some(String::from_utf8_lossy(&resp.body).into_owned());
                }
                Ok(resp) => {
                    warn!("attempt {}/{} for {} returned status {}", attempt, MAX_ATTEMPTS, url, resp.status);
                }
                Err(e) => {
                    warn!("attempt {}/{} for {} failed: {}", attempt, MAX_ATTEMPTS, url, e);
                }
            }
        }
        None
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_template_expands_ascending_and_descending_ranges() {
        let ascending = expand_page_template("http://x.invalid/wt/{page:1-3}");
        assert_eq!(
            ascending,
            vec![
                "http://x.invalid/wt/1",
                "http://x.invalid/wt/2",
                "http://x.invalid/wt/3",
            ]
        );

        let descending = expand_page_template("https://ip.example/?page=[page:3-1]");
        assert_eq!(
            descending,
            vec![
                "https://ip.example/?page=3",
                "https://ip.example/?page=2",
                "https://ip.example/?page=1",
            ]
        );
    }

    #[test]
    fn url_without_page_template_is_unchanged() {
        assert_eq!(
            expand_page_template("http://x.invalid/list.html"),
            vec!["http://x.invalid/list.html".to_string()]
        );
    }

    #[test]
    fn scraper_new_expands_templated_sources() {
        let mut sources = HashMap::new();
        sources.insert("paged".to_string(), vec!["http://x.invalid/p/{page:1-2}".to_string()]);
        let scraper = Scraper::new(
            sources,
            ScraperConfig {
                sleep_time: Duration::from_millis(1),
                spider_timeout: Duration::from_millis(50),
                scrap_interval: Duration::from_millis(50),
            },
        );
        assert_eq!(
            scraper.sources.get("paged").unwrap(),
            &vec!["http://x.invalid/p/1".to_string(), "http://x.invalid/p/2".to_string()]
        );
    }

    #[test]
    fn config_carries_durations() {
        let cfg = ScraperConfig {
            sleep_time: Duration::from_secs(5),
            spider_timeout: Duration::from_secs(30),
            scrap_interval: Duration::from_secs(300),
        };
        assert_eq!(cfg.sleep_time, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn subscribe_receives_published_addresses() {
        let mut sources = HashMap::new();
        sources.insert("test".to_string(), vec!["http://example.invalid/".to_string()]);
        let scraper = Scraper::new(
            sources,
            ScraperConfig {
                sleep_time: Duration::from_millis(1),
                spider_timeout: Duration::from_millis(50),
                scrap_interval: Duration::from_millis(50),
            },
        );
        let mut rx = scraper.subscribe().await;
        scraper.publish(vec!["1.2.3.4:8080".to_string()]).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received, vec!["1.2.3.4:8080".to_string()]);
    }
}
