use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use webanswer_core::{
    filter_search_urls, Error, Result, SearchProvider, SearchQuery, SearchResponse,
};

pub const DEFAULT_DENYLIST: [&str; 1] = ["huggingface.co"];
pub const DEFAULT_PRIMARY_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_SECONDARY_COOLDOWN: Duration = Duration::from_secs(10);

fn timeout_ms_from_query(q: &SearchQuery) -> u64 {
    // Provider requests can hang indefinitely without an explicit timeout.
    q.timeout_ms.unwrap_or(20_000).clamp(1_000, 60_000)
}

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_ms(key: &str) -> Option<Duration> {
    env(key)
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn google_api_key_from_env() -> Option<String> {
    env("WEBANSWER_GOOGLE_API_KEY").or_else(|| env("GOOGLE_API_KEY"))
}

fn google_cse_id_from_env() -> Option<String> {
    env("WEBANSWER_GOOGLE_CSE_ID").or_else(|| env("GOOGLE_CSE_ID"))
}

/// Hosts excluded from every result list (comma/whitespace separated).
pub fn denylist_from_env() -> Vec<String> {
    match env("WEBANSWER_SEARCH_DENYLIST") {
        Some(v) => {
            let mut out: Vec<String> = Vec::new();
            for raw in v.split(|c: char| c == ',' || c.is_whitespace()) {
                let s = raw.trim().to_ascii_lowercase();
                if !s.is_empty() && !out.contains(&s) {
                    out.push(s);
                }
            }
            out
        }
        None => DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
    }
}

/// Rate-limit gate shared by clones of a provider.
///
/// A successful call arms the gate; the next call waits out the remainder before sending.
/// The first call in a process never waits.
#[derive(Debug, Clone)]
struct Cooldown {
    period: Duration,
    next_allowed: Arc<tokio::sync::Mutex<Option<tokio::time::Instant>>>,
}

impl Cooldown {
    fn new(period: Duration) -> Self {
        Self {
            period,
            next_allowed: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    async fn wait(&self) {
        // Held across the sleep so concurrent callers queue up behind each other.
        let next = self.next_allowed.lock().await;
        if let Some(at) = *next {
            tokio::time::sleep_until(at).await;
        }
    }

    async fn arm(&self) {
        if self.period.is_zero() {
            return;
        }
        *self.next_allowed.lock().await = Some(tokio::time::Instant::now() + self.period);
    }
}

/// API-key backed provider (Google Custom Search JSON API).
#[derive(Debug, Clone)]
pub struct GoogleSearchProvider {
    client: reqwest::Client,
    api_key: String,
    cse_id: String,
    endpoint: String,
    denylist: Vec<String>,
    cooldown: Cooldown,
}

/// Quota-free provider (DuckDuckGo HTML endpoint). More rate-limit sensitive.
#[derive(Debug, Clone)]
pub struct DuckDuckGoSearchProvider {
    client: reqwest::Client,
    endpoint: String,
    denylist: Vec<String>,
    cooldown: Cooldown,
}

impl GoogleSearchProvider {
    pub fn new(client: reqwest::Client, api_key: String, cse_id: String) -> Self {
        Self {
            client,
            api_key,
            cse_id,
            endpoint: "https://www.googleapis.com/customsearch/v1".to_string(),
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
            cooldown: Cooldown::new(DEFAULT_PRIMARY_COOLDOWN),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = google_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured("missing WEBANSWER_GOOGLE_API_KEY (or GOOGLE_API_KEY)".to_string())
        })?;
        let cse_id = google_cse_id_from_env().ok_or_else(|| {
            Error::NotConfigured("missing WEBANSWER_GOOGLE_CSE_ID (or GOOGLE_CSE_ID)".to_string())
        })?;
        let mut p = Self::new(client, api_key, cse_id).with_denylist(denylist_from_env());
        if let Some(ep) = env("WEBANSWER_GOOGLE_ENDPOINT") {
            p = p.with_endpoint(ep);
        }
        if let Some(cd) = env_ms("WEBANSWER_PRIMARY_COOLDOWN_MS") {
            p = p.with_cooldown(cd);
        }
        Ok(p)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_denylist(mut self, denylist: Vec<String>) -> Self {
        self.denylist = denylist;
        self
    }

    /// Minimum gap between a successful call and the next call on this provider.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Cooldown::new(cooldown);
        self
    }
}

impl DuckDuckGoSearchProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: "https://html.duckduckgo.com/html/".to_string(),
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
            cooldown: Cooldown::new(DEFAULT_SECONDARY_COOLDOWN),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Self {
        let mut p = Self::new(client).with_denylist(denylist_from_env());
        if let Some(ep) = env("WEBANSWER_DDG_ENDPOINT") {
            p = p.with_endpoint(ep);
        }
        if let Some(cd) = env_ms("WEBANSWER_SECONDARY_COOLDOWN_MS") {
            p = p.with_cooldown(cd);
        }
        p
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_denylist(mut self, denylist: Vec<String>) -> Self {
        self.denylist = denylist;
        self
    }

    /// Minimum gap between a successful call and the next call on this provider.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Cooldown::new(cooldown);
        self
    }
}

#[derive(Debug, Deserialize)]
struct GoogleSearchResponse {
    #[serde(default)]
    items: Vec<GoogleItem>,
}

#[derive(Debug, Deserialize)]
struct GoogleItem {
    link: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for GoogleSearchProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        self.cooldown.wait().await;
        let t0 = Instant::now();
        let timeout_ms = timeout_ms_from_query(q);
        // The API caps `num` at 10.
        let num = q.max_results.clamp(1, 10);

        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.cse_id.as_str()),
                ("q", q.query.as_str()),
                ("num", num.to_string().as_str()),
            ])
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::SearchUnavailable(format!("google: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::SearchUnavailable(format!(
                "google search HTTP {status}"
            )));
        }
        let parsed: GoogleSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::SearchUnavailable(format!("google: {e}")))?;

        let urls = filter_search_urls(
            parsed.items.into_iter().filter_map(|i| i.link),
            &self.denylist,
            q.max_results,
        );

        let mut timings_ms = BTreeMap::new();
        timings_ms.insert("search".to_string(), t0.elapsed().as_millis());
        debug!(provider = "google", results = urls.len(), "search completed");

        self.cooldown.arm().await;
        Ok(SearchResponse {
            urls,
            provider: "google".to_string(),
            timings_ms,
        })
    }
}

/// DuckDuckGo wraps result links as `//duckduckgo.com/l/?uddg=<encoded>&rut=...`.
fn unwrap_ddg_redirect(href: &str) -> String {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    if let Ok(u) = url::Url::parse(&absolute) {
        if let Some((_, target)) = u.query_pairs().find(|(k, _)| k == "uddg") {
            return target.into_owned();
        }
    }
    absolute
}

/// Result links from a DuckDuckGo HTML results page, in page order, ads skipped.
fn parse_ddg_result_links(html: &str) -> Vec<String> {
    let doc = html_scraper::Html::parse_document(html);
    let (Ok(result_sel), Ok(link_sel)) = (
        html_scraper::Selector::parse(".result"),
        html_scraper::Selector::parse("a.result__a"),
    ) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for result in doc.select(&result_sel) {
        let class = result.value().attr("class").unwrap_or("");
        if class.contains("result--ad") {
            continue;
        }
        if let Some(href) = result
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
        {
            out.push(unwrap_ddg_redirect(href.trim()));
        }
    }
    out
}

#[async_trait::async_trait]
impl SearchProvider for DuckDuckGoSearchProvider {
    fn name(&self) -> &'static str {
        "duckduckgo"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        self.cooldown.wait().await;
        let t0 = Instant::now();
        let timeout_ms = timeout_ms_from_query(q);

        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("q", q.query.as_str())])
            .header(reqwest::header::ACCEPT, "text/html")
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::SearchUnavailable(format!("duckduckgo: {e}")))?;
        let status = resp.status();
        // A 202 here is DuckDuckGo's rate-limit page, not results.
        if status != reqwest::StatusCode::OK {
            return Err(Error::SearchUnavailable(format!(
                "duckduckgo search HTTP {status}"
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| Error::SearchUnavailable(format!("duckduckgo: {e}")))?;

        // `Html` is !Send; keep it out of any await.
        let raw = parse_ddg_result_links(&body);
        let urls = filter_search_urls(raw, &self.denylist, q.max_results);

        let mut timings_ms = BTreeMap::new();
        timings_ms.insert("search".to_string(), t0.elapsed().as_millis());
        debug!(provider = "duckduckgo", results = urls.len(), "search completed");

        self.cooldown.arm().await;
        Ok(SearchResponse {
            urls,
            provider: "duckduckgo".to_string(),
            timings_ms,
        })
    }
}
