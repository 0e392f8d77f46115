use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod action;
pub mod context;
pub mod query;

pub use action::{parse_action, ParseError, ParseErrorKind, ParsedAction};
pub use context::{
    aggregate_context, context_pages, Answer, ContextPage, Synthesizer, NO_CONTENT_ANSWER,
};
pub use query::reformulate_query;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("search unavailable: {0}")]
    SearchUnavailable(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("synthesis failed: {0}")]
    Synthesis(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("deadline exceeded during {stage}")]
    DeadlineExceeded { stage: &'static str },
}

impl Error {
    /// Name of the pipeline stage this error belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::InvalidUrl(_) | Error::Fetch(_) => "fetch",
            Error::NotConfigured(_) => "config",
            Error::SearchUnavailable(_) => "search",
            Error::Synthesis(_) => "synthesis",
            Error::Cache(_) => "cache",
            Error::DeadlineExceeded { stage } => *stage,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: usize,
    /// Per-request timeout for the provider call.
    pub timeout_ms: Option<u64>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, max_results: usize) -> Self {
        Self {
            query: query.into(),
            max_results,
            timeout_ms: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Ordered, deduplicated candidate URLs (never longer than the requested count).
    pub urls: Vec<String>,
    pub provider: String,
    pub timings_ms: BTreeMap<String, u128>,
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Fails with `Error::SearchUnavailable` on quota, network or provider errors.
    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse>;
}

/// Outcome of fetching one URL. Failures are recorded here rather than raised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub success: bool,
    /// Sanitized text; present iff `success`.
    pub content: Option<String>,
    pub error: Option<String>,
}

impl FetchedPage {
    pub fn ok(url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            success: true,
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn failed(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            success: false,
            content: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait::async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchedPage;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Implementations own timeouts and retries; a returned error means retries are exhausted.
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion>;
}

/// Normalize a URL for cache keys and dedup: parsed form, fragment dropped.
///
/// Unparseable input falls back to the trimmed string.
pub fn normalize_url(raw: &str) -> String {
    match url::Url::parse(raw.trim()) {
        Ok(mut u) => {
            u.set_fragment(None);
            u.to_string()
        }
        Err(_) => raw.trim().to_string(),
    }
}

fn host_is_denied(host: &str, denylist: &[String]) -> bool {
    let host = host.trim_start_matches("www.");
    denylist.iter().any(|d| {
        let d = d.trim().trim_start_matches("www.").to_ascii_lowercase();
        !d.is_empty() && (host == d || host.ends_with(&format!(".{d}")))
    })
}

/// Turn raw provider URLs into a `SearchResponse`-ready list.
///
/// Produces a new sequence: non-http(s) and denylisted hosts are dropped, duplicates
/// (by normalized URL) keep their first position, and the result is capped at `max_results`.
pub fn filter_search_urls<I>(raw: I, denylist: &[String], max_results: usize) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = std::collections::HashSet::new();
    raw.into_iter()
        .filter_map(|u| {
            let parsed = url::Url::parse(u.trim()).ok()?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return None;
            }
            let host = parsed.host_str()?.to_ascii_lowercase();
            if host_is_denied(&host, denylist) {
                return None;
            }
            Some(u.trim().to_string())
        })
        .filter(|u| seen.insert(normalize_url(u)))
        .take(max_results)
        .collect()
}
