use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use webanswer_core::{normalize_url, Error, FetchedPage, PageFetcher, Result};

pub mod extract;
pub mod openai_compat;
pub mod pipeline;
pub mod search;

use extract::{bytes_look_like_html, content_type_lc_prefix, plain_text_body, sanitize_html, ContentPolicy};

/// Raw response body as stored by [`FsCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBody {
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// On-disk body cache: `<root>/ab/cd/<sha256>.{json,bin}`, keyed by normalized URL.
#[derive(Debug, Clone)]
pub struct FsCache {
    root: PathBuf,
    ttl: Option<Duration>,
}

fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

impl FsCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root, ttl: None }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    fn key_for_url(url: &str) -> String {
        let mut h = Sha256::new();
        h.update(b"url:");
        h.update(normalize_url(url).as_bytes());
        hex::encode(h.finalize())
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let dir = self.root.join(&key[0..2]).join(&key[2..4]);
        let meta = dir.join(format!("{key}.json"));
        let body = dir.join(format!("{key}.bin"));
        (meta, body)
    }

    pub fn get(&self, url: &str) -> Result<Option<CachedBody>> {
        let (meta_p, body_p) = self.paths(&Self::key_for_url(url));
        if !meta_p.exists() || !body_p.exists() {
            return Ok(None);
        }
        let meta_bytes = fs::read(&meta_p).map_err(|e| Error::Cache(e.to_string()))?;
        let meta: serde_json::Value =
            serde_json::from_slice(&meta_bytes).map_err(|e| Error::Cache(e.to_string()))?;

        let fetched_at = meta
            .get("fetched_at_epoch_s")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if let Some(ttl) = self.ttl {
            if now_epoch_s().saturating_sub(fetched_at) > ttl.as_secs() {
                return Ok(None);
            }
        }

        let bytes = fs::read(&body_p).map_err(|e| Error::Cache(e.to_string()))?;
        Ok(Some(CachedBody {
            final_url: meta
                .get("final_url")
                .and_then(|v| v.as_str())
                .unwrap_or(url)
                .to_string(),
            status: meta.get("status").and_then(|v| v.as_u64()).unwrap_or(0) as u16,
            content_type: meta
                .get("content_type")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            bytes,
        }))
    }

    pub fn put(&self, url: &str, body: &CachedBody) -> Result<()> {
        let (meta_p, body_p) = self.paths(&Self::key_for_url(url));
        if let Some(parent) = meta_p.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Cache(e.to_string()))?;
        }
        let meta = serde_json::json!({
            "schema_version": 1,
            "fetched_at_epoch_s": now_epoch_s(),
            "url": normalize_url(url),
            "final_url": body.final_url,
            "status": body.status,
            "content_type": body.content_type,
        });
        fs::write(&body_p, &body.bytes).map_err(|e| Error::Cache(e.to_string()))?;
        fs::write(
            &meta_p,
            serde_json::to_vec(&meta).map_err(|e| Error::Cache(e.to_string()))?,
        )
        .map_err(|e| Error::Cache(e.to_string()))?;
        Ok(())
    }
}

/// In-run page cache shared by concurrent fetches. Last write for a key wins.
#[derive(Debug, Default)]
pub struct PageCache {
    pages: RwLock<HashMap<String, FetchedPage>>,
}

impl PageCache {
    pub fn get(&self, url: &str) -> Option<FetchedPage> {
        let pages = self.pages.read().unwrap_or_else(|e| e.into_inner());
        pages.get(&normalize_url(url)).cloned()
    }

    pub fn insert(&self, page: FetchedPage) {
        let key = normalize_url(&page.url);
        let mut pages = self.pages.write().unwrap_or_else(|e| e.into_inner());
        pages.insert(key, page);
    }

    pub fn len(&self) -> usize {
        self.pages.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
pub struct LocalFetcher {
    client: reqwest::Client,
    cache: Option<FsCache>,
    pages: Arc<PageCache>,
    policy: ContentPolicy,
    timeout: Duration,
    max_bytes: usize,
}

impl LocalFetcher {
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("webanswer/0.1")
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            cache: cache_dir.map(FsCache::new),
            pages: Arc::new(PageCache::default()),
            policy: ContentPolicy::default(),
            timeout: Duration::from_secs(20),
            max_bytes: 5_000_000,
        })
    }

    /// `WEBANSWER_CACHE_DIR` (else `fallback_cache_dir`) enables the body cache;
    /// `WEBANSWER_CACHE_TTL_S` bounds entry age.
    pub fn from_env(fallback_cache_dir: Option<PathBuf>) -> Result<Self> {
        let ttl = env("WEBANSWER_CACHE_TTL_S")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let dir = env("WEBANSWER_CACHE_DIR")
            .map(PathBuf::from)
            .or(fallback_cache_dir);
        let mut f = Self::new(dir)?;
        f.cache = f.cache.map(|c| c.with_ttl(ttl));
        Ok(f)
    }

    pub fn with_policy(mut self, policy: ContentPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn page_cache(&self) -> &PageCache {
        &self.pages
    }

    async fn load_body(&self, raw_url: &str) -> Result<CachedBody> {
        let url = url::Url::parse(raw_url.trim()).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(format!("unsupported scheme: {}", url.scheme())));
        }

        if let Some(cache) = self.cache.clone() {
            let key = url.to_string();
            let hit = tokio::task::spawn_blocking(move || cache.get(&key))
                .await
                .map_err(|e| Error::Cache(format!("cache get join failed: {e}")))?;
            match hit {
                Ok(Some(body)) => return Ok(body),
                Ok(None) => {}
                Err(e) => warn!(url = %url, error = %e, "cache read failed"),
            }
        }

        let resp = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("HTTP {status}")));
        }
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Fetch(e.to_string()))?;
            if bytes.len().saturating_add(chunk.len()) > self.max_bytes {
                let can_take = self.max_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = CachedBody {
            final_url,
            status: status.as_u16(),
            content_type,
            bytes,
        };

        if let Some(cache) = self.cache.clone() {
            let key = url.to_string();
            let body2 = body.clone();
            let put = tokio::task::spawn_blocking(move || cache.put(&key, &body2))
                .await
                .map_err(|e| Error::Cache(format!("cache put join failed: {e}")))?;
            if let Err(e) = put {
                warn!(url = %url, error = %e, "cache write failed");
            }
        }
        Ok(body)
    }

    fn readable_text(&self, body: &CachedBody, policy: &ContentPolicy) -> Result<(String, Vec<String>)> {
        let ct = content_type_lc_prefix(body.content_type.as_deref());
        let is_html = ct == "text/html"
            || ct == "application/xhtml+xml"
            || (ct.is_empty() && bytes_look_like_html(&body.bytes));
        if is_html {
            let html = String::from_utf8_lossy(&body.bytes);
            let s = sanitize_html(&html, Some(&body.final_url), policy);
            return Ok((s.text, s.iframe_urls));
        }
        match plain_text_body(&body.bytes, body.content_type.as_deref()) {
            Some(text) => Ok((text, Vec::new())),
            None => Err(Error::Fetch(format!(
                "unsupported content type: {}",
                body.content_type.as_deref().unwrap_or("unknown")
            ))),
        }
    }

    /// Sanitized text for `url`, with embedded frames (one level deep) appended.
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let body = self.load_body(url).await?;
        let (mut text, frames) = self.readable_text(&body, &self.policy)?;

        if self.policy.process_iframes {
            let frame_policy = ContentPolicy {
                process_iframes: false,
                ..self.policy.clone()
            };
            for frame in frames {
                let frame_text = match self.load_body(&frame).await {
                    Ok(b) => self.readable_text(&b, &frame_policy).map(|(t, _)| t),
                    Err(e) => Err(e),
                };
                match frame_text {
                    Ok(t) if !t.trim().is_empty() => {
                        if !text.is_empty() {
                            text.push_str("\n\n");
                        }
                        text.push_str(t.trim());
                    }
                    Ok(_) => {}
                    Err(e) => debug!(frame = %frame, error = %e, "skipping iframe"),
                }
            }
        }

        if text.trim().is_empty() {
            return Err(Error::Fetch("no readable content".to_string()));
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl PageFetcher for LocalFetcher {
    async fn fetch(&self, url: &str) -> FetchedPage {
        if let Some(hit) = self.pages.get(url) {
            debug!(url, "page cache hit");
            return FetchedPage {
                url: url.to_string(),
                ..hit
            };
        }
        match self.fetch_text(url).await {
            Ok(text) => {
                let page = FetchedPage::ok(url, text);
                self.pages.insert(page.clone());
                page
            }
            Err(e) => {
                warn!(url, error = %e, "fetch failed");
                FetchedPage::failed(url, e.to_string())
            }
        }
    }
}
