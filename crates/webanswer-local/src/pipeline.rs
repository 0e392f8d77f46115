//! Orchestration: reformulate, search with one failover, fetch concurrently, synthesize.

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use webanswer_core::{
    context_pages, reformulate_query, Answer, Error, FetchedPage, PageFetcher, Result,
    SearchProvider, SearchQuery, SearchResponse, Synthesizer,
};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_results: usize,
    /// Upper bound on in-flight page fetches.
    pub fetch_concurrency: usize,
    /// Bound on the whole run; no stage starts after it passes.
    pub deadline: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_results: 3,
            fetch_concurrency: 3,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub query: String,
    pub search_query: String,
    /// Provider that produced `urls`.
    pub provider: String,
    pub urls: Vec<String>,
    /// One entry per URL, in `urls` order, failures included.
    pub pages: Vec<FetchedPage>,
    pub answer: Answer,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlAnswer {
    pub page: FetchedPage,
    pub answer: Answer,
}

pub struct Pipeline {
    secondary: Arc<dyn SearchProvider>,
    primary: Option<Arc<dyn SearchProvider>>,
    fetcher: Arc<dyn PageFetcher>,
    synthesizer: Synthesizer,
    config: PipelineConfig,
}

async fn within<F: Future>(
    deadline: Option<Instant>,
    stage: &'static str,
    fut: F,
) -> Result<F::Output> {
    match deadline {
        Some(at) => {
            if Instant::now() >= at {
                return Err(Error::DeadlineExceeded { stage });
            }
            tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| Error::DeadlineExceeded { stage })
        }
        None => Ok(fut.await),
    }
}

impl Pipeline {
    /// `secondary` is tried first; `primary` is the single fallback.
    pub fn new(
        secondary: Arc<dyn SearchProvider>,
        primary: Option<Arc<dyn SearchProvider>>,
        fetcher: Arc<dyn PageFetcher>,
        synthesizer: Synthesizer,
    ) -> Self {
        Self {
            secondary,
            primary,
            fetcher,
            synthesizer,
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    async fn search_with_failover(&self, q: &SearchQuery) -> Result<(SearchResponse, bool)> {
        let first = match self.secondary.search(q).await {
            Ok(r) => return Ok((r, false)),
            Err(e) => e,
        };
        warn!(provider = self.secondary.name(), error = %first, "search failed");

        let Some(primary) = &self.primary else {
            return Err(Error::SearchUnavailable(format!(
                "{}: {first}; no fallback provider configured",
                self.secondary.name()
            )));
        };
        info!(from = self.secondary.name(), to = primary.name(), "provider failover");
        match primary.search(q).await {
            Ok(r) => Ok((r, true)),
            Err(second) => Err(Error::SearchUnavailable(format!(
                "{}: {first}; {}: {second}",
                self.secondary.name(),
                primary.name()
            ))),
        }
    }

    /// Fetch every URL with bounded concurrency; output order follows input order.
    async fn fetch_all(&self, urls: &[String]) -> Vec<FetchedPage> {
        let limit = self.config.fetch_concurrency.max(1);
        stream::iter(urls.iter().cloned())
            .map(|u| {
                let fetcher = self.fetcher.clone();
                async move { fetcher.fetch(&u).await }
            })
            .buffered(limit)
            .collect()
            .await
    }

    pub async fn run(&self, query: &str) -> Result<PipelineReport> {
        let deadline = self.config.deadline.map(|d| Instant::now() + d);
        let search_query = reformulate_query(query);
        let mut warnings = Vec::new();

        let sq = SearchQuery::new(search_query.clone(), self.config.max_results);
        let (resp, failed_over) =
            within(deadline, "search", self.search_with_failover(&sq)).await??;
        if failed_over {
            warnings.push("provider_failover".to_string());
        }

        if resp.urls.is_empty() {
            warnings.push("no_search_results".to_string());
            info!(provider = %resp.provider, "no search results");
            return Ok(PipelineReport {
                query: query.to_string(),
                search_query,
                provider: resp.provider,
                urls: Vec::new(),
                pages: Vec::new(),
                answer: Answer::no_content(),
                warnings,
            });
        }

        let pages = within(deadline, "fetch", self.fetch_all(&resp.urls)).await?;
        for p in pages.iter().filter(|p| !p.success) {
            warnings.push(format!("fetch_failed:{}", p.url));
        }

        let context = context_pages(pages.clone());
        let answer = within(
            deadline,
            "synthesis",
            self.synthesizer.synthesize(&context, query),
        )
        .await??;

        info!(
            provider = %resp.provider,
            urls = resp.urls.len(),
            pages = context.len(),
            prompt_tokens = answer.prompt_tokens,
            completion_tokens = answer.completion_tokens,
            "pipeline finished"
        );
        Ok(PipelineReport {
            query: query.to_string(),
            search_query,
            provider: resp.provider,
            urls: resp.urls,
            pages,
            answer,
            warnings,
        })
    }

    /// Answer `question` from a single page. A failed fetch yields the no-content answer.
    pub async fn answer_about_url(&self, url: &str, question: &str) -> Result<UrlAnswer> {
        let deadline = self.config.deadline.map(|d| Instant::now() + d);
        let page = within(deadline, "fetch", self.fetcher.fetch(url)).await?;
        let context = context_pages(vec![page.clone()]);
        let answer = within(
            deadline,
            "synthesis",
            self.synthesizer.synthesize(&context, question),
        )
        .await??;
        Ok(UrlAnswer { page, answer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use webanswer_core::{Completion, CompletionBackend, CompletionRequest, NO_CONTENT_ANSWER};

    struct FakeSearch {
        name: &'static str,
        urls: Option<Vec<String>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl FakeSearch {
        fn ok(name: &'static str, urls: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name,
                urls: Some(urls.iter().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                urls: None,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl SearchProvider for FakeSearch {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(q.query.clone());
            match &self.urls {
                Some(urls) => Ok(SearchResponse {
                    urls: urls.iter().take(q.max_results).cloned().collect(),
                    provider: self.name.to_string(),
                    timings_ms: BTreeMap::new(),
                }),
                None => Err(Error::SearchUnavailable("quota exceeded".to_string())),
            }
        }
    }

    #[derive(Default)]
    struct FakeFetcher {
        failing: Vec<String>,
        delays_ms: HashMap<String, u64>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> FetchedPage {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ms) = self.delays_ms.get(url) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            if self.failing.iter().any(|u| u == url) {
                FetchedPage::failed(url, "HTTP 500")
            } else {
                FetchedPage::ok(url, format!("content of {url}"))
            }
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CompletionBackend for FakeBackend {
        async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts
                .lock()
                .unwrap()
                .push(req.messages[0].content.clone());
            Ok(Completion {
                text: "answer".to_string(),
                prompt_tokens: 10,
                completion_tokens: 2,
            })
        }
    }

    const URLS: [&str; 3] = ["https://a.example/", "https://b.example/", "https://c.example/"];

    fn pipeline(
        secondary: Arc<FakeSearch>,
        primary: Option<Arc<FakeSearch>>,
        fetcher: Arc<FakeFetcher>,
        backend: Arc<FakeBackend>,
    ) -> Pipeline {
        Pipeline::new(
            secondary,
            primary.map(|p| p as Arc<dyn SearchProvider>),
            fetcher,
            Synthesizer::new(backend, "m"),
        )
    }

    #[tokio::test]
    async fn secondary_success_never_touches_primary() {
        let secondary = FakeSearch::ok("ddg", &URLS);
        let primary = FakeSearch::ok("google", &URLS);
        let fetcher = Arc::new(FakeFetcher::default());
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(secondary.clone(), Some(primary.clone()), fetcher, backend);

        let r = p.run("capital of France site:wiki.example").await.unwrap();
        assert_eq!(r.provider, "ddg");
        assert_eq!(r.search_query, "capital of France");
        assert_eq!(secondary.seen.lock().unwrap().as_slice(), ["capital of France"]);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 0);
        assert!(r.warnings.is_empty());
    }

    #[tokio::test]
    async fn secondary_failure_fails_over_once() {
        let secondary = FakeSearch::failing("ddg");
        let primary = FakeSearch::ok("google", &URLS);
        let fetcher = Arc::new(FakeFetcher::default());
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(secondary.clone(), Some(primary.clone()), fetcher, backend.clone());

        let r = p.run("q").await.unwrap();
        assert_eq!(r.provider, "google");
        assert_eq!(r.urls.len(), 3);
        assert!(r.warnings.contains(&"provider_failover".to_string()));
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn both_providers_failing_skips_fetch_and_synthesis() {
        let secondary = FakeSearch::failing("ddg");
        let primary = FakeSearch::failing("google");
        let fetcher = Arc::new(FakeFetcher::default());
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(secondary, Some(primary), fetcher.clone(), backend.clone());

        let err = p.run("q").await.unwrap_err();
        assert!(matches!(err, Error::SearchUnavailable(_)));
        assert_eq!(err.stage(), "search");
        let msg = err.to_string();
        assert!(msg.contains("ddg") && msg.contains("google"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_fallback_surfaces_search_unavailable() {
        let fetcher = Arc::new(FakeFetcher::default());
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(FakeSearch::failing("ddg"), None, fetcher.clone(), backend);
        let err = p.run("q").await.unwrap_err();
        assert!(matches!(err, Error::SearchUnavailable(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_fetch_is_dropped_and_order_is_kept() {
        let fetcher = Arc::new(FakeFetcher {
            failing: vec![URLS[1].to_string()],
            ..Default::default()
        });
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(FakeSearch::ok("ddg", &URLS), None, fetcher, backend.clone());

        let r = p.run("q").await.unwrap();
        assert_eq!(r.pages.len(), 3);
        assert_eq!(context_pages(r.pages.clone()).len(), 2);
        assert_eq!(r.warnings, vec![format!("fetch_failed:{}", URLS[1])]);
        assert_eq!(r.answer.text, "answer");

        let prompt = backend.prompts.lock().unwrap()[0].clone();
        let a = prompt.find("[0] source: https://a.example/").unwrap();
        let c = prompt.find("[1] source: https://c.example/").unwrap();
        assert!(a < c);
        assert!(!prompt.contains("b.example"));
    }

    #[tokio::test]
    async fn completion_order_does_not_reorder_context() {
        let mut delays_ms = HashMap::new();
        delays_ms.insert(URLS[0].to_string(), 80);
        delays_ms.insert(URLS[2].to_string(), 30);
        let fetcher = Arc::new(FakeFetcher {
            delays_ms,
            ..Default::default()
        });
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(FakeSearch::ok("ddg", &URLS), None, fetcher, backend);

        let r = p.run("q").await.unwrap();
        let got: Vec<&str> = r.pages.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(got, URLS);
    }

    #[tokio::test]
    async fn zero_results_short_circuit_to_sentinel() {
        let fetcher = Arc::new(FakeFetcher::default());
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(FakeSearch::ok("ddg", &[]), None, fetcher.clone(), backend.clone());

        let r = p.run("q").await.unwrap();
        assert_eq!(r.answer.text, NO_CONTENT_ANSWER);
        assert_eq!(r.answer.prompt_tokens, 0);
        assert!(r.warnings.contains(&"no_search_results".to_string()));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_fetches_failing_yields_sentinel_without_model_call() {
        let fetcher = Arc::new(FakeFetcher {
            failing: URLS.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        });
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(FakeSearch::ok("ddg", &URLS), None, fetcher, backend.clone());

        let r = p.run("q").await.unwrap();
        assert_eq!(r.answer.text, NO_CONTENT_ANSWER);
        assert_eq!(r.warnings.len(), 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn result_count_is_honored() {
        let fetcher = Arc::new(FakeFetcher::default());
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(FakeSearch::ok("ddg", &URLS), None, fetcher.clone(), backend)
            .with_config(PipelineConfig {
                max_results: 2,
                fetch_concurrency: 1,
                deadline: None,
            });
        let r = p.run("q").await.unwrap();
        assert_eq!(r.urls.len(), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deadline_stops_the_run_before_synthesis() {
        let mut delays_ms = HashMap::new();
        delays_ms.insert(URLS[0].to_string(), 2_000);
        let fetcher = Arc::new(FakeFetcher {
            delays_ms,
            ..Default::default()
        });
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(FakeSearch::ok("ddg", &URLS), None, fetcher, backend.clone())
            .with_config(PipelineConfig {
                deadline: Some(Duration::from_millis(50)),
                ..Default::default()
            });

        let err = p.run("q").await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { stage: "fetch" }));
        assert_eq!(err.stage(), "fetch");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn answer_about_url_uses_one_page() {
        let fetcher = Arc::new(FakeFetcher {
            failing: vec!["https://down.example/".to_string()],
            ..Default::default()
        });
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(FakeSearch::failing("ddg"), None, fetcher, backend.clone());

        let ok = p
            .answer_about_url("https://a.example/", "what is it?")
            .await
            .unwrap();
        assert!(ok.page.success);
        assert_eq!(ok.answer.text, "answer");
        let prompt = backend.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("[0] source: https://a.example/"));
        assert!(prompt.contains("Question: what is it?"));

        let down = p
            .answer_about_url("https://down.example/", "what is it?")
            .await
            .unwrap();
        assert!(!down.page.success);
        assert_eq!(down.answer.text, NO_CONTENT_ANSWER);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
