use crate::{ChatMessage, CompletionBackend, CompletionRequest, Error, FetchedPage, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Answer text used when no page content was available; no model call is made for it.
pub const NO_CONTENT_ANSWER: &str = "No web content found.";

const PAGE_SEPARATOR: &str = "==========";

const INSTRUCTION_TEMPLATE: &str = "\
Below are some pages crawled from the web. Please read through them carefully and answer the question.
Web content:
{context}
===== End of web content =====
Question: {question}
";

pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

/// A successfully fetched page with its provenance index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextPage {
    pub index: usize,
    pub url: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Answer {
    pub fn no_content() -> Self {
        Self {
            text: NO_CONTENT_ANSWER.to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

/// Keep successful pages, in input order, numbering them from 0.
pub fn context_pages(pages: Vec<FetchedPage>) -> Vec<ContextPage> {
    pages
        .into_iter()
        .filter(|p| p.success)
        .filter_map(|p| p.content.map(|content| (p.url, content)))
        .enumerate()
        .map(|(index, (url, content))| ContextPage {
            index,
            url,
            content,
        })
        .collect()
}

/// Render pages as `[index] source: <url>\n<content>\n<separator>\n`, concatenated.
///
/// No truncation happens here; the model's input limit is the bound.
pub fn aggregate_context(pages: &[ContextPage]) -> String {
    let mut out = String::new();
    for p in pages {
        out.push_str(&format!(
            "[{}] source: {}\n{}\n{PAGE_SEPARATOR}\n",
            p.index, p.url, p.content
        ));
    }
    out
}

/// Fill the instruction template in a single left-to-right pass, so placeholder-like
/// text inside scraped pages is never substituted.
pub fn render_prompt(context: &str, question: &str) -> String {
    let mut out = String::with_capacity(INSTRUCTION_TEMPLATE.len() + context.len() + question.len());
    let mut rest = INSTRUCTION_TEMPLATE;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        if let Some(after) = tail.strip_prefix("{context}") {
            out.push_str(context);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{question}") {
            out.push_str(question);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Issues at most one completion per call, over aggregated page context.
#[derive(Clone)]
pub struct Synthesizer {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl Synthesizer {
    pub fn new(backend: Arc<dyn CompletionBackend>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Empty context short-circuits to [`Answer::no_content`] without touching the backend.
    /// Backend failures surface as `Error::Synthesis`.
    pub async fn synthesize(&self, pages: &[ContextPage], question: &str) -> Result<Answer> {
        let context = aggregate_context(pages);
        if context.is_empty() {
            return Ok(Answer::no_content());
        }
        let req = CompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user(render_prompt(&context, question))],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let completion = self.backend.complete(&req).await.map_err(|e| match e {
            Error::Synthesis(m) => Error::Synthesis(m),
            other => Error::Synthesis(other.to_string()),
        })?;
        Ok(Answer {
            text: completion.text,
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
        })
    }
}
