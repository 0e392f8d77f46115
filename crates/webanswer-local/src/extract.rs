//! HTML sanitization: turn a fetched page into the readable text that goes into a context.
//!
//! This is a deterministic, structural filter rather than a readability engine:
//! - excluded tags (forms, page headers, nav by default) are dropped with their subtree
//! - overlay/modal containers are dropped
//! - text blocks under a minimum word count are dropped (headings and code are kept)
//! - links to other hosts lose their target; same-site links render as `[text](url)`
//! - `<iframe src>` targets are collected for the fetcher to inline

use html_scraper::{ElementRef, Html, Node};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPolicy {
    /// Tags whose whole subtree is discarded, in addition to non-content tags (script, style, ...).
    pub excluded_tags: Vec<String>,
    /// Minimum words for a paragraph/list block to be kept.
    pub word_count_threshold: usize,
    pub exclude_external_links: bool,
    pub remove_overlays: bool,
    pub process_iframes: bool,
    /// Upper bound on iframes inlined per page.
    pub max_iframes: usize,
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self {
            excluded_tags: vec!["form".to_string(), "header".to_string(), "nav".to_string()],
            word_count_threshold: 10,
            exclude_external_links: true,
            remove_overlays: true,
            process_iframes: true,
            max_iframes: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedHtml {
    pub text: String,
    /// Absolute http(s) URLs of embedded frames, in document order.
    pub iframe_urls: Vec<String>,
}

const NON_CONTENT_TAGS: [&str; 9] = [
    "script", "style", "noscript", "template", "svg", "canvas", "head", "link", "meta",
];

const OVERLAY_MARKERS: [&str; 6] = ["modal", "overlay", "popup", "lightbox", "cookie", "consent"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Heading(u8),
    ListItem,
    Code,
}

fn block_kind(tag: &str) -> Option<BlockKind> {
    Some(match tag {
        "h1" => BlockKind::Heading(1),
        "h2" => BlockKind::Heading(2),
        "h3" => BlockKind::Heading(3),
        "h4" => BlockKind::Heading(4),
        "h5" => BlockKind::Heading(5),
        "h6" => BlockKind::Heading(6),
        "li" | "dt" | "dd" => BlockKind::ListItem,
        "pre" => BlockKind::Code,
        "p" | "div" | "section" | "article" | "main" | "body" | "blockquote" | "ul" | "ol"
        | "dl" | "table" | "tr" | "td" | "th" | "figure" | "figcaption" | "aside" | "footer"
        | "address" | "details" | "summary" => BlockKind::Text,
        _ => return None,
    })
}

pub(crate) fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn class_or_id_lc(el: &ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

fn is_overlay(el: &ElementRef) -> bool {
    let v = el.value();
    if v.name() == "dialog" {
        return true;
    }
    if matches!(v.attr("role"), Some("dialog") | Some("alertdialog")) {
        return true;
    }
    if v.attr("aria-modal").is_some_and(|m| m.eq_ignore_ascii_case("true")) {
        return true;
    }
    // Whole `-`/`_`-separated parts of class/id tokens only: `cookie-banner` matches,
    // `cookies-not-set` does not.
    class_or_id_lc(el)
        .split_whitespace()
        .flat_map(|tok| tok.split(['-', '_']))
        .any(|part| OVERLAY_MARKERS.contains(&part))
}

/// Best-effort guess for whether bytes are HTML-ish.
pub fn bytes_look_like_html(bytes: &[u8]) -> bool {
    let mut i = 0usize;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let rest = &bytes[i..];
    let head: Vec<u8> = rest.iter().take(16).map(|b| b.to_ascii_lowercase()).collect();
    head.starts_with(b"<!doctype")
        || head.starts_with(b"<html")
        || head.starts_with(b"<head")
        || head.starts_with(b"<body")
}

pub fn content_type_lc_prefix(ct: Option<&str>) -> String {
    ct.unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

struct Renderer<'p> {
    policy: &'p ContentPolicy,
    base: Option<url::Url>,
    blocks: Vec<String>,
    inline: String,
    kinds: Vec<BlockKind>,
    iframes: Vec<String>,
}

impl Renderer<'_> {
    fn current_kind(&self) -> BlockKind {
        self.kinds.last().copied().unwrap_or(BlockKind::Text)
    }

    fn flush(&mut self, kind: BlockKind) {
        let raw = std::mem::take(&mut self.inline);
        if kind == BlockKind::Code {
            let code = raw.trim_matches('\n');
            if !code.trim().is_empty() {
                self.blocks.push(code.to_string());
            }
            return;
        }
        let text = norm_ws(&raw);
        if text.is_empty() {
            return;
        }
        match kind {
            BlockKind::Heading(level) => {
                self.blocks
                    .push(format!("{} {text}", "#".repeat(level as usize)));
            }
            BlockKind::ListItem | BlockKind::Text => {
                if text.split_whitespace().count() < self.policy.word_count_threshold {
                    return;
                }
                if kind == BlockKind::ListItem {
                    self.blocks.push(format!("- {text}"));
                } else {
                    self.blocks.push(text);
                }
            }
            BlockKind::Code => {}
        }
    }

    fn resolve(&self, href: &str) -> Option<url::Url> {
        match url::Url::parse(href) {
            Ok(u) => Some(u),
            Err(_) => self.base.as_ref()?.join(href).ok(),
        }
    }

    fn is_same_site(&self, target: &url::Url) -> bool {
        let Some(base) = &self.base else {
            return false;
        };
        let strip = |h: &str| h.trim_start_matches("www.").to_ascii_lowercase();
        match (base.host_str(), target.host_str()) {
            (Some(a), Some(b)) => strip(a) == strip(b),
            _ => false,
        }
    }

    fn walk(&mut self, el: ElementRef) {
        let tag = el.value().name().to_ascii_lowercase();
        if NON_CONTENT_TAGS.contains(&tag.as_str())
            || self
                .policy
                .excluded_tags
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&tag))
        {
            return;
        }
        // Document containers are never overlays, whatever their classes say.
        let container = matches!(tag.as_str(), "html" | "body" | "main");
        if self.policy.remove_overlays && !container && is_overlay(&el) {
            return;
        }

        match tag.as_str() {
            "iframe" => {
                if self.policy.process_iframes {
                    if let Some(u) = el.value().attr("src").and_then(|s| self.resolve(s.trim())) {
                        if matches!(u.scheme(), "http" | "https") {
                            self.iframes.push(u.to_string());
                        }
                    }
                }
                return;
            }
            "br" => {
                self.inline.push('\n');
                return;
            }
            "a" => {
                self.walk_link(el);
                return;
            }
            _ => {}
        }

        match block_kind(&tag) {
            Some(kind) => {
                let parent = self.current_kind();
                self.flush(parent);
                self.kinds.push(kind);
                self.walk_children(el);
                self.flush(kind);
                self.kinds.pop();
            }
            None => self.walk_children(el),
        }
    }

    fn walk_children(&mut self, el: ElementRef) {
        for child in el.children() {
            match child.value() {
                Node::Text(t) => self.inline.push_str(t),
                Node::Element(_) => {
                    if let Some(c) = ElementRef::wrap(child) {
                        self.walk(c);
                    }
                }
                _ => {}
            }
        }
    }

    fn walk_link(&mut self, el: ElementRef) {
        let text = norm_ws(&el.text().collect::<String>());
        if text.is_empty() {
            return;
        }
        let target = el
            .value()
            .attr("href")
            .map(str::trim)
            .filter(|h| !h.is_empty() && !h.starts_with('#'))
            .filter(|h| {
                let lc = h.to_ascii_lowercase();
                !lc.starts_with("javascript:") && !lc.starts_with("mailto:")
            })
            .and_then(|h| self.resolve(h));
        self.inline.push(' ');
        match target {
            Some(mut u) if !self.policy.exclude_external_links || self.is_same_site(&u) => {
                u.set_fragment(None);
                self.inline.push_str(&format!("[{text}]({u})"));
            }
            _ => self.inline.push_str(&text),
        }
        self.inline.push(' ');
    }
}

/// Sanitize an HTML document according to `policy`.
///
/// `base_url` resolves relative links and frames, and decides which links are off-site.
pub fn sanitize_html(html: &str, base_url: Option<&str>, policy: &ContentPolicy) -> SanitizedHtml {
    let doc = Html::parse_document(html);
    let mut r = Renderer {
        policy,
        base: base_url.and_then(|u| url::Url::parse(u).ok()),
        blocks: Vec::new(),
        inline: String::new(),
        kinds: Vec::new(),
        iframes: Vec::new(),
    };
    r.walk(doc.root_element());
    r.flush(BlockKind::Text);

    let mut iframe_urls = Vec::new();
    for u in r.iframes {
        if iframe_urls.len() >= policy.max_iframes {
            break;
        }
        if !iframe_urls.contains(&u) {
            iframe_urls.push(u);
        }
    }
    SanitizedHtml {
        text: r.blocks.join("\n\n"),
        iframe_urls,
    }
}

/// Readable text for a non-HTML body, if the content type is textual.
pub fn plain_text_body(bytes: &[u8], content_type: Option<&str>) -> Option<String> {
    let ct = content_type_lc_prefix(content_type);
    let textual = ct.starts_with("text/")
        || ct == "application/json"
        || ct == "application/xml"
        || ct.ends_with("+json")
        || ct.ends_with("+xml");
    if !textual {
        return None;
    }
    Some(String::from_utf8_lossy(bytes).trim().to_string())
}
