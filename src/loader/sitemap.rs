//! Sitemap loader.
//!
//! Fetches a sitemap (`<urlset>`, or a `<sitemapindex>` pointing at more
//! sitemaps), keeps the page URLs that match the configured filters, then
//! fetches each page at a polite rate and reduces it to plain text.
//!
//! Filters are regular expressions anchored at the start of the URL, so
//! `https://example.com/docs/.*` keeps only pages under `/docs/`.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use docchat_core::models::DocumentSource;
use docchat_core::PipelineError;
use quick_xml::events::Event;
use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SitemapConfig;
use crate::progress::{LoadProgressEvent, LoadProgressReporter};

/// Host whose well-known sections are used when no filters are configured.
const CLOUDFLARE_DOCS_HOST: &str = "developers.cloudflare.com";

/// Filters applied to `developers.cloudflare.com` sitemaps when none are
/// configured.
pub const CLOUDFLARE_DEFAULT_FILTERS: &[&str] = &[
    r"https:\/\/developers.cloudflare.com/ai-gateway.*",
    r"https:\/\/developers.cloudflare.com/vectorize.*",
    r"https:\/\/developers.cloudflare.com/workers-ai.*",
];

/// Nested `<sitemapindex>` documents are followed at most this deep.
const MAX_SITEMAP_DEPTH: usize = 3;

/// Elements whose text never reaches the page text.
const SKIPPED_ELEMENTS: &[&str] = &["header", "footer", "script", "style", "noscript", "template"];

/// One `<url>` entry of a `<urlset>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapEntry {
    pub loc: String,
    pub lastmod: Option<String>,
}

/// A parsed sitemap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapDocument {
    UrlSet(Vec<SitemapEntry>),
    /// Locations of child sitemaps.
    Index(Vec<String>),
}

/// Check that `url` looks like a sitemap: http(s) and mentioning `.xml`.
pub fn validate_sitemap_url(url: &str) -> Result<Url, PipelineError> {
    let parsed =
        Url::parse(url).map_err(|e| PipelineError::Load(format!("invalid URL '{url}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(PipelineError::Load(format!(
            "unsupported URL scheme '{}': use http or https",
            parsed.scheme()
        )));
    }
    if !url.contains(".xml") {
        return Err(PipelineError::Load(
            "Please write down a Sitemap URL (it must point at an .xml file).".to_string(),
        ));
    }
    Ok(parsed)
}

/// Parse a sitemap XML document.
pub fn parse_sitemap(xml: &str) -> Result<SitemapDocument, PipelineError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut root: Option<Vec<u8>> = None;
    let mut entries = Vec::new();
    let mut children = Vec::new();
    let mut field: Option<Vec<u8>> = None;
    let mut loc: Option<String> = None;
    let mut lastmod: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                if root.is_none() {
                    root = Some(name);
                } else {
                    field = Some(name);
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| PipelineError::Load(format!("invalid sitemap XML: {e}")))?
                    .trim()
                    .to_string();
                match field.as_deref() {
                    Some(b"loc") => loc = Some(text),
                    Some(b"lastmod") => lastmod = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"url" => {
                    if let Some(loc) = loc.take() {
                        entries.push(SitemapEntry {
                            loc,
                            lastmod: lastmod.take(),
                        });
                    }
                    lastmod = None;
                }
                b"sitemap" => {
                    if let Some(loc) = loc.take() {
                        children.push(loc);
                    }
                    lastmod = None;
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(PipelineError::Load(format!("invalid sitemap XML: {e}"))),
            _ => {}
        }
    }

    match root.as_deref() {
        Some(b"urlset") => Ok(SitemapDocument::UrlSet(entries)),
        Some(b"sitemapindex") => Ok(SitemapDocument::Index(children)),
        Some(other) => Err(PipelineError::Load(format!(
            "not a sitemap: root element is <{}>",
            String::from_utf8_lossy(other)
        ))),
        None => Err(PipelineError::Load("empty sitemap document".to_string())),
    }
}

/// Reduce an HTML page to text: `<header>` and `<footer>` (and scripts)
/// are dropped, and newlines and non-breaking spaces become plain spaces.
pub fn parse_page(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut text = String::new();
    collect_text(document.root_element(), &mut text);
    text.replace('\n', " ").replace('\u{a0}', " ")
}

fn collect_text(element: ElementRef, out: &mut String) {
    if SKIPPED_ELEMENTS.contains(&element.value().name()) {
        return;
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, out);
                }
            }
            _ => {}
        }
    }
}

/// Compile URL filters, anchoring each at the start of the URL.
pub fn compile_filters(patterns: &[String]) -> Result<Vec<Regex>, PipelineError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("^(?:{p})"))
                .map_err(|e| PipelineError::Config(format!("invalid URL filter '{p}': {e}")))
        })
        .collect()
}

/// Time between requests for a politeness rate, or `None` when the rate is
/// not positive or is too high to leave a non-zero gap.
pub fn request_interval(requests_per_second: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(1.0 / requests_per_second)
        .ok()
        .filter(|period| !period.is_zero())
}

/// Loads every page of a sitemap as a [`DocumentSource`].
pub struct SitemapLoader {
    client: reqwest::Client,
    filters: Vec<String>,
    period: Duration,
    max_pages: usize,
}

impl SitemapLoader {
    pub fn new(config: &SitemapConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("docchat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Load(format!("failed to build HTTP client: {e}")))?;
        compile_filters(&config.filter_urls)?;
        let period = request_interval(config.requests_per_second).ok_or_else(|| {
            PipelineError::Config(format!(
                "sitemap.requests_per_second {} gives no usable request interval",
                config.requests_per_second
            ))
        })?;
        Ok(Self {
            client,
            filters: config.filter_urls.clone(),
            period,
            max_pages: config.max_pages,
        })
    }

    /// Filters in effect for `sitemap`: the configured ones, or the
    /// well-known defaults for its host when none are configured.
    pub fn filters_for(&self, sitemap: &Url) -> Result<Vec<Regex>, PipelineError> {
        if self.filters.is_empty() && sitemap.host_str() == Some(CLOUDFLARE_DOCS_HOST) {
            let defaults: Vec<String> = CLOUDFLARE_DEFAULT_FILTERS
                .iter()
                .map(|s| s.to_string())
                .collect();
            return compile_filters(&defaults);
        }
        compile_filters(&self.filters)
    }

    /// Fetch the sitemap at `url` and every page it lists.
    pub async fn load(
        &self,
        url: &str,
        progress: &dyn LoadProgressReporter,
    ) -> Result<Vec<DocumentSource>, PipelineError> {
        let sitemap = validate_sitemap_url(url)?;
        let filters = self.filters_for(&sitemap)?;
        let mut ticker = self.ticker();

        let mut entries = self.discover(sitemap.as_str(), &filters, &mut ticker, progress).await?;
        if self.max_pages > 0 && entries.len() > self.max_pages {
            info!(found = entries.len(), max_pages = self.max_pages, "page cap applied");
            entries.truncate(self.max_pages);
        }
        if entries.is_empty() {
            return Err(PipelineError::Load(format!(
                "no pages in {url} matched the URL filters"
            )));
        }

        let total = entries.len() as u64;
        let mut sources = Vec::with_capacity(entries.len());
        for (i, entry) in entries.into_iter().enumerate() {
            ticker.tick().await;
            progress.report(LoadProgressEvent::Fetching {
                url: entry.loc.clone(),
                n: i as u64 + 1,
                total,
            });
            match self.fetch(&entry.loc).await {
                Ok(html) => {
                    let text = parse_page(&html);
                    if text.trim().is_empty() {
                        debug!(url = %entry.loc, "page has no text");
                        continue;
                    }
                    let mut source = DocumentSource::new(entry.loc.clone(), text).with_url(entry.loc);
                    if let Some(lastmod) = entry.lastmod {
                        source = source.with_lastmod(lastmod);
                    }
                    sources.push(source);
                }
                Err(e) => warn!(url = %entry.loc, error = %e, "page skipped"),
            }
        }

        if sources.is_empty() {
            return Err(PipelineError::Load(format!("no page of {url} could be loaded")));
        }
        info!(sitemap = %url, pages = sources.len(), "sitemap loaded");
        Ok(sources)
    }

    fn ticker(&self) -> Interval {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Walk the sitemap and any nested indexes, collecting matching pages
    /// in document order without duplicates.
    async fn discover(
        &self,
        root: &str,
        filters: &[Regex],
        ticker: &mut Interval,
        progress: &dyn LoadProgressReporter,
    ) -> Result<Vec<SitemapEntry>, PipelineError> {
        let mut queue = VecDeque::from([(root.to_string(), 0usize)]);
        let mut seen_sitemaps = HashSet::new();
        let mut seen_pages = HashSet::new();
        let mut entries = Vec::new();

        while let Some((sitemap, depth)) = queue.pop_front() {
            if !seen_sitemaps.insert(sitemap.clone()) {
                continue;
            }
            ticker.tick().await;
            progress.report(LoadProgressEvent::Discovering {
                sitemap: sitemap.clone(),
            });
            let xml = match self.fetch(&sitemap).await {
                Ok(xml) => xml,
                // The root must load; a broken child sitemap is skipped.
                Err(e) if depth == 0 => return Err(e),
                Err(e) => {
                    warn!(sitemap = %sitemap, error = %e, "child sitemap skipped");
                    continue;
                }
            };

            match parse_sitemap(&xml)? {
                SitemapDocument::UrlSet(urls) => {
                    let before = entries.len();
                    for entry in urls {
                        if matches_filters(filters, &entry.loc) && seen_pages.insert(entry.loc.clone()) {
                            entries.push(entry);
                        }
                    }
                    debug!(sitemap = %sitemap, kept = entries.len() - before, "sitemap parsed");
                }
                SitemapDocument::Index(children) if depth < MAX_SITEMAP_DEPTH => {
                    queue.extend(children.into_iter().map(|c| (c, depth + 1)));
                }
                SitemapDocument::Index(_) => {
                    warn!(sitemap = %sitemap, "sitemap index nested too deep, skipped");
                }
            }
        }
        Ok(entries)
    }

    async fn fetch(&self, url: &str) -> Result<String, PipelineError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::Load(format!("GET {url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Load(format!("GET {url}: HTTP {status}")));
        }
        response
            .text()
            .await
            .map_err(|e| PipelineError::Load(format!("GET {url}: {e}")))
    }
}

/// No filters means every URL is kept.
pub fn matches_filters(filters: &[Regex], url: &str) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.is_match(url))
}
