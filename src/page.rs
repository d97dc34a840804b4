//! Loaded page snapshots.
//!
//! A [`PageContext`] is the parsed DOM of one chat page together with the URL
//! it was captured from. Adapters only ever read from it.

use std::path::PathBuf;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

use crate::error::PageUnavailable;

static TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());

pub struct PageContext {
    url: Url,
    document: Html,
}

impl PageContext {
    pub fn parse(url: &str, html: &str) -> Result<Self, PageUnavailable> {
        let url = Url::parse(url.trim())
            .map_err(|e| PageUnavailable(format!("invalid page URL {:?}: {}", url, e)))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(PageUnavailable(format!("{} is not a web page", url)));
        }
        if html.trim().is_empty() {
            return Err(PageUnavailable(format!("snapshot of {} is blank", url)));
        }
        Ok(Self {
            url,
            document: Html::parse_document(html),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Lowercased host name.
    pub fn host(&self) -> Option<String> {
        self.url
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .filter(|h| !h.is_empty())
    }

    pub fn document(&self) -> &Html {
        &self.document
    }

    /// Text of `<title>`, if present and non-blank.
    pub fn title(&self) -> Option<String> {
        let title = self.document.select(&TITLE_SEL).next()?;
        let text = title.text().collect::<String>();
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        (!text.is_empty()).then_some(text)
    }

    /// Resolve a root-relative or absolute reference against the page URL.
    pub fn resolve(&self, reference: &str) -> Option<String> {
        self.url.join(reference).ok().map(String::from)
    }
}

/// Anything that can hand over the current page.
pub trait PageSource {
    fn load(&self) -> Result<PageContext, PageUnavailable>;
}

/// An HTML snapshot saved to disk ("Save page as..." or a devtools dump).
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub url: String,
}

impl PageSource for SnapshotFile {
    fn load(&self) -> Result<PageContext, PageUnavailable> {
        let html = std::fs::read_to_string(&self.path).map_err(|e| {
            PageUnavailable(format!("cannot read snapshot {}: {}", self.path.display(), e))
        })?;
        PageContext::parse(&self.url, &html)
    }
}

/// Markup already held in memory (stdin, tests).
#[derive(Debug, Clone)]
pub struct MemoryPage {
    pub url: String,
    pub html: String,
}

impl MemoryPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }
}

impl PageSource for MemoryPage {
    fn load(&self) -> Result<PageContext, PageUnavailable> {
        PageContext::parse(&self.url, &self.html)
    }
}
