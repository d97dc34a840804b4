//! Vendor detection and per-vendor conversation extraction.
//!
//! Each adapter knows the DOM markers of one chat application and turns a
//! [`PageContext`] into canonical [`Turn`]s. Everything downstream is
//! vendor-agnostic.

mod chatgpt;
mod claude;
mod gemini;
mod grok;

use std::sync::LazyLock;

use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PageUnavailable;
use crate::model::{Extraction, ExtractionResult, MediaRef, Role, Turn};
use crate::page::PageContext;
use crate::utils::host_of;

pub use chatgpt::ChatGptAdapter;
pub use claude::ClaudeAdapter;
pub use gemini::GeminiAdapter;
pub use grok::GrokAdapter;

static IMG_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").unwrap());

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "ChatGPT")]
    ChatGpt,
    Claude,
    Gemini,
    Grok,
    Copilot,
    Perplexity,
    Unknown,
}

impl Provider {
    pub fn label(&self) -> &'static str {
        match self {
            Provider::ChatGpt => "ChatGPT",
            Provider::Claude => "Claude",
            Provider::Gemini => "Gemini",
            Provider::Grok => "Grok",
            Provider::Copilot => "Copilot",
            Provider::Perplexity => "Perplexity",
            Provider::Unknown => "Unknown",
        }
    }

    /// Where conversations of this vendor live, for error messages.
    pub fn home(&self) -> &'static str {
        match self {
            Provider::ChatGpt => "chatgpt.com",
            Provider::Claude => "claude.ai",
            Provider::Gemini => "gemini.google.com",
            Provider::Grok => "grok.com",
            Provider::Copilot => "copilot.microsoft.com",
            Provider::Perplexity => "perplexity.ai",
            Provider::Unknown => "a supported chat site",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

pub fn provider_for_host(host: &str) -> Provider {
    let host = host.to_ascii_lowercase();
    if host.contains("chat.openai.com") || host.contains("chatgpt.com") {
        Provider::ChatGpt
    } else if host.contains("claude.ai") {
        Provider::Claude
    } else if host.contains("gemini.google.com") {
        Provider::Gemini
    } else if host.contains("grok.com") {
        Provider::Grok
    } else if host.contains("copilot.microsoft.com") {
        Provider::Copilot
    } else if host.contains("perplexity.ai") {
        Provider::Perplexity
    } else {
        Provider::Unknown
    }
}

pub fn detect_provider(url: &str) -> Provider {
    host_of(url)
        .map(|h| provider_for_host(&h))
        .unwrap_or(Provider::Unknown)
}

/// Extraction for one vendor.
///
/// Implementors supply the vendor markers through [`collect_turns`]; the
/// provided [`extract`] checks the page origin first and never walks the
/// DOM of a foreign page.
///
/// [`collect_turns`]: ProviderAdapter::collect_turns
/// [`extract`]: ProviderAdapter::extract
pub trait ProviderAdapter: Sync {
    fn provider(&self) -> Provider;

    fn matches_host(&self, host: &str) -> bool;

    /// Turns in document order, plus how many turn containers were matched
    /// before empty ones were dropped.
    fn collect_turns(&self, page: &PageContext) -> (Vec<Turn>, usize);

    fn extract(&self, page: &PageContext) -> Result<ExtractionResult, PageUnavailable> {
        let Some(host) = page.host() else {
            return Err(PageUnavailable(format!("{} has no host", page.url())));
        };
        if !self.matches_host(&host) {
            return Ok(ExtractionResult::WrongSite {
                expected: self.provider(),
                url: page.url().to_string(),
            });
        }

        let (turns, raw_turn_count) = self.collect_turns(page);
        let title = page
            .title()
            .unwrap_or_else(|| format!("{} Conversation", self.provider().label()));
        debug!(
            provider = %self.provider(),
            turns = turns.len(),
            raw_turn_count,
            "extracted conversation"
        );
        Ok(ExtractionResult::Extracted(Extraction::new(
            self.provider(),
            page.url().as_str(),
            title,
            turns,
            raw_turn_count,
        )))
    }
}

/// The adapter registered for `provider`, if any.
pub fn adapter_for(provider: Provider) -> Option<&'static dyn ProviderAdapter> {
    match provider {
        Provider::ChatGpt => Some(&ChatGptAdapter),
        Provider::Claude => Some(&ClaudeAdapter),
        Provider::Gemini => Some(&GeminiAdapter),
        Provider::Grok => Some(&GrokAdapter),
        Provider::Copilot | Provider::Perplexity | Provider::Unknown => None,
    }
}

/// Trimmed `alt`, or `default` when missing or blank.
pub(crate) fn alt_or(img: ElementRef<'_>, default: &str) -> String {
    img.value()
        .attr("alt")
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Images under `scope` with an absolute `http(s)` source whose URL contains
/// none of the `deny` patterns.
pub(crate) fn absolute_images(
    scope: ElementRef<'_>,
    role: Role,
    default_alt: &str,
    deny: &[&str],
) -> Vec<MediaRef> {
    scope
        .select(&IMG_SEL)
        .filter_map(|img| {
            let src = img.value().attr("src")?.trim();
            if !src.starts_with("http") || deny.iter().any(|d| src.contains(d)) {
                return None;
            }
            Some(MediaRef::image(src, alt_or(img, default_alt), role))
        })
        .collect()
}
