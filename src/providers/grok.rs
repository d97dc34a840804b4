use std::sync::LazyLock;

use scraper::Selector;

use super::{Provider, ProviderAdapter, absolute_images};
use crate::model::{Role, Turn};
use crate::page::PageContext;

static MESSAGE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"[id^="response-"]"#).unwrap());
static CONTENT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".response-content-markdown").unwrap());
static VIEWER_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"[data-testid="image-viewer"]"#).unwrap());

pub struct GrokAdapter;

impl ProviderAdapter for GrokAdapter {
    fn provider(&self) -> Provider {
        Provider::Grok
    }

    fn matches_host(&self, host: &str) -> bool {
        host.contains("grok.com")
    }

    fn collect_turns(&self, page: &PageContext) -> (Vec<Turn>, usize) {
        let mut turns = Vec::new();
        let mut raw = 0;

        for node in page.document().select(&MESSAGE_SEL) {
            raw += 1;
            // User bubbles are right-aligned.
            let role = if node.value().classes().any(|c| c == "items-end") {
                Role::User
            } else {
                Role::Assistant
            };
            let html = node
                .select(&CONTENT_SEL)
                .next()
                .map(|e| e.inner_html())
                .unwrap_or_default();
            let media = node
                .select(&VIEWER_SEL)
                .next()
                .map(|viewer| absolute_images(viewer, role, "image", &[]))
                .unwrap_or_default();

            let turn = Turn::single(role, html, media);
            if !turn.is_empty() {
                turns.push(turn);
            }
        }
        (turns, raw)
    }
}
