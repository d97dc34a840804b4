use std::sync::LazyLock;

use scraper::{ElementRef, Selector};

use super::{IMG_SEL, Provider, ProviderAdapter, alt_or};
use crate::model::{MediaRef, Role, Turn};
use crate::page::PageContext;

static MESSAGE_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"div[data-testid="user-message"], div.font-claude-response"#).unwrap()
});
static RENDER_COUNT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div[data-test-render-count]").unwrap());

pub struct ClaudeAdapter;

impl ProviderAdapter for ClaudeAdapter {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    fn matches_host(&self, host: &str) -> bool {
        host.contains("claude.ai")
    }

    fn collect_turns(&self, page: &PageContext) -> (Vec<Turn>, usize) {
        let mut turns = Vec::new();
        let mut raw = 0;

        for node in page.document().select(&MESSAGE_SEL) {
            raw += 1;
            let is_user = node.value().attr("data-testid") == Some("user-message");
            let turn = if is_user {
                // Attachments render beside the message, inside the turn wrapper.
                let media = node
                    .ancestors()
                    .filter_map(ElementRef::wrap)
                    .find(|a| RENDER_COUNT_SEL.matches(a))
                    .map(|container| uploaded_images(page, container))
                    .unwrap_or_default();
                Turn::single(Role::User, node.inner_html(), media)
            } else {
                Turn::single(Role::Assistant, node.inner_html(), Vec::new())
            };
            if !turn.is_empty() {
                turns.push(turn);
            }
        }
        (turns, raw)
    }
}

/// Uploads are served from the app's own `/api/` routes, often root-relative.
fn uploaded_images(page: &PageContext, container: ElementRef<'_>) -> Vec<MediaRef> {
    container
        .select(&IMG_SEL)
        .filter_map(|img| {
            let src = img.value().attr("src")?.trim();
            if !src.contains("/api/") {
                return None;
            }
            let src = if src.starts_with('/') {
                page.resolve(src)?
            } else if src.starts_with("http") {
                src.to_string()
            } else {
                return None;
            };
            Some(MediaRef::image(src, alt_or(img, "image"), Role::User))
        })
        .collect()
}
