use std::sync::LazyLock;

use scraper::{ElementRef, Selector};

use super::{IMG_SEL, Provider, ProviderAdapter, alt_or};
use crate::model::{MediaRef, Role, Turn};
use crate::page::PageContext;

static CONTAINER_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".conversation-container").unwrap());
static USER_QUERY_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("user-query").unwrap());
static MODEL_RESPONSE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("model-response").unwrap());
static VIDEO_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("video").unwrap());
static SOURCE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("source[src]").unwrap());

/// Gemini keeps the query and the response of one exchange in a single
/// container, so every turn is [`Turn::paired`].
pub struct GeminiAdapter;

impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn matches_host(&self, host: &str) -> bool {
        host.contains("gemini.google.com")
    }

    fn collect_turns(&self, page: &PageContext) -> (Vec<Turn>, usize) {
        let mut turns = Vec::new();
        let mut raw = 0;

        for node in page.document().select(&CONTAINER_SEL) {
            raw += 1;
            let user_html = node
                .select(&USER_QUERY_SEL)
                .next()
                .map(|e| e.inner_html())
                .unwrap_or_default();
            let model_html = node
                .select(&MODEL_RESPONSE_SEL)
                .next()
                .map(|e| e.inner_html())
                .unwrap_or_default();

            let mut media = Vec::new();
            for img in node.select(&IMG_SEL) {
                let Some(src) = img.value().attr("src").map(str::trim) else {
                    continue;
                };
                if src.starts_with("http") {
                    let role = role_from_ancestors(img, node);
                    media.push(MediaRef::image(src, alt_or(img, "image"), role));
                }
            }
            for video in node.select(&VIDEO_SEL) {
                if let Some(src) = video_src(video) {
                    media.push(MediaRef::video(src, role_from_ancestors(video, node)));
                }
            }

            let turn = Turn::paired(user_html, model_html, media);
            if !turn.is_empty() {
                turns.push(turn);
            }
        }
        (turns, raw)
    }
}

/// Walk up from `el` to the turn container; the first `user-query` or
/// `model-response` on the way decides. Assistant when neither is found.
fn role_from_ancestors(el: ElementRef<'_>, container: ElementRef<'_>) -> Role {
    for ancestor in el.ancestors() {
        if ancestor.id() == container.id() {
            break;
        }
        match ancestor.value().as_element().map(|e| e.name()) {
            Some("user-query") => return Role::User,
            Some("model-response") => return Role::Assistant,
            _ => {}
        }
    }
    Role::Assistant
}

fn video_src(video: ElementRef<'_>) -> Option<String> {
    let src = video
        .value()
        .attr("src")
        .or_else(|| video.select(&SOURCE_SEL).next()?.value().attr("src"))?
        .trim();
    src.starts_with("http").then(|| src.to_string())
}
