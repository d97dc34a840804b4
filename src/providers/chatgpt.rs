use std::sync::LazyLock;

use scraper::Selector;

use super::{Provider, ProviderAdapter, absolute_images};
use crate::model::{Role, Turn};
use crate::page::PageContext;

static TURN_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"article[data-testid^="conversation-turn-"]"#).unwrap()
});
static USER_MSG_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"[data-message-author-role="user"]"#).unwrap()
});
static ASSISTANT_MSG_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"[data-message-author-role="assistant"]"#).unwrap()
});
static USER_TEXT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".whitespace-pre-wrap").unwrap());
static MARKDOWN_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".markdown").unwrap());

/// UI icons served from the sprite sheet.
const NOISE: &[&str] = &["sprites"];

pub struct ChatGptAdapter;

impl ProviderAdapter for ChatGptAdapter {
    fn provider(&self) -> Provider {
        Provider::ChatGpt
    }

    fn matches_host(&self, host: &str) -> bool {
        host.contains("chat.openai.com") || host.contains("chatgpt.com")
    }

    fn collect_turns(&self, page: &PageContext) -> (Vec<Turn>, usize) {
        let mut turns = Vec::new();
        let mut raw = 0;

        for node in page.document().select(&TURN_SEL) {
            raw += 1;
            let role = match node.value().attr("data-turn") {
                Some(r) if r.eq_ignore_ascii_case("user") => Role::User,
                Some(_) => Role::Assistant,
                None if node.select(&USER_MSG_SEL).next().is_some() => Role::User,
                None => Role::Assistant,
            };

            let (msg_sel, body_sel, default_alt) = match role {
                Role::User => (&*USER_MSG_SEL, &*USER_TEXT_SEL, "User Image"),
                Role::Assistant => (&*ASSISTANT_MSG_SEL, &*MARKDOWN_SEL, "Generated Image"),
            };
            // Without a message node, fall back to the whole article.
            let scope = node.select(msg_sel).next().unwrap_or(node);
            let body = scope.select(body_sel).next().unwrap_or(scope);

            let turn = Turn::single(
                role,
                body.inner_html(),
                absolute_images(scope, role, default_alt, NOISE),
            );
            if !turn.is_empty() {
                turns.push(turn);
            }
        }
        (turns, raw)
    }
}
