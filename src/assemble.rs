//! Canonical turns -> one Markdown body.

use crate::markdown::html_to_markdown;
use crate::model::{MediaKind, MediaMap, MediaRef, Role, Turn, TurnBody};
use crate::utils::ATTACHMENTS_FOLDER;

/// Render `turns` in order, substituting downloaded media.
///
/// Each turn becomes a `## <role>` block followed by its media; turns are
/// separated by `---` and the trailing separator is dropped. Media missing
/// from `media` (failed or skipped downloads) is left out silently.
pub fn assemble(turns: &[Turn], media: &MediaMap, media_folder: &str) -> String {
    let mut blocks: Vec<String> = Vec::new();

    for turn in turns {
        match &turn.body {
            TurnBody::Single { role, html } => {
                blocks.push(role_block(*role, &html_to_markdown(html)));
                for item in &turn.media {
                    push_media(&mut blocks, item, media, media_folder);
                }
            }
            TurnBody::Paired {
                user_html,
                model_html,
            } => {
                for (role, html) in [(Role::User, user_html), (Role::Assistant, model_html)] {
                    let text = html_to_markdown(html);
                    if !text.is_empty() {
                        blocks.push(role_block(role, &text));
                    }
                    for kind in [MediaKind::Image, MediaKind::Video] {
                        for item in turn.media.iter().filter(|m| m.role == role && m.kind == kind) {
                            push_media(&mut blocks, item, media, media_folder);
                        }
                    }
                }
            }
        }
        blocks.push("---\n".to_string());
    }

    let md = blocks.join("\n");
    let md = md.trim();
    md.strip_suffix("---").unwrap_or(md).trim().to_string()
}

fn role_block(role: Role, text: &str) -> String {
    if text.is_empty() {
        format!("## {}\n", role)
    } else {
        format!("## {}\n\n{}\n", role, text)
    }
}

fn push_media(blocks: &mut Vec<String>, item: &MediaRef, media: &MediaMap, folder: &str) {
    let Some(entry) = media.get(&item.src) else {
        return;
    };
    let file = &entry.file_name;
    let link = match entry.kind {
        MediaKind::Image => format!(
            "![{}](../{}/{}/{})",
            entry.alt, ATTACHMENTS_FOLDER, folder, file
        ),
        MediaKind::Video => format!("[🎬 Video](../{}/{}/{})", ATTACHMENTS_FOLDER, folder, file),
    };
    blocks.push(format!("![[{}/{}]]\n\n{}\n", folder, file, link));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaEntry;

    fn entry(file: &str, kind: MediaKind) -> MediaEntry {
        MediaEntry {
            file_name: file.into(),
            alt: "imgA".into(),
            kind,
            sha256: String::new(),
        }
    }

    #[test]
    fn three_turns_with_one_image() {
        let img = MediaRef::image("https://x/a", "imgA", Role::Assistant);
        let turns = vec![
            Turn::single(Role::User, "<p>hi</p>", vec![]),
            Turn::single(Role::Assistant, "<p>hello</p>", vec![img]),
            Turn::single(Role::User, "<p>bye</p>", vec![]),
        ];
        let map = MediaMap::from([("https://x/a".to_string(), entry("imgA.png", MediaKind::Image))]);
        let md = assemble(&turns, &map, "Chat");

        assert_eq!(
            md,
            "## user\n\nhi\n\n---\n\n\
             ## assistant\n\nhello\n\n\
             ![[Chat/imgA.png]]\n\n![imgA](../98. Attachments/Chat/imgA.png)\n\n---\n\n\
             ## user\n\nbye"
        );
        let blocks: Vec<&str> = md.split("\n---\n").collect();
        assert_eq!(blocks.len(), 3);
        assert!(blocks[1].find("## assistant").unwrap() < blocks[1].find("![[").unwrap());
        assert!(!md.ends_with("---"));
    }

    #[test]
    fn missing_media_is_skipped_without_touching_text() {
        let turns = vec![Turn::single(
            Role::Assistant,
            "<p>look</p>",
            vec![MediaRef::image("https://x/404", "gone", Role::Assistant)],
        )];
        assert_eq!(assemble(&turns, &MediaMap::new(), "Chat"), "## assistant\n\nlook");
    }

    #[test]
    fn paired_turns_flatten_user_first() {
        let media = vec![
            MediaRef::video("https://x/v", Role::Assistant),
            MediaRef::image("https://x/model", "m", Role::Assistant),
            MediaRef::image("https://x/user", "u", Role::User),
        ];
        let turns = vec![Turn::paired("<p>q</p>", "<p>a</p>", media)];
        let map = MediaMap::from([
            ("https://x/v".to_string(), entry("video_1_0.mp4", MediaKind::Video)),
            ("https://x/model".to_string(), entry("m.png", MediaKind::Image)),
            ("https://x/user".to_string(), entry("u.png", MediaKind::Image)),
        ]);
        let md = assemble(&turns, &map, "G");

        let pos = |needle: &str| md.find(needle).unwrap();
        assert!(pos("## user") < pos("![[G/u.png]]"));
        assert!(pos("![[G/u.png]]") < pos("## assistant"));
        assert!(pos("## assistant") < pos("![[G/m.png]]"));
        assert!(pos("![[G/m.png]]") < pos("![[G/video_1_0.mp4]]"));
        assert!(md.contains("[🎬 Video](../98. Attachments/G/video_1_0.mp4)"));
    }

    #[test]
    fn paired_turn_with_empty_query_omits_user_heading() {
        let turns = vec![Turn::paired("<button>edit</button>", "<p>a</p>", vec![])];
        assert_eq!(assemble(&turns, &MediaMap::new(), "G"), "## assistant\n\na");
    }
}
