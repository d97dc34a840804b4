//! Rendered chat markup -> normalized Markdown.
//!
//! ATX headings, fenced code blocks, `-` bullets, inline links. Interactive
//! and non-content elements (buttons, inline SVG, scripts, styles) and all
//! media elements render to nothing: media is downloaded separately and
//! re-inserted by the assembler.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use thiserror::Error;
use tracing::warn;

const MAX_DEPTH: usize = 256;

/// Elements that contribute no text at all.
const SKIPPED: &[&str] = &[
    "button", "svg", "path", "script", "style", "noscript", "template", "img", "picture", "video",
    "audio", "source", "canvas", "iframe", "object", "embed", "input", "select", "textarea",
    "head", "title", "meta", "link",
];

const BLOCKS: &[&str] = &[
    "p", "div", "section", "article", "header", "footer", "main", "aside", "nav", "figure",
    "figcaption", "details", "summary", "dl", "dt", "dd", "address", "form", "fieldset", "center",
];

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static LINE_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:-|\+ |>|#{1,6} |=+|~~~)").unwrap());
static ORDERED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)\. ").unwrap());
static CODE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("code").unwrap());
static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("markup nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Convert a markup fragment to Markdown.
///
/// Never fails: if structured rendering errors out, the tags are stripped
/// from the raw markup instead so the text survives.
pub fn html_to_markdown(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    match render(html) {
        Ok(md) => md,
        Err(e) => {
            warn!(error = %e, "markdown rendering failed, falling back to tag stripping");
            strip_tags(html)
        }
    }
}

/// Structured rendering without the fallback.
pub fn render(html: &str) -> Result<String, RenderError> {
    let fragment = Html::parse_fragment(html);
    let mut renderer = Renderer { depth: 0 };
    let raw = renderer.children(fragment.root_element())?;
    Ok(normalize(&raw))
}

/// Naive fallback: drop everything that looks like a tag.
pub fn strip_tags(html: &str) -> String {
    TAG_RE.replace_all(html, "").trim().to_string()
}

struct Renderer {
    depth: usize,
}

impl Renderer {
    fn children(&mut self, el: ElementRef<'_>) -> Result<String, RenderError> {
        let mut out = String::new();
        for child in el.children() {
            match child.value() {
                Node::Text(text) => {
                    let at_line_start = out.is_empty() || out.ends_with('\n');
                    let piece = escape_markdown(&collapse_whitespace(&text.text), at_line_start);
                    push_inline(&mut out, &piece);
                }
                Node::Element(_) => {
                    if let Some(child_el) = ElementRef::wrap(child) {
                        let rendered = self.element(child_el)?;
                        push_inline(&mut out, &rendered);
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    fn element(&mut self, el: ElementRef<'_>) -> Result<String, RenderError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(RenderError::TooDeep(MAX_DEPTH));
        }
        let out = self.element_inner(el);
        self.depth -= 1;
        out
    }

    fn element_inner(&mut self, el: ElementRef<'_>) -> Result<String, RenderError> {
        let name = el.value().name();
        if SKIPPED.contains(&name) {
            return Ok(String::new());
        }
        let out = match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name[1..].parse::<usize>().unwrap_or(1);
                let content = self.children(el)?;
                let content = single_line(content.trim());
                if content.is_empty() {
                    String::new()
                } else {
                    format!("\n\n{} {}\n\n", "#".repeat(level), content)
                }
            }
            "br" => "\n".to_string(),
            "hr" => "\n\n---\n\n".to_string(),
            "strong" | "b" => wrap_inline(&self.children(el)?, "**"),
            "em" | "i" => wrap_inline(&self.children(el)?, "*"),
            "del" | "s" | "strike" => wrap_inline(&self.children(el)?, "~~"),
            "code" => inline_code(&el.text().collect::<String>()),
            "pre" => fenced_block(el),
            "a" => {
                let content = self.children(el)?;
                let text = content.trim();
                match el.value().attr("href") {
                    _ if text.is_empty() => String::new(),
                    Some(href) if !href.trim().is_empty() && !href.starts_with("javascript:") => {
                        format!("[{}]({})", text, href.trim())
                    }
                    _ => content,
                }
            }
            "ul" => self.list(el, false)?,
            "ol" => self.list(el, true)?,
            "li" => block(&format!("- {}", tighten(self.children(el)?.trim()))),
            "blockquote" => {
                let content = self.children(el)?;
                let quoted: Vec<String> = content
                    .trim()
                    .lines()
                    .map(|l| if l.trim().is_empty() { ">".to_string() } else { format!("> {}", l) })
                    .collect();
                block(&quoted.join("\n"))
            }
            "table" => self.table(el)?,
            n if BLOCKS.contains(&n) => block(&self.children(el)?),
            _ => self.children(el)?,
        };
        Ok(out)
    }

    fn list(&mut self, el: ElementRef<'_>, ordered: bool) -> Result<String, RenderError> {
        let mut number = if ordered {
            el.value()
                .attr("start")
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(1)
        } else {
            1
        };
        let mut items = Vec::new();
        for child in el.children().filter_map(ElementRef::wrap) {
            if child.value().name() != "li" {
                let rendered = self.element(child)?;
                if !rendered.trim().is_empty() {
                    items.push(rendered.trim().to_string());
                }
                continue;
            }
            let prefix = if ordered {
                format!("{}. ", number)
            } else {
                "- ".to_string()
            };
            number += 1;
            let body = tighten(self.children(child)?.trim());
            if body.trim().is_empty() {
                continue;
            }
            let indent = " ".repeat(prefix.len());
            let mut lines = body.lines();
            let mut item = format!("{}{}", prefix, lines.next().unwrap_or_default());
            for line in lines {
                item.push('\n');
                if !line.is_empty() {
                    item.push_str(&indent);
                    item.push_str(line);
                }
            }
            items.push(item);
        }
        if items.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("\n\n{}\n\n", items.join("\n")))
    }

    fn table(&mut self, el: ElementRef<'_>) -> Result<String, RenderError> {
        let mut rows: Vec<Vec<String>> = Vec::new();
        for row in el.select(&ROW_SEL) {
            let mut cells = Vec::new();
            for cell in row.children().filter_map(ElementRef::wrap) {
                if matches!(cell.value().name(), "th" | "td") {
                    let content = self.children(cell)?;
                    cells.push(single_line(content.trim()).replace('|', "\\|"));
                }
            }
            if !cells.is_empty() {
                rows.push(cells);
            }
        }
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        if width == 0 {
            return Ok(String::new());
        }
        let mut lines = Vec::with_capacity(rows.len() + 1);
        for (i, mut row) in rows.into_iter().enumerate() {
            row.resize(width, String::new());
            lines.push(format!("| {} |", row.join(" | ")));
            if i == 0 {
                lines.push(format!("|{}", " --- |".repeat(width)));
            }
        }
        Ok(format!("\n\n{}\n\n", lines.join("\n")))
    }
}

fn block(content: &str) -> String {
    let content = content.trim();
    if content.is_empty() {
        String::new()
    } else {
        format!("\n\n{}\n\n", content)
    }
}

fn wrap_inline(content: &str, delim: &str) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let leading = if content.starts_with(char::is_whitespace) { " " } else { "" };
    let trailing = if content.ends_with(char::is_whitespace) { " " } else { "" };
    format!("{leading}{delim}{trimmed}{delim}{trailing}")
}

fn inline_code(text: &str) -> String {
    let text = text.replace('\n', " ");
    if text.trim().is_empty() {
        return String::new();
    }
    if text.contains('`') {
        format!("`` {} ``", text)
    } else {
        format!("`{}`", text)
    }
}

fn fenced_block(pre: ElementRef<'_>) -> String {
    let (text, lang) = match pre.select(&CODE_SEL).next() {
        Some(code) => (
            code.text().collect::<String>(),
            language_of(code).or_else(|| language_of(pre)),
        ),
        None => (pre.text().collect::<String>(), language_of(pre)),
    };
    let text = text.trim_end_matches('\n');
    if text.trim().is_empty() {
        return String::new();
    }
    let fence = if text.contains("```") { "````" } else { "```" };
    format!(
        "\n\n{fence}{}\n{text}\n{fence}\n\n",
        lang.unwrap_or_default()
    )
}

fn language_of(el: ElementRef<'_>) -> Option<String> {
    el.value().classes().find_map(|c| {
        c.strip_prefix("language-")
            .or_else(|| c.strip_prefix("lang-"))
            .filter(|l| !l.is_empty())
            .map(str::to_string)
    })
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

fn escape_markdown(text: &str, at_line_start: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '*' | '_' | '`' | '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
    if at_line_start {
        let lead = out.len() - out.trim_start().len();
        let rest = &out[lead..];
        if let Some(caps) = ORDERED_RE.captures(rest) {
            let digits_end = lead + caps[1].len();
            out.insert(digits_end, '\\');
        } else if LINE_START_RE.is_match(rest) {
            out.insert(lead, '\\');
        }
    }
    out
}

fn push_inline(out: &mut String, piece: &str) {
    let mut piece = piece;
    if out.is_empty() || out.ends_with('\n') {
        piece = piece.trim_start_matches([' ', '\t']);
    }
    if out.ends_with(' ') && piece.starts_with(' ') {
        piece = &piece[1..];
    }
    out.push_str(piece);
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drop blank lines outside code fences (tight list items).
fn tighten(s: &str) -> String {
    let mut in_fence = false;
    let mut lines = Vec::new();
    for line in s.lines() {
        let is_fence = line.trim_start().starts_with("```");
        if in_fence || is_fence || !line.trim().is_empty() {
            lines.push(line);
        }
        if is_fence {
            in_fence = !in_fence;
        }
    }
    lines.join("\n")
}

/// Trim line ends and keep at most one blank line in a row, leaving fenced
/// code untouched; then trim the whole document.
fn normalize(raw: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut blank_run = 0usize;
    for line in raw.lines() {
        let is_fence = line.trim_start().starts_with("```");
        if in_fence {
            lines.push(line);
            if is_fence {
                in_fence = false;
            }
            blank_run = 0;
            continue;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run == 1 {
                lines.push("");
            }
            continue;
        }
        blank_run = 0;
        if is_fence {
            in_fence = true;
        }
        lines.push(trimmed);
    }
    lines.join("\n").trim().to_string()
}
