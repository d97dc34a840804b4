use chrono::{DateTime, Local, SecondsFormat, TimeZone};
use indicatif::{ProgressBar, ProgressStyle};
use url::Url;

/// Folder id of the default destination.
pub const INBOX_FOLDER_ID: &str = "00";
pub const INBOX_FOLDER: &str = "00. Inbox";
pub const ATTACHMENTS_FOLDER: &str = "98. Attachments";

const MAX_FILE_NAME_CHARS: usize = 120;

/// Make `input` safe as a file or folder name.
///
/// Path separators, reserved characters and control characters become `_`,
/// whitespace runs collapse to one space, and the result is capped at 120
/// characters. Returns `None` when nothing usable is left, including the
/// bare `.` and `..` directory names.
pub fn sanitize_optional(input: &str) -> Option<String> {
    let replaced: String = input
        .trim()
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let capped: String = collapsed.chars().take(MAX_FILE_NAME_CHARS).collect();
    let capped = capped.trim();
    if capped.is_empty() || capped == "." || capped == ".." {
        None
    } else {
        Some(capped.to_string())
    }
}

/// Like [`sanitize_optional`], but falls back to `untitled`.
pub fn sanitize_file_name(input: &str) -> String {
    sanitize_optional(input).unwrap_or_else(|| "untitled".to_string())
}

/// `YYYYMMDD_HHMMSS` in local time.
pub fn title_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// `YYYYMMDD_HHMM` in local time, used for untitled note file names.
pub fn file_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format("%Y%m%d_%H%M").to_string()
}

/// Local time with offset, e.g. `2025-12-23T01:13:31+09:00`.
pub fn local_iso_now() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .filter(|h| !h.is_empty())
}

/// `<timestamp>_<host>_<suffix>` title used when nothing better is known.
pub fn auto_title(source_url: &str, suffix: &str) -> String {
    let host = host_of(source_url).unwrap_or_else(|| "unknown".to_string());
    format!("{}_{}_{}", title_timestamp(&Local::now()), host, suffix)
}

/// Download progress bar; hidden when `quiet` or when there is nothing to do.
pub fn progress_bar(total: u64, quiet: bool) -> ProgressBar {
    if quiet || total == 0 {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} media [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)",
        )
        .unwrap()
        .progress_chars("=>-"),
    );
    bar
}

/// Split tags typed as `a, b,,c` into a clean list.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_file_name("a/b:c*d?"), "a_b_c_d_");
        assert_eq!(sanitize_file_name("  many   spaces\there "), "many spaces here");
        assert_eq!(sanitize_file_name("   "), "untitled");
        assert_eq!(sanitize_optional(""), None);
    }

    #[test]
    fn dot_names_are_not_usable() {
        assert_eq!(sanitize_optional(".."), None);
        assert_eq!(sanitize_optional(" . "), None);
        assert_eq!(sanitize_file_name(".."), "untitled");
        assert_eq!(sanitize_file_name("..."), "...");
        assert_eq!(sanitize_file_name("../x"), ".._x");
    }

    #[test]
    fn sanitize_caps_length_on_char_boundaries() {
        let long = "한".repeat(200);
        let out = sanitize_file_name(&long);
        assert_eq!(out.chars().count(), 120);
    }

    #[test]
    fn timestamps_have_expected_shape() {
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(title_timestamp(&at), "20250304_050607");
        assert_eq!(file_timestamp(&at), "20250304_0506");
    }

    #[test]
    fn auto_title_uses_host_or_unknown() {
        assert!(auto_title("https://Claude.ai/chat/1", "clip").ends_with("_claude.ai_clip"));
        assert!(auto_title("clipboard://local", "clip").ends_with("_local_clip"));
        assert!(auto_title("not a url", "clip").ends_with("_unknown_clip"));
    }

    #[test]
    fn tags_are_split_and_trimmed() {
        assert_eq!(parse_tags(" rust, llm ,, "), vec!["rust", "llm"]);
        assert!(parse_tags("").is_empty());
    }
}
