/// Canonical, vendor-agnostic conversation types.
///
/// Every provider adapter produces these; everything downstream of the
/// adapters (rendering, media download, assembly, persistence) only sees them.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::Provider;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Author of a turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// Also the fallback when a turn carries no role marker at all.
    #[default]
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// An image or video embedded in a turn. Identity is `src`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Absolute URL.
    pub src: String,
    pub alt: String,
    pub role: Role,
    pub kind: MediaKind,
}

impl MediaRef {
    pub fn image(src: impl Into<String>, alt: impl Into<String>, role: Role) -> Self {
        Self {
            src: src.into(),
            alt: alt.into(),
            role,
            kind: MediaKind::Image,
        }
    }

    pub fn video(src: impl Into<String>, role: Role) -> Self {
        Self {
            src: src.into(),
            alt: "video".into(),
            role,
            kind: MediaKind::Video,
        }
    }
}

/// A successfully downloaded and written asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub file_name: String,
    pub alt: String,
    pub kind: MediaKind,
    /// Hex SHA-256 of the written bytes.
    pub sha256: String,
}

/// `MediaRef::src` -> written asset. Failed downloads have no entry.
pub type MediaMap = HashMap<String, MediaEntry>;

// ---------------------------------------------------------------------------
// Turns
// ---------------------------------------------------------------------------

/// Rendered markup of a turn.
///
/// Most vendors render one node per message (`Single`). Gemini renders the
/// user query and the model response inside one container (`Paired`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnBody {
    Single { role: Role, html: String },
    Paired { user_html: String, model_html: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub body: TurnBody,
    pub media: Vec<MediaRef>,
}

impl Turn {
    pub fn single(role: Role, html: impl Into<String>, media: Vec<MediaRef>) -> Self {
        Self {
            body: TurnBody::Single {
                role,
                html: html.into(),
            },
            media,
        }
    }

    pub fn paired(
        user_html: impl Into<String>,
        model_html: impl Into<String>,
        media: Vec<MediaRef>,
    ) -> Self {
        Self {
            body: TurnBody::Paired {
                user_html: user_html.into(),
                model_html: model_html.into(),
            },
            media,
        }
    }

    /// No markup worth rendering and no media.
    pub fn is_empty(&self) -> bool {
        let blank = match &self.body {
            TurnBody::Single { html, .. } => html.trim().is_empty(),
            TurnBody::Paired {
                user_html,
                model_html,
            } => user_html.trim().is_empty() && model_html.trim().is_empty(),
        };
        blank && self.media.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Extraction result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub provider: Provider,
    pub url: String,
    pub title: String,
    pub turns: Vec<Turn>,
    pub turn_count: usize,
    /// Containers matched before empty turns were dropped.
    pub raw_turn_count: usize,
}

impl Extraction {
    pub fn new(
        provider: Provider,
        url: impl Into<String>,
        title: impl Into<String>,
        turns: Vec<Turn>,
        raw_turn_count: usize,
    ) -> Self {
        let turn_count = turns.len();
        Self {
            provider,
            url: url.into(),
            title: title.into(),
            turns,
            turn_count,
            raw_turn_count,
        }
    }
}

/// What an adapter returns for a loaded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionResult {
    Extracted(Extraction),
    /// The page belongs to another vendor. Checked before any DOM walk.
    WrongSite { expected: Provider, url: String },
}

// ---------------------------------------------------------------------------
// Clip
// ---------------------------------------------------------------------------

static LAST_CLIP_ID: AtomicU64 = AtomicU64::new(0);

/// The persisted unit. Field names stay camelCase so queued clips written by
/// earlier versions still deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub id: String,
    pub title: String,
    /// Markdown body only, no frontmatter and no H1.
    pub content: String,
    pub folder_id: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Extra folder appended to the destination path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subfolder: Option<String>,
    pub created_at: String,
}

impl Clip {
    pub fn new(
        title: impl Into<String>,
        content: impl Into<String>,
        source_url: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            id: next_clip_id(),
            title: title.into(),
            content: content.into(),
            folder_id: crate::utils::INBOX_FOLDER_ID.to_string(),
            source_url: source_url.into(),
            summary: None,
            tags,
            subfolder: None,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Millisecond timestamp, bumped so ids never repeat within one process.
fn next_clip_id() -> String {
    let now = Utc::now().timestamp_millis().max(0) as u64;
    let mut last = LAST_CLIP_ID.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_CLIP_ID.compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return candidate.to_string(),
            Err(actual) => last = actual,
        }
    }
}
