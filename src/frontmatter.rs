use serde::{Deserialize, Serialize};

use crate::providers::Provider;

/// YAML block at the top of every written note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frontmatter {
    /// Local time with offset.
    pub saved_at: String,
    pub created_at: String,
    pub source_url: String,
    pub llm: Provider,
    /// Destination label, e.g. `/00. Inbox` or `/10. Projects/Rust`.
    pub folder: String,
    pub folder_id: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// `---`, the YAML, `---`, a blank line, `# title`, a blank line, the body.
pub fn render_document(fm: &Frontmatter, body: &str) -> Result<String, serde_yaml::Error> {
    let yaml = serde_yaml::to_string(fm)?;
    Ok(format!(
        "---\n{}---\n\n# {}\n\n{}\n",
        yaml,
        fm.title,
        body.trim_end()
    ))
}

/// Read the frontmatter back from a rendered document.
pub fn parse_frontmatter(document: &str) -> Option<Frontmatter> {
    let rest = document.strip_prefix("---\n")?;
    let end = rest.find("\n---\n")?;
    serde_yaml::from_str(&rest[..end + 1]).ok()
}
