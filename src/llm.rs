//! Client for an OpenAI-compatible chat-completions endpoint, used for
//! note metadata and for distilling a conversation into documents.
//!
//! Every call asks for a strict JSON-schema response and parses the first
//! choice's message content as that schema.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ServiceError;

const METADATA_INPUT_CHARS: usize = 15_000;
const PLANNING_INPUT_CHARS: usize = 30_000;
const WRITING_INPUT_CHARS: usize = 20_000;
const MAX_COMPLETION_TOKENS: u32 = 16_384;

const METADATA_PROMPT: &str = "You are an expert at analyzing LLM conversation logs and extracting factual knowledge.
Analyze the provided content and generate:
1. **title**: A clear, descriptive title based on the main topic. Do NOT include any date prefixes.
2. **summary**: A brief, factual summary of the core knowledge discussed (max 200 chars).
3. **tags**: 3-5 relevant single-word tags (camelCase or hyphens).

Respond in the user's language.";

const PLANNING_PROMPT: &str = "You are an expert at analyzing LLM conversation logs and extracting factual knowledge into well-organized documents.

Analyze the conversation and decide how to organize the knowledge into separate markdown documents.

**Document Planning Guidelines:**
- Create documents based on the CONTENT, not predefined categories
- Each document should have a clear, specific purpose (e.g. \"Docker setup guide\", \"API error fixes\")
- If the conversation covers a single topic, create just ONE document
- If there are distinct topics or the content is better split, create multiple documents
- Each document should be self-contained and useful as standalone knowledge

**What to Extract:**
- Extract only FACTS, not TODOs or unresolved questions
- Include relevant code snippets, examples, and references
- Focus on actionable, reusable knowledge

Respond in the user's language.";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub metadata_model: String,
    pub planning_model: String,
    pub writing_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            metadata_model: "gpt-5-mini".to_string(),
            planning_model: "gpt-5.1".to_string(),
            writing_model: "gpt-5-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub title: String,
    pub summary: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSection {
    pub heading: String,
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedDocument {
    pub title: String,
    pub description: String,
    pub sections: Vec<PlannedSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionPlan {
    pub folder_name: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub documents: Vec<PlannedDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenDocument {
    pub title: String,
    /// Markdown starting with `# <title>`.
    pub content: String,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

pub struct LlmClient {
    http: Client,
    api_key: String,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(api_key: Option<&str>, config: LlmConfig) -> Result<Self, ServiceError> {
        let api_key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(ServiceError::MissingCredential)?
            .to_string();
        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http,
            api_key,
            config,
        })
    }

    pub fn generate_metadata(&self, content: &str) -> Result<Metadata, ServiceError> {
        let content = non_empty(content)?;
        let schema = json!({
            "name": "metadata_response",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Clear, descriptive title without date prefix." },
                    "summary": { "type": "string", "description": "Brief factual summary (max 200 chars)." },
                    "tags": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "3-5 relevant single-word tags (camelCase or hyphens)."
                    }
                },
                "required": ["title", "summary", "tags"],
                "additionalProperties": false
            }
        });
        self.call(
            &self.config.metadata_model,
            METADATA_PROMPT,
            truncate_chars(content, METADATA_INPUT_CHARS),
            schema,
            None,
        )
    }

    pub fn plan_extraction(&self, content: &str) -> Result<ExtractionPlan, ServiceError> {
        let content = non_empty(content)?;
        let schema = json!({
            "name": "extraction_plan",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "folder_name": {
                        "type": "string",
                        "description": "Folder name: clear, descriptive topic name without date prefix, e.g. 'React-Hooks-Guide'"
                    },
                    "summary": { "type": "string", "description": "Brief summary of the entire conversation (max 200 chars)" },
                    "tags": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "3-5 relevant tags. Each tag must be a single word without spaces (use camelCase or hyphens)."
                    },
                    "documents": {
                        "type": "array",
                        "description": "List of documents to create (1 or more based on content)",
                        "items": {
                            "type": "object",
                            "properties": {
                                "title": { "type": "string", "description": "Document title (will be used as filename)" },
                                "description": { "type": "string", "description": "Brief description of what this document covers" },
                                "sections": {
                                    "type": "array",
                                    "description": "Sections to include in this document",
                                    "items": {
                                        "type": "object",
                                        "properties": {
                                            "heading": { "type": "string", "description": "Section heading" },
                                            "key_points": {
                                                "type": "array",
                                                "items": { "type": "string" },
                                                "description": "Key points to cover in this section"
                                            }
                                        },
                                        "required": ["heading", "key_points"],
                                        "additionalProperties": false
                                    }
                                }
                            },
                            "required": ["title", "description", "sections"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["folder_name", "summary", "tags", "documents"],
                "additionalProperties": false
            }
        });
        self.call(
            &self.config.planning_model,
            PLANNING_PROMPT,
            truncate_chars(content, PLANNING_INPUT_CHARS),
            schema,
            Some(MAX_COMPLETION_TOKENS),
        )
    }

    pub fn write_document(
        &self,
        content: &str,
        document: &PlannedDocument,
    ) -> Result<WrittenDocument, ServiceError> {
        let content = non_empty(content)?;
        let schema = json!({
            "name": "document_content",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Final document title" },
                    "content": {
                        "type": "string",
                        "description": "Full markdown content (without frontmatter, without main title)"
                    }
                },
                "required": ["title", "content"],
                "additionalProperties": false
            }
        });
        let written: WrittenDocument = self.call(
            &self.config.writing_model,
            &writing_prompt(document),
            truncate_chars(content, WRITING_INPUT_CHARS),
            schema,
            Some(MAX_COMPLETION_TOKENS),
        )?;
        let title = written.title.trim().to_string();
        Ok(WrittenDocument {
            content: format!("# {}\n\n{}", title, written.content),
            title,
        })
    }

    fn call<T: DeserializeOwned>(
        &self,
        model: &str,
        system: &str,
        user: &str,
        schema: Value,
        max_tokens: Option<u32>,
    ) -> Result<T, ServiceError> {
        let mut body = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "response_format": { "type": "json_schema", "json_schema": schema }
        });
        if let Some(max) = max_tokens {
            body["max_completion_tokens"] = json!(max);
        }

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        debug!(model, input_chars = user.chars().count(), "chat completion request");
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;

        let status = resp.status();
        let text = resp.text()?;
        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error.message)
                .unwrap_or_else(|_| status.canonical_reason().unwrap_or("request failed").to_string());
            return Err(ServiceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            let head: String = text.chars().take(50).collect();
            ServiceError::Malformed(format!("{} (response starts with {:?})", e, head))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::Malformed("response has no message content".into()))?;
        serde_json::from_str(&content).map_err(|e| ServiceError::Malformed(e.to_string()))
    }
}

fn writing_prompt(document: &PlannedDocument) -> String {
    let sections = document
        .sections
        .iter()
        .map(|s| format!("## {}\n- {}", s.heading, s.key_points.join("\n- ")))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "You are a technical writer creating clean, well-structured markdown documentation.

**Task:** Create a markdown document titled \"{}\"
**Purpose:** {}

**Sections to write:**
{}

**Guidelines:**
- Use clear headings (## for main sections, ### for subsections)
- Include relevant code snippets with proper syntax highlighting
- Write in the same language as the original conversation
- Be concise but include enough context to be useful standalone
- Focus on FACTS only, not opinions or TODOs",
        document.title, document.description, sections
    )
}

fn non_empty(content: &str) -> Result<&str, ServiceError> {
    if content.trim().is_empty() {
        Err(ServiceError::EmptyContent)
    } else {
        Ok(content)
    }
}

/// First `max` characters of `s`.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
