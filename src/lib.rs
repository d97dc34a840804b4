//! # llm-archive
//!
//! Archive LLM chat conversations (ChatGPT, Claude, Gemini, Grok) as local
//! Markdown notes with YAML frontmatter, the way a note vault expects them.
//!
//! ## What it does
//!
//! A saved page snapshot is matched to its vendor by hostname, the vendor's
//! markup is walked into vendor-agnostic turns, each turn's HTML is rendered
//! to Markdown, and embedded images and videos are downloaded next to the
//! note under `98. Attachments/<title>/`. The note itself lands in the
//! selected folder (or `00. Inbox`) with a unique file name.
//!
//! When no archive directory is connected, clips are kept in a durable queue
//! and written the next time a directory is connected.
//!
//! ## Usage
//!
//! ```sh
//! # Pick the vault root once
//! llm-archive connect ~/vault
//!
//! # Save a conversation from a saved HTML snapshot
//! llm-archive save page.html --url https://chatgpt.com/c/abc --title "Lifetimes"
//!
//! # Split a conversation into standalone documents
//! llm-archive api-key sk-...
//! llm-archive distill page.html --url https://claude.ai/chat/xyz
//! ```
//!
//! Preferences can be persisted in `~/.config/llm-archive/config.toml`.
pub mod assemble;
pub mod download;
pub mod error;
pub mod frontmatter;
pub mod llm;
pub mod markdown;
pub mod model;
pub mod orchestrator;
pub mod page;
pub mod providers;
pub mod queue;
pub mod session;
pub mod state;
pub mod store;
pub mod utils;

pub use error::SaveError;
pub use orchestrator::{Options, SaveOrchestrator, SaveOutcome, SaveRequest};
