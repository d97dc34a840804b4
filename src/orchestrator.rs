//! One entry point per user action. Each save runs start to finish on the
//! calling thread; only media downloads fan out to worker threads.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::assemble::assemble;
use crate::download::{MediaFetcher, MediaReport, collect_unique_media, download_all, write_media};
use crate::error::{SaveError, StateError, StoreError};
use crate::frontmatter::{Frontmatter, render_document};
use crate::llm::{LlmClient, LlmConfig, Metadata};
use crate::model::{Clip, Extraction, ExtractionResult, MediaMap};
use crate::page::PageSource;
use crate::providers::{Provider, adapter_for, detect_provider};
use crate::queue::{DrainReport, PersistenceQueue};
use crate::session::Session;
use crate::state::{StateDb, keys};
use crate::store::{DirectoryHandle, DirectoryStore, PermissionOracle, RootState};
use crate::utils::{
    ATTACHMENTS_FOLDER, INBOX_FOLDER_ID, auto_title, file_timestamp, local_iso_now, progress_bar,
    sanitize_file_name, sanitize_optional,
};

pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 4;
pub const MAX_DOWNLOAD_CONCURRENCY: usize = 16;
pub const TEXT_SOURCE_URL: &str = "clipboard://local";

pub struct Options {
    /// Frontmatter tags for clips that carry none of their own.
    pub default_tags: Vec<String>,
    pub download_concurrency: usize,
    pub llm: LlmConfig,
    pub quiet: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            default_tags: Vec::new(),
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            llm: LlmConfig::default(),
            quiet: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SaveRequest {
    /// Takes priority over generated and extracted titles.
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub folder_id: String,
    pub generate_metadata: bool,
}

impl Default for SaveRequest {
    fn default() -> Self {
        Self {
            title: None,
            tags: Vec::new(),
            folder_id: INBOX_FOLDER_ID.to_string(),
            generate_metadata: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Written(PathBuf),
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub clip_id: String,
    pub title: String,
    pub disposition: Disposition,
    pub turn_count: usize,
    pub media_written: usize,
    pub media_failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DistillReport {
    pub folder: Option<String>,
    pub documents: Vec<SaveOutcome>,
    pub failed: usize,
}

/// Diagnostics of the most recent save, stored under `last_save`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSave {
    pub at: String,
    pub ms: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    pub turn_count: usize,
    pub raw_turn_count: usize,
    pub media_written: usize,
    pub media_failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SaveOrchestrator {
    db: StateDb,
    store: DirectoryStore,
    session: Session,
    fetcher: Box<dyn MediaFetcher>,
    options: Options,
    /// Connection epoch whose queue has already been drained.
    drained_epoch: u64,
}

impl SaveOrchestrator {
    pub fn new(
        db: StateDb,
        oracle: Box<dyn PermissionOracle>,
        fetcher: Box<dyn MediaFetcher>,
        options: Options,
    ) -> Result<Self, StateError> {
        let session = Session::load(&db)?;
        Ok(Self {
            db,
            store: DirectoryStore::new(oracle),
            session,
            fetcher,
            options,
            drained_epoch: 0,
        })
    }

    pub fn db(&self) -> &StateDb {
        &self.db
    }

    pub fn store(&self) -> &DirectoryStore {
        &self.store
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Session and state together, for preference edits.
    pub fn session_mut(&mut self) -> (&mut Session, &StateDb) {
        (&mut self.session, &self.db)
    }

    pub fn queue(&self) -> PersistenceQueue<'_> {
        PersistenceQueue::new(&self.db)
    }

    // -----------------------------------------------------------------------
    // Directory lifecycle
    // -----------------------------------------------------------------------

    /// Restore the stored root and drain the queue if it is connected.
    pub fn startup(&mut self) -> Result<Option<DrainReport>, SaveError> {
        self.store.restore(&self.db)?;
        Ok(self.on_connected()?)
    }

    /// Drain the queue once per transition into `Connected`.
    pub fn on_connected(&mut self) -> Result<Option<DrainReport>, StateError> {
        let epoch = self.store.epoch();
        if self.store.handle().is_none() || epoch == self.drained_epoch {
            return Ok(None);
        }
        let report = PersistenceQueue::new(&self.db).drain(|clip| self.write_clip(clip))?;
        self.drained_epoch = epoch;
        Ok(Some(report))
    }

    pub fn choose_directory(
        &mut self,
        path: &Path,
    ) -> Result<(DirectoryHandle, Option<DrainReport>), SaveError> {
        let handle = self.store.choose(&self.db, path)?;
        let drained = self.on_connected()?;
        Ok((handle, drained))
    }

    /// `None` when access was not granted again.
    pub fn reconfirm(&mut self) -> Result<Option<(DirectoryHandle, Option<DrainReport>)>, SaveError> {
        let Some(handle) = self.store.verify_or_prompt(&self.db) else {
            return Ok(None);
        };
        let drained = self.on_connected()?;
        Ok(Some((handle, drained)))
    }

    // -----------------------------------------------------------------------
    // Saves
    // -----------------------------------------------------------------------

    pub fn save_conversation(
        &mut self,
        source: &dyn PageSource,
        request: &SaveRequest,
    ) -> Result<SaveOutcome, SaveError> {
        let started = Instant::now();
        let mut record = LastSave {
            at: local_iso_now(),
            ms: 0,
            ok: false,
            provider: None,
            turn_count: 0,
            raw_turn_count: 0,
            media_written: 0,
            media_failed: 0,
            error: None,
        };

        let result = self.save_conversation_inner(source, request, &mut record);

        record.ms = started.elapsed().as_millis() as u64;
        record.ok = result.is_ok();
        record.error = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self.db.set_json(keys::LAST_SAVE, &record) {
            warn!(error = %e, "failed to record save diagnostics");
        }
        result
    }

    fn save_conversation_inner(
        &self,
        source: &dyn PageSource,
        request: &SaveRequest,
        record: &mut LastSave,
    ) -> Result<SaveOutcome, SaveError> {
        let extraction = self.extract(source)?;
        record.provider = Some(extraction.provider);
        record.turn_count = extraction.turn_count;
        record.raw_turn_count = extraction.raw_turn_count;
        if extraction.turns.is_empty() {
            return Err(SaveError::EmptyContent);
        }

        let metadata = if request.generate_metadata {
            let preview = assemble(&extraction.turns, &MediaMap::new(), "");
            self.metadata_for(&preview)
        } else {
            None
        };

        let title = manual_title(request)
            .or_else(|| metadata.as_ref().and_then(|m| usable_title(&m.title)))
            .or_else(|| usable_title(&extraction.title))
            .unwrap_or_else(|| auto_title(&extraction.url, "conversation"));
        let media_folder = sanitize_file_name(&title);

        let media = match self.store.handle() {
            Some(root) => self.fetch_media(root, &extraction, &media_folder),
            None => {
                debug!("no directory connected, skipping media");
                MediaReport::default()
            }
        };
        record.media_written = media.written;
        record.media_failed = media.failed;

        let body = assemble(&extraction.turns, &media.map, &media_folder);
        if body.is_empty() {
            return Err(SaveError::EmptyContent);
        }

        let tags = if !request.tags.is_empty() {
            request.tags.clone()
        } else {
            metadata.as_ref().map(|m| m.tags.clone()).unwrap_or_default()
        };
        let mut clip = Clip::new(title, body, extraction.url.as_str(), tags);
        clip.folder_id = request.folder_id.clone();
        self.db.append_history(&clip)?;
        clip.summary = metadata.map(|m| m.summary).filter(|s| !s.trim().is_empty());

        let disposition = self.persist(&clip)?;
        Ok(SaveOutcome {
            clip_id: clip.id,
            title: clip.title,
            disposition,
            turn_count: extraction.turn_count,
            media_written: media.written,
            media_failed: media.failed,
        })
    }

    /// Save already-rendered Markdown, such as clipboard text.
    pub fn save_text(
        &mut self,
        markdown: &str,
        source_url: Option<&str>,
        request: &SaveRequest,
    ) -> Result<SaveOutcome, SaveError> {
        let markdown = markdown.trim();
        if markdown.is_empty() {
            return Err(SaveError::EmptyContent);
        }
        let source_url = source_url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(TEXT_SOURCE_URL);

        let metadata = if request.generate_metadata {
            self.metadata_for(markdown)
        } else {
            None
        };
        let title = manual_title(request)
            .or_else(|| metadata.as_ref().and_then(|m| usable_title(&m.title)))
            .unwrap_or_else(|| auto_title(source_url, "clip"));
        let tags = if !request.tags.is_empty() {
            request.tags.clone()
        } else {
            metadata.as_ref().map(|m| m.tags.clone()).unwrap_or_default()
        };

        let mut clip = Clip::new(title, markdown, source_url, tags);
        clip.folder_id = request.folder_id.clone();
        self.db.append_history(&clip)?;
        clip.summary = metadata.map(|m| m.summary).filter(|s| !s.trim().is_empty());

        let disposition = self.persist(&clip)?;
        Ok(SaveOutcome {
            clip_id: clip.id,
            title: clip.title,
            disposition,
            turn_count: 0,
            media_written: 0,
            media_failed: 0,
        })
    }

    /// Split a conversation into standalone documents with the text service.
    ///
    /// A document that fails to generate or persist is logged and counted;
    /// the others still go through.
    pub fn distill(
        &mut self,
        source: &dyn PageSource,
        request: &SaveRequest,
    ) -> Result<DistillReport, SaveError> {
        let llm = LlmClient::new(self.session.api_key.as_deref(), self.options.llm.clone())?;
        let extraction = self.extract(source)?;
        if extraction.turns.is_empty() {
            return Err(SaveError::EmptyContent);
        }
        let markdown = assemble(&extraction.turns, &MediaMap::new(), "");
        if markdown.is_empty() {
            return Err(SaveError::EmptyContent);
        }

        let plan = llm.plan_extraction(&markdown)?;
        info!(
            folder = %plan.folder_name,
            documents = plan.documents.len(),
            "extraction planned"
        );
        let subfolder = sanitize_optional(&plan.folder_name);
        let tags = if request.tags.is_empty() {
            plan.tags.clone()
        } else {
            request.tags.clone()
        };

        let mut report = DistillReport {
            folder: subfolder.clone(),
            ..DistillReport::default()
        };
        let progress = progress_bar(plan.documents.len() as u64, self.options.quiet);
        for planned in &plan.documents {
            let written = match llm.write_document(&markdown, planned) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(title = %planned.title, error = %e, "document generation failed");
                    report.failed += 1;
                    progress.inc(1);
                    continue;
                }
            };

            let title = usable_title(&written.title)
                .unwrap_or_else(|| auto_title(&extraction.url, "document"));
            let mut clip = Clip::new(title, written.content, extraction.url.as_str(), tags.clone());
            clip.folder_id = request.folder_id.clone();
            clip.subfolder = subfolder.clone();
            clip.summary = Some(plan.summary.clone()).filter(|s| !s.trim().is_empty());

            let persisted = self
                .db
                .append_history(&clip)
                .map_err(SaveError::from)
                .and_then(|()| self.persist(&clip));
            match persisted {
                Ok(disposition) => report.documents.push(SaveOutcome {
                    clip_id: clip.id,
                    title: clip.title,
                    disposition,
                    turn_count: extraction.turn_count,
                    media_written: 0,
                    media_failed: 0,
                }),
                Err(e) => {
                    warn!(title = %clip.title, error = %e, "distilled document not saved");
                    report.failed += 1;
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(report)
    }

    /// Write `clip` under the connected root. Used by saves and by drains.
    pub fn write_clip(&self, clip: &Clip) -> Result<PathBuf, SaveError> {
        let root = match self.store.state() {
            RootState::Connected(handle) => handle,
            RootState::AwaitingReconfirmation(_) => return Err(SaveError::PermissionPending),
            RootState::Unselected => return Err(StoreError::NotConnected.into()),
        };
        let destination = self
            .session
            .destination(&clip.folder_id, clip.subfolder.as_deref());
        let dir = root.get_or_create_nested(&destination.segments)?;

        let file_name = match sanitize_file_name(&clip.title).as_str() {
            "untitled" => format!("{}.md", file_timestamp(&Local::now())),
            safe => format!("{}.md", safe),
        };

        let fm = Frontmatter {
            saved_at: local_iso_now(),
            created_at: clip.created_at.clone(),
            source_url: clip.source_url.clone(),
            llm: detect_provider(&clip.source_url),
            folder: destination.label,
            folder_id: clip.folder_id.clone(),
            title: clip.title.clone(),
            tags: if clip.tags.is_empty() {
                self.options.default_tags.clone()
            } else {
                clip.tags.clone()
            },
            summary: clip.summary.clone(),
        };
        // Distilled documents already open with their own H1.
        let heading = format!("# {}\n", clip.title);
        let body = clip
            .content
            .strip_prefix(heading.as_str())
            .map(str::trim_start)
            .unwrap_or(&clip.content);
        let document = render_document(&fm, body).map_err(|e| SaveError::WriteFailed {
            path: dir.path().join(&file_name),
            reason: e.to_string(),
        })?;

        let path = dir.write_unique(&file_name, document)?;
        info!(path = %path.display(), "note written");
        Ok(path)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn extract(&self, source: &dyn PageSource) -> Result<Extraction, SaveError> {
        let page = source.load()?;
        let provider = detect_provider(page.url().as_str());
        let adapter = adapter_for(provider).ok_or_else(|| {
            SaveError::WrongPage(format!("no extractor for this site: {}", page.url()))
        })?;
        match adapter.extract(&page)? {
            ExtractionResult::Extracted(extraction) => Ok(extraction),
            ExtractionResult::WrongSite { expected, url } => Err(SaveError::WrongPage(format!(
                "not a {} conversation page: {}",
                expected.label(),
                url
            ))),
        }
    }

    fn fetch_media(&self, root: &DirectoryHandle, extraction: &Extraction, folder: &str) -> MediaReport {
        let unique = collect_unique_media(&extraction.turns);
        if unique.is_empty() {
            return MediaReport::default();
        }
        let dir = match root.get_or_create_nested(&[ATTACHMENTS_FOLDER, folder]) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "cannot create attachments folder, saving without media");
                return MediaReport {
                    failed: unique.len(),
                    ..MediaReport::default()
                };
            }
        };

        let concurrency = self
            .options
            .download_concurrency
            .clamp(1, MAX_DOWNLOAD_CONCURRENCY);
        let progress = progress_bar(unique.len() as u64, self.options.quiet);
        let fetched = download_all(self.fetcher.as_ref(), &unique, concurrency, &progress);
        progress.finish_and_clear();

        let report = write_media(&dir, &unique, fetched);
        info!(
            written = report.written,
            failed = report.failed,
            deduplicated = report.deduplicated,
            "media saved"
        );
        report
    }

    fn metadata_for(&self, content: &str) -> Option<Metadata> {
        let result = LlmClient::new(self.session.api_key.as_deref(), self.options.llm.clone())
            .and_then(|llm| llm.generate_metadata(content));
        match result {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(error = %e, "metadata generation failed, continuing without it");
                None
            }
        }
    }

    /// Write when connected, queue otherwise. A failing write while connected
    /// is reported, not queued.
    fn persist(&self, clip: &Clip) -> Result<Disposition, SaveError> {
        if self.store.handle().is_some() {
            return self.write_clip(clip).map(Disposition::Written);
        }
        self.queue().enqueue(clip)?;
        Ok(Disposition::Queued)
    }
}

fn manual_title(request: &SaveRequest) -> Option<String> {
    request.title.as_deref().and_then(usable_title)
}

/// Trimmed `title` if anything of it survives as a file name.
fn usable_title(title: &str) -> Option<String> {
    sanitize_optional(title).map(|_| title.trim().to_string())
}
