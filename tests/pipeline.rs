use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier, Mutex};

use llm_archive::download::{Fetched, MediaFetcher};
use llm_archive::error::{DownloadError, FailureReason, SaveError, StoreError};
use llm_archive::frontmatter::parse_frontmatter;
use llm_archive::model::Clip;
use llm_archive::orchestrator::{Disposition, Options, SaveOrchestrator, SaveRequest};
use llm_archive::page::MemoryPage;
use llm_archive::state::StateDb;
use llm_archive::store::{FsOracle, Grant, Permission, PermissionOracle, RootState};
use mockito::Matcher;
use serde_json::{Value, json};

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Clone, Default)]
struct FakeFetcher {
    calls: Arc<Mutex<Vec<String>>>,
}

impl MediaFetcher for FakeFetcher {
    fn fetch(&self, url: &str) -> Result<Fetched, DownloadError> {
        self.calls.lock().unwrap().push(url.to_string());
        if url.contains("missing") {
            return Err(DownloadError {
                url: url.to_string(),
                reason: FailureReason::Status(404),
            });
        }
        let mut bytes = PNG_MAGIC.to_vec();
        bytes.extend_from_slice(url.as_bytes());
        Ok(Fetched {
            bytes,
            content_type: "image/png".into(),
        })
    }
}

fn orchestrator(db: StateDb) -> (SaveOrchestrator, FakeFetcher) {
    orchestrator_with(db, Box::new(FsOracle::default()), Options::default())
}

fn orchestrator_with(
    db: StateDb,
    oracle: Box<dyn PermissionOracle>,
    options: Options,
) -> (SaveOrchestrator, FakeFetcher) {
    let fetcher = FakeFetcher::default();
    let app = SaveOrchestrator::new(db, oracle, Box::new(fetcher.clone()), options).unwrap();
    (app, fetcher)
}

/// Orchestrator talking to `server` with an API key already stored.
fn with_text_service(server: &mockito::Server) -> SaveOrchestrator {
    let mut options = Options::default();
    options.llm.base_url = server.url();
    let (mut app, _) = orchestrator_with(
        StateDb::open_in_memory().unwrap(),
        Box::new(FsOracle::default()),
        options,
    );
    let (session, db) = app.session_mut();
    session.set_api_key(db, "sk-test").unwrap();
    app
}

fn completion(content: Value) -> String {
    json!({ "choices": [{ "message": { "content": content.to_string() } }] }).to_string()
}

/// Grants every request, but wants each stored grant confirmed again.
struct ReconfirmOracle;

impl PermissionOracle for ReconfirmOracle {
    fn query(&self, _grant: &Grant) -> Permission {
        Permission::Prompt
    }

    fn request(&self, _path: &Path) -> Result<Permission, StoreError> {
        Ok(Permission::Granted)
    }
}

fn chatgpt_page(title: &str, assistant_images: &[(&str, &str)]) -> MemoryPage {
    let images: String = assistant_images
        .iter()
        .map(|(src, alt)| format!(r#"<img src="{}" alt="{}">"#, src, alt))
        .collect();
    let html = format!(
        r#"<html><head><title>{title}</title></head><body>
<article data-testid="conversation-turn-1" data-turn="user">
  <div data-message-author-role="user"><div class="whitespace-pre-wrap">plot this</div></div>
</article>
<article data-testid="conversation-turn-2" data-turn="assistant">
  <div data-message-author-role="assistant">
    <div class="markdown"><p>Here is the <strong>plot</strong>.</p></div>
    {images}
  </div>
</article>
</body></html>"#
    );
    MemoryPage::new("https://chatgpt.com/c/abc", html)
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

fn written(disposition: &Disposition) -> &Path {
    match disposition {
        Disposition::Written(path) => path,
        Disposition::Queued => panic!("expected a written note"),
    }
}

#[test]
fn saves_conversation_with_media_and_frontmatter() {
    let vault = tempfile::tempdir().unwrap();
    let (mut app, _) = orchestrator(StateDb::open_in_memory().unwrap());
    app.choose_directory(vault.path()).unwrap();

    let request = SaveRequest {
        tags: vec!["rust".into()],
        ..SaveRequest::default()
    };
    let page = chatgpt_page("Plot help", &[("https://files.example/a.png", "chart")]);
    let outcome = app.save_conversation(&page, &request).unwrap();

    let path = written(&outcome.disposition);
    assert_eq!(path, vault.path().join("00. Inbox/Plot help.md"));
    assert!(vault.path().join("98. Attachments/Plot help/chart.png").is_file());

    let doc = read(path);
    let fm = parse_frontmatter(&doc).unwrap();
    assert_eq!(fm.title, "Plot help");
    assert_eq!(fm.source_url, "https://chatgpt.com/c/abc");
    assert_eq!(fm.tags, vec!["rust"]);
    assert_eq!(fm.folder_id, "00");
    assert_eq!(fm.folder, "/00. Inbox");
    assert!(doc.contains("\n# Plot help\n\n## user\n\nplot this\n\n---\n\n## assistant\n\nHere is the **plot**."));
    assert!(doc.contains("![[Plot help/chart.png]]"));
    assert!(doc.contains("![chart](../98. Attachments/Plot help/chart.png)"));
    assert!(!doc.trim_end().ends_with("---"));
    assert_eq!(app.db().history_len().unwrap(), 1);
}

#[test]
fn missing_media_does_not_fail_the_save() {
    let vault = tempfile::tempdir().unwrap();
    let (mut app, _) = orchestrator(StateDb::open_in_memory().unwrap());
    app.choose_directory(vault.path()).unwrap();

    let page = chatgpt_page(
        "Partial",
        &[
            ("https://files.example/missing.png", "gone"),
            ("https://files.example/ok.png", "kept"),
        ],
    );
    let outcome = app.save_conversation(&page, &SaveRequest::default()).unwrap();
    assert_eq!(outcome.media_written, 1);
    assert_eq!(outcome.media_failed, 1);

    let doc = read(written(&outcome.disposition));
    assert!(doc.contains("Here is the **plot**."));
    assert!(doc.contains("![[Partial/kept.png]]"));
    assert!(!doc.contains("gone"));
}

#[test]
fn duplicate_media_is_fetched_once() {
    let vault = tempfile::tempdir().unwrap();
    let (mut app, fetcher) = orchestrator(StateDb::open_in_memory().unwrap());
    app.choose_directory(vault.path()).unwrap();

    let page = chatgpt_page(
        "Twice",
        &[
            ("https://files.example/same.png", "first"),
            ("https://files.example/same.png", "second"),
        ],
    );
    app.save_conversation(&page, &SaveRequest::default()).unwrap();
    assert_eq!(*fetcher.calls.lock().unwrap(), vec!["https://files.example/same.png"]);
}

#[test]
fn same_title_gets_a_numbered_name() {
    let vault = tempfile::tempdir().unwrap();
    let (mut app, _) = orchestrator(StateDb::open_in_memory().unwrap());
    app.choose_directory(vault.path()).unwrap();

    let request = SaveRequest {
        title: Some("Notes".into()),
        ..SaveRequest::default()
    };
    let first = app.save_text("one", None, &request).unwrap();
    let second = app.save_text("two", None, &request).unwrap();

    let inbox = vault.path().join("00. Inbox");
    assert_eq!(written(&first.disposition), inbox.join("Notes.md"));
    assert_eq!(written(&second.disposition), inbox.join("Notes (1).md"));
    assert!(read(&inbox.join("Notes (1).md")).ends_with("# Notes\n\ntwo\n"));
}

#[test]
fn queued_clips_are_written_when_a_directory_connects() {
    let vault = tempfile::tempdir().unwrap();
    let (mut app, fetcher) = orchestrator(StateDb::open_in_memory().unwrap());
    assert_eq!(app.store().state(), &RootState::Unselected);

    let first = app
        .save_text("first body", Some("https://claude.ai/chat/1"), &SaveRequest::default())
        .unwrap();
    let page = chatgpt_page("Offline", &[("https://files.example/a.png", "chart")]);
    let second = app.save_conversation(&page, &SaveRequest::default()).unwrap();
    assert_eq!(first.disposition, Disposition::Queued);
    assert_eq!(second.disposition, Disposition::Queued);
    assert!(fetcher.calls.lock().unwrap().is_empty());
    assert_eq!(app.queue().len().unwrap(), 2);

    let (_, drained) = app.choose_directory(vault.path()).unwrap();
    let drained = drained.unwrap();
    assert_eq!(drained.attempted, 2);
    assert_eq!(drained.written.len(), 2);
    assert_eq!(app.queue().len().unwrap(), 0);

    let notes: Vec<_> = fs::read_dir(vault.path().join("00. Inbox")).unwrap().collect();
    assert_eq!(notes.len(), 2);
    assert!(read(&vault.path().join("00. Inbox/Offline.md")).contains("Here is the **plot**."));

    // A second connect event in the same epoch does not drain again.
    assert!(app.on_connected().unwrap().is_none());
}

#[test]
fn startup_with_a_stored_grant_drains_the_queue() {
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let db_path = state.path().join("state.db");

    {
        let (mut app, _) = orchestrator(StateDb::open(&db_path).unwrap());
        app.choose_directory(vault.path()).unwrap();
    }
    {
        let db = StateDb::open(&db_path).unwrap();
        db.enqueue(&llm_archive::model::Clip::new(
            "Later",
            "queued while away",
            "clipboard://local",
            vec![],
        ))
        .unwrap();
    }

    let (mut app, _) = orchestrator(StateDb::open(&db_path).unwrap());
    let drained = app.startup().unwrap().unwrap();
    assert_eq!(drained.written, vec![vault.path().join("00. Inbox/Later.md")]);
    assert!(matches!(app.store().state(), RootState::Connected(_)));
}

#[test]
fn selected_folder_overrides_the_inbox() {
    let vault = tempfile::tempdir().unwrap();
    let (mut app, _) = orchestrator(StateDb::open_in_memory().unwrap());
    app.choose_directory(vault.path()).unwrap();
    {
        let (session, db) = app.session_mut();
        session.set_selected_path(db, &["10. Projects", "Rust"]).unwrap();
    }

    let outcome = app
        .save_text("body", None, &SaveRequest { title: Some("Deep".into()), ..SaveRequest::default() })
        .unwrap();
    let path = written(&outcome.disposition);
    assert_eq!(path, vault.path().join("10. Projects/Rust/Deep.md"));
    assert_eq!(parse_frontmatter(&read(path)).unwrap().folder, "/10. Projects/Rust");
}

#[test]
fn empty_conversation_is_rejected_before_writing() {
    let vault = tempfile::tempdir().unwrap();
    let (mut app, _) = orchestrator(StateDb::open_in_memory().unwrap());
    app.choose_directory(vault.path()).unwrap();

    let page = MemoryPage::new(
        "https://chatgpt.com/c/empty",
        "<html><head><title>Nothing</title></head><body><main></main></body></html>",
    );
    let err = app.save_conversation(&page, &SaveRequest::default()).unwrap_err();
    assert!(matches!(err, SaveError::EmptyContent));
    assert!(!vault.path().join("00. Inbox").exists());
    assert_eq!(app.db().history_len().unwrap(), 0);

    let err = app.save_text("   ", None, &SaveRequest::default()).unwrap_err();
    assert!(matches!(err, SaveError::EmptyContent));
}

#[test]
fn unsupported_site_is_a_wrong_page() {
    let (mut app, _) = orchestrator(StateDb::open_in_memory().unwrap());
    let page = MemoryPage::new("https://example.com/", "<p>hello</p>");
    let err = app.save_conversation(&page, &SaveRequest::default()).unwrap_err();
    assert!(matches!(err, SaveError::WrongPage(m) if m.contains("example.com")));
}

#[test]
fn dot_title_falls_back_to_the_page_title() {
    let vault = tempfile::tempdir().unwrap();
    let (mut app, _) = orchestrator(StateDb::open_in_memory().unwrap());
    app.choose_directory(vault.path()).unwrap();

    let request = SaveRequest {
        title: Some("..".into()),
        ..SaveRequest::default()
    };
    let page = chatgpt_page("Plot help", &[("https://files.example/a.png", "chart")]);
    let outcome = app.save_conversation(&page, &request).unwrap();

    assert_eq!(written(&outcome.disposition), vault.path().join("00. Inbox/Plot help.md"));
    assert!(vault.path().join("98. Attachments/Plot help/chart.png").is_file());
    assert!(!vault.path().join("chart.png").exists());
}

#[test]
fn concurrent_drains_write_each_clip_once() {
    const CLIPS: usize = 50;
    let vault = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let db_path = state.path().join("state.db");

    {
        let (mut app, _) = orchestrator(StateDb::open(&db_path).unwrap());
        app.choose_directory(vault.path()).unwrap();
        for i in 0..CLIPS {
            // Titles repeat so both writers compete for the same names.
            let clip = Clip::new(format!("Note {}", i % 10), format!("body {i}"), "clipboard://local", vec![]);
            app.db().enqueue(&clip).unwrap();
        }
    }

    let barrier = Barrier::new(2);
    let written: Vec<usize> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (barrier, db_path) = (&barrier, &db_path);
                s.spawn(move || {
                    let (mut app, _) = orchestrator(StateDb::open(db_path).unwrap());
                    barrier.wait();
                    app.startup().unwrap().map_or(0, |r| r.written.len())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(written.iter().sum::<usize>(), CLIPS);
    let mut bodies: Vec<String> = fs::read_dir(vault.path().join("00. Inbox"))
        .unwrap()
        .map(|e| read(&e.unwrap().path()))
        .map(|doc| doc.lines().last().unwrap_or_default().to_string())
        .collect();
    bodies.sort();
    let mut expected: Vec<String> = (0..CLIPS).map(|i| format!("body {i}")).collect();
    expected.sort();
    assert_eq!(bodies, expected);
    assert_eq!(StateDb::open(&db_path).unwrap().pending_len().unwrap(), 0);
}

#[test]
fn save_while_awaiting_reconfirmation_is_queued_then_written() {
    let vault = tempfile::tempdir().unwrap();
    let (mut app, _) = orchestrator_with(
        StateDb::open_in_memory().unwrap(),
        Box::new(ReconfirmOracle),
        Options::default(),
    );
    app.choose_directory(vault.path()).unwrap();
    assert!(app.startup().unwrap().is_none());
    assert!(matches!(app.store().state(), RootState::AwaitingReconfirmation(_)));

    let request = SaveRequest {
        title: Some("Held".into()),
        ..SaveRequest::default()
    };
    let outcome = app.save_text("waiting for access", None, &request).unwrap();
    assert_eq!(outcome.disposition, Disposition::Queued);
    assert!(!vault.path().join("00. Inbox").exists());

    let (_, drained) = app.reconfirm().unwrap().unwrap();
    let drained = drained.unwrap();
    assert_eq!(drained.written, vec![vault.path().join("00. Inbox/Held.md")]);
    assert!(read(&drained.written[0]).ends_with("# Held\n\nwaiting for access\n"));
    assert!(app.queue().is_empty().unwrap());
}

#[test]
fn write_failure_while_connected_is_reported_not_queued() {
    let vault = tempfile::tempdir().unwrap();
    let (mut app, _) = orchestrator(StateDb::open_in_memory().unwrap());
    app.choose_directory(vault.path()).unwrap();
    // A plain file where the inbox folder should go.
    fs::write(vault.path().join("00. Inbox"), "in the way").unwrap();

    let err = app.save_text("body", None, &SaveRequest::default()).unwrap_err();
    assert!(matches!(err, SaveError::WriteFailed { .. }));
    assert_eq!(app.queue().len().unwrap(), 0);
    assert_eq!(app.db().history_len().unwrap(), 1);
}

#[test]
fn generated_metadata_fills_what_the_request_leaves_open() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({ "model": "gpt-5-mini" })))
        .with_status(200)
        .with_body(completion(json!({
            "title": "Borrow checker",
            "summary": "Lifetimes explained",
            "tags": ["rust", "lifetimes"]
        })))
        .expect(2)
        .create();

    let vault = tempfile::tempdir().unwrap();
    let mut app = with_text_service(&server);
    app.choose_directory(vault.path()).unwrap();

    let generated = SaveRequest {
        generate_metadata: true,
        ..SaveRequest::default()
    };
    let outcome = app.save_text("why does this not compile", None, &generated).unwrap();
    let doc = read(written(&outcome.disposition));
    let fm = parse_frontmatter(&doc).unwrap();
    assert_eq!(fm.title, "Borrow checker");
    assert_eq!(fm.tags, vec!["rust", "lifetimes"]);
    assert_eq!(fm.summary.as_deref(), Some("Lifetimes explained"));
    // The summary only reaches the note, not the history record.
    let recorded = app.db().history(1).unwrap().remove(0).unwrap();
    assert_eq!(recorded.title, "Borrow checker");
    assert_eq!(recorded.summary, None);

    let manual = SaveRequest {
        title: Some("My own title".into()),
        tags: vec!["mine".into()],
        generate_metadata: true,
        ..SaveRequest::default()
    };
    let outcome = app.save_text("second body", None, &manual).unwrap();
    let fm = parse_frontmatter(&read(written(&outcome.disposition))).unwrap();
    assert_eq!(fm.title, "My own title");
    assert_eq!(fm.tags, vec!["mine"]);
    assert_eq!(fm.summary.as_deref(), Some("Lifetimes explained"));
    mock.assert();
}

#[test]
fn distill_writes_each_document_under_the_plan_folder() {
    let mut server = mockito::Server::new();
    server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({ "model": "gpt-5.1" })))
        .with_status(200)
        .with_body(completion(json!({
            "folder_name": "Rust-Notes",
            "summary": "Ownership notes",
            "tags": ["rust", "notes"],
            "documents": [
                { "title": "Alpha", "description": "first", "sections": [] },
                { "title": "Broken", "description": "second", "sections": [] },
                { "title": "Gamma ", "description": "third", "sections": [] }
            ]
        })))
        .create();
    let writing = |title: &str| {
        Matcher::AllOf(vec![
            Matcher::PartialJson(json!({ "model": "gpt-5-mini" })),
            Matcher::Regex(title.to_string()),
        ])
    };
    server
        .mock("POST", "/chat/completions")
        .match_body(writing("Alpha"))
        .with_status(200)
        .with_body(completion(json!({ "title": "Alpha", "content": "## Part\n\nalpha body" })))
        .create();
    server
        .mock("POST", "/chat/completions")
        .match_body(writing("Broken"))
        .with_status(500)
        .with_body(r#"{"error":{"message":"overloaded"}}"#)
        .create();
    server
        .mock("POST", "/chat/completions")
        .match_body(writing("Gamma"))
        .with_status(200)
        .with_body(completion(json!({ "title": "Gamma \n", "content": "gamma body" })))
        .create();

    let vault = tempfile::tempdir().unwrap();
    let mut app = with_text_service(&server);
    app.choose_directory(vault.path()).unwrap();

    let page = chatgpt_page("Plot help", &[]);
    let report = app.distill(&page, &SaveRequest::default()).unwrap();
    assert_eq!(report.folder.as_deref(), Some("Rust-Notes"));
    assert_eq!(report.documents.len(), 2);
    assert_eq!(report.failed, 1);

    let folder = vault.path().join("00. Inbox/Rust-Notes");
    let alpha = read(&folder.join("Alpha.md"));
    let gamma = read(&folder.join("Gamma.md"));
    assert!(!folder.join("Broken.md").exists());
    assert_eq!(alpha.matches("\n# Alpha\n").count(), 1);
    assert!(alpha.ends_with("# Alpha\n\n## Part\n\nalpha body\n"));
    assert!(gamma.ends_with("# Gamma\n\ngamma body\n"));

    let fm = parse_frontmatter(&gamma).unwrap();
    assert_eq!(fm.title, "Gamma");
    assert_eq!(fm.tags, vec!["rust", "notes"]);
    assert_eq!(fm.summary.as_deref(), Some("Ownership notes"));
    assert_eq!(fm.folder, "/00. Inbox/Rust-Notes");
}
