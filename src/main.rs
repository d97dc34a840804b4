use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use llm_archive::download::HttpFetcher;
use llm_archive::llm::LlmConfig;
use llm_archive::orchestrator::{
    DEFAULT_DOWNLOAD_CONCURRENCY, Disposition, LastSave, Options, SaveOrchestrator, SaveOutcome,
    SaveRequest,
};
use llm_archive::page::{MemoryPage, PageSource, SnapshotFile};
use llm_archive::queue::DrainReport;
use llm_archive::state::{StateDb, keys};
use llm_archive::store::{DirectoryHandle, FsOracle, RootState};
use llm_archive::utils::{INBOX_FOLDER_ID, parse_tags};

const TREE_ENTRIES_PER_DIR: usize = 200;

/// Archive LLM chat conversations as Markdown notes.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/llm-archive/config.toml
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Path to the state database.
    #[arg(long, value_name = "PATH", global = true)]
    state_db: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress progress bars.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Select the archive root directory.
    Connect { dir: PathBuf },

    /// Confirm access to the stored root again.
    Reconfirm,

    /// Show directory, queue and last-save state.
    Status,

    /// Save a conversation from an HTML snapshot ("-" reads stdin).
    Save {
        #[command(flatten)]
        page: PageArgs,
        #[command(flatten)]
        opts: SaveArgs,
    },

    /// Save Markdown text ("-" or nothing reads stdin).
    SaveText {
        file: Option<PathBuf>,
        /// Source URL recorded in the frontmatter.
        #[arg(long)]
        url: Option<String>,
        #[command(flatten)]
        opts: SaveArgs,
    },

    /// Split a conversation into standalone documents with the text service.
    Distill {
        #[command(flatten)]
        page: PageArgs,
        #[command(flatten)]
        opts: SaveArgs,
    },

    /// Show or set the default destination, e.g. `folder "10. Projects" Rust`.
    Folder {
        segments: Vec<String>,
        /// Go back to the inbox.
        #[arg(long, conflicts_with = "segments")]
        clear: bool,
    },

    /// Toggle a pinned destination, or list pins when no path is given.
    Pin { segments: Vec<String> },

    /// Store the text-service API key, or show whether one is set.
    ApiKey {
        key: Option<String>,
        #[arg(long, conflicts_with = "key")]
        clear: bool,
    },

    /// Print the folder tree under the root.
    Tree {
        #[arg(long, default_value_t = 4)]
        depth: usize,
    },

    /// List the most recent clips.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(clap::Args)]
struct PageArgs {
    /// Saved page markup.
    snapshot: PathBuf,
    /// Address the snapshot was taken from.
    #[arg(long)]
    url: String,
}

#[derive(clap::Args)]
struct SaveArgs {
    /// Title for the note; beats generated and extracted titles.
    #[arg(long)]
    title: Option<String>,
    /// Comma-separated tags (e.g. "rust,llm").
    #[arg(long, value_name = "TAGS")]
    tags: Option<String>,
    #[arg(long, default_value = INBOX_FOLDER_ID)]
    folder_id: String,
    /// Ask the text service for title, summary and tags.
    #[arg(long)]
    metadata: bool,
}

impl SaveArgs {
    fn request(&self) -> SaveRequest {
        SaveRequest {
            title: self.title.clone(),
            tags: self.tags.as_deref().map(parse_tags).unwrap_or_default(),
            folder_id: self.folder_id.clone(),
            generate_metadata: self.metadata,
        }
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    state_db: Option<PathBuf>,
    tags: Option<Vec<String>>,
    download_concurrency: Option<usize>,
    grant_ttl_days: Option<i64>,
    #[serde(default)]
    confirm_grants: bool,
    openai: Option<LlmConfig>,
    #[serde(default)]
    cookies: HashMap<String, String>,
}

fn default_state_db() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("llm-archive/state.db"))
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("llm-archive/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("llm_archive={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve state db (CLI > Config > Default)
    let state_path = cli
        .state_db
        .clone()
        .or(file_cfg.state_db)
        .or_else(default_state_db)
        .ok_or_else(|| {
            eyre!("Could not determine state database path.\nUse --state-db, or set state_db in config.toml.")
        })?;
    let db = StateDb::open(&state_path)
        .wrap_err_with(|| format!("Failed to open state database: {}", state_path.display()))?;

    // 3. Collaborators
    let oracle = FsOracle {
        grant_ttl: file_cfg.grant_ttl_days.map(chrono::Duration::days),
        confirm: file_cfg.confirm_grants,
    };
    let fetcher = HttpFetcher::new(file_cfg.cookies).wrap_err("Failed to build HTTP client")?;
    let options = Options {
        default_tags: file_cfg.tags.unwrap_or_default(),
        download_concurrency: file_cfg
            .download_concurrency
            .unwrap_or(DEFAULT_DOWNLOAD_CONCURRENCY),
        llm: file_cfg.openai.unwrap_or_default(),
        quiet: cli.quiet,
    };
    let mut app = SaveOrchestrator::new(db, Box::new(oracle), Box::new(fetcher), options)
        .wrap_err("Failed to load session")?;

    // 4. Restore the root and flush whatever was queued while disconnected
    match app.startup() {
        Ok(report) => report_drain(report.as_ref()),
        Err(e) => eprintln!("Warning: {}", e),
    }

    // 5. Run the command
    run(&mut app, cli.command)
}

fn run(app: &mut SaveOrchestrator, command: Command) -> Result<()> {
    match command {
        Command::Connect { dir } => {
            let (handle, drained) = app
                .choose_directory(&dir)
                .map_err(|e| eyre!("Connect failed: {}", e))?;
            println!("Connected: {}", handle.path().display());
            report_drain(drained.as_ref());
        }
        Command::Reconfirm => match app.reconfirm().map_err(|e| eyre!("{}", e))? {
            Some((handle, drained)) => {
                println!("Connected: {}", handle.path().display());
                report_drain(drained.as_ref());
            }
            None => println!("Access not granted; choose a directory with `llm-archive connect`."),
        },
        Command::Status => print_status(app)?,
        Command::Save { page, opts } => {
            let source = page_source(&page)?;
            let outcome = app
                .save_conversation(source.as_ref(), &opts.request())
                .map_err(|e| eyre!("Save failed: {}", e))?;
            report_outcome(&outcome);
        }
        Command::SaveText { file, url, opts } => {
            let text = read_input(file.as_deref())?;
            let outcome = app
                .save_text(&text, url.as_deref(), &opts.request())
                .map_err(|e| eyre!("Save failed: {}", e))?;
            report_outcome(&outcome);
        }
        Command::Distill { page, opts } => {
            let source = page_source(&page)?;
            let report = app
                .distill(source.as_ref(), &opts.request())
                .map_err(|e| eyre!("Distill failed: {}", e))?;
            for outcome in &report.documents {
                report_outcome(outcome);
            }
            println!(
                "Distilled {} document(s) into {}, {} failed.",
                report.documents.len(),
                report.folder.as_deref().unwrap_or("the destination folder"),
                report.failed
            );
        }
        Command::Folder { segments, clear } => {
            let (session, db) = app.session_mut();
            if clear {
                session.clear_selected_path(db)?;
            } else if !segments.is_empty() {
                session.set_selected_path(db, &segments)?;
            }
            println!("Destination: {}", app.session().destination(INBOX_FOLDER_ID, None).label);
        }
        Command::Pin { segments } => {
            if !segments.is_empty() {
                let (session, db) = app.session_mut();
                let pinned = session.toggle_pin(db, &segments)?;
                println!("{}: /{}", if pinned { "Pinned" } else { "Unpinned" }, segments.join("/"));
            }
            for pin in &app.session().pinned {
                println!("* /{}", pin.join("/"));
            }
        }
        Command::ApiKey { key, clear } => {
            let (session, db) = app.session_mut();
            if clear {
                session.set_api_key(db, "")?;
            } else if let Some(key) = key {
                session.set_api_key(db, &key)?;
            }
            let state = if app.session().api_key.is_some() { "set" } else { "not set" };
            println!("API key: {}", state);
        }
        Command::Tree { depth } => {
            let root = app
                .store()
                .handle()
                .ok_or_else(|| eyre!("No directory connected; run `llm-archive connect <DIR>`."))?;
            println!("{}", root.path().display());
            print_tree(root, depth, 1)?;
        }
        Command::History { limit } => {
            for row in app.db().history(limit)? {
                match row {
                    Ok(clip) => println!("{}  {}  {}", clip.created_at, clip.title, clip.source_url),
                    Err(e) => eprintln!("Unreadable history row: {}", e),
                }
            }
        }
    }
    Ok(())
}

fn page_source(page: &PageArgs) -> Result<Box<dyn PageSource>> {
    if page.snapshot.as_os_str() == "-" {
        let html = read_input(None)?;
        return Ok(Box::new(MemoryPage::new(page.url.clone(), html)));
    }
    Ok(Box::new(SnapshotFile {
        path: page.snapshot.clone(),
        url: page.url.clone(),
    }))
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(p) if p.as_os_str() != "-" => {
            fs::read_to_string(p).wrap_err_with(|| format!("Failed to read {}", p.display()))
        }
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .wrap_err("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

fn report_outcome(outcome: &SaveOutcome) {
    match &outcome.disposition {
        Disposition::Written(path) => println!("Saved: {}", path.display()),
        Disposition::Queued => println!(
            "Queued: {} (written once a directory is connected)",
            outcome.title
        ),
    }
    if outcome.media_failed > 0 {
        eprintln!(
            "Media: {} saved, {} failed",
            outcome.media_written, outcome.media_failed
        );
    }
}

fn report_drain(report: Option<&DrainReport>) {
    let Some(report) = report else { return };
    if report.attempted == 0 {
        return;
    }
    for path in &report.written {
        println!("Created: {}", path.display());
    }
    if report.failed > 0 {
        eprintln!("{} queued clip(s) could not be written and stay queued.", report.failed);
    }
}

fn print_status(app: &SaveOrchestrator) -> Result<()> {
    match app.store().state() {
        RootState::Connected(handle) => println!("Directory: {} (connected)", handle.path().display()),
        RootState::AwaitingReconfirmation(grant) => println!(
            "Directory: {} (needs reconfirmation, run `llm-archive reconfirm`)",
            grant.path.display()
        ),
        RootState::Unselected => println!("Directory: none"),
    }
    let status = app.store().check_permission(app.db())?;
    if let Some(permission) = status.permission {
        println!("Permission: {}", permission);
    }

    let session = app.session();
    println!("Destination: {}", session.destination(INBOX_FOLDER_ID, None).label);
    println!("Pinned: {}", session.pinned.len());
    println!("API key: {}", if session.api_key.is_some() { "set" } else { "not set" });
    println!("Queued clips: {}", app.queue().len()?);
    println!("History: {}", app.db().history_len()?);

    if let Some(last) = app.db().get_json::<LastSave>(keys::LAST_SAVE)? {
        let result = match &last.error {
            None => "ok".to_string(),
            Some(e) => format!("failed: {}", e),
        };
        println!(
            "Last save: {} ({} ms, {} turns, {} media) {}",
            last.at, last.ms, last.turn_count, last.media_written, result
        );
    }
    if let Some(drain) = app.db().get_json::<DrainReport>(keys::LAST_DRAIN)? {
        println!(
            "Last drain: {} ({} written, {} failed)",
            drain.at,
            drain.written.len(),
            drain.failed
        );
    }
    Ok(())
}

fn print_tree(dir: &DirectoryHandle, max_depth: usize, depth: usize) -> Result<()> {
    if depth > max_depth {
        return Ok(());
    }
    for entry in dir.list_entries(TREE_ENTRIES_PER_DIR)? {
        let indent = "  ".repeat(depth);
        if entry.is_dir {
            println!("{}{}/", indent, entry.name);
            let child = DirectoryHandle::new(dir.path().join(&entry.name));
            print_tree(&child, max_depth, depth + 1)?;
        } else {
            println!("{}{}", indent, entry.name);
        }
    }
    Ok(())
}
