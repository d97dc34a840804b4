//! Permission-aware access to the archive root directory.
//!
//! The root is reached through a [`Grant`] (path + grant time) persisted in
//! the state database. A [`PermissionOracle`] decides whether a stored grant is
//! still good; only a [`RootState::Connected`] store hands out a writable
//! [`DirectoryHandle`].

use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::state::{StateDb, keys};
use crate::utils::sanitize_optional;

/// Upper bound on `name (n).ext` probes before giving up.
const MAX_NAME_ATTEMPTS: usize = 10_000;
/// Renames refused because another writer took the name first.
const MAX_CLAIM_ATTEMPTS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Granted,
    Denied,
    /// The grant exists but must be confirmed again by the user.
    Prompt,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Permission::Granted => "granted",
            Permission::Denied => "denied",
            Permission::Prompt => "prompt",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub path: PathBuf,
    pub granted_at: DateTime<Utc>,
}

/// Grants and checks read-write access to a directory.
pub trait PermissionOracle {
    /// Current permission for a stored grant. Never asks the user.
    fn query(&self, grant: &Grant) -> Permission;

    /// Ask for read-write access to `path`. Must only be called on behalf of
    /// an explicit user action.
    fn request(&self, path: &Path) -> Result<Permission, StoreError>;
}

/// Filesystem-backed oracle.
///
/// A grant is denied when its directory is gone or read-only, and goes back
/// to `prompt` once it is older than `grant_ttl`. With `confirm`, requests are
/// confirmed on the terminal.
#[derive(Debug, Clone, Default)]
pub struct FsOracle {
    pub grant_ttl: Option<chrono::Duration>,
    pub confirm: bool,
}

impl PermissionOracle for FsOracle {
    fn query(&self, grant: &Grant) -> Permission {
        if !is_writable_dir(&grant.path) {
            return Permission::Denied;
        }
        if let Some(ttl) = self.grant_ttl
            && Utc::now() - grant.granted_at > ttl
        {
            return Permission::Prompt;
        }
        Permission::Granted
    }

    fn request(&self, path: &Path) -> Result<Permission, StoreError> {
        if self.confirm {
            if !io::stdin().is_terminal() {
                return Err(StoreError::Unsupported(
                    "confirming directory access needs an interactive terminal".into(),
                ));
            }
            eprint!("Allow llm-archive to read and write {}? [y/N] ", path.display());
            let _ = io::stderr().flush();
            let mut answer = String::new();
            io::stdin()
                .lock()
                .read_line(&mut answer)
                .map_err(|source| StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            if !matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
                return Ok(Permission::Denied);
            }
        }
        fs::create_dir_all(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(if is_writable_dir(path) {
            Permission::Granted
        } else {
            Permission::Denied
        })
    }
}

fn is_writable_dir(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Directory handle
// ---------------------------------------------------------------------------

/// Result of probing a name without creating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Found,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub is_dir: bool,
}

/// A folder inside the connected root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryHandle {
    path: PathBuf,
}

impl DirectoryHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Child folder `name`, created if absent. Blank names resolve to `self`.
    pub fn get_or_create_folder(&self, name: &str) -> Result<DirectoryHandle, StoreError> {
        let Some(name) = sanitize_optional(name) else {
            return Ok(self.clone());
        };
        let path = self.path.join(name);
        fs::create_dir_all(&path).map_err(io_err(path.clone()))?;
        Ok(DirectoryHandle::new(path))
    }

    /// Walk `segments`, creating each folder; blank segments are skipped.
    pub fn get_or_create_nested<S: AsRef<str>>(
        &self,
        segments: &[S],
    ) -> Result<DirectoryHandle, StoreError> {
        let mut current = self.clone();
        for segment in segments {
            current = current.get_or_create_folder(segment.as_ref())?;
        }
        Ok(current)
    }

    /// Create or replace `name` with `content`.
    ///
    /// The bytes go to a temporary file in the same folder which is then
    /// renamed over the target, so a failed write never leaves a partial file.
    pub fn write_file(&self, name: &str, content: impl AsRef<[u8]>) -> Result<PathBuf, StoreError> {
        let target = self.path.join(name);
        let tmp = self.staged(name, content.as_ref())?;
        tmp.persist(&target)
            .map_err(|e| StoreError::Io {
                path: target.clone(),
                source: e.error,
            })?;
        Ok(target)
    }

    /// Write `content` under the first free name derived from `name`.
    ///
    /// The final rename never replaces an existing file; when another writer
    /// takes the chosen name first, the next free name is tried. Only when no
    /// free name can be claimed does this fall back to replacing `name`.
    pub fn write_unique(&self, name: &str, content: impl AsRef<[u8]>) -> Result<PathBuf, StoreError> {
        let mut tmp = self.staged(name, content.as_ref())?;
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let target = self.path.join(self.ensure_unique_name(name));
            match tmp.persist_noclobber(&target) {
                Ok(_) => return Ok(target),
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(path = %target.display(), "name taken during write, retrying");
                    tmp = e.file;
                }
                Err(e) => {
                    return Err(StoreError::Io {
                        path: target,
                        source: e.error,
                    });
                }
            }
        }
        warn!(name, "could not claim a free name, replacing existing file");
        let target = self.path.join(name);
        tmp.persist(&target).map_err(|e| StoreError::Io {
            path: target.clone(),
            source: e.error,
        })?;
        Ok(target)
    }

    /// Temporary file in this folder holding `content`, flushed to disk.
    fn staged(&self, name: &str, content: &[u8]) -> Result<NamedTempFile, StoreError> {
        let target = self.path.join(name);
        let mut tmp = NamedTempFile::new_in(&self.path).map_err(io_err(target.clone()))?;
        tmp.write_all(content)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(io_err(target))?;
        Ok(tmp)
    }

    /// Whether `name` exists, without creating anything.
    pub fn probe(&self, name: &str) -> io::Result<Probe> {
        match fs::symlink_metadata(self.path.join(name)) {
            Ok(_) => Ok(Probe::Found),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Probe::NotFound),
            Err(e) => Err(e),
        }
    }

    /// First free name among `name`, `stem (1).ext`, `stem (2).ext`, ...
    ///
    /// If probing fails or no free name turns up, the original name is
    /// returned and the caller may overwrite.
    pub fn ensure_unique_name(&self, name: &str) -> String {
        let (stem, ext) = split_extension(name);
        for n in 0..MAX_NAME_ATTEMPTS {
            let candidate = if n == 0 {
                name.to_string()
            } else {
                format!("{} ({}){}", stem, n, ext)
            };
            match self.probe(&candidate) {
                Ok(Probe::NotFound) => return candidate,
                Ok(Probe::Found) => {}
                Err(e) => {
                    warn!(name, error = %e, "name probe failed, keeping original name");
                    return name.to_string();
                }
            }
        }
        warn!(name, "no free file name found, keeping original name");
        name.to_string()
    }

    /// Directories first, then files, each sorted by name, at most `max`.
    pub fn list_entries(&self, max: usize) -> Result<Vec<Entry>, StoreError> {
        let read = fs::read_dir(&self.path).map_err(io_err(self.path.clone()))?;
        let mut entries: Vec<Entry> = read
            .flatten()
            .map(|e| Entry {
                name: e.file_name().to_string_lossy().into_owned(),
                is_dir: e.file_type().map(|t| t.is_dir()).unwrap_or(false),
            })
            .collect();
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        entries.truncate(max);
        Ok(entries)
    }
}

fn io_err(path: PathBuf) -> impl FnOnce(io::Error) -> StoreError {
    move |source| StoreError::Io { path, source }
}

/// `"a.b.md"` -> `("a.b", ".md")`; dotfiles and extensionless names keep
/// everything in the stem.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    }
}

// ---------------------------------------------------------------------------
// Root state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootState {
    Unselected,
    AwaitingReconfirmation(Grant),
    Connected(DirectoryHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionStatus {
    pub exists: bool,
    pub permission: Option<Permission>,
    pub handle: Option<DirectoryHandle>,
}

pub struct DirectoryStore {
    oracle: Box<dyn PermissionOracle>,
    state: RootState,
    /// Bumped on every transition into `Connected`.
    epoch: u64,
}

impl DirectoryStore {
    pub fn new(oracle: Box<dyn PermissionOracle>) -> Self {
        Self {
            oracle,
            state: RootState::Unselected,
            epoch: 0,
        }
    }

    pub fn state(&self) -> &RootState {
        &self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The root, only while connected.
    pub fn handle(&self) -> Option<&DirectoryHandle> {
        match &self.state {
            RootState::Connected(handle) => Some(handle),
            _ => None,
        }
    }

    fn connect(&mut self, handle: DirectoryHandle) -> DirectoryHandle {
        self.epoch += 1;
        info!(root = %handle.path().display(), epoch = self.epoch, "directory connected");
        self.state = RootState::Connected(handle.clone());
        handle
    }

    /// Current state of the stored grant, without prompting.
    pub fn check_permission(&self, db: &StateDb) -> Result<PermissionStatus, StoreError> {
        let Some(grant) = db.get_json::<Grant>(keys::GRANT)? else {
            return Ok(PermissionStatus {
                exists: false,
                permission: None,
                handle: None,
            });
        };
        Ok(PermissionStatus {
            exists: true,
            permission: Some(self.oracle.query(&grant)),
            handle: Some(DirectoryHandle::new(grant.path)),
        })
    }

    /// Start-up path: reuse the stored grant if it is still good.
    pub fn restore(&mut self, db: &StateDb) -> Result<&RootState, StoreError> {
        match db.get_json::<Grant>(keys::GRANT)? {
            None => self.state = RootState::Unselected,
            Some(grant) => match self.oracle.query(&grant) {
                Permission::Granted => {
                    self.connect(DirectoryHandle::new(grant.path));
                }
                Permission::Prompt => self.state = RootState::AwaitingReconfirmation(grant),
                Permission::Denied => self.state = RootState::Unselected,
            },
        }
        debug!(state = ?self.state, "directory state restored");
        Ok(&self.state)
    }

    /// Select `path` as the archive root. Call only on explicit user action.
    pub fn choose(&mut self, db: &StateDb, path: &Path) -> Result<DirectoryHandle, StoreError> {
        let path = std::path::absolute(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match self.oracle.request(&path)? {
            Permission::Granted => {
                let grant = Grant {
                    path: path.clone(),
                    granted_at: Utc::now(),
                };
                db.set_json(keys::GRANT, &grant)?;
                Ok(self.connect(DirectoryHandle::new(path)))
            }
            Permission::Denied | Permission::Prompt => {
                self.state = RootState::Unselected;
                Err(StoreError::PermissionDenied(path))
            }
        }
    }

    /// Re-request access for the stored grant. `None` on denial or failure;
    /// never errors.
    pub fn verify_or_prompt(&mut self, db: &StateDb) -> Option<DirectoryHandle> {
        let grant = match db.get_json::<Grant>(keys::GRANT) {
            Ok(Some(grant)) => grant,
            Ok(None) => {
                self.state = RootState::Unselected;
                return None;
            }
            Err(e) => {
                warn!(error = %e, "cannot read stored grant");
                return None;
            }
        };
        match self.oracle.request(&grant.path) {
            Ok(Permission::Granted) => {
                let refreshed = Grant {
                    granted_at: Utc::now(),
                    ..grant
                };
                if let Err(e) = db.set_json(keys::GRANT, &refreshed) {
                    warn!(error = %e, "failed to refresh stored grant");
                }
                Some(self.connect(DirectoryHandle::new(refreshed.path)))
            }
            Ok(_) => {
                info!(root = %grant.path.display(), "directory access denied");
                self.state = RootState::Unselected;
                None
            }
            Err(e) => {
                warn!(error = %e, "cannot request directory access");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn unique_names_are_idempotent_until_created() {
        let root = tempfile::tempdir().unwrap();
        let dir = DirectoryHandle::new(root.path());
        assert_eq!(dir.ensure_unique_name("Notes.md"), "Notes.md");
        dir.write_file("Notes.md", "a").unwrap();
        assert_eq!(dir.ensure_unique_name("Notes.md"), "Notes (1).md");
        assert_eq!(dir.ensure_unique_name("Notes.md"), "Notes (1).md");
        dir.write_file("Notes (1).md", "b").unwrap();
        assert_eq!(dir.ensure_unique_name("Notes.md"), "Notes (2).md");
    }

    #[test]
    fn split_extension_handles_edge_cases() {
        assert_eq!(split_extension("a.b.md"), ("a.b", ".md"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(split_extension(".hidden"), (".hidden", ""));
    }

    #[test]
    fn nested_folders_skip_blank_segments() {
        let root = tempfile::tempdir().unwrap();
        let dir = DirectoryHandle::new(root.path());
        let nested = dir
            .get_or_create_nested(&["10. Projects", "  ", "", "Rust"])
            .unwrap();
        assert_eq!(nested.path(), root.path().join("10. Projects").join("Rust"));
        assert!(nested.path().is_dir());
        // Idempotent.
        assert_eq!(dir.get_or_create_nested(&["10. Projects", "Rust"]).unwrap(), nested);
        // Separators cannot escape the folder.
        let odd = dir.get_or_create_folder("../up").unwrap();
        assert_eq!(odd.path(), root.path().join(".._up"));
    }

    #[test]
    fn write_file_replaces_content() {
        let root = tempfile::tempdir().unwrap();
        let dir = DirectoryHandle::new(root.path());
        let path = dir.write_file("a.md", "long original content").unwrap();
        dir.write_file("a.md", "short").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "short");
        assert_eq!(dir.list_entries(10).unwrap().len(), 1);
    }

    #[test]
    fn write_unique_never_replaces_a_note() {
        let root = tempfile::tempdir().unwrap();
        let dir = DirectoryHandle::new(root.path());
        let first = dir.write_unique("a.md", "one").unwrap();
        let second = dir.write_unique("a.md", "two").unwrap();
        assert_eq!(first, root.path().join("a.md"));
        assert_eq!(second, root.path().join("a (1).md"));
        assert_eq!(fs::read_to_string(first).unwrap(), "one");
    }

    #[test]
    fn racing_writers_each_get_their_own_file() {
        let root = tempfile::tempdir().unwrap();
        let dir = DirectoryHandle::new(root.path());
        let barrier = std::sync::Barrier::new(8);
        std::thread::scope(|s| {
            for i in 0..8 {
                let (dir, barrier) = (&dir, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    dir.write_unique("same.md", format!("writer {i}")).unwrap();
                });
            }
        });

        let mut bodies: Vec<String> = fs::read_dir(root.path())
            .unwrap()
            .map(|e| fs::read_to_string(e.unwrap().path()).unwrap())
            .collect();
        bodies.sort();
        let expected: Vec<String> = (0..8).map(|i| format!("writer {i}")).collect();
        assert_eq!(bodies, expected);
    }

    #[test]
    fn write_into_missing_folder_fails_cleanly() {
        let root = tempfile::tempdir().unwrap();
        let dir = DirectoryHandle::new(root.path().join("gone"));
        assert!(matches!(dir.write_file("a.md", "x"), Err(StoreError::Io { .. })));
    }

    #[test]
    fn entries_list_directories_first() {
        let root = tempfile::tempdir().unwrap();
        let dir = DirectoryHandle::new(root.path());
        dir.write_file("b.md", "").unwrap();
        dir.write_file("a.md", "").unwrap();
        dir.get_or_create_folder("z").unwrap();
        dir.get_or_create_folder("m").unwrap();
        let names: Vec<String> = dir.list_entries(10).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["m", "z", "a.md", "b.md"]);
        assert_eq!(dir.list_entries(3).unwrap().len(), 3);
    }

    /// Answers requests from a script and reports a fixed query result.
    struct ScriptedOracle {
        answers: Rc<RefCell<Vec<Result<Permission, StoreError>>>>,
        query: Rc<RefCell<Permission>>,
    }

    impl PermissionOracle for ScriptedOracle {
        fn query(&self, _grant: &Grant) -> Permission {
            *self.query.borrow()
        }

        fn request(&self, _path: &Path) -> Result<Permission, StoreError> {
            self.answers.borrow_mut().remove(0)
        }
    }

    fn scripted(
        answers: Vec<Result<Permission, StoreError>>,
        query: Permission,
    ) -> (DirectoryStore, Rc<RefCell<Permission>>) {
        let query = Rc::new(RefCell::new(query));
        let oracle = ScriptedOracle {
            answers: Rc::new(RefCell::new(answers)),
            query: query.clone(),
        };
        (DirectoryStore::new(Box::new(oracle)), query)
    }

    #[test]
    fn choose_connects_and_persists_grant() {
        let root = tempfile::tempdir().unwrap();
        let db = StateDb::open_in_memory().unwrap();
        let (mut store, _) = scripted(vec![Ok(Permission::Granted)], Permission::Granted);

        let handle = store.choose(&db, root.path()).unwrap();
        assert_eq!(store.handle(), Some(&handle));
        assert_eq!(store.epoch(), 1);
        let grant: Grant = db.get_json(keys::GRANT).unwrap().unwrap();
        assert_eq!(grant.path, root.path());

        let status = store.check_permission(&db).unwrap();
        assert!(status.exists);
        assert_eq!(status.permission, Some(Permission::Granted));
    }

    #[test]
    fn refused_or_unsupported_choose() {
        let root = tempfile::tempdir().unwrap();
        let db = StateDb::open_in_memory().unwrap();
        let (mut store, _) = scripted(
            vec![
                Ok(Permission::Denied),
                Err(StoreError::Unsupported("no terminal".into())),
            ],
            Permission::Granted,
        );
        assert!(matches!(store.choose(&db, root.path()), Err(StoreError::PermissionDenied(_))));
        assert!(matches!(store.choose(&db, root.path()), Err(StoreError::Unsupported(_))));
        assert_eq!(store.state(), &RootState::Unselected);
        assert!(!store.check_permission(&db).unwrap().exists);
    }

    #[test]
    fn restart_with_prompt_needs_reconfirmation() {
        let root = tempfile::tempdir().unwrap();
        let db = StateDb::open_in_memory().unwrap();
        let (mut store, query) = scripted(
            vec![Ok(Permission::Granted), Ok(Permission::Granted)],
            Permission::Granted,
        );
        store.choose(&db, root.path()).unwrap();

        *query.borrow_mut() = Permission::Prompt;
        assert!(matches!(store.restore(&db).unwrap(), RootState::AwaitingReconfirmation(_)));
        assert!(store.handle().is_none());

        let handle = store.verify_or_prompt(&db).unwrap();
        assert_eq!(handle.path(), root.path());
        assert_eq!(store.epoch(), 2);
    }

    #[test]
    fn reconfirmation_denied_goes_unselected() {
        let root = tempfile::tempdir().unwrap();
        let db = StateDb::open_in_memory().unwrap();
        let (mut store, query) = scripted(
            vec![Ok(Permission::Granted), Ok(Permission::Denied)],
            Permission::Granted,
        );
        store.choose(&db, root.path()).unwrap();
        *query.borrow_mut() = Permission::Prompt;
        store.restore(&db).unwrap();
        assert!(store.verify_or_prompt(&db).is_none());
        assert_eq!(store.state(), &RootState::Unselected);
    }

    #[test]
    fn fs_oracle_denies_missing_and_expires_old_grants() {
        let root = tempfile::tempdir().unwrap();
        let oracle = FsOracle {
            grant_ttl: Some(chrono::Duration::days(30)),
            confirm: false,
        };
        let fresh = Grant {
            path: root.path().to_path_buf(),
            granted_at: Utc::now(),
        };
        assert_eq!(oracle.query(&fresh), Permission::Granted);
        let old = Grant {
            granted_at: Utc::now() - chrono::Duration::days(31),
            ..fresh.clone()
        };
        assert_eq!(oracle.query(&old), Permission::Prompt);
        let missing = Grant {
            path: root.path().join("nope"),
            ..fresh
        };
        assert_eq!(oracle.query(&missing), Permission::Denied);
        assert_eq!(oracle.request(&root.path().join("new")).unwrap(), Permission::Granted);
    }
}
