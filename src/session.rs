//! User-level preferences that outlive a single save: the selected default
//! destination, pinned destinations and the service credential.

use crate::error::{SessionError, StateError};
use crate::state::{StateDb, keys};
use crate::utils::{INBOX_FOLDER, INBOX_FOLDER_ID, sanitize_optional};

pub const MAX_PINS: usize = 5;

/// Where a clip lands under the connected root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub segments: Vec<String>,
    /// `/a/b`, written to the `folder` frontmatter field.
    pub label: String,
}

impl Destination {
    fn new(segments: Vec<String>) -> Self {
        let label = format!("/{}", segments.join("/"));
        Self { segments, label }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub selected_path: Vec<String>,
    pub pinned: Vec<Vec<String>>,
    pub api_key: Option<String>,
}

impl Session {
    pub fn load(db: &StateDb) -> Result<Self, StateError> {
        Ok(Self {
            selected_path: db.get_json(keys::SELECTED_FOLDER_PATH)?.unwrap_or_default(),
            pinned: db.get_json(keys::PINNED_PATHS)?.unwrap_or_default(),
            api_key: db
                .get_json::<String>(keys::API_KEY)?
                .filter(|k| !k.trim().is_empty()),
        })
    }

    /// Segments are cleaned like folder names; empty ones are dropped.
    pub fn set_selected_path<S: AsRef<str>>(
        &mut self,
        db: &StateDb,
        path: &[S],
    ) -> Result<(), StateError> {
        self.selected_path = clean_path(path);
        db.set_json(keys::SELECTED_FOLDER_PATH, &self.selected_path)
    }

    pub fn clear_selected_path(&mut self, db: &StateDb) -> Result<(), StateError> {
        self.selected_path.clear();
        db.remove(keys::SELECTED_FOLDER_PATH)
    }

    pub fn is_pinned<S: AsRef<str>>(&self, path: &[S]) -> bool {
        let path = clean_path(path);
        self.pinned.contains(&path)
    }

    /// Pin or unpin `path`. Returns whether it is pinned afterwards.
    pub fn toggle_pin<S: AsRef<str>>(
        &mut self,
        db: &StateDb,
        path: &[S],
    ) -> Result<bool, SessionError> {
        let path = clean_path(path);
        let pinned = if let Some(pos) = self.pinned.iter().position(|p| *p == path) {
            self.pinned.remove(pos);
            false
        } else {
            if self.pinned.len() >= MAX_PINS {
                return Err(SessionError::PinLimit { max: MAX_PINS });
            }
            self.pinned.push(path);
            true
        };
        db.set_json(keys::PINNED_PATHS, &self.pinned)?;
        Ok(pinned)
    }

    pub fn set_api_key(&mut self, db: &StateDb, key: &str) -> Result<(), StateError> {
        let key = key.trim();
        if key.is_empty() {
            self.api_key = None;
            return db.remove(keys::API_KEY);
        }
        self.api_key = Some(key.to_string());
        db.set_json(keys::API_KEY, key)
    }

    /// Selected path, else the inbox for the default folder id, else
    /// `<folder_id>.`. `subfolder` is appended when present.
    pub fn destination(&self, folder_id: &str, subfolder: Option<&str>) -> Destination {
        let mut segments = if !self.selected_path.is_empty() {
            self.selected_path.clone()
        } else if folder_id == INBOX_FOLDER_ID || folder_id.trim().is_empty() {
            vec![INBOX_FOLDER.to_string()]
        } else {
            vec![format!("{}.", folder_id.trim())]
        };
        if let Some(sub) = subfolder.and_then(sanitize_optional) {
            segments.push(sub);
        }
        Destination::new(segments)
    }
}

fn clean_path<S: AsRef<str>>(path: &[S]) -> Vec<String> {
    path.iter()
        .filter_map(|s| sanitize_optional(s.as_ref()))
        .filter(|s| s != "." && s != "..")
        .collect()
}
