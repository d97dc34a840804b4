use std::path::PathBuf;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{SaveError, StateError};
use crate::model::Clip;
use crate::state::{StateDb, keys};

/// Outcome of one drain, also stored under `last_drain`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub at: String,
    pub ms: u64,
    pub attempted: usize,
    pub written: Vec<PathBuf>,
    /// Clips whose write failed. They stay queued for the next drain.
    pub failed: usize,
}

/// Clips waiting for a connected directory, backed by the `pending` table.
pub struct PersistenceQueue<'a> {
    db: &'a StateDb,
}

impl<'a> PersistenceQueue<'a> {
    pub fn new(db: &'a StateDb) -> Self {
        Self { db }
    }

    pub fn enqueue(&self, clip: &Clip) -> Result<(), StateError> {
        let seq = self.db.enqueue(clip)?;
        info!(seq, clip_id = %clip.id, title = %clip.title, "clip queued");
        Ok(())
    }

    pub fn len(&self) -> Result<usize, StateError> {
        self.db.pending_len()
    }

    pub fn is_empty(&self) -> Result<bool, StateError> {
        Ok(self.len()? == 0)
    }

    /// Try `writer` once for every queued clip, in enqueue order.
    ///
    /// The queue is claimed up front, so a concurrent drain on the same
    /// state file sees none of these clips. Failed ones are put back for the
    /// next connection to retry.
    pub fn drain<F>(&self, mut writer: F) -> Result<DrainReport, StateError>
    where
        F: FnMut(&Clip) -> Result<PathBuf, SaveError>,
    {
        let started = Instant::now();
        let claimed = self.db.claim_pending()?;
        let mut report = DrainReport {
            attempted: claimed.len(),
            ..DrainReport::default()
        };

        for item in &claimed {
            match writer(&item.clip) {
                Ok(path) => report.written.push(path),
                Err(e) => {
                    warn!(seq = item.seq, clip_id = %item.clip.id, error = %e, "queued clip not written");
                    report.failed += 1;
                    self.db.requeue(item)?;
                }
            }
        }

        report.at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        report.ms = started.elapsed().as_millis() as u64;
        self.db.set_json(keys::LAST_DRAIN, &report)?;

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                written = report.written.len(),
                failed = report.failed,
                "queue drained"
            );
        }
        Ok(report)
    }
}
