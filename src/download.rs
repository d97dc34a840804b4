//! Media download and attachment persistence.
//!
//! Every distinct `src` of an extraction is fetched exactly once on a small
//! worker pool; the results are then written by the calling thread, in the
//! order the media first appeared, into the extraction's attachment folder.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, unbounded};
use indicatif::ProgressBar;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{DownloadError, FailureReason};
use crate::model::{MediaEntry, MediaKind, MediaMap, MediaRef, Turn};
use crate::store::DirectoryHandle;
use crate::utils::{host_of, sanitize_optional};

const FALLBACK_CONTENT_TYPE: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// The privileged fetch path: attaches whatever credentials the site needs.
pub trait MediaFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Fetched, DownloadError>;
}

/// Blocking HTTP fetcher with per-host `Cookie` headers.
pub struct HttpFetcher {
    client: Client,
    cookies: HashMap<String, String>,
}

impl HttpFetcher {
    /// `cookies` maps a host (or parent domain) to a raw `Cookie` header value.
    pub fn new(cookies: HashMap<String, String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;
        let cookies = cookies
            .into_iter()
            .map(|(k, v)| (k.trim().trim_start_matches('.').to_ascii_lowercase(), v))
            .collect();
        Ok(Self { client, cookies })
    }

    fn cookie_for(&self, host: &str) -> Option<&str> {
        self.cookies
            .iter()
            .filter(|(domain, _)| host == domain.as_str() || host.ends_with(&format!(".{}", domain)))
            .max_by_key(|(domain, _)| domain.len())
            .map(|(_, v)| v.as_str())
    }
}

impl MediaFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Fetched, DownloadError> {
        let fail = |reason| DownloadError {
            url: url.to_string(),
            reason,
        };

        let mut request = self.client.get(url);
        if let Some(host) = host_of(url)
            && let Some(cookie) = self.cookie_for(&host)
        {
            request = request.header(COOKIE, cookie);
        }

        let response = request
            .send()
            .map_err(|e| fail(FailureReason::Transport(e.to_string())))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fail(FailureReason::Status(status.as_u16())));
        }
        let header = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .map_err(|e| fail(FailureReason::Transport(e.to_string())))?
            .to_vec();

        let content_type = resolve_content_type(header.as_deref(), &bytes);
        debug!(url, %content_type, len = bytes.len(), "fetched media");
        Ok(Fetched {
            bytes,
            content_type,
        })
    }
}

/// Header value unless missing or generic; then sniff; then `image/png`.
pub fn resolve_content_type(header: Option<&str>, bytes: &[u8]) -> String {
    match header.map(str::trim) {
        Some(ct) if !ct.is_empty() && !ct.starts_with("application/octet-stream") => {
            ct.to_string()
        }
        _ => infer::get(bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string()),
    }
}

pub fn image_extension(content_type: &str) -> &'static str {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("jpeg") || ct.contains("jpg") {
        "jpg"
    } else if ct.contains("webp") {
        "webp"
    } else if ct.contains("gif") {
        "gif"
    } else {
        "png"
    }
}

pub fn video_extension(content_type: &str) -> &'static str {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("webm") {
        "webm"
    } else if ct.contains("quicktime") || ct.contains("mov") {
        "mov"
    } else {
        "mp4"
    }
}

/// Proposed file name for the `index`-th asset of an extraction.
///
/// Images are named after their alt text; videos (and images whose alt text
/// sanitizes to nothing) get `<kind>_<stamp>_<index>`.
pub fn media_file_name(media: &MediaRef, content_type: &str, stamp: i64, index: usize) -> String {
    let (base, ext) = match media.kind {
        MediaKind::Image => (
            sanitize_optional(&media.alt).unwrap_or_else(|| format!("image_{}_{}", stamp, index)),
            image_extension(content_type),
        ),
        MediaKind::Video => (
            format!("video_{}_{}", stamp, index),
            video_extension(content_type),
        ),
    };
    if base.to_lowercase().ends_with(&format!(".{}", ext)) {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}

/// Distinct media across all turns, first occurrence wins.
pub fn collect_unique_media(turns: &[Turn]) -> Vec<MediaRef> {
    let mut seen = HashSet::new();
    turns
        .iter()
        .flat_map(|t| t.media.iter())
        .filter(|m| !m.src.is_empty() && seen.insert(m.src.clone()))
        .cloned()
        .collect()
}

/// Fetch `media` with at most `concurrency` requests in flight.
///
/// Results come back in input order. `progress` advances once per finished
/// request, never ahead of it.
pub fn download_all(
    fetcher: &dyn MediaFetcher,
    media: &[MediaRef],
    concurrency: usize,
    progress: &ProgressBar,
) -> Vec<Result<Fetched, DownloadError>> {
    if media.is_empty() {
        return Vec::new();
    }

    let n_workers = concurrency.clamp(1, media.len());
    let (job_tx, job_rx) = bounded::<(usize, &MediaRef)>(n_workers * 2);
    let (done_tx, done_rx) = unbounded::<(usize, Result<Fetched, DownloadError>)>();
    let count_failed = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..n_workers {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let count_failed = &count_failed;

            s.spawn(move || {
                while let Ok((index, item)) = job_rx.recv() {
                    let result = fetcher.fetch(&item.src);
                    if let Err(e) = &result {
                        count_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(url = %item.src, error = %e, "media download failed");
                    }
                    progress.inc(1);
                    if done_tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }

        drop(job_rx);
        drop(done_tx);

        for job in media.iter().enumerate() {
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);
    });

    debug!(
        total = media.len(),
        failed = count_failed.load(Ordering::Relaxed),
        "media downloads finished"
    );

    let mut slots: Vec<Option<Result<Fetched, DownloadError>>> =
        (0..media.len()).map(|_| None).collect();
    for (index, result) in done_rx.try_iter() {
        slots[index] = Some(result);
    }
    slots
        .into_iter()
        .zip(media)
        .map(|(slot, item)| {
            slot.unwrap_or_else(|| {
                Err(DownloadError {
                    url: item.src.clone(),
                    reason: FailureReason::Transport("download worker stopped".into()),
                })
            })
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct MediaReport {
    pub map: MediaMap,
    pub written: usize,
    pub failed: usize,
    /// URLs whose bytes matched an asset already written for this extraction.
    pub deduplicated: usize,
}

/// Write fetched assets into `dir`, pairing `media[i]` with `fetched[i]`.
///
/// Failed downloads and failed writes are logged and left out of the map.
pub fn write_media(
    dir: &DirectoryHandle,
    media: &[MediaRef],
    fetched: Vec<Result<Fetched, DownloadError>>,
) -> MediaReport {
    let stamp = Utc::now().timestamp_millis();
    let mut report = MediaReport::default();
    let mut by_hash: HashMap<String, MediaEntry> = HashMap::new();

    for (index, (item, result)) in media.iter().zip(fetched).enumerate() {
        let Ok(asset) = result else {
            report.failed += 1;
            continue;
        };

        let sha256 = format!("{:x}", Sha256::digest(&asset.bytes));
        if let Some(existing) = by_hash.get(&sha256) {
            report.map.insert(
                item.src.clone(),
                MediaEntry {
                    alt: item.alt.clone(),
                    ..existing.clone()
                },
            );
            report.deduplicated += 1;
            continue;
        }

        let proposed = media_file_name(item, &asset.content_type, stamp, index);
        match dir.write_unique(&proposed, &asset.bytes) {
            Ok(path) => {
                debug!(path = %path.display(), "wrote media");
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or(proposed);
                let entry = MediaEntry {
                    file_name,
                    alt: item.alt.clone(),
                    kind: item.kind,
                    sha256: sha256.clone(),
                };
                by_hash.insert(sha256, entry.clone());
                report.map.insert(item.src.clone(), entry);
                report.written += 1;
            }
            Err(e) => {
                warn!(url = %item.src, error = %e, "failed to write media");
                report.failed += 1;
            }
        }
    }
    report
}
