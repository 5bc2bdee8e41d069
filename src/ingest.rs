//! Recording ingestion from JSON manifests.
//!
//! A manifest file holds either one recording object or an array of them:
//!
//! ```json
//! {
//!   "device_id": 12,
//!   "group_id": 3,
//!   "recorded_at": "2024-05-10T22:14:03Z",
//!   "duration": 31.5,
//!   "location": { "lat": -41.29, "lng": 174.78 },
//!   "tracks": [
//!     { "start_s": 2.0, "end_s": 9.5,
//!       "tags": [ { "label": "possum", "model": "Master" },
//!                 { "label": "possum", "user": "ana" } ] }
//!   ]
//! }
//! ```
//!
//! Each recording is stamped with its station as it is stored, and never
//! restamped afterwards. Start times are stored to the whole second:
//! fractional seconds in `recorded_at` are dropped on ingestion.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::db::models::{LatLng, NewRecording, NewTag, NewTrack};
use crate::db::{Database, DbError};
use crate::location::match_station;

/// Longest recording accepted from a manifest, in seconds.
pub const MAX_DURATION_SECS: f64 = 86_400.0;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Malformed manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid recording: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingManifest {
    pub device_id: i64,
    pub group_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub duration: f64,
    #[serde(default)]
    pub location: Option<LatLng>,
    #[serde(default)]
    pub tracks: Vec<TrackManifest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackManifest {
    pub start_s: f64,
    pub end_s: f64,
    #[serde(default)]
    pub tags: Vec<TagManifest>,
}

/// Exactly one of `model` (automatic tag) or `user` (human tag) must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct TagManifest {
    pub label: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    One(RecordingManifest),
    Many(Vec<RecordingManifest>),
}

impl ManifestFile {
    fn into_recordings(self) -> Vec<RecordingManifest> {
        match self {
            Self::One(r) => vec![r],
            Self::Many(rs) => rs,
        }
    }
}

/// A stored recording and the station it was stamped with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ingested {
    pub recording_id: i64,
    pub station_id: Option<i64>,
}

#[derive(Debug, Default)]
pub struct ImportResult {
    pub files: u64,
    pub recordings: u64,
    pub stamped: u64,
    pub errors: u64,
}

impl TagManifest {
    fn to_new_tag(&self) -> Result<NewTag> {
        let label = self.label.trim();
        if label.is_empty() {
            return Err(IngestError::Invalid("tag with empty label".into()));
        }
        let mut tag = match (&self.model, &self.user) {
            (Some(model), None) => NewTag::automatic(label, model),
            (None, Some(user)) => NewTag::human(label, user),
            _ => {
                return Err(IngestError::Invalid(format!(
                    "tag \"{label}\" needs exactly one of model or user"
                )));
            }
        };
        tag.path = self.path.clone();
        Ok(tag)
    }
}

impl RecordingManifest {
    fn validate(&self) -> Result<()> {
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(IngestError::Invalid(format!("duration {} is not a length", self.duration)));
        }
        if self.duration > MAX_DURATION_SECS {
            return Err(IngestError::Invalid(format!(
                "duration {}s is longer than a day",
                self.duration
            )));
        }
        if let Some(loc) = self.location {
            if !(-90.0..=90.0).contains(&loc.lat) || !(-180.0..=180.0).contains(&loc.lng) {
                return Err(IngestError::Invalid(format!(
                    "location ({}, {}) is off the globe",
                    loc.lat, loc.lng
                )));
            }
        }
        if let Some(t) = self.tracks.iter().find(|t| t.end_s < t.start_s) {
            return Err(IngestError::Invalid(format!(
                "track ends ({}) before it starts ({})",
                t.end_s, t.start_s
            )));
        }
        Ok(())
    }
}

/// Store one recording, stamping the station active at its location and time.
pub fn ingest_recording(db: &Database, manifest: &RecordingManifest) -> Result<Ingested> {
    manifest.validate()?;

    let tracks = manifest
        .tracks
        .iter()
        .map(|t| -> Result<NewTrack> {
            Ok(NewTrack {
                start_s: t.start_s,
                end_s: t.end_s,
                tags: t.tags.iter().map(TagManifest::to_new_tag).collect::<Result<Vec<_>>>()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let recorded_at = manifest.recorded_at.trunc_subsecs(0);
    if recorded_at != manifest.recorded_at {
        log::debug!("Dropping fractional seconds from {}", manifest.recorded_at);
    }

    let station = match manifest.location {
        Some(point) => match_station(db, manifest.group_id, point, recorded_at)?,
        None => None,
    };
    let station_id = station.as_ref().map(|s| s.id);

    let recording_id = db.insert_recording(&NewRecording {
        device_id: manifest.device_id,
        group_id: manifest.group_id,
        station_id,
        recorded_at,
        duration: manifest.duration,
        location: manifest.location,
        tracks,
    })?;

    match &station {
        Some(s) => log::debug!("Recording {} at station {} \"{}\"", recording_id, s.id, s.name),
        None => log::debug!("Recording {} matched no station", recording_id),
    }
    Ok(Ingested { recording_id, station_id })
}

/// Stamp recordings that arrived before a station covered their location.
/// Returns how many were stamped.
pub fn stamp_unassigned(db: &Database) -> Result<u64> {
    let mut stamped = 0;
    for pending in db.unassigned_recordings()? {
        let Some(station) = match_station(db, pending.group_id, pending.location, pending.recorded_at)?
        else {
            continue;
        };
        if db.assign_station(pending.id, station.id)? {
            stamped += 1;
        }
    }
    if stamped > 0 {
        log::info!("Stamped {} previously unassigned recordings", stamped);
    }
    Ok(stamped)
}

/// Parse a manifest file into its recordings.
pub fn read_manifest(path: &Path) -> Result<Vec<RecordingManifest>> {
    let contents = std::fs::read_to_string(path)?;
    let file: ManifestFile = serde_json::from_str(&contents)?;
    Ok(file.into_recordings())
}

/// Import every `*.json` manifest under `paths` (files or directories).
/// Bad files and bad recordings are logged and counted, not fatal.
pub fn import_paths(db: &Database, paths: &[PathBuf]) -> Result<ImportResult> {
    let mut manifests: Vec<PathBuf> = Vec::new();
    for path in paths {
        for entry in WalkDir::new(path).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let is_json = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("json"));
            if is_json {
                manifests.push(entry.into_path());
            }
        }
    }
    manifests.sort();

    let pb = ProgressBar::new(manifests.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message("Importing...");

    let mut result = ImportResult::default();
    for path in &manifests {
        result.files += 1;
        let recordings = match read_manifest(path) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                result.errors += 1;
                pb.inc(1);
                continue;
            }
        };

        for (i, manifest) in recordings.iter().enumerate() {
            match ingest_recording(db, manifest) {
                Ok(ingested) => {
                    result.recordings += 1;
                    if ingested.station_id.is_some() {
                        result.stamped += 1;
                    }
                }
                // A broken store is not a per-file problem
                Err(IngestError::Db(e)) => return Err(e.into()),
                Err(e) => {
                    log::warn!("Skipping recording {} in {}: {}", i, path.display(), e);
                    result.errors += 1;
                }
            }
        }
        pb.inc(1);
    }

    pb.finish_with_message(format!(
        "Done: {} recordings, {} at stations, {} errors",
        result.recordings, result.stamped, result.errors
    ));
    log::info!(
        "Imported {} recordings from {} files ({} errors)",
        result.recordings,
        result.files,
        result.errors
    );
    Ok(result)
}
