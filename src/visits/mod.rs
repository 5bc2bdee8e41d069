//! Visits: runs of recordings at one station, classified from their tags.
//!
//! Visits are derived on every query and never stored. [`visit_criteria`]
//! bounds the page to fetch, [`generate_visits`] builds and classifies it.

pub mod classify;
pub mod query;
pub mod resolve;
pub mod segment;
pub mod window;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbError;
use crate::db::models::{Recording, RecordingFilter};
use crate::labels::DEFAULT_MODEL;
use resolve::ResolvedTrack;
use segment::Segment;

pub use query::generate_visits;
pub use window::visit_criteria;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Page must be at least 1 (got {0})")]
    InvalidPage(u32),
    #[error("Page size must be at least 1 (got {0})")]
    InvalidPageSize(u32),
    #[error("Search range is empty: {from} is not before {until}")]
    InvalidRange {
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    },
}

/// Who is asking. Access control happens upstream; this only carries the
/// groups the caller may see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Viewer {
    pub user: String,
    #[serde(default)]
    pub groups: Vec<i64>,
    #[serde(default)]
    pub super_user: bool,
}

impl Viewer {
    /// Local operator with access to everything (CLI and scheduled jobs).
    pub fn operator() -> Self {
        Self {
            user: "operator".to_string(),
            groups: Vec::new(),
            super_user: true,
        }
    }

    /// Groups this viewer may see, or `None` for unrestricted.
    /// Super users only see past their own groups when they ask to.
    pub fn scope(&self, elevated: bool) -> Option<&[i64]> {
        if self.super_user && elevated {
            None
        } else {
            Some(&self.groups)
        }
    }
}

/// What the caller asked for.
#[derive(Debug, Clone, Deserialize)]
pub struct VisitRequest {
    #[serde(default)]
    pub groups: Vec<i64>,
    #[serde(default)]
    pub stations: Vec<i64>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub page: u32,
    pub page_size: u32,
    /// Model whose automatic tags count; defaults to [`DEFAULT_MODEL`].
    pub compare_ai: Option<String>,
}

impl Default for VisitRequest {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            stations: Vec::new(),
            from: None,
            until: None,
            page: 1,
            page_size: 20,
            compare_ai: None,
        }
    }
}

/// The bounded window for one page of visits.
///
/// Visits on the page start within `[page_from, page_until]`. Where a bound
/// sits on a visit start rather than a search edge, the matching
/// `*_recording` id breaks ties between visits that start at the same instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitCriteria {
    pub page: u32,
    pub page_size: u32,
    pub pages_estimate: u32,
    pub search_from: DateTime<Utc>,
    pub search_until: DateTime<Utc>,
    pub page_from: DateTime<Utc>,
    pub page_until: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_from_recording: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_until_recording: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stations: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<i64>>,
    pub compare_ai: String,
}

impl VisitCriteria {
    pub(crate) fn filter(&self) -> RecordingFilter {
        RecordingFilter {
            from: self.search_from,
            until: self.search_until,
            stations: self.stations.clone(),
            groups: self.groups.clone(),
        }
    }

    /// True when the page reaches down to the start of the search range.
    pub fn covers_search_start(&self) -> bool {
        self.page_from_recording.is_none()
    }

    /// True when the page reaches up to the end of the search range.
    pub fn covers_search_end(&self) -> bool {
        self.page_until_recording.is_none()
    }

    /// True if a visit opened by `first` belongs on this page.
    pub fn contains_start(&self, first: &Recording) -> bool {
        let key = (first.recorded_at, first.id);
        let above_floor = match self.page_from_recording {
            Some(id) => key >= (self.page_from, id),
            None => first.recorded_at >= self.page_from,
        };
        let below_ceiling = match self.page_until_recording {
            Some(id) => key <= (self.page_until, id),
            None => first.recorded_at < self.search_until,
        };
        above_floor && below_ceiling
    }
}

/// A recording as it appears inside a visit, with per-track resolutions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitRecording {
    pub id: i64,
    pub device_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub duration: f64,
    pub tracks: Vec<ResolvedTrack>,
}

/// A classified visit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Visit {
    pub station_id: i64,
    pub group_id: i64,
    pub device_ids: Vec<i64>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub recordings: Vec<VisitRecording>,
    /// Human tags over AI tags.
    pub classification: String,
    /// Comparison model's tags only.
    pub ai_classification: String,
    /// The visit continues from before the searched range, so its true start
    /// (and possibly some of its tracks) lie outside what was fetched. Only
    /// ever set on the page that contains the start of the search range.
    pub incomplete: bool,
}

impl Visit {
    /// Resolve every track in the segment and classify the whole visit.
    pub fn from_segment(segment: Segment, model: &str, incomplete: bool) -> Self {
        let start = segment.first().recorded_at;
        let group_id = segment.first().group_id;
        let end = segment
            .recordings
            .iter()
            .map(Recording::end)
            .max()
            .unwrap_or(start);
        let device_ids: Vec<i64> = segment
            .recordings
            .iter()
            .map(|r| r.device_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let recordings: Vec<VisitRecording> = segment
            .recordings
            .iter()
            .map(|r| VisitRecording {
                id: r.id,
                device_id: r.device_id,
                recorded_at: r.recorded_at,
                duration: r.duration,
                tracks: r.tracks.iter().map(|t| resolve::resolve_track(t, model)).collect(),
            })
            .collect();

        let tracks = || recordings.iter().flat_map(|r| r.tracks.iter());
        let classification = classify::classify(tracks().map(|t| t.label.as_str()));
        let ai_classification = classify::classify(tracks().map(|t| t.ai_label.as_str()));

        Self {
            station_id: segment.station_id,
            group_id,
            device_ids,
            start,
            end,
            recordings,
            classification,
            ai_classification,
            incomplete,
        }
    }

    /// Number of tracks across all recordings.
    pub fn track_count(&self) -> usize {
        self.recordings.iter().map(|r| r.tracks.len()).sum()
    }
}

/// Default comparison model when a request doesn't name one.
pub(crate) fn comparison_model(requested: Option<&str>) -> String {
    requested
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(DEFAULT_MODEL)
        .to_string()
}
