use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A WGS84 point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// Data for creating a station.
#[derive(Debug, Clone)]
pub struct NewStation {
    pub group_id: i64,
    pub name: String,
    pub location: LatLng,
    pub active_at: DateTime<Utc>,
}

/// A geolocated, time-bounded monitoring location within a group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Station {
    pub id: i64,
    pub group_id: i64,
    pub name: String,
    pub location: LatLng,
    pub active_at: DateTime<Utc>,
    /// `None` while the station is still in service.
    pub retired_at: Option<DateTime<Utc>>,
}

impl Station {
    /// True if the station was in service at `t` (retirement is exclusive).
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        self.active_at <= t && self.retired_at.is_none_or(|r| r > t)
    }

    /// True if the two stations were ever in service at the same time.
    pub fn overlaps(&self, other_from: DateTime<Utc>, other_until: Option<DateTime<Utc>>) -> bool {
        let starts_before_other_ends = other_until.is_none_or(|until| self.active_at < until);
        let other_starts_before_end = self.retired_at.is_none_or(|retired| other_from < retired);
        starts_before_other_ends && other_starts_before_end
    }
}

/// Data for inserting a recording together with its tracks and tags.
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub device_id: i64,
    pub group_id: i64,
    pub station_id: Option<i64>,
    pub recorded_at: DateTime<Utc>,
    pub duration: f64,
    pub location: Option<LatLng>,
    pub tracks: Vec<NewTrack>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTrack {
    pub start_s: f64,
    pub end_s: f64,
    pub tags: Vec<NewTag>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTag {
    pub label: String,
    pub automatic: bool,
    pub model: Option<String>,
    pub user: Option<String>,
    pub path: Option<String>,
}

impl NewTag {
    /// A tag produced by an AI model.
    pub fn automatic(label: &str, model: &str) -> Self {
        Self {
            label: label.to_string(),
            automatic: true,
            model: Some(model.to_string()),
            ..Self::default()
        }
    }

    /// A tag entered by a person.
    pub fn human(label: &str, user: &str) -> Self {
        Self {
            label: label.to_string(),
            automatic: false,
            user: Some(user.to_string()),
            ..Self::default()
        }
    }
}

/// A recording row with its tracks and tags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recording {
    pub id: i64,
    pub device_id: i64,
    pub station_id: Option<i64>,
    pub group_id: i64,
    pub recorded_at: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
    pub tracks: Vec<Track>,
}

impl Recording {
    /// Wall-clock end of the recording. A duration that runs past the
    /// representable range ends the recording at its start.
    pub fn end(&self) -> DateTime<Utc> {
        Duration::try_milliseconds((self.duration * 1000.0).round() as i64)
            .and_then(|d| self.recorded_at.checked_add_signed(d))
            .unwrap_or(self.recorded_at)
    }

    /// Seconds elapsed between the end of `previous` and the start of `self`.
    pub fn gap_after(&self, previous: &Recording) -> f64 {
        (self.recorded_at - previous.recorded_at).num_milliseconds() as f64 / 1000.0 - previous.duration
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub id: i64,
    pub recording_id: i64,
    pub start_s: f64,
    pub end_s: f64,
    pub tags: Vec<TrackTag>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackTag {
    pub track_id: i64,
    pub label: String,
    pub automatic: bool,
    pub model: Option<String>,
    pub user: Option<String>,
    pub path: Option<String>,
}

/// Time/station/group filter shared by the visit-start and window queries.
///
/// `None` lists mean "no restriction"; an empty list matches nothing.
/// When both lists are present a recording matches if either one does.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingFilter {
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub stations: Option<Vec<i64>>,
    pub groups: Option<Vec<i64>>,
}

impl RecordingFilter {
    /// True if no recording could ever satisfy the filter.
    pub fn matches_nothing(&self) -> bool {
        let empty = |ids: &Option<Vec<i64>>| ids.as_ref().is_some_and(|v| v.is_empty());
        match (&self.stations, &self.groups) {
            (None, None) => false,
            (Some(_), None) => empty(&self.stations),
            (None, Some(_)) => empty(&self.groups),
            (Some(_), Some(_)) => empty(&self.stations) && empty(&self.groups),
        }
    }
}

/// A located recording still waiting for a station.
#[derive(Debug, Clone, PartialEq)]
pub struct UnassignedRecording {
    pub id: i64,
    pub group_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub location: LatLng,
}

/// A recording that opens a visit, as reported by the visit-start query.
#[derive(Debug, Clone, PartialEq)]
pub struct VisitStart {
    pub recording_id: i64,
    pub station_id: i64,
    pub recorded_at: DateTime<Utc>,
}

/// The station-local recording immediately preceding another one.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorRecording {
    pub id: i64,
    pub recorded_at: DateTime<Utc>,
    pub duration: f64,
}

impl PriorRecording {
    /// Seconds between the end of this recording and the start of `next`.
    pub fn gap_until(&self, next: &Recording) -> f64 {
        (next.recorded_at - self.recorded_at).num_milliseconds() as f64 / 1000.0 - self.duration
    }
}

/// Store statistics.
#[derive(Debug)]
pub struct StoreStats {
    pub stations: i64,
    pub active_stations: i64,
    pub recordings: i64,
    pub unassigned_recordings: i64,
    pub tracks: i64,
    pub human_tags: i64,
    pub automatic_tags: i64,
    pub models: Vec<(String, i64)>,
}
