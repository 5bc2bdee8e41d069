use std::collections::HashMap;

use crate::db::models::Recording;

/// Longest silence, in seconds, between the end of one recording and the
/// start of the next that still counts as the same visit.
pub const VISIT_GAP_SECS: f64 = 600.0;

/// A run of recordings at one station with no gap above [`VISIT_GAP_SECS`].
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub station_id: i64,
    /// Oldest first.
    pub recordings: Vec<Recording>,
}

impl Segment {
    /// The recording that opened the segment.
    pub fn first(&self) -> &Recording {
        &self.recordings[0]
    }
}

/// True if `current` opens a new visit after `previous` at the same station.
pub fn starts_new_visit(previous: Option<&Recording>, current: &Recording) -> bool {
    match previous {
        None => true,
        Some(prev) => current.gap_after(prev) > VISIT_GAP_SECS,
    }
}

/// Partition recordings into visits.
///
/// Recordings are grouped per station (not per device) and walked in
/// `(recorded_at, id)` order. Recordings without a station or without a
/// positive duration are skipped. Segments are returned ordered by their
/// first recording.
pub fn segment_recordings(mut recordings: Vec<Recording>) -> Vec<Segment> {
    recordings.retain(|r| r.station_id.is_some() && r.duration > 0.0);
    recordings.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then(a.id.cmp(&b.id)));

    let mut segments: Vec<Segment> = Vec::new();
    // station -> index of its open segment
    let mut open: HashMap<i64, usize> = HashMap::new();

    for recording in recordings {
        let Some(station_id) = recording.station_id else {
            continue;
        };

        let previous = open
            .get(&station_id)
            .and_then(|&i| segments[i].recordings.last());

        if starts_new_visit(previous, &recording) {
            open.insert(station_id, segments.len());
            segments.push(Segment {
                station_id,
                recordings: vec![recording],
            });
        } else if let Some(&i) = open.get(&station_id) {
            segments[i].recordings.push(recording);
        }
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 22, 0, 0).unwrap()
    }

    fn rec(id: i64, station: Option<i64>, offset_s: i64, duration: f64) -> Recording {
        Recording {
            id,
            device_id: 100 + id,
            station_id: station,
            group_id: 1,
            recorded_at: t0() + Duration::seconds(offset_s),
            duration,
            tracks: Vec::new(),
        }
    }

    fn ids(segments: &[Segment]) -> Vec<Vec<i64>> {
        segments
            .iter()
            .map(|s| s.recordings.iter().map(|r| r.id).collect())
            .collect()
    }

    #[test]
    fn test_gap_at_threshold_joins_visit() {
        // end(a) = 60, start(b) = 660: gap of exactly 600s
        let segs = segment_recordings(vec![rec(1, Some(1), 0, 60.0), rec(2, Some(1), 660, 30.0)]);
        assert_eq!(ids(&segs), vec![vec![1, 2]]);
    }

    #[test]
    fn test_gap_over_threshold_splits_visit() {
        let segs = segment_recordings(vec![rec(1, Some(1), 0, 60.0), rec(2, Some(1), 661, 30.0)]);
        assert_eq!(ids(&segs), vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_gap_measured_from_previous_recording() {
        // Each hop is under the threshold even though the total span is not
        let segs = segment_recordings(vec![
            rec(1, Some(1), 0, 10.0),
            rec(2, Some(1), 500, 10.0),
            rec(3, Some(1), 1000, 10.0),
            rec(4, Some(1), 1500, 10.0),
        ]);
        assert_eq!(ids(&segs), vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn test_same_instant_different_stations() {
        let segs = segment_recordings(vec![
            rec(1, Some(1), 0, 30.0),
            rec(2, Some(2), 0, 30.0),
            rec(3, Some(3), 0, 30.0),
        ]);
        assert_eq!(segs.len(), 3);
        assert!(segs.iter().all(|s| s.recordings.len() == 1));
    }

    #[test]
    fn test_devices_sharing_a_station_share_a_visit() {
        let segs = segment_recordings(vec![rec(1, Some(5), 0, 30.0), rec(2, Some(5), 40, 30.0)]);
        assert_eq!(segs.len(), 1);
        assert_ne!(segs[0].recordings[0].device_id, segs[0].recordings[1].device_id);
    }

    #[test]
    fn test_interleaved_stations() {
        let segs = segment_recordings(vec![
            rec(1, Some(1), 0, 30.0),
            rec(2, Some(2), 10, 30.0),
            rec(3, Some(1), 100, 30.0),
            rec(4, Some(2), 2000, 30.0),
        ]);
        assert_eq!(ids(&segs), vec![vec![1, 3], vec![2], vec![4]]);
    }

    #[test]
    fn test_skips_unassigned_and_zero_duration() {
        let segs = segment_recordings(vec![
            rec(1, None, 0, 30.0),
            rec(2, Some(1), 10, 0.0),
            rec(3, Some(1), 20, 30.0),
        ]);
        assert_eq!(ids(&segs), vec![vec![3]]);
    }

    #[test]
    fn test_unordered_input_is_sorted() {
        let segs = segment_recordings(vec![rec(2, Some(1), 100, 30.0), rec(1, Some(1), 0, 30.0)]);
        assert_eq!(ids(&segs), vec![vec![1, 2]]);
        assert_eq!(segs[0].first().id, 1);
    }

    #[test]
    fn test_empty() {
        assert!(segment_recordings(Vec::new()).is_empty());
    }
}
