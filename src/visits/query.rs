use std::collections::{HashMap, HashSet};

use rayon::prelude::*;

use super::segment::{Segment, VISIT_GAP_SECS, segment_recordings};
use super::window::{visible_groups, visible_stations};
use super::{QueryError, Viewer, Visit, VisitCriteria};
use crate::db::Database;
use crate::db::models::{Recording, RecordingFilter};

/// Build the classified visits for the page described by `criteria`,
/// newest first.
pub fn generate_visits(
    db: &Database,
    viewer: &Viewer,
    criteria: &VisitCriteria,
) -> Result<Vec<Visit>, QueryError> {
    if criteria.page < 1 {
        return Err(QueryError::InvalidPage(criteria.page));
    }
    if criteria.page_size < 1 {
        return Err(QueryError::InvalidPageSize(criteria.page_size));
    }
    if criteria.page > criteria.pages_estimate {
        return Ok(Vec::new());
    }

    let filter = restrict_to_viewer(db, viewer, criteria)?;
    if filter.matches_nothing() {
        return Ok(Vec::new());
    }

    let window = RecordingFilter {
        from: criteria.page_from,
        ..filter
    };
    let mut recordings = db.recordings_in_window(&window, criteria.page_until)?;

    if !criteria.covers_search_end() {
        // Visits near the top of the page keep going past page_until
        let continued = continue_open_visits(db, &recordings, criteria)?;
        recordings.extend(continued);
    }
    let fetched = recordings.len();

    let mut seen_stations: HashSet<i64> = HashSet::new();
    let mut kept: Vec<(Segment, bool)> = Vec::new();
    for segment in segment_recordings(recordings) {
        let mut incomplete = false;

        // Only a station's earliest segment in the window can have started
        // before the window; later ones were split by the gap rule in-window.
        if seen_stations.insert(segment.station_id) {
            if let Some(prior) = db.prior_recording(segment.first())? {
                if prior.gap_until(segment.first()) <= VISIT_GAP_SECS {
                    if prior.recorded_at >= criteria.search_from {
                        // Tail of a visit that an older page shows in full
                        continue;
                    }
                    incomplete = true;
                }
            }
        }

        if criteria.contains_start(segment.first()) {
            kept.push((segment, incomplete));
        }
    }

    let model = criteria.compare_ai.as_str();
    let mut visits: Vec<Visit> = kept
        .into_par_iter()
        .map(|(segment, incomplete)| Visit::from_segment(segment, model, incomplete))
        .collect();

    visits.sort_by(|a, b| {
        b.start
            .cmp(&a.start)
            .then_with(|| b.recordings[0].id.cmp(&a.recordings[0].id))
    });

    log::debug!(
        "Page {}: {} recordings fetched, {} visits",
        criteria.page,
        fetched,
        visits.len()
    );
    Ok(visits)
}

/// Narrow the criteria's stations/groups to what `viewer` may see. Criteria
/// can round-trip through a client, so they are not trusted as-is.
fn restrict_to_viewer(
    db: &Database,
    viewer: &Viewer,
    criteria: &VisitCriteria,
) -> Result<RecordingFilter, QueryError> {
    let mut filter = criteria.filter();
    let scope = viewer.scope(true);
    let Some(allowed) = scope else {
        return Ok(filter);
    };

    filter.stations = match &criteria.stations {
        Some(ids) if !ids.is_empty() => Some(visible_stations(db, scope, ids)?),
        other => other.clone(),
    };
    filter.groups = criteria.groups.as_deref().map(|ids| visible_groups(scope, ids));
    if filter.stations.is_none() && filter.groups.is_none() {
        filter.groups = Some(allowed.to_vec());
    }
    Ok(filter)
}

/// Recordings after the window that extend a visit still open at its
/// upper edge, one continuation query per station.
fn continue_open_visits(
    db: &Database,
    recordings: &[Recording],
    criteria: &VisitCriteria,
) -> Result<Vec<Recording>, QueryError> {
    // Window recordings are oldest first, so the last one per station wins
    let mut last_at_station: HashMap<i64, &Recording> = HashMap::new();
    for r in recordings {
        if let Some(station_id) = r.station_id {
            last_at_station.insert(station_id, r);
        }
    }

    let mut continued = Vec::new();
    for last in last_at_station.values() {
        continued.extend(db.visit_continuation(last, criteria.search_until)?);
    }
    Ok(continued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{LatLng, NewRecording, NewStation, NewTag, NewTrack};
    use crate::labels::{CONFLICTING_TAGS, DEFAULT_MODEL};
    use crate::visits::{VisitRequest, visit_criteria};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()
    }

    fn station(db: &Database, group_id: i64) -> i64 {
        db.insert_station(&NewStation {
            group_id,
            name: "s".into(),
            location: LatLng { lat: 0.0, lng: 0.0 },
            active_at: t0() - Duration::days(365),
        })
        .unwrap()
    }

    fn record(db: &Database, station_id: i64, offset_s: i64, duration: f64, tags: Vec<Vec<NewTag>>) -> i64 {
        db.insert_recording(&NewRecording {
            device_id: station_id * 100,
            group_id: 1,
            station_id: Some(station_id),
            recorded_at: t0() + Duration::seconds(offset_s),
            duration,
            location: None,
            tracks: tags
                .into_iter()
                .map(|tags| NewTrack { start_s: 0.0, end_s: 5.0, tags })
                .collect(),
        })
        .unwrap()
    }

    fn possum() -> Vec<Vec<NewTag>> {
        vec![vec![NewTag::automatic("possum", DEFAULT_MODEL)]]
    }

    fn request(page: u32, page_size: u32) -> VisitRequest {
        VisitRequest {
            from: Some(t0()),
            until: Some(t0() + Duration::days(60)),
            page,
            page_size,
            ..VisitRequest::default()
        }
    }

    fn page(db: &Database, req: &VisitRequest) -> Vec<Visit> {
        let op = Viewer::operator();
        let criteria = visit_criteria(db, &op, req, true).unwrap();
        generate_visits(db, &op, &criteria).unwrap()
    }

    fn first_ids(visits: &[Visit]) -> Vec<i64> {
        visits.iter().map(|v| v.recordings[0].id).collect()
    }

    #[test]
    fn test_thousand_visits_paged_by_hundred() {
        let db = Database::open_in_memory().unwrap();
        let s = station(&db, 1);
        let ids: Vec<i64> = (0..1000).map(|i| record(&db, s, i * 3600, 30.0, possum())).collect();

        let op = Viewer::operator();
        let criteria = visit_criteria(&db, &op, &request(1, 100), true).unwrap();
        assert_eq!(criteria.pages_estimate, 10);

        let first = generate_visits(&db, &op, &criteria).unwrap();
        assert_eq!(first.len(), 100);
        let expected: Vec<i64> = ids.iter().rev().take(100).copied().collect();
        assert_eq!(first_ids(&first), expected);
        assert!(first.windows(2).all(|w| w[0].start > w[1].start));

        let tenth = page(&db, &request(10, 100));
        let expected: Vec<i64> = ids.iter().take(100).rev().copied().collect();
        assert_eq!(first_ids(&tenth), expected);
        assert!(tenth.iter().all(|v| !v.incomplete));

        assert!(page(&db, &request(11, 100)).is_empty());
    }

    #[test]
    fn test_pages_partition_visits() {
        let db = Database::open_in_memory().unwrap();
        let a = station(&db, 1);
        let b = station(&db, 1);
        let mut all = Vec::new();
        for i in 0..12 {
            all.push(record(&db, a, i * 2000, 60.0, possum()));
            // B records at the same instants as A
            all.push(record(&db, b, i * 2000, 60.0, possum()));
        }

        let mut seen: Vec<i64> = Vec::new();
        for p in 1..=5 {
            seen.extend(first_ids(&page(&db, &request(p, 5))));
        }
        seen.sort();
        all.sort();
        assert_eq!(seen, all);
    }

    #[test]
    fn test_visit_spanning_page_boundary_is_whole_once() {
        let db = Database::open_in_memory().unwrap();
        let a = station(&db, 1);
        let b = station(&db, 1);
        // A: one long visit from 0s to ~3000s, a recording every 500s
        let long_visit: Vec<i64> = (0..7).map(|i| record(&db, a, i * 500, 60.0, possum())).collect();
        // B: separate visits, one of them starting in the middle of A's visit
        record(&db, b, 100, 10.0, possum());
        record(&db, b, 1500, 10.0, possum());
        record(&db, b, 5000, 10.0, possum());

        // 4 visit starts: A@0, B@100, B@1500, B@5000; pages of 2
        let p1 = page(&db, &request(1, 2));
        let p2 = page(&db, &request(2, 2));
        assert_eq!(p1.len(), 2);
        assert_eq!(p2.len(), 2);

        let a_visits: Vec<&Visit> = p1.iter().chain(p2.iter()).filter(|v| v.station_id == a).collect();
        assert_eq!(a_visits.len(), 1);
        let got: Vec<i64> = a_visits[0].recordings.iter().map(|r| r.id).collect();
        assert_eq!(got, long_visit);
        assert!(!a_visits[0].incomplete);
    }

    #[test]
    fn test_visit_before_search_start_is_incomplete() {
        let db = Database::open_in_memory().unwrap();
        let a = station(&db, 1);
        record(&db, a, -300, 60.0, possum());
        let inside = record(&db, a, 100, 60.0, possum());
        record(&db, a, 10_000, 60.0, possum());

        let visits = page(&db, &request(1, 10));
        assert_eq!(visits.len(), 2);
        assert_eq!(visits[1].recordings[0].id, inside);
        assert!(visits[1].incomplete);
        assert!(!visits[0].incomplete);
    }

    #[test]
    fn test_simultaneous_recordings_at_three_stations() {
        let db = Database::open_in_memory().unwrap();
        let stations: Vec<i64> = (0..3).map(|_| station(&db, 1)).collect();
        for s in &stations {
            record(&db, *s, 50, 30.0, possum());
        }
        let visits = page(&db, &request(1, 10));
        assert_eq!(visits.len(), 3);
        assert!(visits.iter().all(|v| v.recordings.len() == 1));
    }

    #[test]
    fn test_classification_through_the_store() {
        let db = Database::open_in_memory().unwrap();
        let a = station(&db, 1);
        record(
            &db,
            a,
            0,
            30.0,
            vec![vec![NewTag::human("possum", "ana"), NewTag::human("rat", "ben")]],
        );
        let visits = page(&db, &request(1, 10));
        assert_eq!(visits[0].classification, CONFLICTING_TAGS);

        // Two independently resolved possums outvote the conflict
        record(&db, a, 60, 30.0, vec![vec![NewTag::human("possum", "ana")]]);
        record(&db, a, 120, 30.0, possum());
        let visits = page(&db, &request(1, 10));
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].classification, "possum");
    }

    #[test]
    fn test_tags_added_later_change_the_result() {
        let db = Database::open_in_memory().unwrap();
        let a = station(&db, 1);
        let id = record(&db, a, 0, 30.0, vec![vec![NewTag::automatic("cat", "research-v2")]]);
        assert_eq!(page(&db, &request(1, 10))[0].classification, "none");

        let track_id = db.recordings_by_ids(&[id]).unwrap()[0].tracks[0].id;
        db.add_track_tag(track_id, &NewTag::human("hedgehog", "ana")).unwrap();
        assert_eq!(page(&db, &request(1, 10))[0].classification, "hedgehog");

        let other_model = VisitRequest { compare_ai: Some("research-v2".into()), ..request(1, 10) };
        assert_eq!(page(&db, &other_model)[0].ai_classification, "cat");
    }

    #[test]
    fn test_tampered_criteria_are_narrowed() {
        let db = Database::open_in_memory().unwrap();
        let mine = station(&db, 1);
        let theirs = station(&db, 2);
        record(&db, mine, 0, 30.0, possum());
        db.insert_recording(&NewRecording {
            device_id: 5,
            group_id: 2,
            station_id: Some(theirs),
            recorded_at: t0() + Duration::seconds(10),
            duration: 30.0,
            location: None,
            tracks: vec![],
        })
        .unwrap();

        let viewer = Viewer { user: "ana".into(), groups: vec![1], super_user: false };
        let mut criteria = visit_criteria(&db, &viewer, &request(1, 10), false).unwrap();
        criteria.groups = Some(vec![1, 2]);
        let visits = generate_visits(&db, &viewer, &criteria).unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].station_id, mine);
    }

    #[test]
    fn test_stored_duration_past_date_range() {
        let db = Database::open_in_memory().unwrap();
        let a = station(&db, 1);
        let huge = record(&db, a, 0, 1e14, possum());
        record(&db, a, 3600, 30.0, possum());

        let visits = page(&db, &request(1, 10));
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].recordings[0].id, huge);
        assert_eq!(visits[0].recordings.len(), 2);
        assert_eq!(visits[0].end, t0() + Duration::seconds(3630));
    }

    #[test]
    fn test_rejects_invalid_page() {
        let db = Database::open_in_memory().unwrap();
        let op = Viewer::operator();
        let mut criteria = visit_criteria(&db, &op, &request(1, 10), true).unwrap();
        criteria.page = 0;
        assert!(matches!(
            generate_visits(&db, &op, &criteria),
            Err(QueryError::InvalidPage(0))
        ));
    }
}
