//! Periodic per-station summary of classified visits.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::Database;
use crate::visits::{QueryError, Viewer, VisitRequest, generate_visits, visit_criteria};

/// Visits fetched per page while walking the whole range.
const DIGEST_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Serialize)]
pub struct StationDigest {
    pub station_id: i64,
    pub name: String,
    pub visits: u64,
    pub incomplete: u64,
    /// Classification -> visit count.
    pub classifications: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Digest {
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub visits: u64,
    /// Busiest stations first.
    pub stations: Vec<StationDigest>,
}

/// Start of the period covering the `hours` before `until`, or `None` when
/// `hours` is not positive or reaches past the representable range.
pub fn period_start(until: DateTime<Utc>, hours: i64) -> Option<DateTime<Utc>> {
    if hours < 1 {
        return None;
    }
    Duration::try_hours(hours).and_then(|span| until.checked_sub_signed(span))
}

/// Summarise every visit in `[from, until)` for the given groups (all the
/// viewer can see when empty).
pub fn build_digest(
    db: &Database,
    viewer: &Viewer,
    groups: &[i64],
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    compare_ai: Option<&str>,
) -> Result<Digest, QueryError> {
    let mut request = VisitRequest {
        groups: groups.to_vec(),
        from: Some(from),
        until: Some(until),
        page: 1,
        page_size: DIGEST_PAGE_SIZE,
        compare_ai: compare_ai.map(str::to_string),
        ..VisitRequest::default()
    };

    let mut by_station: HashMap<i64, StationDigest> = HashMap::new();
    let mut total = 0u64;
    loop {
        let criteria = visit_criteria(db, viewer, &request, true)?;
        if criteria.page > criteria.pages_estimate {
            break;
        }
        for visit in generate_visits(db, viewer, &criteria)? {
            total += 1;
            let entry = by_station.entry(visit.station_id).or_insert_with(|| StationDigest {
                station_id: visit.station_id,
                name: String::new(),
                visits: 0,
                incomplete: 0,
                classifications: BTreeMap::new(),
            });
            entry.visits += 1;
            if visit.incomplete {
                entry.incomplete += 1;
            }
            *entry.classifications.entry(visit.classification).or_default() += 1;
        }
        request.page += 1;
    }

    let mut stations: Vec<StationDigest> = by_station.into_values().collect();
    for s in &mut stations {
        s.name = db
            .get_station(s.station_id)?
            .map(|station| station.name)
            .unwrap_or_else(|| format!("#{}", s.station_id));
    }
    stations.sort_by(|a, b| b.visits.cmp(&a.visits).then_with(|| a.name.cmp(&b.name)));

    log::info!(
        "Digest {} .. {}: {} visits at {} stations",
        from,
        until,
        total,
        stations.len()
    );
    Ok(Digest { from, until, visits: total, stations })
}
