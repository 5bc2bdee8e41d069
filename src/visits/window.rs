//! Page windows over the derived visits relation.
//!
//! Visits are not stored, so a plain OFFSET over them would mean segmenting
//! the whole history on every request. Instead:
//!
//! 1. count visit-start recordings over the full filtered range to estimate
//!    the number of pages, then
//! 2. fetch only the visit-start rows for the requested page (plus one) to
//!    find the exact time window its visits start in.

use chrono::{DateTime, Utc};

use super::{QueryError, Viewer, VisitCriteria, VisitRequest, comparison_model};
use crate::db::Database;

/// Build the criteria for one page of visits.
///
/// Requested stations and groups the viewer may not see are dropped without
/// error; if nothing visible remains the criteria describe an empty result.
pub fn visit_criteria(
    db: &Database,
    viewer: &Viewer,
    request: &VisitRequest,
    elevated: bool,
) -> Result<VisitCriteria, QueryError> {
    if request.page < 1 {
        return Err(QueryError::InvalidPage(request.page));
    }
    if request.page_size < 1 {
        return Err(QueryError::InvalidPageSize(request.page_size));
    }
    let search_from = request.from.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let search_until = request.until.unwrap_or_else(Utc::now);
    if search_from >= search_until {
        return Err(QueryError::InvalidRange {
            from: search_from,
            until: search_until,
        });
    }

    let scope = viewer.scope(elevated);
    let (stations, groups) = if request.stations.is_empty() && request.groups.is_empty() {
        (None, scope.map(<[i64]>::to_vec))
    } else {
        let stations = (!request.stations.is_empty())
            .then(|| visible_stations(db, scope, &request.stations))
            .transpose()?;
        let groups = (!request.groups.is_empty()).then(|| visible_groups(scope, &request.groups));
        (stations, groups)
    };

    let mut criteria = VisitCriteria {
        page: request.page,
        page_size: request.page_size,
        pages_estimate: 0,
        search_from,
        search_until,
        page_from: search_from,
        page_until: search_until,
        page_from_recording: None,
        page_until_recording: None,
        stations,
        groups,
        compare_ai: comparison_model(request.compare_ai.as_deref()),
    };

    let filter = criteria.filter();
    if filter.matches_nothing() {
        log::debug!("No visible stations or groups for {}", viewer.user);
        return Ok(criteria);
    }

    // Phase 1: estimate
    let page_size = u64::from(request.page_size);
    let starts = db.count_visit_starts(&filter)?;
    criteria.pages_estimate = u32::try_from(starts.div_ceil(page_size)).unwrap_or(u32::MAX);
    log::debug!(
        "{} visit starts between {} and {} ({} pages of {})",
        starts,
        search_from,
        search_until,
        criteria.pages_estimate,
        page_size
    );

    if criteria.page > criteria.pages_estimate || starts <= page_size {
        // Beyond the last page, or everything fits on page 1: search window as-is
        return Ok(criteria);
    }

    // Phase 2: exact window from the visit-start rows of this page, plus
    // one more to tell whether an older page follows.
    let offset = u64::from(request.page - 1) * page_size;
    let rows = db.visit_starts(&filter, page_size + 1, offset)?;

    let Some(newest) = rows.first() else {
        // Rows vanished between the two queries
        criteria.pages_estimate = request.page - 1;
        return Ok(criteria);
    };
    if request.page > 1 {
        criteria.page_until = newest.recorded_at;
        criteria.page_until_recording = Some(newest.recording_id);
    }
    if rows.len() as u64 > page_size {
        let oldest = &rows[rows.len() - 2];
        criteria.page_from = oldest.recorded_at;
        criteria.page_from_recording = Some(oldest.recording_id);
    }

    log::debug!(
        "Page {} window: {} .. {}",
        criteria.page,
        criteria.page_from,
        criteria.page_until
    );
    Ok(criteria)
}

/// Keep the stations whose group `scope` allows. Unknown stations are dropped.
pub(crate) fn visible_stations(
    db: &Database,
    scope: Option<&[i64]>,
    stations: &[i64],
) -> Result<Vec<i64>, QueryError> {
    let groups = db.station_groups(stations)?;
    let visible: Vec<i64> = stations
        .iter()
        .copied()
        .filter(|id| {
            groups
                .get(id)
                .is_some_and(|g| scope.is_none_or(|allowed| allowed.contains(g)))
        })
        .collect();
    if visible.len() < stations.len() {
        log::debug!("Dropped {} stations outside the viewer's groups", stations.len() - visible.len());
    }
    Ok(visible)
}

/// Keep the groups `scope` allows.
pub(crate) fn visible_groups(scope: Option<&[i64]>, groups: &[i64]) -> Vec<i64> {
    groups
        .iter()
        .copied()
        .filter(|g| scope.is_none_or(|allowed| allowed.contains(g)))
        .collect()
}
