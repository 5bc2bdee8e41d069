//! Station matching: which station, if any, a recording was made at.
//!
//! Stations of one group must sit at least [`MIN_STATION_SEPARATION_M`] apart
//! while both are in service, so a point within half that distance of a
//! station cannot be equally close to another one.

use chrono::{DateTime, Utc};
use rusqlite::{Transaction, TransactionBehavior};
use thiserror::Error;

use crate::db::models::{LatLng, NewStation, Station};
use crate::db::{Database, DbError};

/// Mean Earth radius used by the Haversine formula.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
/// Minimum distance between two concurrently active stations of one group.
pub const MIN_STATION_SEPARATION_M: f64 = 60.0;
/// A recording is matched to a station within this radius.
pub const MATCH_RADIUS_M: f64 = MIN_STATION_SEPARATION_M / 2.0;

#[derive(Error, Debug)]
pub enum StationError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Station \"{name}\" is {distance_m:.1}m from active station {existing} (minimum 60m)")]
    TooClose {
        name: String,
        existing: i64,
        distance_m: f64,
    },
}

/// Great-circle distance in metres.
pub fn haversine_m(a: LatLng, b: LatLng) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Pick the station nearest to `point` among those active at `at` and
/// within [`MATCH_RADIUS_M`].
pub fn closest_station<'a>(
    stations: &'a [Station],
    point: LatLng,
    at: DateTime<Utc>,
) -> Option<&'a Station> {
    let mut candidates: Vec<(f64, &Station)> = stations
        .iter()
        .filter(|s| s.is_active_at(at))
        .map(|s| (haversine_m(point, s.location), s))
        .filter(|(d, _)| *d <= MATCH_RADIUS_M)
        .collect();

    candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    candidates.first().map(|(_, s)| *s)
}

/// Resolve a point and time to a station of `group_id`.
pub fn match_station(
    db: &Database,
    group_id: i64,
    point: LatLng,
    at: DateTime<Utc>,
) -> Result<Option<Station>, DbError> {
    let active = db.stations_active_at(group_id, at)?;
    Ok(closest_station(&active, point, at).cloned())
}

/// The first existing station that would be too close to `candidate` while
/// both are in service, with its distance.
pub fn station_conflict<'a>(
    existing: &'a [Station],
    candidate: &NewStation,
) -> Option<(&'a Station, f64)> {
    existing
        .iter()
        .filter(|s| s.group_id == candidate.group_id)
        .filter(|s| s.overlaps(candidate.active_at, None))
        .map(|s| (s, haversine_m(s.location, candidate.location)))
        .find(|(_, d)| *d < MIN_STATION_SEPARATION_M)
}

/// Create a station after checking the separation rule.
///
/// The check and the insert share one write transaction, so two concurrent
/// adds cannot both pass the check.
pub fn add_station(db: &Database, station: &NewStation) -> Result<i64, StationError> {
    let tx = Transaction::new_unchecked(&db.conn, TransactionBehavior::Immediate)
        .map_err(DbError::from)?;

    let existing = db.list_stations(Some(station.group_id))?;
    if let Some((clash, distance_m)) = station_conflict(&existing, station) {
        return Err(StationError::TooClose {
            name: station.name.clone(),
            existing: clash.id,
            distance_m,
        });
    }
    let id = db.insert_station(station)?;
    tx.commit().map_err(DbError::from)?;
    log::info!("Added station {} \"{}\" to group {}", id, station.name, station.group_id);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    /// Metres per degree of latitude on the Haversine sphere.
    const M_PER_DEG_LAT: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn origin() -> LatLng {
        LatLng { lat: -41.0, lng: 174.0 }
    }

    /// A point `metres` due north of the origin.
    fn north(metres: f64) -> LatLng {
        LatLng { lat: origin().lat + metres / M_PER_DEG_LAT, lng: origin().lng }
    }

    fn station_at(id: i64, location: LatLng) -> Station {
        Station {
            id,
            group_id: 1,
            name: format!("s{id}"),
            location,
            active_at: t0() - Duration::days(10),
            retired_at: None,
        }
    }

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude
        let d = haversine_m(LatLng { lat: 0.0, lng: 0.0 }, LatLng { lat: 1.0, lng: 0.0 });
        assert!((d - M_PER_DEG_LAT).abs() < 1e-6);
        assert_eq!(haversine_m(origin(), origin()), 0.0);
        assert!((haversine_m(origin(), north(25.0)) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_matches_single_station_within_radius() {
        let stations = vec![station_at(1, origin())];
        let found = closest_station(&stations, north(20.0), t0()).map(|s| s.id);
        assert_eq!(found, Some(1));
    }

    #[test]
    fn test_no_match_beyond_radius() {
        let stations = vec![station_at(1, origin()), station_at(2, north(100.0))];
        assert!(closest_station(&stations, north(50.0), t0()).is_none());
    }

    #[test]
    fn test_picks_nearest_of_several() {
        // Retired-and-replaced stations can leave two candidates in range
        let stations = vec![
            station_at(1, north(-25.0)),
            station_at(2, north(10.0)),
            station_at(3, north(28.0)),
        ];
        let found = closest_station(&stations, origin(), t0()).map(|s| s.id);
        assert_eq!(found, Some(2));
    }

    #[test]
    fn test_ignores_inactive_stations() {
        let mut retired = station_at(1, origin());
        retired.retired_at = Some(t0() - Duration::days(1));
        let mut future = station_at(2, origin());
        future.active_at = t0() + Duration::days(1);
        let stations = vec![retired, future];
        assert!(closest_station(&stations, origin(), t0()).is_none());
    }

    #[test]
    fn test_match_station_uses_group_and_time() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .insert_station(&NewStation {
                group_id: 1,
                name: "Ridge".into(),
                location: origin(),
                active_at: t0() - Duration::days(1),
            })
            .unwrap();

        let hit = match_station(&db, 1, north(5.0), t0()).unwrap().map(|s| s.id);
        assert_eq!(hit, Some(id));
        assert!(match_station(&db, 2, north(5.0), t0()).unwrap().is_none());
        assert!(match_station(&db, 1, north(5.0), t0() - Duration::days(2)).unwrap().is_none());
    }

    #[test]
    fn test_add_station_rejects_close_active_neighbour() {
        let db = Database::open_in_memory().unwrap();
        let first = NewStation {
            group_id: 1,
            name: "Ridge".into(),
            location: origin(),
            active_at: t0(),
        };
        let first_id = add_station(&db, &first).unwrap();

        let too_close = NewStation { name: "Ridge 2".into(), location: north(40.0), ..first.clone() };
        match add_station(&db, &too_close) {
            Err(StationError::TooClose { existing, distance_m, .. }) => {
                assert_eq!(existing, first_id);
                assert!((distance_m - 40.0).abs() < 0.01);
            }
            other => panic!("expected TooClose, got {other:?}"),
        }

        // Far enough away is fine
        let apart = NewStation { name: "Ridge 3".into(), location: north(70.0), ..first.clone() };
        assert!(add_station(&db, &apart).is_ok());

        // Once the first station is retired its spot can be reused
        db.retire_station(first_id, t0() + Duration::days(5)).unwrap();
        let replacement = NewStation {
            name: "Ridge (moved)".into(),
            location: north(-10.0),
            active_at: t0() + Duration::days(5),
            ..first
        };
        assert!(add_station(&db, &replacement).is_ok());
    }

    #[test]
    fn test_add_station_checks_under_write_lock() {
        let path = std::env::temp_dir().join(format!("fieldvisits-stations-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let other = Database::open(&path).unwrap();
        let db = Database::open(&path).unwrap();
        db.conn.busy_timeout(std::time::Duration::from_millis(50)).unwrap();

        let ridge = NewStation {
            group_id: 1,
            name: "Ridge".into(),
            location: origin(),
            active_at: t0(),
        };
        let neighbour = NewStation { name: "Ridge 2".into(), location: north(20.0), ..ridge.clone() };

        // Another writer is mid-way through adding a station nearby
        other.conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        other.insert_station(&ridge).unwrap();
        assert!(matches!(add_station(&db, &neighbour), Err(StationError::Db(_))));

        other.conn.execute_batch("COMMIT").unwrap();
        assert!(matches!(add_station(&db, &neighbour), Err(StationError::TooClose { .. })));
        assert_eq!(db.list_stations(Some(1)).unwrap().len(), 1);

        drop(other);
        drop(db);
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }
}
