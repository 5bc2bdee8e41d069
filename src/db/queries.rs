use super::models::{
    LatLng, NewRecording, NewStation, NewTag, PriorRecording, Recording, RecordingFilter, Station,
    StoreStats, Track, TrackTag, UnassignedRecording, VisitStart,
};
use super::{column_time, column_time_opt, to_secs, Database, DbError, Result};
use crate::visits::segment::VISIT_GAP_SECS;
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::HashMap;

/// Shared WHERE clause for recordings that can take part in a visit.
/// Binds ?1 = from, ?2 = until (exclusive), ?3 = station ids JSON, ?4 = group ids JSON.
const FILTER_SQL: &str = "r.station_id IS NOT NULL
    AND r.duration > 0
    AND r.recorded_at >= ?1 AND r.recorded_at < ?2
    AND ((?3 IS NULL AND ?4 IS NULL)
         OR r.station_id IN (SELECT value FROM json_each(?3))
         OR r.group_id IN (SELECT value FROM json_each(?4)))";

/// Recordings in the filter, tagged with whether they open a visit.
/// Mirrors `visits::segment`: a recording starts a visit when it is the first
/// at its station or follows the previous one's end by more than ?5 seconds.
fn visit_start_cte() -> String {
    format!(
        "WITH ordered AS (
            SELECT r.id, r.station_id, r.recorded_at,
                   LAG(r.recorded_at + r.duration) OVER (
                       PARTITION BY r.station_id ORDER BY r.recorded_at, r.id
                   ) AS prev_end
            FROM recordings r
            WHERE {FILTER_SQL}
        ),
        starts AS (
            SELECT id, station_id, recorded_at FROM ordered
            WHERE prev_end IS NULL OR recorded_at - prev_end > ?5
        )"
    )
}

const RECORDING_COLUMNS: &str =
    "r.id, r.device_id, r.station_id, r.group_id, r.recorded_at, r.duration";

fn id_list(ids: &[i64]) -> String {
    let joined: Vec<String> = ids.iter().map(ToString::to_string).collect();
    format!("[{}]", joined.join(","))
}

fn filter_params(f: &RecordingFilter) -> (i64, i64, Option<String>, Option<String>) {
    (
        to_secs(f.from),
        to_secs(f.until),
        f.stations.as_deref().map(id_list),
        f.groups.as_deref().map(id_list),
    )
}

fn station_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Station> {
    Ok(Station {
        id: row.get(0)?,
        group_id: row.get(1)?,
        name: row.get(2)?,
        location: LatLng {
            lat: row.get(3)?,
            lng: row.get(4)?,
        },
        active_at: column_time(row, 5)?,
        retired_at: column_time_opt(row, 6)?,
    })
}

fn recording_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Recording> {
    Ok(Recording {
        id: row.get(0)?,
        device_id: row.get(1)?,
        station_id: row.get(2)?,
        group_id: row.get(3)?,
        recorded_at: column_time(row, 4)?,
        duration: row.get(5)?,
        tracks: Vec::new(),
    })
}

const STATION_COLUMNS: &str = "id, group_id, name, lat, lng, active_at, retired_at";

impl Database {
    /// Insert a station. Separation rules are checked by `location::add_station`.
    pub fn insert_station(&self, s: &NewStation) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO stations (group_id, name, lat, lng, active_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![s.group_id, s.name, s.location.lat, s.location.lng, to_secs(s.active_at)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Take a station out of service from `at` onwards.
    pub fn retire_station(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE stations SET retired_at = ?2 WHERE id = ?1",
            params![id, to_secs(at)],
        )?;
        if changed == 0 {
            return Err(DbError::StationNotFound { id });
        }
        Ok(())
    }

    pub fn get_station(&self, id: i64) -> Result<Option<Station>> {
        let result = self.conn.query_row(
            &format!("SELECT {STATION_COLUMNS} FROM stations WHERE id = ?1"),
            params![id],
            station_from_row,
        );
        match result {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All stations, optionally restricted to one group.
    pub fn list_stations(&self, group_id: Option<i64>) -> Result<Vec<Station>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STATION_COLUMNS} FROM stations
             WHERE ?1 IS NULL OR group_id = ?1
             ORDER BY group_id, name, id"
        ))?;
        let stations = stmt
            .query_map(params![group_id], station_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stations)
    }

    /// Stations of a group that were in service at `at`.
    pub fn stations_active_at(&self, group_id: i64, at: DateTime<Utc>) -> Result<Vec<Station>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {STATION_COLUMNS} FROM stations
             WHERE group_id = ?1
               AND active_at <= ?2
               AND (retired_at IS NULL OR retired_at > ?2)"
        ))?;
        let stations = stmt
            .query_map(params![group_id, to_secs(at)], station_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stations)
    }

    /// Map station ids to their group ids. Unknown ids are omitted.
    pub fn station_groups(&self, ids: &[i64]) -> Result<HashMap<i64, i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, group_id FROM stations WHERE id IN (SELECT value FROM json_each(?1))",
        )?;
        let pairs = stmt
            .query_map(params![id_list(ids)], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(pairs)
    }

    /// Insert a recording with its tracks and tags in a single transaction.
    pub fn insert_recording(&self, r: &NewRecording) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO recordings (device_id, group_id, station_id, recorded_at, duration, lat, lng)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                r.device_id,
                r.group_id,
                r.station_id,
                to_secs(r.recorded_at),
                r.duration,
                r.location.map(|l| l.lat),
                r.location.map(|l| l.lng),
            ],
        )?;
        let recording_id = tx.last_insert_rowid();

        for track in &r.tracks {
            tx.execute(
                "INSERT INTO tracks (recording_id, start_s, end_s) VALUES (?1, ?2, ?3)",
                params![recording_id, track.start_s, track.end_s],
            )?;
            let track_id = tx.last_insert_rowid();
            for tag in &track.tags {
                Self::insert_tag(&tx, track_id, tag)?;
            }
        }

        tx.commit()?;
        Ok(recording_id)
    }

    /// Stamp a station onto a recording that has none yet.
    /// Returns false if the recording already had a station (assignment is write-once).
    pub fn assign_station(&self, recording_id: i64, station_id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE recordings SET station_id = ?2 WHERE id = ?1 AND station_id IS NULL",
            params![recording_id, station_id],
        )?;
        Ok(changed > 0)
    }

    /// Recordings that have a location but no station, oldest first.
    pub fn unassigned_recordings(&self) -> Result<Vec<UnassignedRecording>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, group_id, recorded_at, lat, lng FROM recordings
             WHERE station_id IS NULL AND lat IS NOT NULL AND lng IS NOT NULL
             ORDER BY recorded_at, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UnassignedRecording {
                    id: row.get(0)?,
                    group_id: row.get(1)?,
                    recorded_at: column_time(row, 2)?,
                    location: LatLng {
                        lat: row.get(3)?,
                        lng: row.get(4)?,
                    },
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Add a tag to an existing track (tags can arrive long after ingestion).
    pub fn add_track_tag(&self, track_id: i64, tag: &NewTag) -> Result<i64> {
        Self::insert_tag(&self.conn, track_id, tag)
    }

    fn insert_tag(conn: &rusqlite::Connection, track_id: i64, tag: &NewTag) -> Result<i64> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO track_tags (track_id, label, automatic, model, user_id, path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![track_id, tag.label, tag.automatic, tag.model, tag.user, tag.path])?;
        Ok(conn.last_insert_rowid())
    }

    /// Count recordings that open a visit anywhere in the filtered range.
    pub fn count_visit_starts(&self, filter: &RecordingFilter) -> Result<u64> {
        let (from, until, stations, groups) = filter_params(filter);
        let sql = format!("{} SELECT COUNT(*) FROM starts", visit_start_cte());
        let count: i64 = self.conn.query_row(
            &sql,
            params![from, until, stations, groups, VISIT_GAP_SECS],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Visit-start rows, newest first.
    pub fn visit_starts(
        &self,
        filter: &RecordingFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<VisitStart>> {
        let (from, until, stations, groups) = filter_params(filter);
        let sql = format!(
            "{} SELECT id, station_id, recorded_at FROM starts
             ORDER BY recorded_at DESC, id DESC
             LIMIT ?6 OFFSET ?7",
            visit_start_cte()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![from, until, stations, groups, VISIT_GAP_SECS, limit as i64, offset as i64],
                |row| {
                    Ok(VisitStart {
                        recording_id: row.get(0)?,
                        station_id: row.get(1)?,
                        recorded_at: column_time(row, 2)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Recordings matching `filter` that started no later than `page_until`,
    /// oldest first, with tracks and tags attached.
    pub fn recordings_in_window(
        &self,
        filter: &RecordingFilter,
        page_until: DateTime<Utc>,
    ) -> Result<Vec<Recording>> {
        let (from, until, stations, groups) = filter_params(filter);
        let sql = format!(
            "SELECT {RECORDING_COLUMNS} FROM recordings r
             WHERE {FILTER_SQL} AND r.recorded_at <= ?5
             ORDER BY r.recorded_at, r.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut recordings = stmt
            .query_map(
                params![from, until, stations, groups, to_secs(page_until)],
                recording_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.attach_tracks(&mut recordings)?;
        Ok(recordings)
    }

    /// Follow a visit forward from `last`: every later recording at the same
    /// station that keeps within the visit gap, stopping before `until`.
    pub fn visit_continuation(&self, last: &Recording, until: DateTime<Utc>) -> Result<Vec<Recording>> {
        let Some(station_id) = last.station_id else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare_cached(
            "WITH RECURSIVE chain(id, recorded_at, duration) AS (
                SELECT id, recorded_at, duration FROM recordings WHERE id = ?1
                UNION ALL
                SELECT n.id, n.recorded_at, n.duration
                FROM chain c
                JOIN recordings n ON n.id = (
                    SELECT m.id FROM recordings m
                    WHERE m.station_id = ?2
                      AND m.duration > 0
                      AND (m.recorded_at > c.recorded_at
                           OR (m.recorded_at = c.recorded_at AND m.id > c.id))
                    ORDER BY m.recorded_at, m.id
                    LIMIT 1
                )
                WHERE n.recorded_at - (c.recorded_at + c.duration) <= ?3
                  AND n.recorded_at < ?4
            )
            SELECT id FROM chain WHERE id <> ?1",
        )?;
        let ids = stmt
            .query_map(
                params![last.id, station_id, VISIT_GAP_SECS, to_secs(until)],
                |row| row.get::<_, i64>(0),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.recordings_by_ids(&ids)
    }

    /// The recording at the same station immediately before `recording`.
    pub fn prior_recording(&self, recording: &Recording) -> Result<Option<PriorRecording>> {
        let Some(station_id) = recording.station_id else {
            return Ok(None);
        };
        let result = self.conn.query_row(
            "SELECT id, recorded_at, duration FROM recordings
             WHERE station_id = ?1
               AND duration > 0
               AND (recorded_at < ?2 OR (recorded_at = ?2 AND id < ?3))
             ORDER BY recorded_at DESC, id DESC
             LIMIT 1",
            params![station_id, to_secs(recording.recorded_at), recording.id],
            |row| {
                Ok(PriorRecording {
                    id: row.get(0)?,
                    recorded_at: column_time(row, 1)?,
                    duration: row.get(2)?,
                })
            },
        );
        match result {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load recordings by id, oldest first, with tracks and tags attached.
    pub fn recordings_by_ids(&self, ids: &[i64]) -> Result<Vec<Recording>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORDING_COLUMNS} FROM recordings r
             WHERE r.id IN (SELECT value FROM json_each(?1))
             ORDER BY r.recorded_at, r.id"
        ))?;
        let mut recordings = stmt
            .query_map(params![id_list(ids)], recording_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.attach_tracks(&mut recordings)?;
        Ok(recordings)
    }

    /// Fill in `tracks` (and their tags) for each recording with one query.
    fn attach_tracks(&self, recordings: &mut [Recording]) -> Result<()> {
        if recordings.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = recordings.iter().map(|r| r.id).collect();
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.recording_id, t.start_s, t.end_s,
                    g.label, g.automatic, g.model, g.user_id, g.path
             FROM tracks t
             LEFT JOIN track_tags g ON g.track_id = t.id
             WHERE t.recording_id IN (SELECT value FROM json_each(?1))
             ORDER BY t.recording_id, t.id, g.id",
        )?;

        let mut by_recording: HashMap<i64, Vec<Track>> = HashMap::new();
        let mut rows = stmt.query(params![id_list(&ids)])?;
        while let Some(row) = rows.next()? {
            let track_id: i64 = row.get(0)?;
            let recording_id: i64 = row.get(1)?;
            let tracks = by_recording.entry(recording_id).or_default();

            if tracks.last().is_none_or(|t| t.id != track_id) {
                tracks.push(Track {
                    id: track_id,
                    recording_id,
                    start_s: row.get(2)?,
                    end_s: row.get(3)?,
                    tags: Vec::new(),
                });
            }

            // LEFT JOIN: untagged tracks yield a single row with NULL tag columns
            let label: Option<String> = row.get(4)?;
            if let (Some(label), Some(track)) = (label, tracks.last_mut()) {
                track.tags.push(TrackTag {
                    track_id,
                    label,
                    automatic: row.get(5)?,
                    model: row.get(6)?,
                    user: row.get(7)?,
                    path: row.get(8)?,
                });
            }
        }

        for recording in recordings.iter_mut() {
            recording.tracks = by_recording.remove(&recording.id).unwrap_or_default();
        }
        Ok(())
    }

    /// Get store statistics.
    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<i64> { Ok(self.conn.query_row(sql, [], |row| row.get(0))?) };

        let stations = count("SELECT COUNT(*) FROM stations")?;
        let active_stations = count("SELECT COUNT(*) FROM stations WHERE retired_at IS NULL")?;
        let recordings = count("SELECT COUNT(*) FROM recordings")?;
        let unassigned_recordings = count("SELECT COUNT(*) FROM recordings WHERE station_id IS NULL")?;
        let tracks = count("SELECT COUNT(*) FROM tracks")?;
        let human_tags = count("SELECT COUNT(*) FROM track_tags WHERE automatic = 0")?;
        let automatic_tags = count("SELECT COUNT(*) FROM track_tags WHERE automatic = 1")?;

        let mut model_stmt = self.conn.prepare(
            "SELECT COALESCE(model, '?'), COUNT(*)
             FROM track_tags
             WHERE automatic = 1
             GROUP BY COALESCE(model, '?')
             ORDER BY COUNT(*) DESC",
        )?;
        let models: Vec<(String, i64)> = model_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(StoreStats {
            stations,
            active_stations,
            recordings,
            unassigned_recordings,
            tracks,
            human_tags,
            automatic_tags,
            models,
        })
    }
}
