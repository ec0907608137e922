// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Database access logic for the recordings index.
//!
//! [`Database`] wraps a single SQLite connection behind a mutex, following
//! the single-writer assumption the recording engine and clip/export
//! engine both rely on: only one process touches a given store directory
//! at a time, so a plain `Mutex` (no connection pool) is sufficient and
//! avoids SQLITE_BUSY churn under concurrent segment closes.

use base::{err, ErrorKind, ResultExt as _};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::raw;
use crate::schema;

/// On-disk container format of a recording's segments.
#[derive(Copy, Clone, Eq, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
pub enum SegmentFormat {
    Mp4,
    MpegTs,
}

impl SegmentFormat {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SegmentFormat::Mp4 => "mp4",
            SegmentFormat::MpegTs => "mpegts",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, base::Error> {
        match s {
            "mp4" => Ok(SegmentFormat::Mp4),
            "mpegts" => Ok(SegmentFormat::MpegTs),
            _ => Err(err!(Internal, msg("unknown segment_format {s:?}"))),
        }
    }
}

/// What caused a recording to start.
#[derive(Copy, Clone, Eq, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
pub enum Trigger {
    /// Continuous-mode recording with no gating.
    Continuous,
    /// Started by a detection event (motion, object, or ONVIF event).
    Detection,
    /// Started by an operator-initiated manual clip.
    Manual,
}

impl Trigger {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Trigger::Continuous => "continuous",
            Trigger::Detection => "detection",
            Trigger::Manual => "manual",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, base::Error> {
        match s {
            "continuous" => Ok(Trigger::Continuous),
            "detection" => Ok(Trigger::Detection),
            "manual" => Ok(Trigger::Manual),
            _ => Err(err!(Internal, msg("unknown trigger {s:?}"))),
        }
    }
}

/// A recording row as it exists once inserted; `id` is assigned by SQLite.
#[derive(Clone, Debug)]
pub struct RecordingRow {
    pub id: i64,
    pub stream_name: String,
    pub file_path: String,
    pub start_time: base::Timestamp,
    pub end_time: Option<base::Timestamp>,
    pub size_bytes: i64,
    pub segment_format: SegmentFormat,
    pub trigger: Trigger,
    pub event_id: Option<String>,
}

impl RecordingRow {
    pub(crate) fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let start_time: i64 = row.get(3)?;
        let end_time: Option<i64> = row.get(4)?;
        let segment_format: String = row.get(6)?;
        let trigger: String = row.get(7)?;
        Ok(RecordingRow {
            id: row.get(0)?,
            stream_name: row.get(1)?,
            file_path: row.get(2)?,
            start_time: base::Timestamp::from_unix_secs(start_time)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            end_time: end_time
                .map(base::Timestamp::from_unix_secs)
                .transpose()
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            size_bytes: row.get(5)?,
            segment_format: SegmentFormat::parse(&segment_format)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            trigger: Trigger::parse(&trigger).map_err(|_| rusqlite::Error::InvalidQuery)?,
            event_id: row.get(8)?,
        })
    }
}

/// A recording to be inserted; `id` is not yet known.
#[derive(Clone, Debug)]
pub struct NewRecording {
    pub stream_name: String,
    pub file_path: String,
    pub start_time: base::Timestamp,
    pub end_time: Option<base::Timestamp>,
    pub size_bytes: i64,
    pub segment_format: SegmentFormat,
    pub trigger: Trigger,
    pub event_id: Option<String>,
}

struct LockedDatabase {
    conn: rusqlite::Connection,
}

/// The recordings index. Cheap to clone; internally reference-counted.
#[derive(Clone)]
pub struct Database(Arc<Mutex<LockedDatabase>>);

impl Database {
    /// Opens (creating if needed) the recordings index at `path`.
    pub fn open(path: &Path) -> Result<Self, base::Error> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| err!(Io, msg("opening {}", path.display()), source(e)))?;
        conn.execute_batch(schema::CREATE_TABLES_SQL)
            .err_kind(ErrorKind::Internal)?;
        conn.execute(
            "insert or ignore into meta (id, schema_version) values (0, ?1)",
            [schema::SCHEMA_VERSION],
        )
        .err_kind(ErrorKind::Internal)?;
        info!(path = %path.display(), "opened recordings index");
        Ok(Database(Arc::new(Mutex::new(LockedDatabase { conn }))))
    }

    /// Opens a private, in-memory index; used by tests.
    pub fn open_in_memory() -> Result<Self, base::Error> {
        let conn = rusqlite::Connection::open_in_memory().err_kind(ErrorKind::Internal)?;
        conn.execute_batch(schema::CREATE_TABLES_SQL)
            .err_kind(ErrorKind::Internal)?;
        Ok(Database(Arc::new(Mutex::new(LockedDatabase { conn }))))
    }

    fn lock(&self) -> MutexGuard<'_, LockedDatabase> {
        self.0.lock().unwrap()
    }

    /// Inserts a new, possibly still-open, recording and returns its id.
    pub fn insert_recording(&self, r: &NewRecording) -> Result<i64, base::Error> {
        raw::insert_recording(&self.lock().conn, r)
    }

    /// Marks a recording's segment group as closed, recording its final
    /// size. Called when the recording engine rolls to a new file or the
    /// stream stops.
    pub fn finish_recording(
        &self,
        id: i64,
        end_time: base::Timestamp,
        size_bytes: i64,
    ) -> Result<(), base::Error> {
        raw::finish_recording(&self.lock().conn, id, end_time, size_bytes)
    }

    pub fn get_recording(&self, id: i64) -> Result<RecordingRow, base::Error> {
        raw::get_recording(&self.lock().conn, id)
    }

    /// Lists every recording for `stream_name` overlapping
    /// `[start_time, end_time)`, ascending by start time. This is the
    /// range query the clip/export engine uses to build a coverage
    /// manifest.
    pub fn list_recordings_by_time(
        &self,
        stream_name: &str,
        start_time: base::Timestamp,
        end_time: base::Timestamp,
    ) -> Result<Vec<RecordingRow>, base::Error> {
        raw::list_recordings_by_time(
            &self.lock().conn,
            stream_name,
            start_time.unix_secs(),
            end_time.unix_secs(),
        )
    }

    /// Lists the `limit` oldest recordings for `stream_name`, ascending by
    /// start time. Used by the retention sweep to find eviction
    /// candidates once a stream exceeds its storage quota.
    pub fn list_oldest(
        &self,
        stream_name: &str,
        limit: i64,
    ) -> Result<Vec<RecordingRow>, base::Error> {
        raw::list_oldest(&self.lock().conn, stream_name, limit)
    }

    pub fn delete_recording(&self, id: i64) -> Result<(), base::Error> {
        raw::delete_recording(&self.lock().conn, id)
    }

    /// Total bytes currently indexed for `stream_name`, used to decide
    /// whether the retention sweep needs to evict anything.
    pub fn bytes_for_stream(&self, stream_name: &str) -> Result<i64, base::Error> {
        raw::sum_bytes_for_stream(&self.lock().conn, stream_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(stream: &str, start: i64) -> NewRecording {
        NewRecording {
            stream_name: stream.to_string(),
            file_path: format!("/recordings/{stream}/{start}.mp4"),
            start_time: base::Timestamp::from_unix_secs(start).unwrap(),
            end_time: None,
            size_bytes: 0,
            segment_format: SegmentFormat::Mp4,
            trigger: Trigger::Continuous,
            event_id: None,
        }
    }

    #[test]
    fn insert_and_fetch_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_recording(&sample("cam1", 1_000)).unwrap();
        let row = db.get_recording(id).unwrap();
        assert_eq!(row.stream_name, "cam1");
        assert_eq!(row.trigger, Trigger::Continuous);
        assert!(row.end_time.is_none());
    }

    #[test]
    fn finish_recording_sets_end_and_size() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_recording(&sample("cam1", 1_000)).unwrap();
        let end = base::Timestamp::from_unix_secs(1_060).unwrap();
        db.finish_recording(id, end, 4096).unwrap();
        let row = db.get_recording(id).unwrap();
        assert_eq!(row.end_time, Some(end));
        assert_eq!(row.size_bytes, 4096);
    }

    #[test]
    fn finish_unknown_recording_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let end = base::Timestamp::from_unix_secs(1).unwrap();
        let e = db.finish_recording(9999, end, 0).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::RecordingNotFound);
    }

    #[test]
    fn list_by_time_only_returns_overlapping_rows() {
        let db = Database::open_in_memory().unwrap();
        let a = db.insert_recording(&sample("cam1", 0)).unwrap();
        db.finish_recording(a, base::Timestamp::from_unix_secs(100).unwrap(), 10)
            .unwrap();
        let b = db.insert_recording(&sample("cam1", 200)).unwrap();
        db.finish_recording(b, base::Timestamp::from_unix_secs(300).unwrap(), 10)
            .unwrap();

        let rows = db
            .list_recordings_by_time(
                "cam1",
                base::Timestamp::from_unix_secs(50).unwrap(),
                base::Timestamp::from_unix_secs(150).unwrap(),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, a);
    }

    #[test]
    fn list_oldest_orders_ascending_and_respects_limit() {
        let db = Database::open_in_memory().unwrap();
        for start in [300, 100, 200] {
            db.insert_recording(&sample("cam1", start)).unwrap();
        }
        let rows = db.list_oldest("cam1", 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].start_time.unix_secs(), 100);
        assert_eq!(rows[1].start_time.unix_secs(), 200);
    }

    #[test]
    fn bytes_for_stream_sums_finished_recordings() {
        let db = Database::open_in_memory().unwrap();
        let a = db.insert_recording(&sample("cam1", 0)).unwrap();
        db.finish_recording(a, base::Timestamp::from_unix_secs(10).unwrap(), 1000)
            .unwrap();
        let b = db.insert_recording(&sample("cam1", 20)).unwrap();
        db.finish_recording(b, base::Timestamp::from_unix_secs(30).unwrap(), 2000)
            .unwrap();
        assert_eq!(db.bytes_for_stream("cam1").unwrap(), 3000);
    }

    #[test]
    fn delete_removes_row() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_recording(&sample("cam1", 0)).unwrap();
        db.delete_recording(id).unwrap();
        let e = db.get_recording(id).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::RecordingNotFound);
    }
}
