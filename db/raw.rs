// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Raw SQLite statements which do not touch any cached state.

use crate::db::{NewRecording, RecordingRow};
use base::{err, ErrorKind, ResultExt as _};
use rusqlite::{named_params, OptionalExtension};

const INSERT_RECORDING_SQL: &str = r#"
    insert into recordings (stream_name, file_path, start_time, end_time,
                             size_bytes, segment_format, trigger, event_id)
                     values (:stream_name, :file_path, :start_time, :end_time,
                             :size_bytes, :segment_format, :trigger, :event_id)
"#;

const UPDATE_RECORDING_END_SQL: &str = r#"
    update recordings
    set end_time = :end_time, size_bytes = :size_bytes
    where id = :id
"#;

const SELECT_RECORDING_BY_ID_SQL: &str = r#"
    select id, stream_name, file_path, start_time, end_time, size_bytes,
           segment_format, trigger, event_id
    from recordings
    where id = :id
"#;

const SELECT_RECORDINGS_BY_TIME_SQL: &str = r#"
    select id, stream_name, file_path, start_time, end_time, size_bytes,
           segment_format, trigger, event_id
    from recordings
    where stream_name = :stream_name
      and start_time < :end_time
      and (end_time is null or end_time > :start_time)
    order by start_time
"#;

const SELECT_OLDEST_BY_STREAM_SQL: &str = r#"
    select id, stream_name, file_path, start_time, end_time, size_bytes,
           segment_format, trigger, event_id
    from recordings
    where stream_name = :stream_name
    order by start_time
    limit :limit
"#;

const DELETE_RECORDING_SQL: &str = "delete from recordings where id = :id";

const SUM_BYTES_FOR_STREAM_SQL: &str = r#"
    select coalesce(sum(size_bytes), 0) from recordings where stream_name = :stream_name
"#;

pub(crate) fn insert_recording(
    conn: &rusqlite::Connection,
    r: &NewRecording,
) -> Result<i64, base::Error> {
    let mut stmt = conn
        .prepare_cached(INSERT_RECORDING_SQL)
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {
        ":stream_name": r.stream_name,
        ":file_path": r.file_path,
        ":start_time": r.start_time.unix_secs(),
        ":end_time": r.end_time.map(|t| t.unix_secs()),
        ":size_bytes": r.size_bytes,
        ":segment_format": r.segment_format.as_str(),
        ":trigger": r.trigger.as_str(),
        ":event_id": r.event_id,
    })
    .err_kind(ErrorKind::Internal)?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn finish_recording(
    conn: &rusqlite::Connection,
    id: i64,
    end_time: base::Timestamp,
    size_bytes: i64,
) -> Result<(), base::Error> {
    let mut stmt = conn
        .prepare_cached(UPDATE_RECORDING_END_SQL)
        .err_kind(ErrorKind::Internal)?;
    let n = stmt
        .execute(named_params! {
            ":id": id,
            ":end_time": end_time.unix_secs(),
            ":size_bytes": size_bytes,
        })
        .err_kind(ErrorKind::Internal)?;
    if n == 0 {
        return Err(err!(RecordingNotFound, msg("recording {id} not found")));
    }
    Ok(())
}

pub(crate) fn get_recording(
    conn: &rusqlite::Connection,
    id: i64,
) -> Result<RecordingRow, base::Error> {
    let mut stmt = conn
        .prepare_cached(SELECT_RECORDING_BY_ID_SQL)
        .err_kind(ErrorKind::Internal)?;
    stmt.query_row(named_params! {":id": id}, RecordingRow::from_row)
        .optional()
        .err_kind(ErrorKind::Internal)?
        .ok_or_else(|| err!(RecordingNotFound, msg("recording {id} not found")))
}

pub(crate) fn list_recordings_by_time(
    conn: &rusqlite::Connection,
    stream_name: &str,
    start_time: i64,
    end_time: i64,
) -> Result<Vec<RecordingRow>, base::Error> {
    let mut stmt = conn
        .prepare_cached(SELECT_RECORDINGS_BY_TIME_SQL)
        .err_kind(ErrorKind::Internal)?;
    let rows = stmt
        .query_map(
            named_params! {
                ":stream_name": stream_name,
                ":start_time": start_time,
                ":end_time": end_time,
            },
            RecordingRow::from_row,
        )
        .err_kind(ErrorKind::Internal)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn list_oldest(
    conn: &rusqlite::Connection,
    stream_name: &str,
    limit: i64,
) -> Result<Vec<RecordingRow>, base::Error> {
    let mut stmt = conn
        .prepare_cached(SELECT_OLDEST_BY_STREAM_SQL)
        .err_kind(ErrorKind::Internal)?;
    let rows = stmt
        .query_map(
            named_params! {":stream_name": stream_name, ":limit": limit},
            RecordingRow::from_row,
        )
        .err_kind(ErrorKind::Internal)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn delete_recording(conn: &rusqlite::Connection, id: i64) -> Result<(), base::Error> {
    let mut stmt = conn
        .prepare_cached(DELETE_RECORDING_SQL)
        .err_kind(ErrorKind::Internal)?;
    let n = stmt
        .execute(named_params! {":id": id})
        .err_kind(ErrorKind::Internal)?;
    if n == 0 {
        return Err(err!(RecordingNotFound, msg("recording {id} not found")));
    }
    Ok(())
}

pub(crate) fn sum_bytes_for_stream(
    conn: &rusqlite::Connection,
    stream_name: &str,
) -> Result<i64, base::Error> {
    conn.query_row(
        SUM_BYTES_FOR_STREAM_SQL,
        named_params! {":stream_name": stream_name},
        |row| row.get(0),
    )
    .err_kind(ErrorKind::Internal)
}
