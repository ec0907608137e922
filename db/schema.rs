// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

// Recordings index schema.
//
// One row per finished (or in-progress) segment group written by the
// recording engine. The index is intentionally flat: there is no
// composite-id sample index here, because nothing downstream needs
// frame-level seek tables -- clip export seeks within the MP4/TS files
// themselves.

pub const SCHEMA_VERSION: i32 = 1;

pub const CREATE_TABLES_SQL: &str = r#"
    create table if not exists meta (
      id integer primary key check (id = 0),
      schema_version integer not null
    );

    create table if not exists recordings (
      id integer primary key,
      stream_name text not null,
      file_path text not null,
      start_time integer not null,
      end_time integer,
      size_bytes integer not null default 0,
      segment_format text not null,
      trigger text not null,
      event_id text
    );

    create index if not exists recordings_stream_start
      on recordings (stream_name, start_time);
"#;
