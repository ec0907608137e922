// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The recordings index: a flat SQLite table mapping stream name and time
//! range to the on-disk segment-group files the recording engine writes,
//! used by the clip/export engine to answer range queries and by the
//! retention sweep to find eviction candidates.

mod db;
mod raw;
mod schema;

pub use crate::db::{Database, NewRecording, RecordingRow, SegmentFormat, Trigger};
