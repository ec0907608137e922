// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Produces a single playable MP4 from a time range on a stream by lossless
//! concatenation of the recordings index's stored files. Never re-encodes:
//! samples are read back with [`crate::mp4_reader`] and rewritten verbatim
//! with [`crate::mp4_writer`], which always emits a faststart layout.

use crate::mp4_reader;
use crate::mp4_writer::{self, Sample};
use base::{bail, err, Error};
use db::{Database, RecordingRow};
use std::path::{Path, PathBuf};
use tracing::warn;

/// What a completed export covers, returned alongside the output path so
/// callers can record it without re-reading the file.
#[derive(Clone, Debug)]
pub struct ExportMetadata {
    pub stream_name: String,
    pub start_time: base::Timestamp,
    pub end_time: base::Timestamp,
    pub recording_count: usize,
}

pub struct ExportEngine {
    db: Database,
    exports_dir: PathBuf,
}

impl ExportEngine {
    pub fn new(db: Database, exports_dir: PathBuf) -> Self {
        ExportEngine { db, exports_dir }
    }

    /// Exports every recording covering `[t_start, t_end]` on `stream`,
    /// concatenated in `start_time` order with no re-encoding.
    pub fn export_range(
        &self,
        stream: &str,
        t_start: base::Timestamp,
        t_end: base::Timestamp,
    ) -> Result<(PathBuf, ExportMetadata), Error> {
        let rows = self.db.list_recordings_by_time(stream, t_start, t_end)?;
        if rows.is_empty() {
            bail!(NoCoverage, msg("no recordings for {stream} overlapping range"));
        }

        let out_path = self.exports_dir.join(format!(
            "export_{stream}_{}_{}.mp4",
            t_start.unix_secs(),
            t_end.unix_secs()
        ));

        let manifest = existing_files(&rows);
        if manifest.is_empty() {
            bail!(NoCoverage, msg("every covering recording's file is missing on disk"));
        }

        let (entry, samples) = if manifest.len() == 1 {
            trim_single(&manifest[0], t_start, t_end)?
        } else {
            concat_all(&manifest)?
        };

        write_output(&out_path, &entry, &samples, t_start.unix_secs())?;

        Ok((
            out_path,
            ExportMetadata {
                stream_name: stream.to_string(),
                start_time: t_start,
                end_time: t_end,
                recording_count: manifest.len(),
            },
        ))
    }

    /// Trims within a single known recording, ignoring the index's other
    /// rows for `stream` entirely.
    pub fn export_single(
        &self,
        stream: &str,
        recording_id: i64,
        t_start: base::Timestamp,
        t_end: base::Timestamp,
    ) -> Result<PathBuf, Error> {
        let row = self.db.get_recording(recording_id)?;
        if row.stream_name != stream {
            bail!(RecordingNotFound, msg("recording {recording_id} is not on stream {stream}"));
        }
        if !Path::new(&row.file_path).exists() {
            bail!(NoCoverage, msg("recording {recording_id}'s file is missing on disk"));
        }

        let out_path = self.exports_dir.join(format!(
            "export_{stream}_{}_{}.mp4",
            t_start.unix_secs(),
            t_end.unix_secs()
        ));
        let (entry, samples) = trim_single(&row, t_start, t_end)?;
        write_output(&out_path, &entry, &samples, t_start.unix_secs())?;
        Ok(out_path)
    }
}

/// Rows with a file that still exists on disk, in `start_time` order
/// (already guaranteed by the index query). Missing files are logged and
/// dropped rather than failing the whole export.
fn existing_files(rows: &[RecordingRow]) -> Vec<RecordingRow> {
    rows.iter()
        .filter(|r| {
            let exists = Path::new(&r.file_path).exists();
            if !exists {
                warn!(recording_id = r.id, path = %r.file_path, "recording file missing, skipping in export");
            }
            exists
        })
        .cloned()
        .collect()
}

/// Reads `row`'s samples and keeps only those whose presentation time, once
/// translated to wall-clock, falls within `[t_start, t_end]`.
fn trim_single(
    row: &RecordingRow,
    t_start: base::Timestamp,
    t_end: base::Timestamp,
) -> Result<(crate::codec::VideoSampleEntry, Vec<Sample>), Error> {
    let track = mp4_reader::read(Path::new(&row.file_path))?;
    let row_start = row.start_time.unix_secs();

    let lo_90k = (t_start.unix_secs() - row_start).max(0) * 90_000;
    let hi_90k = (t_end.unix_secs() - row_start) * 90_000;

    let kept: Vec<Sample> = track
        .samples
        .into_iter()
        .filter(|s| s.pts_90k >= lo_90k && s.pts_90k < hi_90k)
        .collect();
    if kept.is_empty() {
        bail!(NoCoverage, msg("requested range has no samples in recording"));
    }
    Ok((track.entry, rebase(kept)))
}

/// Reads every file's samples in order and concatenates them, rebasing each
/// file's `pts_90k` to continue directly after the previous file's last
/// sample so the result has no gaps or resets.
fn concat_all(rows: &[RecordingRow]) -> Result<(crate::codec::VideoSampleEntry, Vec<Sample>), Error> {
    let mut all = Vec::new();
    let mut entry = None;
    let mut base_pts: i64 = 0;
    for row in rows {
        let track = mp4_reader::read(Path::new(&row.file_path))?;
        if entry.is_none() {
            entry = Some(track.entry);
        }
        let last = track.samples.last().map(|s| s.pts_90k + s.duration_90k as i64);
        for mut s in track.samples {
            s.pts_90k += base_pts;
            all.push(s);
        }
        if let Some(last) = last {
            base_pts += last;
        }
    }
    let entry = entry.ok_or_else(|| err!(NoCoverage, msg("no samples across concatenated recordings")))?;
    Ok((entry, all))
}

/// Shifts every sample's `pts_90k` so the first one starts at zero, matching
/// `mp4_writer`'s expectation that samples are relative to the file start.
fn rebase(samples: Vec<Sample>) -> Vec<Sample> {
    let Some(first_pts) = samples.first().map(|s| s.pts_90k) else {
        return samples;
    };
    samples
        .into_iter()
        .map(|mut s| {
            s.pts_90k -= first_pts;
            s
        })
        .collect()
}

fn write_output(
    path: &Path,
    entry: &crate::codec::VideoSampleEntry,
    samples: &[Sample],
    creation_time_unix_s: i64,
) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| err!(Io, source(e)).with_path(parent))?;
    }
    let mut f = std::fs::File::create(path).map_err(|e| err!(Io, source(e)).with_path(path))?;
    mp4_writer::write(&mut f, entry, samples, creation_time_unix_s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VideoSampleEntry;
    use db::{NewRecording, SegmentFormat, Trigger};

    fn entry() -> VideoSampleEntry {
        VideoSampleEntry {
            data: vec![0u8; 16],
            rfc6381_codec: "avc1.64001f".to_string(),
            width: 1280,
            height: 720,
            pasp_h_spacing: 1,
            pasp_v_spacing: 1,
        }
    }

    fn write_recording(dir: &Path, name: &str, first_pts: i64, count: i64) -> PathBuf {
        let path = dir.join(name);
        let samples: Vec<Sample> = (0..count)
            .map(|i| Sample {
                pts_90k: first_pts + i * 3000,
                duration_90k: 3000,
                is_key: i == 0,
                data: vec![0xcd; 40],
            })
            .collect();
        let mut f = std::fs::File::create(&path).unwrap();
        mp4_writer::write(&mut f, &entry(), &samples, 1_700_000_000).unwrap();
        path
    }

    fn insert(db: &Database, stream: &str, file_path: &Path, start: i64, end: i64) -> i64 {
        db.insert_recording(&NewRecording {
            stream_name: stream.to_string(),
            file_path: file_path.to_string_lossy().into_owned(),
            start_time: base::Timestamp::from_unix_secs(start).unwrap(),
            end_time: Some(base::Timestamp::from_unix_secs(end).unwrap()),
            size_bytes: 1000,
            segment_format: SegmentFormat::Mp4,
            trigger: Trigger::Continuous,
            event_id: None,
        })
        .unwrap()
    }

    #[test]
    fn no_coverage_fails_with_no_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let engine = ExportEngine::new(db, dir.path().to_path_buf());
        let e = engine
            .export_range(
                "cam1",
                base::Timestamp::from_unix_secs(0).unwrap(),
                base::Timestamp::from_unix_secs(10).unwrap(),
            )
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::NoCoverage);
    }

    #[test]
    fn single_recording_trims_to_range() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let file = write_recording(dir.path(), "a.mp4", 0, 20);
        insert(&db, "cam1", &file, 0, 60);

        let engine = ExportEngine::new(db, dir.path().join("exports"));
        let (out, meta) = engine
            .export_range(
                "cam1",
                base::Timestamp::from_unix_secs(0).unwrap(),
                base::Timestamp::from_unix_secs(30).unwrap(),
            )
            .unwrap();
        assert!(out.exists());
        assert_eq!(meta.recording_count, 1);
        let parsed = mp4_reader::read(&out).unwrap();
        assert!(!parsed.samples.is_empty());
        assert_eq!(parsed.samples[0].pts_90k, 0);
    }

    #[test]
    fn multiple_recordings_concat_in_start_time_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let a = write_recording(dir.path(), "a.mp4", 0, 10);
        let b = write_recording(dir.path(), "b.mp4", 0, 10);
        insert(&db, "cam1", &a, 0, 60);
        insert(&db, "cam1", &b, 60, 120);

        let engine = ExportEngine::new(db, dir.path().join("exports"));
        let (out, meta) = engine
            .export_range(
                "cam1",
                base::Timestamp::from_unix_secs(50).unwrap(),
                base::Timestamp::from_unix_secs(70).unwrap(),
            )
            .unwrap();
        assert_eq!(meta.recording_count, 2);
        let parsed = mp4_reader::read(&out).unwrap();
        assert_eq!(parsed.samples.len(), 20);
        // Monotonically increasing pts across the concat boundary.
        for w in parsed.samples.windows(2) {
            assert!(w[1].pts_90k > w[0].pts_90k);
        }
    }

    #[test]
    fn missing_file_is_skipped_with_remaining_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let a = write_recording(dir.path(), "a.mp4", 0, 10);
        let missing = dir.path().join("gone.mp4");
        insert(&db, "cam1", &missing, 0, 60);
        insert(&db, "cam1", &a, 60, 120);

        let engine = ExportEngine::new(db, dir.path().join("exports"));
        let (_out, meta) = engine
            .export_range(
                "cam1",
                base::Timestamp::from_unix_secs(0).unwrap(),
                base::Timestamp::from_unix_secs(120).unwrap(),
            )
            .unwrap();
        assert_eq!(meta.recording_count, 1);
    }

    #[test]
    fn export_single_rejects_recording_on_other_stream() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let a = write_recording(dir.path(), "a.mp4", 0, 10);
        let id = insert(&db, "cam1", &a, 0, 60);

        let engine = ExportEngine::new(db, dir.path().join("exports"));
        let e = engine
            .export_single(
                "cam2",
                id,
                base::Timestamp::from_unix_secs(0).unwrap(),
                base::Timestamp::from_unix_secs(10).unwrap(),
            )
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::RecordingNotFound);
    }
}
