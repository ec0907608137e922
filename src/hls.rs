// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Rolling HLS playlist + segment writer. One [`HlsSession`] per stream;
//! `write_packet` rolls to a new `segment_<N>.ts` at the first key frame
//! once the current segment has accumulated `segment_duration_s` of
//! presentation time, and publishes the playlist via write-new + rename
//! so readers never observe a half-written file.

use crate::codec::VideoSampleEntry;
use crate::sink::{Packet, PacketSink};
use crate::ts::TsMuxer;
use base::{err, Error};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const CLOCK_RATE_90K: i64 = 90_000;

struct SegmentInfo {
    index: u64,
    duration_s: f64,
}

/// Per-stream HLS state. `write_packet` must only be called from a single
/// thread in sequence, per the concurrency invariant; nothing here is
/// internally synchronized.
pub struct HlsSession {
    out_dir: PathBuf,
    segment_duration_s: u32,
    playlist_window: usize,
    segment_index: u64,
    segments: VecDeque<SegmentInfo>,
    current: Option<CurrentSegment>,
    first_pts_90k: Option<i64>,
    consecutive_write_failures: u32,
}

struct CurrentSegment {
    index: u64,
    file: BufWriter<File>,
    muxer: TsMuxer,
    start_pts_90k: i64,
    last_pts_90k: i64,
}

impl HlsSession {
    /// Creates `out_dir` (and parents), clears any preexisting segments
    /// for this stream, and starts a fresh session at segment index 0.
    pub fn open(out_dir: &Path, segment_duration_s: u32, playlist_window: usize) -> Result<Self, Error> {
        std::fs::create_dir_all(out_dir).map_err(|e| err!(Io, source(e)))?;
        if let Ok(entries) = std::fs::read_dir(out_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with("segment_") && name.ends_with(".ts") {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(HlsSession {
            out_dir: out_dir.to_path_buf(),
            segment_duration_s,
            playlist_window,
            segment_index: 0,
            segments: VecDeque::new(),
            current: None,
            first_pts_90k: None,
            consecutive_write_failures: 0,
        })
    }

    fn segment_path(&self, index: u64) -> PathBuf {
        self.out_dir.join(format!("segment_{index}.ts"))
    }

    fn open_new_segment(&mut self, pts_90k: i64) -> Result<(), Error> {
        let index = self.segment_index;
        self.segment_index += 1;
        let path = self.segment_path(index);
        let file = File::create(&path).map_err(|e| err!(Io, source(e)))?;
        self.current = Some(CurrentSegment {
            index,
            file: BufWriter::new(file),
            muxer: TsMuxer::new(),
            start_pts_90k: pts_90k,
            last_pts_90k: pts_90k,
        });
        Ok(())
    }

    /// Closes the current segment: flushes and fsyncs the file, records
    /// its duration, then rewrites the playlist (write-new + rename) and
    /// prunes segments older than `playlist_window`.
    fn close_current_segment(&mut self) -> Result<(), Error> {
        let Some(cur) = self.current.take() else {
            return Ok(());
        };
        let duration_90k = (cur.last_pts_90k - cur.start_pts_90k).max(1);
        let mut file = cur.file.into_inner().map_err(|e| err!(Io, source(e.into_error())))?;
        file.flush().map_err(|e| err!(Io, source(e)))?;
        file.sync_all().map_err(|e| err!(Io, source(e)))?;
        self.segments.push_back(SegmentInfo {
            index: cur.index,
            duration_s: duration_90k as f64 / CLOCK_RATE_90K as f64,
        });
        while self.segments.len() > self.playlist_window {
            if let Some(old) = self.segments.pop_front() {
                let _ = std::fs::remove_file(self.segment_path(old.index));
            }
        }
        self.publish_playlist()
    }

    fn publish_playlist(&self) -> Result<(), Error> {
        let max_duration = self
            .segments
            .iter()
            .map(|s| s.duration_s)
            .fold(0.0_f64, f64::max);
        let target_duration = max_duration.ceil().max(1.0) as u64;
        let first_index = self.segments.front().map(|s| s.index).unwrap_or(0);

        let mut body = String::new();
        body.push_str("#EXTM3U\n");
        body.push_str("#EXT-X-VERSION:3\n");
        body.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration}\n"));
        body.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{first_index}\n"));
        for seg in &self.segments {
            body.push_str(&format!("#EXTINF:{:.3},\n", seg.duration_s));
            body.push_str(&format!("segment_{}.ts\n", seg.index));
        }

        let tmp_path = self.out_dir.join("index.m3u8.tmp");
        let final_path = self.out_dir.join("index.m3u8");
        {
            let mut f = File::create(&tmp_path).map_err(|e| err!(Io, source(e)))?;
            f.write_all(body.as_bytes()).map_err(|e| err!(Io, source(e)))?;
            f.sync_all().map_err(|e| err!(Io, source(e)))?;
        }
        std::fs::rename(&tmp_path, &final_path).map_err(|e| err!(Io, source(e)))?;
        Ok(())
    }

    /// Flushes the current segment and updates the playlist a final time.
    /// Consumes the session; callers that only have `&mut HlsSession` (the
    /// common case, via [`PacketSink::close`]) can't reach this directly.
    pub fn finish(mut self) -> Result<(), Error> {
        self.close_current_segment()
    }

    fn write_packet_inner(&mut self, pkt: &Packet) -> Result<(), Error> {
        let first_pts = *self.first_pts_90k.get_or_insert(pkt.pts);
        let pts_90k = pkt.pts - first_pts;
        let dts_90k = pkt.dts - first_pts;

        let should_roll = self.current.as_ref().is_some_and(|cur| {
            pkt.is_key
                && (pts_90k - cur.start_pts_90k) as f64 / CLOCK_RATE_90K as f64
                    >= self.segment_duration_s as f64
        });
        if should_roll {
            self.close_current_segment()?;
        }
        if self.current.is_none() {
            self.open_new_segment(pts_90k)?;
        }

        let cur = self.current.as_mut().expect("just ensured Some");
        cur.last_pts_90k = pts_90k;
        cur.muxer
            .write_sample(&mut cur.file, pts_90k, dts_90k, pkt.is_key, &pkt.data)
    }
}

impl PacketSink for HlsSession {
    /// A write failure ends the current segment as-is and attempts one
    /// reopen; a second consecutive failure surfaces `SinkFatal`.
    fn write_packet(&mut self, pkt: &Packet, _entry: &VideoSampleEntry) -> Result<(), Error> {
        match self.write_packet_inner(pkt) {
            Ok(()) => {
                self.consecutive_write_failures = 0;
                Ok(())
            }
            Err(e) => {
                self.current = None;
                self.consecutive_write_failures += 1;
                if self.consecutive_write_failures >= 2 {
                    return Err(err!(SinkFatal, msg("HLS segment write failed twice"), source(e)));
                }
                // First failure: swallow and let the next packet's
                // implicit reopen (current is None) retry.
                Ok(())
            }
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        let s = std::mem::replace(
            self,
            HlsSession {
                out_dir: self.out_dir.clone(),
                segment_duration_s: self.segment_duration_s,
                playlist_window: self.playlist_window,
                segment_index: self.segment_index,
                segments: VecDeque::new(),
                current: None,
                first_pts_90k: self.first_pts_90k,
                consecutive_write_failures: 0,
            },
        );
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pkt(pts: i64, is_key: bool) -> Packet {
        Packet {
            pts,
            dts: pts,
            duration: 3000,
            is_key,
            data: Bytes::from_static(b"\x00\x00\x00\x04\x65\x88\x84\x00"),
        }
    }

    fn dummy_entry() -> VideoSampleEntry {
        VideoSampleEntry {
            data: Vec::new(),
            rfc6381_codec: "avc1.64001f".to_string(),
            width: 1280,
            height: 720,
            pasp_h_spacing: 1,
            pasp_v_spacing: 1,
        }
    }

    #[test]
    fn rolls_over_at_keyframe_past_target_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = HlsSession::open(dir.path(), 2, 4).unwrap();
        let entry = dummy_entry();
        // One key frame every 90_000 (1s); segment_duration_s=2 means we
        // should still be in segment 0 at t=1s and roll at/after t=2s.
        s.write_packet(&pkt(0, true), &entry).unwrap();
        s.write_packet(&pkt(90_000, true), &entry).unwrap();
        assert_eq!(s.current.as_ref().unwrap().index, 0);
        s.write_packet(&pkt(180_000, true), &entry).unwrap();
        assert_eq!(s.current.as_ref().unwrap().index, 1);
    }

    #[test]
    fn close_publishes_playlist_with_extm3u_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = HlsSession::open(dir.path(), 2, 4).unwrap();
        let entry = dummy_entry();
        s.write_packet(&pkt(0, true), &entry).unwrap();
        s.finish().unwrap();
        let playlist = std::fs::read_to_string(dir.path().join("index.m3u8")).unwrap();
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-VERSION:3"));
        assert!(playlist.contains("segment_0.ts"));
    }

    #[test]
    fn playlist_window_prunes_old_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = HlsSession::open(dir.path(), 1, 2).unwrap();
        let entry = dummy_entry();
        for i in 0..5i64 {
            s.write_packet(&pkt(i * 90_000, true), &entry).unwrap();
        }
        s.finish().unwrap();
        let playlist = std::fs::read_to_string(dir.path().join("index.m3u8")).unwrap();
        // Only the last `playlist_window` (2) segments should remain
        // referenced.
        let refs = playlist.matches("segment_").count();
        assert_eq!(refs, 2);
    }
}
