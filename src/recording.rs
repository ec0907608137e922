// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Recording Engine: writes durable faststart `.mp4` recordings per
//! stream, either continuously (one file every `segment_duration_s`) or
//! gated on detection events with pre/post-roll buffers.

use crate::codec::VideoSampleEntry;
use crate::mp4_writer::{self, Sample as Mp4Sample};
use crate::sink::{Packet, PacketSink};
use base::clock::{Clocks, Instant};
use base::{err, Error, Timestamp};
use db::{Database, NewRecording, SegmentFormat, Trigger};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

const CLOCK_RATE_90K: i64 = 90_000;
const MAX_RECORDING_DURATION: Duration = Duration::from_secs(600);

/// One buffered packet, held in the pre-roll ring or in a file already
/// being written.
struct BufferedPacket {
    pts_90k: i64,
    duration_90k: u32,
    is_key: bool,
    data: Vec<u8>,
}

/// The file currently being written for one stream.
struct OpenFile {
    path: PathBuf,
    trigger: Trigger,
    start_time: Timestamp,
    start_pts_90k: i64,
    last_pts_90k: i64,
    samples: Vec<BufferedPacket>,
    entry: VideoSampleEntry,
}

enum Mode {
    Continuous,
    /// Pre-roll ring buffer plus the detection state machine. `active`
    /// tracks whether an open file exists because of an in-progress
    /// motion event; `post_roll_until` is the wall-clock deadline for
    /// `check_timeouts` to close it once motion stops.
    DetectionGated {
        pre_roll: VecDeque<BufferedPacket>,
        pre_roll_s: u32,
        post_roll_s: u32,
        post_roll_until: Option<Instant>,
    },
}

/// Per-stream recording state. One instance per configured stream; the
/// supervisor wires it in as a [`PacketSink`].
pub struct StreamRecorder<C: Clocks> {
    clocks: C,
    db: Database,
    stream_name: String,
    storage_root: PathBuf,
    segment_duration_s: u32,
    mode: Mutex<Mode>,
    current: Mutex<Option<OpenFile>>,
    /// Last PTS/DTS emitted to any file for this stream, across restarts;
    /// enforces the non-decreasing invariant with a 1-tick gap inserted
    /// whenever the source reopens and PTS would otherwise collide or go
    /// backwards.
    last_emitted_pts_90k: Mutex<Option<i64>>,
    /// Sample entry from the most recent `write_packet`, used by
    /// `on_motion` to open a file without the detection orchestrator
    /// having to track the entry itself (its contract only passes
    /// `stream, is_start, t`, per the recording engine's public contract).
    last_entry: Mutex<Option<VideoSampleEntry>>,
}

impl<C: Clocks> StreamRecorder<C> {
    pub fn new_continuous(
        clocks: C,
        db: Database,
        stream_name: String,
        storage_root: PathBuf,
        segment_duration_s: u32,
    ) -> Self {
        StreamRecorder {
            clocks,
            db,
            stream_name,
            storage_root,
            segment_duration_s,
            mode: Mutex::new(Mode::Continuous),
            current: Mutex::new(None),
            last_emitted_pts_90k: Mutex::new(None),
            last_entry: Mutex::new(None),
        }
    }

    pub fn new_detection_gated(
        clocks: C,
        db: Database,
        stream_name: String,
        storage_root: PathBuf,
        pre_roll_s: u32,
        post_roll_s: u32,
    ) -> Self {
        StreamRecorder {
            clocks,
            db,
            stream_name,
            storage_root,
            segment_duration_s: 0,
            mode: Mutex::new(Mode::DetectionGated {
                pre_roll: VecDeque::new(),
                pre_roll_s,
                post_roll_s,
                post_roll_until: None,
            }),
            current: Mutex::new(None),
            last_emitted_pts_90k: Mutex::new(None),
            last_entry: Mutex::new(None),
        }
    }

    fn output_path(&self, start_time: Timestamp) -> PathBuf {
        let (date, hour) = start_time.date_hour();
        self.storage_root
            .join("recordings")
            .join(&self.stream_name)
            .join(date)
            .join(format!("{hour:02}"))
            .join(format!("recording_{}.mp4", start_time.unix_secs()))
    }

    /// Rescales an incoming PTS to the output stream's time base, bumping
    /// it by one tick if it would otherwise collide with or precede the
    /// last value emitted for this stream (the forced-restart invariant).
    fn rescale(&self, pts_90k: i64) -> i64 {
        let mut last = self.last_emitted_pts_90k.lock().unwrap();
        let out = match *last {
            Some(prev) if pts_90k <= prev => prev + 1,
            _ => pts_90k,
        };
        *last = Some(out);
        out
    }

    fn open_new_file(
        &self,
        current: &mut Option<OpenFile>,
        trigger: Trigger,
        start_pts_90k: i64,
        entry: &VideoSampleEntry,
    ) -> Result<(), Error> {
        let start_time = Timestamp(self.clocks.realtime());
        let path = self.output_path(start_time);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| err!(Io, source(e)))?;
        }
        *current = Some(OpenFile {
            path,
            trigger,
            start_time,
            start_pts_90k,
            last_pts_90k: start_pts_90k,
            samples: Vec::new(),
            entry: entry.clone(),
        });
        Ok(())
    }

    fn close_file(&self, file: OpenFile) -> Result<(), Error> {
        if file.samples.is_empty() {
            return Ok(());
        }
        let samples: Vec<Mp4Sample> = file
            .samples
            .iter()
            .map(|s| Mp4Sample {
                pts_90k: s.pts_90k - file.start_pts_90k,
                duration_90k: s.duration_90k,
                is_key: s.is_key,
                data: s.data.clone(),
            })
            .collect();
        let mut out = std::fs::File::create(&file.path).map_err(|e| err!(Io, source(e)))?;
        mp4_writer::write(&mut out, &file.entry, &samples, file.start_time.unix_secs())?;
        let size_bytes = out.metadata().map(|m| m.len() as i64).unwrap_or(0);

        let duration_90k = (file.last_pts_90k - file.start_pts_90k).max(0);
        let end_time = Timestamp::from_unix_secs(
            file.start_time.unix_secs() + duration_90k / CLOCK_RATE_90K,
        )?;
        let new_recording = NewRecording {
            stream_name: self.stream_name.clone(),
            file_path: file.path.to_string_lossy().into_owned(),
            start_time: file.start_time,
            end_time: Some(end_time),
            size_bytes,
            segment_format: SegmentFormat::Mp4,
            trigger: file.trigger,
            event_id: None,
        };
        // Insert is the final operation: a crash before this point leaves
        // an orphan file on disk but never a partial row in the index.
        self.db.insert_recording(&new_recording)?;
        info!(
            stream = %self.stream_name,
            path = %file.path.display(),
            "closed recording"
        );
        Ok(())
    }

    fn append_continuous(
        &self,
        pkt: &Packet,
        entry: &VideoSampleEntry,
        pts_90k: i64,
    ) -> Result<(), Error> {
        let mut current = self.current.lock().unwrap();
        let should_roll = current.as_ref().is_some_and(|f| {
            pkt.is_key
                && (pts_90k - f.start_pts_90k) as f64 / CLOCK_RATE_90K as f64
                    >= self.segment_duration_s as f64
        });
        if should_roll {
            if let Some(old) = current.take() {
                self.close_file(old)?;
            }
        }
        if current.is_none() {
            self.open_new_file(&mut current, Trigger::Continuous, pts_90k, entry)?;
        }
        let f = current.as_mut().expect("just ensured Some");
        f.last_pts_90k = pts_90k;
        f.samples.push(BufferedPacket {
            pts_90k,
            duration_90k: pkt.duration.max(0) as u32,
            is_key: pkt.is_key,
            data: pkt.data.to_vec(),
        });
        Ok(())
    }

    fn append_detection_gated(
        &self,
        pkt: &Packet,
        entry: &VideoSampleEntry,
        pts_90k: i64,
    ) -> Result<(), Error> {
        let mut mode = self.mode.lock().unwrap();
        let Mode::DetectionGated {
            pre_roll,
            pre_roll_s,
            ..
        } = &mut *mode
        else {
            unreachable!("append_detection_gated called on a Continuous recorder");
        };

        let buffered = BufferedPacket {
            pts_90k,
            duration_90k: pkt.duration.max(0) as u32,
            is_key: pkt.is_key,
            data: pkt.data.to_vec(),
        };

        let mut current = self.current.lock().unwrap();
        if let Some(f) = current.as_mut() {
            let elapsed = Duration::from_secs_f64(
                (pts_90k - f.start_pts_90k).max(0) as f64 / CLOCK_RATE_90K as f64,
            );
            if elapsed >= MAX_RECORDING_DURATION && pkt.is_key {
                let old = current.take().unwrap();
                self.close_file(old)?;
                self.open_new_file(&mut current, Trigger::Detection, pts_90k, entry)?;
                warn!(
                    stream = %self.stream_name,
                    "recording hit max_recording_duration_s, rolled to a new file"
                );
            }
        }
        if let Some(f) = current.as_mut() {
            f.last_pts_90k = pts_90k;
            f.samples.push(buffered);
        } else {
            pre_roll.push_back(buffered);
            // Keep a little more than pre_roll_s so the keyframe search in
            // on_motion always has a candidate at or before the true
            // cutoff; trimming here doesn't need keyframe alignment, only
            // the flush in on_motion does.
            let margin = (*pre_roll_s as i64) * 2 * CLOCK_RATE_90K;
            let keep_from = pts_90k - margin;
            while pre_roll.front().is_some_and(|p| p.pts_90k < keep_from) {
                pre_roll.pop_front();
            }
        }
        Ok(())
    }

    /// Called by the detection orchestrator. `t` is wall-clock; internal
    /// bookkeeping is all in PTS terms via the packet stream itself, so
    /// `t` only gates the post-roll deadline. Uses the sample entry from
    /// the most recent `write_packet` to open a file, since this
    /// contract (matching the detection orchestrator's call site) only
    /// carries `stream, is_start, t`.
    pub fn on_motion(&self, is_start: bool) -> Result<(), Error> {
        let Some(entry) = self.last_entry.lock().unwrap().clone() else {
            // No packet has arrived yet; nothing to bracket.
            return Ok(());
        };
        let mut mode = self.mode.lock().unwrap();
        let Mode::DetectionGated {
            pre_roll,
            pre_roll_s,
            post_roll_s,
            post_roll_until,
        } = &mut *mode
        else {
            return Ok(());
        };

        if is_start {
            let mut current = self.current.lock().unwrap();
            if current.is_none() {
                // "t" is approximated as the newest buffered PTS: motion
                // events arrive close in wall time to the packet that
                // triggered them, and everything here operates on the PTS
                // timeline anyway.
                let latest_pts = pre_roll.back().map(|p| p.pts_90k).unwrap_or(0);
                let cutoff = latest_pts - (*pre_roll_s as i64) * CLOCK_RATE_90K;
                let flush_from = pre_roll
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(_, p)| p.is_key && p.pts_90k <= cutoff)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let start_pts = pre_roll
                    .get(flush_from)
                    .map(|p| p.pts_90k)
                    .unwrap_or(latest_pts);
                self.open_new_file(&mut current, Trigger::Detection, start_pts, &entry)?;
                let f = current.as_mut().expect("just opened");
                for p in pre_roll.drain(flush_from..) {
                    f.last_pts_90k = f.last_pts_90k.max(p.pts_90k);
                    f.samples.push(p);
                }
            }
            // Step 5: overlapping events extend rather than restart.
            *post_roll_until = None;
        } else {
            *post_roll_until = Some(self.clocks.monotonic() + Duration::from_secs(*post_roll_s as u64));
        }
        Ok(())
    }

    /// Enforces post-roll close-out; the caller (the supervisor's periodic
    /// tick) must invoke this at most 5s apart per the contract.
    pub fn check_timeouts(&self) -> Result<(), Error> {
        let mut mode = self.mode.lock().unwrap();
        let Mode::DetectionGated {
            post_roll_until, ..
        } = &mut *mode
        else {
            return Ok(());
        };
        let Some(deadline) = *post_roll_until else {
            return Ok(());
        };
        if self.clocks.monotonic() < deadline {
            return Ok(());
        }
        *post_roll_until = None;
        drop(mode);
        let mut current = self.current.lock().unwrap();
        if let Some(f) = current.take() {
            self.close_file(f)?;
        }
        Ok(())
    }

    /// Flushes and indexes whatever file is open, without error if none
    /// is. Called when the supervisor tears the stream down.
    pub fn close(&self) -> Result<(), Error> {
        if let Some(f) = self.current.lock().unwrap().take() {
            self.close_file(f)?;
        }
        Ok(())
    }
}

impl<C: Clocks> PacketSink for StreamRecorder<C> {
    fn write_packet(&mut self, pkt: &Packet, entry: &VideoSampleEntry) -> Result<(), Error> {
        *self.last_entry.lock().unwrap() = Some(entry.clone());
        let pts_90k = self.rescale(pkt.pts);
        let is_gated = matches!(*self.mode.lock().unwrap(), Mode::DetectionGated { .. });
        let result = if is_gated {
            self.append_detection_gated(pkt, entry, pts_90k)
        } else {
            self.append_continuous(pkt, entry, pts_90k)
        };
        if let Err(e) = &result {
            error!(stream = %self.stream_name, error = %e.chain(), "recording write failed");
        }
        result
    }

    fn close(&mut self) -> Result<(), Error> {
        StreamRecorder::close(self)
    }
}

impl<C: Clocks> crate::detection::MotionSink for StreamRecorder<C> {
    fn on_motion(&self, is_start: bool) -> Result<(), Error> {
        StreamRecorder::on_motion(self, is_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use bytes::Bytes;

    fn entry() -> VideoSampleEntry {
        VideoSampleEntry {
            data: vec![0u8; 16],
            rfc6381_codec: "avc1.64001f".to_string(),
            width: 640,
            height: 480,
            pasp_h_spacing: 1,
            pasp_v_spacing: 1,
        }
    }

    fn pkt(pts: i64, is_key: bool) -> Packet {
        Packet {
            pts,
            dts: pts,
            duration: 3000,
            is_key,
            data: Bytes::from_static(b"\x00\x00\x00\x04\x65\x88\x84\x00"),
        }
    }

    fn clocks() -> SimulatedClocks {
        SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap())
    }

    #[test]
    fn continuous_mode_rolls_at_segment_duration_and_indexes() {
        base::time::testutil::init_zone();
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let rec = StreamRecorder::new_continuous(
            clocks(),
            db.clone(),
            "cam1".to_string(),
            dir.path().to_path_buf(),
            2,
        );
        let e = entry();
        let mut sink: Box<dyn PacketSink> = Box::new(rec);
        sink.write_packet(&pkt(0, true), &e).unwrap();
        sink.write_packet(&pkt(90_000, true), &e).unwrap();
        sink.write_packet(&pkt(180_000, true), &e).unwrap();
        sink.close().unwrap();
        let rows = db
            .list_recordings_by_time(
                "cam1",
                Timestamp::from_unix_secs(0).unwrap(),
                Timestamp::from_unix_secs(4_000_000_000).unwrap(),
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn detection_gated_mode_buffers_until_motion_start() {
        base::time::testutil::init_zone();
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let rec = StreamRecorder::new_detection_gated(
            clocks(),
            db.clone(),
            "cam2".to_string(),
            dir.path().to_path_buf(),
            5,
            5,
        );
        let e = entry();
        rec.write_packet_for_test(&pkt(0, true), &e).unwrap();
        rec.write_packet_for_test(&pkt(90_000, false), &e).unwrap();
        assert!(rec.current.lock().unwrap().is_none());
        rec.on_motion(true).unwrap();
        assert!(rec.current.lock().unwrap().is_some());
        rec.on_motion(false).unwrap();
        // Fast-forward past post_roll_s and confirm check_timeouts closes it.
        rec.clocks.sleep(Duration::from_secs(6));
        rec.check_timeouts().unwrap();
        assert!(rec.current.lock().unwrap().is_none());
        let rows = db
            .list_recordings_by_time(
                "cam2",
                Timestamp::from_unix_secs(0).unwrap(),
                Timestamp::from_unix_secs(4_000_000_000).unwrap(),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    impl<C: Clocks> StreamRecorder<C> {
        fn write_packet_for_test(&self, pkt: &Packet, entry: &VideoSampleEntry) -> Result<(), Error> {
            *self.last_entry.lock().unwrap() = Some(entry.clone());
            let pts_90k = self.rescale(pkt.pts);
            self.append_detection_gated(pkt, entry, pts_90k)
        }
    }
}
