// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2024 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Glue tying C1's packet fan-out to C2/C3's sinks and C4's motion feed
//! for one running process. `main.rs` is a thin caller of this module;
//! the wiring itself lives here so it can be exercised without a binary.
//!
//! Live-frame and segment-scan detection (`DetectionWorker`/`ScanWorker`)
//! both need a decoded [`crate::sink::Frame`], and no H.264 pixel decoder
//! exists anywhere in this crate's dependency stack (see `DESIGN.md`).
//! `DetectorRef::Onvif` is the one detector that needs no frame at all
//! (`OnvifDetector::infer` ignores its `Sample` entirely), so it is the
//! only detector kind this registry actually drives; the others are
//! left for a caller that supplies real frames by some other means.

use crate::codec::VideoSampleEntry;
use crate::config::{DetectorRef, StreamConfig};
use crate::detection::{MotionSink, OnvifEventPoll};
use crate::hls::HlsSession;
use crate::onvif::{Credentials, PullPointClient};
use crate::recording::StreamRecorder;
use crate::sink::{Packet, PacketSink};
use crate::stream::{Opener, RealOpener};
use crate::supervisor::Supervisors;
use base::clock::{Clocks, RealClocks};
use base::shutdown::Coordinator;
use base::Error;
use db::Database;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Matches the 6-segment (30s at the default 5s segment duration) window
/// most HLS players buffer comfortably.
const HLS_PLAYLIST_WINDOW: usize = 6;

/// Shares one [`StreamRecorder`] between the supervisor's packet fan-out
/// (`PacketSink::write_packet` needs `&mut self`) and the detection
/// orchestrator's motion feed (`MotionSink::on_motion` needs a handle
/// that outlives the boxed sink Supervisors owns).
struct SharedRecorder<C: Clocks>(Arc<Mutex<StreamRecorder<C>>>);

impl<C: Clocks> PacketSink for SharedRecorder<C> {
    fn write_packet(&mut self, pkt: &Packet, entry: &VideoSampleEntry) -> Result<(), Error> {
        self.0.lock().unwrap().write_packet(pkt, entry)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.0.lock().unwrap().close()
    }
}

impl<C: Clocks> MotionSink for SharedRecorder<C> {
    fn on_motion(&self, is_start: bool) -> Result<(), Error> {
        self.0.lock().unwrap().on_motion(is_start)
    }
}

/// One process's worth of running stream supervisors, plus the storage
/// paths every stream's sinks are rooted under.
pub struct Registry<C: Clocks> {
    clocks: C,
    coordinator: Arc<Coordinator>,
    supervisors: Arc<Supervisors<C>>,
    db: Database,
    storage_root: PathBuf,
    hls_root: PathBuf,
}

impl Registry<RealClocks> {
    /// Builds a registry backed by the real system clock and `retina`
    /// (RTSP) ingest, the combination `main.rs` runs in production.
    pub fn new_real(db: Database, storage_root: PathBuf, hls_root: PathBuf, capacity: usize) -> Self {
        Self::new(RealClocks {}, Arc::new(RealOpener), db, storage_root, hls_root, capacity)
    }
}

impl<C: Clocks + Clone> Registry<C> {
    pub fn new(
        clocks: C,
        opener: Arc<dyn Opener>,
        db: Database,
        storage_root: PathBuf,
        hls_root: PathBuf,
        capacity: usize,
    ) -> Self {
        let coordinator = Coordinator::new();
        let supervisors = Supervisors::new(Arc::new(clocks.clone()), coordinator.clone(), opener, capacity);
        Registry {
            clocks,
            coordinator,
            supervisors,
            db,
            storage_root,
            hls_root,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Builds this stream's sinks per its config (HLS always; recording
    /// when `record_enabled`) and hands them to the supervisor table.
    /// When `detector_ref` is `Onvif` and `detection_based`, also spawns
    /// a background thread polling the camera's own event service and
    /// bracketing recordings directly, bypassing `DetectionWorker`
    /// entirely since no frame feed is needed for that detector.
    pub fn start_stream(&self, cfg: StreamConfig) -> Result<(), Error> {
        let name = cfg.name.clone();
        let mut sinks: Vec<Box<dyn PacketSink>> = Vec::new();

        sinks.push(Box::new(HlsSession::open(
            &self.hls_root.join(&name),
            cfg.hls_segment_duration_s,
            HLS_PLAYLIST_WINDOW,
        )?));

        let shared_recorder = if cfg.record_enabled {
            let recorder = if cfg.detection_based {
                StreamRecorder::new_detection_gated(
                    self.clocks.clone(),
                    self.db.clone(),
                    name.clone(),
                    self.storage_root.clone(),
                    cfg.pre_roll_s,
                    cfg.post_roll_s,
                )
            } else {
                StreamRecorder::new_continuous(
                    self.clocks.clone(),
                    self.db.clone(),
                    name.clone(),
                    self.storage_root.clone(),
                    cfg.recording_segment_duration_s,
                )
            };
            let shared = Arc::new(Mutex::new(recorder));
            sinks.push(Box::new(SharedRecorder(shared.clone())));
            Some(shared)
        } else {
            None
        };

        if let Some(detector) = &cfg.detector_ref {
            if !cfg.detection_based {
                warn!(stream = %name, "detector_ref set but detection_based is false, nothing to gate");
            } else if !matches!(detector, DetectorRef::Onvif) {
                warn!(
                    stream = %name,
                    detector = ?detector,
                    "live/segment-scan pixel detection needs a frame decoder this build doesn't carry; \
                     only the onvif detector (event-based, no decode needed) is wired by this registry"
                );
            } else if let Some(recorder) = shared_recorder {
                self.spawn_onvif_poll(&cfg, recorder);
            } else {
                warn!(stream = %name, "onvif detector configured but record_enabled is false, nothing to gate");
            }
        }

        self.supervisors.start(cfg, sinks)
    }

    pub fn stop_stream(&self, name: &str, grace: Duration) -> Result<(), Error> {
        self.supervisors.stop(name, grace)
    }

    fn spawn_onvif_poll(&self, cfg: &StreamConfig, recorder: Arc<Mutex<StreamRecorder<C>>>) {
        let creds = Credentials {
            user: cfg.onvif_user.clone(),
            pass: cfg.onvif_pass.clone(),
        };
        let Some(events_xaddr) = cfg.detection_api_url.clone() else {
            warn!(stream = %cfg.name, "onvif detector configured but no events service address set");
            return;
        };
        let run_interval = Duration::from_secs(cfg.run_interval_s.max(1) as u64);
        let stream_name = cfg.name.clone();
        let coordinator = self.coordinator.clone();
        coordinator.register(&format!("onvif-poll-{stream_name}"));
        std::thread::Builder::new()
            .name(format!("onvif-poll-{stream_name}"))
            .spawn(move || {
                let mut client = PullPointClient::new(events_xaddr, creds);
                let mut active = false;
                loop {
                    if coordinator.shutdown_initiated() {
                        break;
                    }
                    match client.poll_motion() {
                        Ok(motion) if motion != active => {
                            active = motion;
                            let rec = recorder.lock().unwrap();
                            if let Err(e) = rec.on_motion(active) {
                                warn!(stream = %stream_name, error = %e.chain(), "on_motion failed");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(stream = %stream_name, error = %e.chain(), "onvif poll failed"),
                    }
                    std::thread::sleep(run_interval);
                }
                coordinator.unregister(&format!("onvif-poll-{stream_name}"));
            })
            .expect("spawning onvif poll thread");
        info!(stream = %cfg.name, "onvif event polling started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Options, Stream, VideoFrame};
    use base::clock::SimulatedClocks;
    use base::err;

    struct NoopStream;
    impl Stream for NoopStream {
        fn tool(&self) -> Option<&retina::client::Tool> {
            None
        }
        fn video_sample_entry(&self) -> &VideoSampleEntry {
            unreachable!()
        }
        fn next(&mut self) -> Result<VideoFrame, Error> {
            Err(err!(Cancelled))
        }
    }

    struct NoopOpener;
    impl Opener for NoopOpener {
        fn open(&self, _label: String, _url: url::Url, _options: Options) -> Result<Box<dyn Stream>, Error> {
            Ok(Box::new(NoopStream))
        }
    }

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

    #[test]
    fn shared_recorder_forwards_to_the_same_underlying_recorder() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let clocks = SimulatedClocks::new(jiff::Timestamp::now());
        let recorder = StreamRecorder::new_continuous(
            clocks,
            db,
            "cam1".to_string(),
            tmp.path().to_path_buf(),
            60,
        );
        let shared = Arc::new(Mutex::new(recorder));
        let mut sink = SharedRecorder(shared.clone());
        let pkt = Packet {
            pts: 0,
            dts: 0,
            duration: 3000,
            is_key: true,
            data: bytes::Bytes::from_static(&[0u8; 4]),
        };
        sink.write_packet(&pkt, &entry()).unwrap();
        assert!(tmp.path().join("recordings").join("cam1").exists());
    }

    #[test]
    fn start_stream_wires_hls_and_recording_sinks_without_a_decoder() {
        let storage = tempfile::tempdir().unwrap();
        let hls = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let clocks = SimulatedClocks::new(jiff::Timestamp::now());
        let registry = Registry::new(
            clocks,
            Arc::new(NoopOpener),
            db,
            storage.path().to_path_buf(),
            hls.path().to_path_buf(),
            4,
        );

        let mut cfg = StreamConfig {
            name: "cam1".to_string(),
            url: "rtsp://example.invalid/main".to_string(),
            ..StreamConfig::default()
        };
        cfg.detector_ref = Some(DetectorRef::Local("some-model".to_string()));
        cfg.detection_based = true;

        registry.start_stream(cfg).unwrap();
        assert!(hls.path().join("cam1").exists());
    }
}
