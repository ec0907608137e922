// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Detection orchestration: downsamples offered frames, runs a
//! [`FrameDetector`] at most once at a time on a background thread, and
//! turns survivors (after zone filtering) into debounced motion-start /
//! motion-end calls against a [`MotionSink`].
//!
//! Two feed modes exist at the config layer: live-frame (the supervisor
//! hands decoded frames to [`DetectionWorker`] via [`FrameSink`]) and
//! segment-scan (`ScanWorker` below watches the HLS output directory for
//! newly closed segments and decodes only their key frames). Both funnel
//! into the same [`FrameDetector`]/zone/debounce machinery.

use crate::sink::{Frame, FrameSink, PixelFormat};
use crate::zone::{self, BBox, Zone};
use base::clock::{Clocks, Instant};
use base::{err, Error};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

const STARTUP_DELAY: Duration = Duration::from_secs(10);

/// One surviving detection, in normalized `[0,1]` frame coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub label: String,
    pub score: f32,
}

/// Downsampled, grayscale view of a [`Frame`], the only shape every
/// [`FrameDetector`] impl needs: detectors that want color or full
/// resolution are out of scope here (the embedded model and the motion
/// heuristic both work on luma alone, and the HTTP API detector only
/// needs enough signal to draw a box, not a faithful image).
pub struct Sample {
    pub width: u32,
    pub height: u32,
    /// Row-major luma, one byte per pixel.
    pub luma: Vec<u8>,
}

/// Extracts luma from `frame` and box-downsamples it by the integer
/// `factor`, forcing even output dimensions (the dimension most codecs and
/// image encoders assume for chroma-subsampled formats).
pub fn prepare(frame: &Frame, factor: u32) -> Sample {
    let factor = factor.max(1);
    let src_luma: Vec<u8> = match frame.format {
        PixelFormat::Yuv420p => frame.planes[0].to_vec(),
        PixelFormat::Rgb24 => {
            let rgb = &frame.planes[0];
            (0..(frame.width * frame.height) as usize)
                .map(|i| {
                    let r = rgb[i * 3] as u32;
                    let g = rgb[i * 3 + 1] as u32;
                    let b = rgb[i * 3 + 2] as u32;
                    ((r * 299 + g * 587 + b * 114) / 1000) as u8
                })
                .collect()
        }
    };

    let mut out_w = (frame.width / factor).max(1);
    let mut out_h = (frame.height / factor).max(1);
    if out_w % 2 != 0 {
        out_w += 1;
    }
    if out_h % 2 != 0 {
        out_h += 1;
    }
    out_w = out_w.min(frame.width);
    out_h = out_h.min(frame.height);

    let mut luma = vec![0u8; (out_w * out_h) as usize];
    for oy in 0..out_h {
        for ox in 0..out_w {
            let sx = (ox * frame.width / out_w).min(frame.width - 1);
            let sy = (oy * frame.height / out_h).min(frame.height - 1);
            luma[(oy * out_w + ox) as usize] = src_luma[(sy * frame.width + sx) as usize];
        }
    }

    Sample {
        width: out_w,
        height: out_h,
        luma,
    }
}

/// A pluggable inference backend. `infer` may block (a HTTP round trip, a
/// model forward pass); callers run it off the frame-delivery thread.
pub trait FrameDetector: Send {
    fn infer(&mut self, sample: &Sample) -> Result<Vec<Detection>, Error>;

    /// Integer downscale factor [`prepare`] should apply before calling
    /// `infer`. `1` means full resolution.
    fn downscale_factor(&self) -> u32 {
        1
    }
}

/// Whole-frame motion-or-not via mean absolute luma difference against the
/// previous sample. Used directly as the `Motion` detector variant, and as
/// the underlying computation for the plumbing-only `LocalDetector` (see
/// its doc comment).
pub struct MotionDetector {
    threshold: f32,
    previous: Option<Vec<u8>>,
}

impl MotionDetector {
    pub fn new(threshold: f32) -> Self {
        MotionDetector {
            threshold,
            previous: None,
        }
    }

    fn diff_exceeds_threshold(&mut self, sample: &Sample) -> bool {
        let exceeded = match &self.previous {
            Some(prev) if prev.len() == sample.luma.len() => {
                let sum: u64 = prev
                    .iter()
                    .zip(sample.luma.iter())
                    .map(|(&a, &b)| (a as i32 - b as i32).unsigned_abs() as u64)
                    .sum();
                let mean = sum as f32 / sample.luma.len() as f32;
                mean >= self.threshold
            }
            _ => false,
        };
        self.previous = Some(sample.luma.clone());
        exceeded
    }
}

impl FrameDetector for MotionDetector {
    fn infer(&mut self, sample: &Sample) -> Result<Vec<Detection>, Error> {
        if self.diff_exceeds_threshold(sample) {
            Ok(vec![Detection {
                bbox: BBox {
                    x: 0.0,
                    y: 0.0,
                    w: 1.0,
                    h: 1.0,
                },
                label: "motion".to_string(),
                score: 1.0,
            }])
        } else {
            Ok(Vec::new())
        }
    }

    fn downscale_factor(&self) -> u32 {
        4
    }
}

/// One box in a HTTP detection API's JSON response, already in normalized
/// coordinates.
#[derive(serde::Deserialize)]
struct ApiBox {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    label: String,
    score: f32,
}

#[derive(serde::Deserialize)]
struct ApiResponse {
    #[serde(default)]
    detections: Vec<ApiBox>,
}

/// Posts a grayscale JPEG of the sample to an external detection API and
/// parses a JSON box list back, applying `confidence_threshold` client
/// side (some APIs return everything above a very permissive floor).
pub struct HttpApiDetector {
    client: reqwest::blocking::Client,
    url: String,
    confidence_threshold: f32,
}

impl HttpApiDetector {
    pub fn new(url: String, confidence_threshold: f32) -> Self {
        HttpApiDetector {
            client: reqwest::blocking::Client::new(),
            url,
            confidence_threshold,
        }
    }

    fn encode_jpeg(sample: &Sample) -> Result<Vec<u8>, Error> {
        let img = image::GrayImage::from_raw(sample.width, sample.height, sample.luma.clone())
            .ok_or_else(|| err!(Internal, msg("sample dimensions don't match luma buffer")))?;
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Jpeg)
            .map_err(|e| err!(Internal, source(e)))?;
        Ok(buf.into_inner())
    }
}

impl FrameDetector for HttpApiDetector {
    fn infer(&mut self, sample: &Sample) -> Result<Vec<Detection>, Error> {
        let jpeg = Self::encode_jpeg(sample)?;
        let resp = self
            .client
            .post(&self.url)
            .header("content-type", "image/jpeg")
            .body(jpeg)
            .send()
            .map_err(|e| err!(SocketError, source(e)))?;
        if !resp.status().is_success() {
            return Err(err!(
                SocketError,
                msg("detection API returned status {}", resp.status())
            ));
        }
        let parsed: ApiResponse = resp.json().map_err(|e| err!(SocketError, source(e)))?;
        Ok(parsed
            .detections
            .into_iter()
            .filter(|b| b.score >= self.confidence_threshold)
            .map(|b| Detection {
                bbox: BBox {
                    x: b.x,
                    y: b.y,
                    w: b.w,
                    h: b.h,
                },
                label: b.label,
                score: b.score,
            })
            .collect())
    }

    fn downscale_factor(&self) -> u32 {
        2
    }
}

/// Plumbing for an embedded local model: no ML runtime crate exists
/// anywhere in this tree (and none is to be fabricated), so this checks
/// that `model_path` still exists, tracks consecutive load failures, and
/// otherwise delegates the actual inference computation to the same
/// frame-diff heuristic [`MotionDetector`] uses. Gated behind the
/// `local-detector` feature so it isn't built into configurations that
/// never name a `Local` detector ref.
#[cfg(feature = "local-detector")]
pub struct LocalDetector {
    model_path: std::path::PathBuf,
    consecutive_failures: u32,
    inner: MotionDetector,
}

#[cfg(feature = "local-detector")]
const MAX_CONSECUTIVE_LOAD_FAILURES: u32 = 5;

#[cfg(feature = "local-detector")]
impl LocalDetector {
    pub fn new(model_path: std::path::PathBuf, threshold: f32) -> Self {
        LocalDetector {
            model_path,
            consecutive_failures: 0,
            inner: MotionDetector::new(threshold),
        }
    }
}

#[cfg(feature = "local-detector")]
impl FrameDetector for LocalDetector {
    fn infer(&mut self, sample: &Sample) -> Result<Vec<Detection>, Error> {
        if !self.model_path.exists() {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= MAX_CONSECUTIVE_LOAD_FAILURES {
                warn!(
                    path = %self.model_path.display(),
                    failures = self.consecutive_failures,
                    "local model unavailable; skipping inference but continuing"
                );
            }
            return Ok(Vec::new());
        }
        self.consecutive_failures = 0;
        self.inner.infer(sample)
    }

    fn downscale_factor(&self) -> u32 {
        self.inner.downscale_factor()
    }
}

/// Seam onto a pull-point subscription client (implemented by `onvif.rs`):
/// `poll_motion` reports whether an unconsumed motion event is pending,
/// without blocking on the network beyond the subscription's own pull
/// timeout.
pub trait OnvifEventPoll: Send {
    fn poll_motion(&mut self) -> Result<bool, Error>;
}

/// Wraps a [`OnvifEventPoll`] as a [`FrameDetector`]: frame content is
/// ignored entirely, and a poll match produces one whole-frame detection
/// labeled `"motion"`.
pub struct OnvifDetector<P: OnvifEventPoll> {
    poll: P,
}

impl<P: OnvifEventPoll> OnvifDetector<P> {
    pub fn new(poll: P) -> Self {
        OnvifDetector { poll }
    }
}

impl<P: OnvifEventPoll> FrameDetector for OnvifDetector<P> {
    fn infer(&mut self, _sample: &Sample) -> Result<Vec<Detection>, Error> {
        if self.poll.poll_motion()? {
            Ok(vec![Detection {
                bbox: BBox {
                    x: 0.0,
                    y: 0.0,
                    w: 1.0,
                    h: 1.0,
                },
                label: "motion".to_string(),
                score: 1.0,
            }])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Decouples [`DetectionWorker`] from the recording engine directly;
/// `StreamRecorder::on_motion` satisfies this.
pub trait MotionSink: Send + Sync {
    fn on_motion(&self, is_start: bool) -> Result<(), Error>;
}

struct Shared<D: FrameDetector> {
    detector: Mutex<D>,
    zones: Vec<Zone>,
    motion_sink: Arc<dyn MotionSink>,
    in_flight: AtomicBool,
    active: AtomicBool,
    run_interval: Duration,
    last_run: Mutex<Option<Instant>>,
    started_at: Instant,
}

/// Live-frame detection orchestrator: one instance per stream configured
/// with `detection_based = true` and a non-`Onvif`-segment-scan detector.
/// Implements [`FrameSink`], offered frames the supervisor decodes inline;
/// `offer_frame` never blocks, dispatching actual inference to a
/// background thread gated by an at-most-one-in-flight flag.
pub struct DetectionWorker<C: Clocks, D: FrameDetector + 'static> {
    clocks: Arc<C>,
    stream_name: String,
    shared: Arc<Shared<D>>,
}

impl<C: Clocks, D: FrameDetector + 'static> DetectionWorker<C, D> {
    pub fn new(
        clocks: Arc<C>,
        stream_name: String,
        detector: D,
        zones: Vec<Zone>,
        motion_sink: Arc<dyn MotionSink>,
        run_interval_s: u32,
    ) -> Self {
        let started_at = clocks.monotonic();
        DetectionWorker {
            clocks,
            stream_name,
            shared: Arc::new(Shared {
                detector: Mutex::new(detector),
                zones,
                motion_sink,
                in_flight: AtomicBool::new(false),
                active: AtomicBool::new(false),
                run_interval: Duration::from_secs(run_interval_s.max(1) as u64),
                last_run: Mutex::new(None),
                started_at,
            }),
        }
    }

    fn should_run(&self, now: Instant) -> bool {
        if now.duration_since(self.shared.started_at) < STARTUP_DELAY {
            return false;
        }
        let mut last_run = self.shared.last_run.lock().unwrap();
        let ready = match *last_run {
            Some(t) => now.duration_since(t) >= self.shared.run_interval,
            None => true,
        };
        if ready {
            *last_run = Some(now);
        }
        ready
    }
}

impl<C: Clocks, D: FrameDetector + 'static> FrameSink for DetectionWorker<C, D> {
    fn offer_frame(&mut self, frame: &Frame) {
        let now = self.clocks.monotonic();
        if !self.should_run(now) {
            return;
        }
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let shared = self.shared.clone();
        let stream_name = self.stream_name.clone();
        let frame = frame.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("detect-{stream_name}"))
            .spawn(move || run_inference(&shared, &stream_name, &frame));
        if let Err(e) = spawned {
            error!(stream = %stream_name, error = %e, "failed to spawn detection thread");
            shared.in_flight.store(false, Ordering::Release);
        }
    }
}

fn run_inference<D: FrameDetector>(shared: &Arc<Shared<D>>, stream_name: &str, frame: &Frame) {
    let result = (|| -> Result<Vec<Detection>, Error> {
        let mut detector = shared.detector.lock().unwrap();
        let sample = prepare(frame, detector.downscale_factor());
        detector.infer(&sample)
    })();

    match result {
        Ok(detections) => {
            let survivors: Vec<&Detection> = detections
                .iter()
                .filter(|d| zone::passes_zones(&shared.zones, d.bbox, &d.label))
                .collect();
            let now_active = !survivors.is_empty();
            let was_active = shared.active.swap(now_active, Ordering::AcqRel);
            if now_active && !was_active {
                debug!(stream = stream_name, count = survivors.len(), "motion start");
                if let Err(e) = shared.motion_sink.on_motion(true) {
                    error!(stream = stream_name, error = %e.chain(), "on_motion(start) failed");
                }
            } else if !now_active && was_active {
                debug!(stream = stream_name, "motion end");
                if let Err(e) = shared.motion_sink.on_motion(false) {
                    error!(stream = stream_name, error = %e.chain(), "on_motion(end) failed");
                }
            }
        }
        Err(e) => {
            // Inference failures never propagate as supervisor-fatal; log
            // and clear the in-flight flag so the next offered frame can
            // try again.
            error!(stream = stream_name, error = %e.chain(), "detection inference failed");
        }
    }
    shared.in_flight.store(false, Ordering::Release);
}

/// Segment-scan mode: watches a HLS output directory for newly closed
/// `segment_<N>.ts` files and runs detection against each one's first key
/// frame, for streams that aren't already decoding frames live for some
/// other sink. Polled by the caller (the supervisor's periodic tick)
/// rather than event-driven, matching how the rest of this core avoids
/// filesystem watch dependencies.
pub struct ScanWorker<D> {
    dir: std::path::PathBuf,
    last_seen_index: Option<u64>,
    detector: D,
    zones: Vec<Zone>,
    motion_sink: Arc<dyn MotionSink>,
    active: bool,
    consecutive_decode_failures: u32,
}

const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 10;

impl<D: FrameDetector> ScanWorker<D> {
    pub fn new(dir: std::path::PathBuf, detector: D, zones: Vec<Zone>, motion_sink: Arc<dyn MotionSink>) -> Self {
        ScanWorker {
            dir,
            last_seen_index: None,
            detector,
            zones,
            motion_sink,
            active: false,
            consecutive_decode_failures: 0,
        }
    }

    fn newest_segment_index(&self) -> Option<u64> {
        std::fs::read_dir(&self.dir)
            .ok()?
            .flatten()
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.strip_prefix("segment_")?
                    .strip_suffix(".ts")?
                    .parse::<u64>()
                    .ok()
            })
            .max()
    }

    /// Called periodically. Decodes and runs detection on any segment
    /// index newer than the last one seen; a decode failure is logged and
    /// counted but never torn down as fatal (a corrupt or half-written
    /// segment is expected occasionally under real network conditions).
    pub fn scan(&mut self, decode_keyframe: impl Fn(&std::path::Path) -> Result<Frame, Error>) {
        let Some(newest) = self.newest_segment_index() else {
            return;
        };
        if self.last_seen_index == Some(newest) {
            return;
        }
        self.last_seen_index = Some(newest);
        let path = self.dir.join(format!("segment_{newest}.ts"));

        let frame = match decode_keyframe(&path) {
            Ok(f) => {
                self.consecutive_decode_failures = 0;
                f
            }
            Err(e) => {
                self.consecutive_decode_failures += 1;
                warn!(
                    path = %path.display(),
                    error = %e.chain(),
                    failures = self.consecutive_decode_failures,
                    "segment key frame decode failed"
                );
                return;
            }
        };

        let sample = prepare(&frame, self.detector.downscale_factor());
        let detections = match self.detector.infer(&sample) {
            Ok(d) => d,
            Err(e) => {
                error!(path = %path.display(), error = %e.chain(), "detection inference failed");
                return;
            }
        };
        let now_active = detections
            .iter()
            .any(|d| zone::passes_zones(&self.zones, d.bbox, &d.label));
        if now_active && !self.active {
            if let Err(e) = self.motion_sink.on_motion(true) {
                error!(error = %e.chain(), "on_motion(start) failed");
            }
        } else if !now_active && self.active {
            if let Err(e) = self.motion_sink.on_motion(false) {
                error!(error = %e.chain(), "on_motion(end) failed");
            }
        }
        self.active = now_active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use bytes::Bytes;
    use std::sync::atomic::AtomicI32;

    fn frame(luma: Vec<u8>, w: u32, h: u32) -> Frame {
        Frame {
            width: w,
            height: h,
            format: PixelFormat::Yuv420p,
            planes: vec![Bytes::from(luma)],
            pts: 0,
        }
    }

    #[test]
    fn prepare_downsamples_to_even_dimensions() {
        let f = frame(vec![128u8; 10 * 10], 10, 10);
        let s = prepare(&f, 3);
        assert_eq!(s.width % 2, 0);
        assert_eq!(s.height % 2, 0);
        assert_eq!(s.luma.len(), (s.width * s.height) as usize);
    }

    #[test]
    fn motion_detector_is_silent_on_first_frame() {
        let mut d = MotionDetector::new(10.0);
        let f = frame(vec![0u8; 16], 4, 4);
        let s = prepare(&f, 1);
        assert!(d.infer(&s).unwrap().is_empty());
    }

    #[test]
    fn motion_detector_fires_on_large_luma_change() {
        let mut d = MotionDetector::new(10.0);
        let s1 = prepare(&frame(vec![0u8; 16], 4, 4), 1);
        d.infer(&s1).unwrap();
        let s2 = prepare(&frame(vec![255u8; 16], 4, 4), 1);
        let dets = d.infer(&s2).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "motion");
    }

    #[test]
    #[cfg(feature = "local-detector")]
    fn local_detector_skips_inference_when_model_missing() {
        let mut d = LocalDetector::new(std::path::PathBuf::from("/nonexistent/model.bin"), 10.0);
        let s = prepare(&frame(vec![0u8; 16], 4, 4), 1);
        assert!(d.infer(&s).unwrap().is_empty());
        assert_eq!(d.consecutive_failures, 1);
    }

    struct RecordingMotionSink {
        calls: Mutex<Vec<bool>>,
    }

    impl MotionSink for RecordingMotionSink {
        fn on_motion(&self, is_start: bool) -> Result<(), Error> {
            self.calls.lock().unwrap().push(is_start);
            Ok(())
        }
    }

    struct AlwaysFires(AtomicI32);

    impl FrameDetector for AlwaysFires {
        fn infer(&mut self, _sample: &Sample) -> Result<Vec<Detection>, Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Detection {
                bbox: BBox {
                    x: 0.0,
                    y: 0.0,
                    w: 1.0,
                    h: 1.0,
                },
                label: "person".to_string(),
                score: 1.0,
            }])
        }
    }

    #[test]
    fn worker_suppresses_offers_before_startup_delay() {
        let clocks = Arc::new(SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap()));
        let sink = Arc::new(RecordingMotionSink {
            calls: Mutex::new(Vec::new()),
        });
        let mut worker = DetectionWorker::new(
            clocks.clone(),
            "cam1".to_string(),
            AlwaysFires(AtomicI32::new(0)),
            Vec::new(),
            sink.clone(),
            1,
        );
        let f = frame(vec![0u8; 16], 4, 4);
        worker.offer_frame(&f);
        // Give the (not-actually-spawned, since should_run gates first)
        // background thread no chance to run: startup delay hasn't
        // elapsed, so no thread should have been spawned at all.
        std::thread::sleep(Duration::from_millis(50));
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn worker_fires_motion_start_after_startup_delay() {
        let clocks = Arc::new(SimulatedClocks::new(jiff::Timestamp::from_second(1_700_000_000).unwrap()));
        let sink = Arc::new(RecordingMotionSink {
            calls: Mutex::new(Vec::new()),
        });
        let mut worker = DetectionWorker::new(
            clocks.clone(),
            "cam1".to_string(),
            AlwaysFires(AtomicI32::new(0)),
            Vec::new(),
            sink.clone(),
            1,
        );
        clocks.sleep(STARTUP_DELAY + Duration::from_secs(1));
        let f = frame(vec![0u8; 16], 4, 4);
        worker.offer_frame(&f);
        // Inference runs on a background thread; give it a moment.
        for _ in 0..100 {
            if !sink.calls.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*sink.calls.lock().unwrap(), vec![true]);
    }

    #[test]
    fn zones_filter_out_detections_outside_allowlisted_label() {
        let zones = vec![Zone {
            name: "z".to_string(),
            shape: crate::zone::Shape::Rectangle {
                x: 0.0,
                y: 0.0,
                w: 1.0,
                h: 1.0,
            },
            label_filter: vec!["car".to_string()],
            min_overlap_fraction: 0.1,
        }];
        assert!(!zone::passes_zones(
            &zones,
            BBox {
                x: 0.0,
                y: 0.0,
                w: 1.0,
                h: 1.0
            },
            "person"
        ));
    }
}
