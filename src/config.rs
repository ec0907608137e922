// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Stream configuration. An external config-file loader (out of scope here)
//! deserializes these directly; the core never reads a config file itself.

use crate::zone::Zone;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
}

/// What triggers detection for a stream, and which detector answers it.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum DetectorRef {
    /// A local model id, naming a file under the embedded model directory.
    Local(String),
    /// A HTTP detection API URL.
    HttpApi(String),
    Motion,
    Onvif,
}

/// Identity and ingest policy for one camera stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Unique, printable-ASCII; used as a directory key under
    /// `<storage_root>/recordings/<name>` and `<hls_root>/<name>`.
    pub name: String,

    /// RTSP or HTTP-MJPEG source URL.
    pub url: String,

    pub transport: Transport,
    pub enabled: bool,

    // --- Recording policy ---
    pub record_enabled: bool,
    /// Default 5 for HLS, 60 for MP4; see `hls_segment_duration_s` /
    /// `recording_segment_duration_s` for the actual per-purpose values.
    pub recording_segment_duration_s: u32,
    pub hls_segment_duration_s: u32,
    pub detection_based: bool,
    pub pre_roll_s: u32,
    pub post_roll_s: u32,

    // --- Detection policy ---
    pub detector_ref: Option<DetectorRef>,
    pub confidence_threshold: f32,
    pub run_interval_s: u32,
    pub zones: Vec<Zone>,

    // --- ONVIF credentials ---
    pub onvif_user: String,
    pub onvif_pass: String,
    pub onvif_profile_token: Option<String>,
    pub detection_api_url: Option<String>,

    // --- Declared media shape (advisory, not trusted) ---
    pub codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
}

impl StreamConfig {
    pub fn packet_timeout_s(&self) -> u32 {
        5
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            name: String::new(),
            url: String::new(),
            transport: Transport::Tcp,
            enabled: true,
            record_enabled: true,
            recording_segment_duration_s: 60,
            hls_segment_duration_s: 5,
            detection_based: false,
            pre_roll_s: 5,
            post_roll_s: 10,
            detector_ref: None,
            confidence_threshold: 0.5,
            run_interval_s: 2,
            zones: Vec::new(),
            onvif_user: String::new(),
            onvif_pass: String::new(),
            onvif_profile_token: None,
            detection_api_url: None,
            codec: None,
            width: None,
            height: None,
            fps: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_segment_durations() {
        let c = StreamConfig::default();
        assert_eq!(c.hls_segment_duration_s, 5);
        assert_eq!(c.recording_segment_duration_s, 60);
    }
}
