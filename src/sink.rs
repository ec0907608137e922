// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared packet/frame shapes and the sink traits the supervisor fans a
//! stream's demuxed output out to. Each of C2 (HLS), C3 (recording), and
//! C4 (detection, live-frame mode) implements [`PacketSink`] once.

use crate::codec::VideoSampleEntry;
use base::Error;
use bytes::Bytes;

/// One demuxed access unit, already in AVC length-prefixed form (the
/// supervisor applies [`crate::codec::transform_sample_data`] itself when
/// the source needs it, so sinks never see Annex B).
#[derive(Clone, Debug)]
pub struct Packet {
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub is_key: bool,
    pub data: Bytes,
}

impl Packet {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Per-stream metadata a sink needs once (until the encoder's parameter
/// set changes, signalled by `Packet` delivery alongside a fresh
/// `&VideoSampleEntry`).
pub trait PacketSink: Send {
    /// Appends `pkt` to whatever the sink is building (a segment, a
    /// recording file). `entry` reflects the sample entry in effect for
    /// `pkt`; sinks that roll over on sample-entry change compare against
    /// the entry they last saw.
    fn write_packet(&mut self, pkt: &Packet, entry: &VideoSampleEntry) -> Result<(), Error>;

    /// Called once when the supervisor is about to stop this stream or
    /// tear down this sink for a reconnect; flushes and releases
    /// resources. Must be safe to call even if no packet was ever written.
    fn close(&mut self) -> Result<(), Error>;
}

/// A decoded video frame, offered to the detection orchestrator's
/// live-frame path. Plane data is packed, row-major, no stride padding.
#[derive(Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Bytes>,
    pub pts: i64,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PixelFormat {
    Yuv420p,
    Rgb24,
}

pub trait FrameSink: Send {
    /// Offers a frame. The sink decides internally whether to actually run
    /// detection on it (at-most-one-in-flight, interval gate); this call
    /// never blocks on inference.
    fn offer_frame(&mut self, frame: &Frame);
}
