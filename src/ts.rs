// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Minimal MPEG-2 Transport Stream muxer for HLS segments: one PMT/PAT
//! pair per segment, one H.264 elementary stream packetized as PES. No
//! crate in the corpus covers MPEG-TS muxing, so this follows the
//! teacher's hand-rolled MP4 box writing idiom (explicit byte layout via
//! `byteorder`, no intermediate AST).

use base::{err, Error};
use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

const TS_PACKET_LEN: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
const VIDEO_PID: u16 = 0x0100;
const PROGRAM_NUMBER: u16 = 1;
const STREAM_TYPE_H264: u8 = 0x1b;

/// Packetizes one segment's worth of [`crate::sink::Packet`]s into MPEG-TS.
/// One instance per HLS segment file; the segmenter creates a fresh muxer
/// on every rollover so continuity counters always restart at 0, matching
/// how most HLS players expect segment-local TS streams.
pub struct TsMuxer {
    cc_pat: u8,
    cc_pmt: u8,
    cc_video: u8,
    wrote_headers: bool,
}

impl Default for TsMuxer {
    fn default() -> Self {
        TsMuxer {
            cc_pat: 0,
            cc_pmt: 0,
            cc_video: 0,
            wrote_headers: false,
        }
    }
}

impl TsMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the PAT+PMT pair if not already written this segment, then
    /// one PES packet (split across as many 188-byte TS packets as
    /// needed) carrying `data` (already AVC length-prefixed, as delivered
    /// by [`crate::codec`]).
    pub fn write_sample(
        &mut self,
        out: &mut impl Write,
        pts_90k: i64,
        dts_90k: i64,
        is_key: bool,
        data: &[u8],
    ) -> Result<(), Error> {
        if !self.wrote_headers {
            self.write_pat(out)?;
            self.write_pmt(out)?;
            self.wrote_headers = true;
        }
        self.write_pes(out, pts_90k, dts_90k, is_key, data)
    }

    fn write_pat(&mut self, out: &mut impl Write) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(16);
        payload.push(0x00); // table id: program association section
        payload.write_u16::<BigEndian>(0xb00d).map_err(io_err)?; // section_syntax_indicator=1, length=13
        payload.write_u16::<BigEndian>(1).map_err(io_err)?; // transport_stream_id
        payload.push(0xc1); // version=0, current_next=1
        payload.push(0); // section_number
        payload.push(0); // last_section_number
        payload.write_u16::<BigEndian>(PROGRAM_NUMBER).map_err(io_err)?;
        payload
            .write_u16::<BigEndian>(0xe000 | PMT_PID)
            .map_err(io_err)?;
        let crc = crc32_mpeg2(&payload);
        payload.write_u32::<BigEndian>(crc).map_err(io_err)?;
        self.cc_pat = write_section(out, PAT_PID, self.cc_pat, &payload)?;
        Ok(())
    }

    fn write_pmt(&mut self, out: &mut impl Write) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(32);
        payload.push(0x02); // table id: TS program map section
        let section_len: u16 = 9 + 5 + 4; // header fields + one stream entry + CRC_32
        payload
            .write_u16::<BigEndian>(0xb000 | section_len)
            .map_err(io_err)?;
        payload.write_u16::<BigEndian>(PROGRAM_NUMBER).map_err(io_err)?;
        payload.push(0xc1);
        payload.push(0);
        payload.push(0);
        payload
            .write_u16::<BigEndian>(0xe000 | VIDEO_PID)
            .map_err(io_err)?; // PCR_PID
        payload.write_u16::<BigEndian>(0xf000).map_err(io_err)?; // program_info_length = 0
        payload.push(STREAM_TYPE_H264);
        payload
            .write_u16::<BigEndian>(0xe000 | VIDEO_PID)
            .map_err(io_err)?;
        payload.write_u16::<BigEndian>(0xf000).map_err(io_err)?; // ES_info_length = 0
        let crc = crc32_mpeg2(&payload);
        payload.write_u32::<BigEndian>(crc).map_err(io_err)?;
        self.cc_pmt = write_section(out, PMT_PID, self.cc_pmt, &payload)?;
        Ok(())
    }

    fn write_pes(
        &mut self,
        out: &mut impl Write,
        pts_90k: i64,
        dts_90k: i64,
        is_key: bool,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut pes = Vec::with_capacity(data.len() + 19);
        pes.extend_from_slice(&[0x00, 0x00, 0x01, 0xe0]); // start code + stream id (video)
        pes.write_u16::<BigEndian>(0).map_err(io_err)?; // PES_packet_length = 0 (unbounded, video)
        pes.push(0x80); // marker bits
        pes.push(0xc0); // PTS_DTS_flags = 11
        pes.push(10); // PES_header_data_length
        write_pts_field(&mut pes, 0b0011, pts_90k)?;
        write_pts_field(&mut pes, 0b0001, dts_90k)?;
        pes.extend_from_slice(data);

        write_ts_packets(out, VIDEO_PID, &mut self.cc_video, &pes, true, is_key)
    }
}

fn io_err(e: std::io::Error) -> Error {
    err!(Internal, source(e))
}

/// Writes `section` (a PSI table section, sans the TS packet wrapper) as a
/// single TS packet with `payload_unit_start_indicator` set and a leading
/// pointer field of 0.
fn write_section(out: &mut impl Write, pid: u16, cc: u8, section: &[u8]) -> Result<u8, Error> {
    let mut payload = Vec::with_capacity(section.len() + 1);
    payload.push(0); // pointer_field
    payload.extend_from_slice(section);
    let mut cc = cc;
    write_ts_packets(out, pid, &mut cc, &payload, true, false)?;
    Ok(cc)
}

/// Splits `payload` across as many 188-byte TS packets as needed,
/// stuffing the final packet with `0xff` to pad it to length. `pusi` must
/// be true for the first packet only; this function handles that, the
/// caller just says whether this payload begins a new PES/section.
fn write_ts_packets(
    out: &mut impl Write,
    pid: u16,
    cc: &mut u8,
    payload: &[u8],
    starts_unit: bool,
    is_key: bool,
) -> Result<(), Error> {
    let mut offset = 0;
    let mut first = true;
    while offset < payload.len() || first {
        let mut packet = [0xffu8; TS_PACKET_LEN];
        packet[0] = SYNC_BYTE;
        let pusi = first && starts_unit;
        let pid_hi = ((pid >> 8) & 0x1f) as u8;
        packet[1] = (if pusi { 0x40 } else { 0x00 }) | pid_hi;
        packet[2] = (pid & 0xff) as u8;

        let remaining = payload.len() - offset;
        let needs_adaptation = first && is_key;
        const HEADER_LEN: usize = 4;
        let max_payload = TS_PACKET_LEN - HEADER_LEN - if needs_adaptation { 2 } else { 0 };
        let take = remaining.min(max_payload);
        let has_adaptation = needs_adaptation || take < max_payload;

        let mut pos = 4usize;
        if has_adaptation {
            let stuffing = max_payload - take;
            let adaptation_len = 1 + stuffing + if needs_adaptation { 1 } else { 0 };
            packet[3] = 0x10 | (*cc & 0x0f) | 0x20; // adaptation field present + payload
            packet[pos] = (adaptation_len - 1) as u8;
            pos += 1;
            packet[pos] = if needs_adaptation { 0x50 } else { 0x00 }; // random_access_indicator + PCR flag when keyframe
            pos += 1;
            if needs_adaptation {
                // PCR omitted (zeroed) — acceptable for a single-program,
                // single-PID stream where players derive timing from PTS.
                pos += 6;
            }
            pos += stuffing;
        } else {
            packet[3] = 0x10 | (*cc & 0x0f); // payload only, no adaptation field
        }
        *cc = cc.wrapping_add(1) & 0x0f;

        packet[pos..pos + take].copy_from_slice(&payload[offset..offset + take]);
        out.write_all(&packet).map_err(io_err)?;

        offset += take;
        first = false;
    }
    Ok(())
}

fn write_pts_field(out: &mut Vec<u8>, marker: u8, ts_90k: i64) -> Result<(), Error> {
    let ts = (ts_90k & 0x1_ffff_ffff) as u64;
    let b0 = (marker << 4) | (((ts >> 30) & 0x7) as u8) << 1 | 1;
    let b1 = ((ts >> 22) & 0xff) as u8;
    let b2 = (((ts >> 15) & 0x7f) as u8) << 1 | 1;
    let b3 = ((ts >> 7) & 0xff) as u8;
    let b4 = ((ts & 0x7f) as u8) << 1 | 1;
    out.extend_from_slice(&[b0, b1, b2, b3, b4]);
    Ok(())
}

/// CRC-32/MPEG-2: polynomial 0x04C11DB7, init 0xFFFFFFFF, no reflection,
/// no final xor. Used by every MPEG-TS PSI section trailer.
fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04c1_1db7
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_mpeg2_matches_known_vector() {
        // CRC-32/MPEG-2 of the ASCII bytes "123456789" is a well known
        // test vector for this variant.
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn ts_packets_are_188_bytes_and_sync_byte_aligned() {
        let mut out = Vec::new();
        let mut cc = 0u8;
        write_ts_packets(&mut out, VIDEO_PID, &mut cc, &[0xab; 500], true, true).unwrap();
        assert_eq!(out.len() % TS_PACKET_LEN, 0);
        for chunk in out.chunks(TS_PACKET_LEN) {
            assert_eq!(chunk[0], SYNC_BYTE);
        }
    }

    #[test]
    fn write_sample_emits_pat_pmt_once_per_muxer() {
        let mut muxer = TsMuxer::new();
        let mut out = Vec::new();
        muxer.write_sample(&mut out, 0, 0, true, &[0; 10]).unwrap();
        let after_first = out.len();
        muxer.write_sample(&mut out, 100, 100, false, &[0; 10]).unwrap();
        // Second sample doesn't repeat PAT/PMT, so it adds fewer TS
        // packets than the first (which included both tables).
        assert!(out.len() - after_first <= after_first);
    }
}
