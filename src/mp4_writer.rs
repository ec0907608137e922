// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Faststart single-track H.264 `.mp4` writer. Builds `moov` first (with
//! placeholder `stco` offsets), then patches those offsets once the `mdat`
//! start position is known, so `moov` always precedes `mdat` and a player
//! can start rendering after the first read. No HTTP range-serving virtual
//! file machinery here -- recordings and exports are written once, to a
//! real file, start to finish.

use crate::codec::VideoSampleEntry;
use base::{err, Error};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io::Write;

const TIMESCALE: u32 = 90_000;

/// An `ftyp` box identical to the one emitted for every Moonfire NVR
/// recording. ISO/IEC 14496-12 section 4.3.
const FTYP_BOX: &[u8] = &[
    0x00, 0x00, 0x00, 0x20, b'f', b't', b'y', b'p', b'i', b's', b'o', b'm', 0x00, 0x00, 0x00,
    0x00, b'i', b's', b'o', b'm', b'i', b's', b'o', b'2', b'a', b'v', b'c', b'1', b'm', b'p',
    b'4', b'1',
];

const VIDEO_HDLR_BOX: &[u8] = &[
    0x00, 0x00, 0x00, 0x21, b'h', b'd', b'l', b'r', 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, b'v', b'i', b'd', b'e', 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00,
];

const MVHD_JUNK: &[u8] = &[
    0x00, 0x01, 0x00, 0x00, // rate
    0x01, 0x00, // volume
    0x00, 0x00, // reserved
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // reserved
    0x00, 0x01, 0x00, 0x00, // matrix[0]
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // matrix[1,2]
    0x00, 0x01, 0x00, 0x00, // matrix[4]
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // matrix[5,6]
    0x40, 0x00, 0x00, 0x00, // matrix[8]
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, // pre_defined[0..6)
];

const TKHD_JUNK: &[u8] = &[
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // reserved
    0x00, 0x00, 0x00, 0x00, // layer + alternate_group
    0x00, 0x00, 0x00, 0x00, // volume + reserved
    0x00, 0x01, 0x00, 0x00, // matrix[0]
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // matrix[1,2]
    0x00, 0x01, 0x00, 0x00, // matrix[4]
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // matrix[5,6]
    0x40, 0x00, 0x00, 0x00, // matrix[8]
];

/// `vmhd` + self-contained `dinf` pair shared by every video `minf`.
const VIDEO_MINF_JUNK: &[u8] = &[
    0x00, 0x00, 0x00, 0x14, b'v', b'm', b'h', b'd', 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x24, b'd', b'i', b'n', b'f', 0x00, 0x00,
    0x00, 0x1c, b'd', b'r', b'e', b'f', 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00,
    0x00, 0x00, 0x0c, b'u', b'r', b'l', b' ', 0x00, 0x00, 0x00, 0x01,
];

/// One access unit ready to mux: AVC length-prefixed `data`, presentation
/// time and duration both in 90kHz ticks relative to the first sample.
pub struct Sample {
    pub pts_90k: i64,
    pub duration_90k: u32,
    pub is_key: bool,
    pub data: Vec<u8>,
}

/// Writes a complete faststart `.mp4` containing `samples`, all described
/// by the single sample entry `entry`. `creation_time` is Unix seconds,
/// widened to the 1904 mp4 epoch.
pub fn write(
    out: &mut impl Write,
    entry: &VideoSampleEntry,
    samples: &[Sample],
    creation_time_unix_s: i64,
) -> Result<(), Error> {
    if samples.is_empty() {
        return Err(err!(Internal, msg("no samples to write")));
    }
    let mp4_time = (creation_time_unix_s + 2_082_844_800).max(0) as u32;
    let duration: u64 = samples.iter().map(|s| s.duration_90k as u64).sum();

    let mut moov = Vec::with_capacity(4096);
    let mut stco_patch_pos = 0usize;
    write_box(&mut moov, b"moov", |moov| {
        write_mvhd(moov, mp4_time, duration)?;
        write_box(moov, b"trak", |trak| {
            write_tkhd(trak, mp4_time, duration, entry.width, entry.height)?;
            write_box(trak, b"mdia", |mdia| {
                write_mdhd(mdia, mp4_time, duration)?;
                mdia.write_all(VIDEO_HDLR_BOX).map_err(io_err)?;
                write_box(mdia, b"minf", |minf| {
                    minf.write_all(VIDEO_MINF_JUNK).map_err(io_err)?;
                    write_box(minf, b"stbl", |stbl| {
                        write_stsd(stbl, entry)?;
                        write_stts(stbl, samples)?;
                        write_stsc(stbl, samples.len())?;
                        write_stsz(stbl, samples)?;
                        stco_patch_pos = write_stco_placeholder(stbl)?;
                        write_stss(stbl, samples)?;
                        Ok(())
                    })
                })
            })
        })
    })?;

    let mdat_start = FTYP_BOX.len() + moov.len() + 8; // +8 for the mdat box header itself
    BigEndian::write_u32(&mut moov[stco_patch_pos..stco_patch_pos + 4], mdat_start as u32);

    out.write_all(FTYP_BOX).map_err(io_err)?;
    out.write_all(&moov).map_err(io_err)?;

    let mdat_len: usize = samples.iter().map(|s| s.data.len()).sum();
    out.write_u32::<BigEndian>((mdat_len + 8) as u32)
        .map_err(io_err)?;
    out.write_all(b"mdat").map_err(io_err)?;
    for s in samples {
        out.write_all(&s.data).map_err(io_err)?;
    }
    Ok(())
}

fn io_err(e: std::io::Error) -> Error {
    err!(Io, source(e))
}

/// Writes `type_` with a 4-byte length prefix, calling `body` to fill the
/// box contents, then patching the length once `body` has run. Matches the
/// write-placeholder-then-patch idiom every box in this module uses.
fn write_box(
    out: &mut Vec<u8>,
    type_: &[u8; 4],
    body: impl FnOnce(&mut Vec<u8>) -> Result<(), Error>,
) -> Result<(), Error> {
    let start = out.len();
    out.write_u32::<BigEndian>(0).map_err(io_err)?;
    out.write_all(type_).map_err(io_err)?;
    body(out)?;
    let len = (out.len() - start) as u32;
    BigEndian::write_u32(&mut out[start..start + 4], len);
    Ok(())
}

fn write_mvhd(out: &mut Vec<u8>, mp4_time: u32, duration_90k: u64) -> Result<(), Error> {
    write_box(out, b"mvhd", |b| {
        b.write_u8(0).map_err(io_err)?; // version
        b.write_u24::<BigEndian>(0).map_err(io_err)?; // flags
        b.write_u32::<BigEndian>(mp4_time).map_err(io_err)?; // creation_time
        b.write_u32::<BigEndian>(mp4_time).map_err(io_err)?; // modification_time
        b.write_u32::<BigEndian>(TIMESCALE).map_err(io_err)?;
        b.write_u32::<BigEndian>(duration_90k as u32).map_err(io_err)?;
        b.write_all(MVHD_JUNK).map_err(io_err)?;
        b.write_u32::<BigEndian>(2).map_err(io_err)?; // next_track_id
        Ok(())
    })
}

fn write_tkhd(
    out: &mut Vec<u8>,
    mp4_time: u32,
    duration_90k: u64,
    width: u16,
    height: u16,
) -> Result<(), Error> {
    write_box(out, b"tkhd", |b| {
        b.write_u8(0).map_err(io_err)?; // version
        b.write_u24::<BigEndian>(0x7).map_err(io_err)?; // flags: enabled+in_movie+in_preview
        b.write_u32::<BigEndian>(mp4_time).map_err(io_err)?;
        b.write_u32::<BigEndian>(mp4_time).map_err(io_err)?;
        b.write_u32::<BigEndian>(1).map_err(io_err)?; // track_id
        b.write_u32::<BigEndian>(0).map_err(io_err)?; // reserved
        b.write_u32::<BigEndian>(duration_90k as u32).map_err(io_err)?;
        b.write_all(TKHD_JUNK).map_err(io_err)?;
        b.write_u32::<BigEndian>((width as u32) << 16).map_err(io_err)?;
        b.write_u32::<BigEndian>((height as u32) << 16).map_err(io_err)?;
        Ok(())
    })
}

fn write_mdhd(out: &mut Vec<u8>, mp4_time: u32, duration_90k: u64) -> Result<(), Error> {
    write_box(out, b"mdhd", |b| {
        b.write_u8(0).map_err(io_err)?;
        b.write_u24::<BigEndian>(0).map_err(io_err)?;
        b.write_u32::<BigEndian>(mp4_time).map_err(io_err)?;
        b.write_u32::<BigEndian>(mp4_time).map_err(io_err)?;
        b.write_u32::<BigEndian>(TIMESCALE).map_err(io_err)?;
        b.write_u32::<BigEndian>(duration_90k as u32).map_err(io_err)?;
        b.write_u16::<BigEndian>(0x55c4).map_err(io_err)?; // language = und
        b.write_u16::<BigEndian>(0).map_err(io_err)?; // pre_defined
        Ok(())
    })
}

fn write_stsd(out: &mut Vec<u8>, entry: &VideoSampleEntry) -> Result<(), Error> {
    write_box(out, b"stsd", |b| {
        b.write_u32::<BigEndian>(0).map_err(io_err)?; // version + flags
        b.write_u32::<BigEndian>(1).map_err(io_err)?; // entry_count
        b.write_all(&entry.data).map_err(io_err)?; // avc1 sample entry, already fully built
        Ok(())
    })
}

fn write_stts(out: &mut Vec<u8>, samples: &[Sample]) -> Result<(), Error> {
    write_box(out, b"stts", |b| {
        b.write_u32::<BigEndian>(0).map_err(io_err)?;
        let entries = run_length_durations(samples);
        b.write_u32::<BigEndian>(entries.len() as u32).map_err(io_err)?;
        for (count, delta) in entries {
            b.write_u32::<BigEndian>(count).map_err(io_err)?;
            b.write_u32::<BigEndian>(delta).map_err(io_err)?;
        }
        Ok(())
    })
}

fn run_length_durations(samples: &[Sample]) -> Vec<(u32, u32)> {
    let mut out: Vec<(u32, u32)> = Vec::new();
    for s in samples {
        match out.last_mut() {
            Some((count, delta)) if *delta == s.duration_90k => *count += 1,
            _ => out.push((1, s.duration_90k)),
        }
    }
    out
}

fn write_stsc(out: &mut Vec<u8>, sample_count: usize) -> Result<(), Error> {
    write_box(out, b"stsc", |b| {
        b.write_u32::<BigEndian>(0).map_err(io_err)?;
        b.write_u32::<BigEndian>(1).map_err(io_err)?; // entry_count
        b.write_u32::<BigEndian>(1).map_err(io_err)?; // first_chunk
        b.write_u32::<BigEndian>(sample_count as u32).map_err(io_err)?; // samples_per_chunk
        b.write_u32::<BigEndian>(1).map_err(io_err)?; // sample_description_index
        Ok(())
    })
}

fn write_stsz(out: &mut Vec<u8>, samples: &[Sample]) -> Result<(), Error> {
    write_box(out, b"stsz", |b| {
        b.write_u32::<BigEndian>(0).map_err(io_err)?;
        b.write_u32::<BigEndian>(0).map_err(io_err)?; // sample_size == 0 (varies, see table)
        b.write_u32::<BigEndian>(samples.len() as u32).map_err(io_err)?;
        for s in samples {
            b.write_u32::<BigEndian>(s.data.len() as u32).map_err(io_err)?;
        }
        Ok(())
    })
}

/// Writes a single-entry `stco` with a zeroed offset and returns the byte
/// position (within the buffer being built) of that offset, so the caller
/// can patch it once the absolute `mdat` start is known.
fn write_stco_placeholder(out: &mut Vec<u8>) -> Result<usize, Error> {
    let mut pos = 0;
    write_box(out, b"stco", |b| {
        b.write_u32::<BigEndian>(0).map_err(io_err)?;
        b.write_u32::<BigEndian>(1).map_err(io_err)?; // entry_count
        pos = b.len();
        b.write_u32::<BigEndian>(0).map_err(io_err)?; // chunk_offset placeholder
        Ok(())
    })?;
    // `pos` was recorded relative to the box's own body buffer passed to
    // write_box, which is `out` itself (write_box operates in place), so it
    // already denotes the absolute offset within `out`.
    Ok(pos)
}

fn write_stss(out: &mut Vec<u8>, samples: &[Sample]) -> Result<(), Error> {
    let keys: Vec<u32> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_key)
        .map(|(i, _)| (i + 1) as u32)
        .collect();
    if keys.is_empty() {
        return Ok(());
    }
    write_box(out, b"stss", |b| {
        b.write_u32::<BigEndian>(0).map_err(io_err)?;
        b.write_u32::<BigEndian>(keys.len() as u32).map_err(io_err)?;
        for k in keys {
            b.write_u32::<BigEndian>(k).map_err(io_err)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VideoSampleEntry;

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

    fn sample(pts: i64, is_key: bool) -> Sample {
        Sample {
            pts_90k: pts,
            duration_90k: 3000,
            is_key,
            data: vec![0u8; 100],
        }
    }

    #[test]
    fn writes_ftyp_then_moov_then_mdat_in_order() {
        let mut out = Vec::new();
        let samples = vec![sample(0, true), sample(3000, false)];
        write(&mut out, &entry(), &samples, 1_700_000_000).unwrap();
        assert_eq!(&out[4..8], b"ftyp");
        let moov_pos = 32; // ftyp box is 32 bytes per FTYP_BOX
        assert_eq!(&out[moov_pos + 4..moov_pos + 8], b"moov");
    }

    #[test]
    fn rejects_empty_sample_list() {
        let mut out = Vec::new();
        assert!(write(&mut out, &entry(), &[], 0).is_err());
    }

    #[test]
    fn stco_offset_points_at_mdat_payload_start() {
        let mut out = Vec::new();
        let samples = vec![sample(0, true)];
        write(&mut out, &entry(), &samples, 0).unwrap();
        // mdat's header is the last 8 bytes before its payload; find "mdat"
        // and confirm the recorded stco offset equals its payload offset.
        let mdat_tag = out.windows(4).position(|w| w == b"mdat").unwrap();
        let payload_start = (mdat_tag + 4) as u32;
        // Find the stco box and read its one entry.
        let stco_tag = out.windows(4).position(|w| w == b"stco").unwrap();
        let entry_count_pos = stco_tag + 4 + 4; // type + version/flags
        let offset_pos = entry_count_pos + 4;
        let recorded = BigEndian::read_u32(&out[offset_pos..offset_pos + 4]);
        assert_eq!(recorded, payload_start);
    }
}
