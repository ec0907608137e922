// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Reads back the exact box tree [`crate::mp4_writer`] produces: single
//! `trak`, single `stsd` entry, single `stco` chunk. This is the export
//! engine's only way to get samples back out of a stored recording, so it
//! is deliberately narrow -- it is never asked to parse an MP4 from
//! anywhere but this system's own recordings and exports.

use crate::codec::VideoSampleEntry;
use crate::mp4_writer::Sample;
use base::{err, Error};
use byteorder::{BigEndian, ByteOrder};
use std::io::Read;
use std::path::Path;

/// One parsed track: the sample entry every sample shares, plus the
/// samples themselves with `pts_90k` relative to the file's own start (as
/// `mp4_writer` wrote them, i.e. the first sample is always at `0`).
pub struct ParsedTrack {
    pub entry: VideoSampleEntry,
    pub samples: Vec<Sample>,
}

/// Walks sibling boxes starting at `data[0]`, yielding `(type, body_start,
/// body_end)` offsets into `data`. Stops at the first malformed header
/// (declared size larger than what remains) rather than erroring, since a
/// trailing partial box only happens if the caller sliced past a box's own
/// declared end.
fn iter_boxes(data: &[u8]) -> impl Iterator<Item = ([u8; 4], usize, usize)> + '_ {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos + 8 > data.len() {
            return None;
        }
        let len = BigEndian::read_u32(&data[pos..pos + 4]) as usize;
        if len < 8 || pos + len > data.len() {
            return None;
        }
        let mut type_ = [0u8; 4];
        type_.copy_from_slice(&data[pos + 4..pos + 8]);
        let body_start = pos + 8;
        let body_end = pos + len;
        pos = body_end;
        Some((type_, body_start, body_end))
    })
}

fn find_box<'a>(data: &'a [u8], want: &[u8; 4]) -> Result<&'a [u8], Error> {
    iter_boxes(data)
        .find(|(t, _, _)| t == want)
        .map(|(_, s, e)| &data[s..e])
        .ok_or_else(|| {
            err!(
                Internal,
                msg("missing '{}' box", String::from_utf8_lossy(want))
            )
        })
}

/// VisualSampleEntry header up to width/height: 6 bytes reserved + 2
/// bytes data_reference_index + 16 bytes predefined/reserved, all ahead of
/// the `width`/`height` fields (ISO/IEC 14496-12 section 12.1.3).
const VISUAL_SAMPLE_ENTRY_PREFIX: usize = 8 + 16;

fn read_stsd(stbl: &[u8]) -> Result<VideoSampleEntry, Error> {
    let stsd = find_box(stbl, b"stsd")?;
    // version/flags (4) + entry_count (4), then the raw `avc1` box.
    if stsd.len() < 8 {
        return Err(err!(Internal, msg("stsd box truncated")));
    }
    let avc1 = &stsd[8..];
    if avc1.len() < 8 + VISUAL_SAMPLE_ENTRY_PREFIX + 4 {
        return Err(err!(Internal, msg("avc1 box too short")));
    }
    let body = &avc1[8..];
    let width = BigEndian::read_u16(&body[VISUAL_SAMPLE_ENTRY_PREFIX..VISUAL_SAMPLE_ENTRY_PREFIX + 2]);
    let height =
        BigEndian::read_u16(&body[VISUAL_SAMPLE_ENTRY_PREFIX + 2..VISUAL_SAMPLE_ENTRY_PREFIX + 4]);
    let rfc6381_codec = avc1_codec_tag(avc1).unwrap_or_else(|| "avc1.640028".to_string());
    Ok(VideoSampleEntry {
        data: avc1.to_vec(),
        rfc6381_codec,
        width,
        height,
        pasp_h_spacing: 1,
        pasp_v_spacing: 1,
    })
}

/// Finds the embedded `avcC` box by its 4-byte tag (rather than assuming a
/// fixed offset -- the bytes between `height` and `avcC` vary with the
/// encoder that produced the sample entry) and reads
/// `profile_idc/constraint_flags/level_idc` from its first bytes. Best
/// effort: a malformed or missing `avcC` falls back to a generic tag
/// rather than failing the read.
fn avc1_codec_tag(avc1: &[u8]) -> Option<String> {
    let tag_pos = avc1.windows(4).position(|w| w == b"avcC")?;
    let body = avc1.get(tag_pos + 4..tag_pos + 8)?;
    let (profile_idc, constraint_flags, level_idc) = (body[1], body[2], body[3]);
    Some(format!("avc1.{profile_idc:02x}{constraint_flags:02x}{level_idc:02x}"))
}

fn read_stts(stbl: &[u8]) -> Result<Vec<(u32, u32)>, Error> {
    let stts = find_box(stbl, b"stts")?;
    let count = BigEndian::read_u32(&stts[4..8]) as usize;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let off = 8 + i * 8;
        out.push((
            BigEndian::read_u32(&stts[off..off + 4]),
            BigEndian::read_u32(&stts[off + 4..off + 8]),
        ));
    }
    Ok(out)
}

fn read_stsz(stbl: &[u8]) -> Result<Vec<u32>, Error> {
    let stsz = find_box(stbl, b"stsz")?;
    let sample_count = BigEndian::read_u32(&stsz[8..12]) as usize;
    let mut out = Vec::with_capacity(sample_count);
    for i in 0..sample_count {
        let off = 12 + i * 4;
        out.push(BigEndian::read_u32(&stsz[off..off + 4]));
    }
    Ok(out)
}

fn read_stco(stbl: &[u8]) -> Result<u32, Error> {
    let stco = find_box(stbl, b"stco")?;
    Ok(BigEndian::read_u32(&stco[8..12]))
}

fn read_stss(stbl: &[u8]) -> Vec<u32> {
    let Ok(stss) = find_box(stbl, b"stss") else {
        return Vec::new();
    };
    let count = BigEndian::read_u32(&stss[4..8]) as usize;
    (0..count)
        .map(|i| BigEndian::read_u32(&stss[8 + i * 4..12 + i * 4]))
        .collect()
}

/// Reads the whole track back: sample entry, per-sample size/duration/
/// keyframe flag, and the sample bytes themselves (read directly from the
/// file at the offsets `stco`/`stsz` describe, so this never holds more
/// than one file's `mdat` in memory at a time).
pub fn read(path: &Path) -> Result<ParsedTrack, Error> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| err!(Io, source(e)).with_path(path))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| err!(Io, source(e)).with_path(path))?;

    let moov = find_box(&data, b"moov")?;
    let trak = find_box(moov, b"trak")?;
    let mdia = find_box(trak, b"mdia")?;
    let minf = find_box(mdia, b"minf")?;
    let stbl = find_box(minf, b"stbl")?;

    let entry = read_stsd(stbl)?;
    let durations = read_stts(stbl)?;
    let sizes = read_stsz(stbl)?;
    let chunk_offset = read_stco(stbl)?;
    let keyframes = read_stss(stbl);

    let mut duration_iter = durations.into_iter().flat_map(|(count, delta)| std::iter::repeat(delta).take(count as usize));

    let mut samples = Vec::with_capacity(sizes.len());
    let mut file_offset = chunk_offset as u64;
    let mut pts_90k: i64 = 0;
    for (i, size) in sizes.into_iter().enumerate() {
        let duration_90k = duration_iter
            .next()
            .ok_or_else(|| err!(Internal, msg("stts/stsz sample count mismatch")))?;
        let is_key = keyframes.is_empty() || keyframes.binary_search(&((i + 1) as u32)).is_ok();

        let mut buf = vec![0u8; size as usize];
        read_at(&mut file, file_offset, &mut buf)?;
        file_offset += size as u64;

        samples.push(Sample {
            pts_90k,
            duration_90k,
            is_key,
            data: buf,
        });
        pts_90k += duration_90k as i64;
    }

    Ok(ParsedTrack { entry, samples })
}

fn read_at(file: &mut std::fs::File, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset)).map_err(|e| err!(Io, source(e)))?;
    file.read_exact(buf).map_err(|e| err!(Io, source(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VideoSampleEntry;
    use crate::mp4_writer;

    fn entry() -> VideoSampleEntry {
        // A minimal, structurally valid `avc1` box: header fields up to
        // width/height at the documented offsets, a tiny `avcC` child.
        let mut body = vec![0u8; VISUAL_SAMPLE_ENTRY_PREFIX + 4];
        BigEndian::write_u16(
            &mut body[VISUAL_SAMPLE_ENTRY_PREFIX..VISUAL_SAMPLE_ENTRY_PREFIX + 2],
            1280,
        );
        BigEndian::write_u16(
            &mut body[VISUAL_SAMPLE_ENTRY_PREFIX + 2..VISUAL_SAMPLE_ENTRY_PREFIX + 4],
            720,
        );
        // avcC box: 4-byte length + "avcC" + configurationVersion,
        // profile_idc, constraint_flags, level_idc.
        body.extend_from_slice(&[0, 0, 0, 12, b'a', b'v', b'c', b'C', 1, 0x64, 0x00, 0x28]);
        let mut data = Vec::with_capacity(body.len() + 8);
        data.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
        data.extend_from_slice(b"avc1");
        data.extend_from_slice(&body);

        VideoSampleEntry {
            data,
            rfc6381_codec: "avc1.640028".to_string(),
            width: 1280,
            height: 720,
            pasp_h_spacing: 1,
            pasp_v_spacing: 1,
        }
    }

    fn sample(pts: i64, is_key: bool) -> mp4_writer::Sample {
        mp4_writer::Sample {
            pts_90k: pts,
            duration_90k: 3000,
            is_key,
            data: vec![0xab; 50],
        }
    }

    #[test]
    fn round_trips_samples_written_by_mp4_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.mp4");
        let samples = vec![sample(0, true), sample(3000, false), sample(6000, false)];
        {
            let mut f = std::fs::File::create(&path).unwrap();
            mp4_writer::write(&mut f, &entry(), &samples, 1_700_000_000).unwrap();
        }
        let parsed = read(&path).unwrap();
        assert_eq!(parsed.samples.len(), 3);
        assert_eq!(parsed.samples[0].pts_90k, 0);
        assert_eq!(parsed.samples[1].pts_90k, 3000);
        assert!(parsed.samples[0].is_key);
        assert!(!parsed.samples[1].is_key);
        assert_eq!(parsed.samples[2].data, vec![0xab; 50]);
        assert_eq!(parsed.entry.width, 1280);
        assert_eq!(parsed.entry.height, 720);
    }
}
