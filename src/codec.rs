// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! H.264 byte stream handling.
//!
//! H.264 has two byte stream encodings: ISO/IEC 14496-10 Annex B, and
//! ISO/IEC 14496-15 AVC access units. RTSP (via `retina`) supplies the
//! latter already; some HTTP ingest sources and all our MP4 muxing need an
//! `AVCDecoderConfigurationRecord` and length-prefixed samples, so this
//! module also builds the one sample entry type the recording engine and
//! HLS segmenter both consume.

use base::{err, Error};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::convert::TryFrom;

const NAL_UNIT_SEQ_PARAMETER_SET: u8 = 7;
const NAL_UNIT_PIC_PARAMETER_SET: u8 = 8;
const NAL_UNIT_TYPE_MASK: u8 = 0x1F;

/// A concrete box derived from a ISO/IEC 14496-12 section 8.5.2
/// `VisualSampleEntry` box: the codec, dimensions, and `avcC` payload
/// shared by every segment written for a given parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSampleEntry {
    /// The full `avc1` box, ready to copy into an MP4 `stsd`.
    pub data: Vec<u8>,
    pub rfc6381_codec: String,
    pub width: u16,
    pub height: u16,
    pub pasp_h_spacing: u16,
    pub pasp_v_spacing: u16,
}

/// Decodes a H.264 Annex B byte stream into NAL units, calling `f` for
/// each. `f` receives the encoded NAL form (header byte plus any emulation
/// prevention bytes), not the RBSP.
///
/// See ISO/IEC 14496-10 section B.2.
fn decode_h264_annex_b<'a, F>(mut data: &'a [u8], mut f: F) -> Result<(), Error>
where
    F: FnMut(&'a [u8]) -> Result<(), Error>,
{
    let start_code = &b"\x00\x00\x01"[..];
    use nom::FindSubstring;
    'outer: while let Some(pos) = data.find_substring(start_code) {
        let mut unit = &data[0..pos];
        data = &data[pos + start_code.len()..];
        loop {
            match unit.last() {
                None => continue 'outer,
                Some(0) => unit = &unit[..unit.len() - 1],
                Some(_) => break,
            }
        }
        f(unit)?;
    }
    if !data.is_empty() {
        f(data)?;
    }
    Ok(())
}

fn parse_annex_b_extra_data(data: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    let mut sps = None;
    let mut pps = None;
    decode_h264_annex_b(data, |unit| {
        match unit[0] & NAL_UNIT_TYPE_MASK {
            NAL_UNIT_SEQ_PARAMETER_SET => sps = Some(unit),
            NAL_UNIT_PIC_PARAMETER_SET => pps = Some(unit),
            t => return Err(err!(ConfigInvalid, msg("expected SPS/PPS, got NAL type {t}"))),
        };
        Ok(())
    })?;
    match (sps, pps) {
        (Some(s), Some(p)) => Ok((s, p)),
        _ => Err(err!(ConfigInvalid, msg("SPS and PPS must both be present"))),
    }
}

/// Decodes a NAL unit (minus header byte) into its RBSP, undoing emulation
/// prevention byte escaping.
fn decode_rbsp(encoded: &[u8]) -> Vec<u8> {
    struct NalRead(Vec<u8>);
    use h264_reader::nal::NalHandler;
    use h264_reader::Context;
    impl NalHandler for NalRead {
        type Ctx = ();
        fn start(&mut self, _ctx: &mut Context<Self::Ctx>, _header: h264_reader::nal::NalHeader) {}
        fn push(&mut self, _ctx: &mut Context<Self::Ctx>, buf: &[u8]) {
            self.0.extend_from_slice(buf)
        }
        fn end(&mut self, _ctx: &mut Context<Self::Ctx>) {}
    }
    let mut decode = h264_reader::rbsp::RbspDecoder::new(NalRead(vec![]));
    let mut ctx = Context::new(());
    decode.push(&mut ctx, encoded);
    decode.into_handler().0
}

const PIXEL_ASPECT_RATIOS: [((u16, u16), (u16, u16)); 4] = [
    ((320, 240), (4, 3)),
    ((352, 240), (40, 33)),
    ((640, 480), (4, 3)),
    ((704, 480), (40, 33)),
];

fn default_pixel_aspect_ratio(width: u16, height: u16) -> (u16, u16) {
    PIXEL_ASPECT_RATIOS
        .iter()
        .find(|r| r.0 == (width, height))
        .map(|r| r.1)
        .unwrap_or((1, 1))
}

/// Parsed form of the ingest source's "extra data": the out-of-band
/// SPS/PPS a RTSP `SDP` or a MJPEG source's first frame provides.
#[derive(Debug, PartialEq, Eq)]
pub struct ExtraData {
    pub entry: VideoSampleEntry,

    /// True iff sample data must be converted from Annex B to AVC length-
    /// prefixed form via [`transform_sample_data`] before muxing.
    pub need_transform: bool,
}

impl ExtraData {
    /// Parses extra data in either Annex B or `AVCDecoderConfigurationRecord`
    /// form into a [`VideoSampleEntry`].
    pub fn parse(extradata: &[u8], width: u16, height: u16) -> Result<ExtraData, Error> {
        let raw_sps_and_pps;
        let need_transform;
        let ctx;
        let sps_owner;
        let sps;
        if extradata.starts_with(b"\x00\x00\x00\x01") || extradata.starts_with(b"\x00\x00\x01") {
            let (s, p) = parse_annex_b_extra_data(extradata)?;
            let rbsp = decode_rbsp(&s[1..]);
            sps_owner = h264_reader::nal::sps::SeqParameterSet::from_bytes(&rbsp)
                .map_err(|e| err!(ConfigInvalid, msg("bad SPS: {e:?}")))?;
            sps = &sps_owner;
            raw_sps_and_pps = Some((s, p));
            need_transform = true;
        } else {
            need_transform = false;
            raw_sps_and_pps = None;
            let avcc = h264_reader::avcc::AvcDecoderConfigurationRecord::try_from(extradata)
                .map_err(|e| err!(ConfigInvalid, msg("bad AVCDecoderConfigurationRecord: {e:?}")))?;
            if avcc.num_of_sequence_parameter_sets() != 1 {
                return Err(err!(ConfigInvalid, msg("multiple SPSs unsupported")));
            }
            ctx = avcc
                .create_context(())
                .map_err(|e| err!(ConfigInvalid, msg("can't load SPS+PPS: {e:?}")))?;
            sps = ctx
                .sps_by_id(h264_reader::nal::pps::ParamSetId::from_u32(0).unwrap())
                .ok_or_else(|| err!(ConfigInvalid, msg("no SPS 0")))?;
        };

        let mut sample_entry = Vec::with_capacity(256);
        let avc1_len_pos = sample_entry.len();
        sample_entry.extend_from_slice(b"\x00\x00\x00\x00avc1\x00\x00\x00\x00\x00\x00\x00\x01");
        sample_entry.extend_from_slice(&[0; 16]);
        sample_entry
            .write_u16::<BigEndian>(width)
            .map_err(|e| err!(Internal, source(e)))?;
        sample_entry
            .write_u16::<BigEndian>(height)
            .map_err(|e| err!(Internal, source(e)))?;
        sample_entry.extend_from_slice(&[
            0x00, 0x48, 0x00, 0x00, 0x00, 0x48, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x18, 0xff, 0xff,
        ]);

        let avcc_len_pos = sample_entry.len();
        sample_entry.extend_from_slice(b"\x00\x00\x00\x00avcC");
        if let Some((sps_raw, pps_raw)) = raw_sps_and_pps {
            sample_entry.push(1);
            sample_entry.push(sps_raw[1]);
            sample_entry.push(sps_raw[2]);
            sample_entry.push(sps_raw[3]);
            sample_entry.push(0xff); // lengthSizeMinusOne = 3
            sample_entry.push(0xe1); // 1 SPS
            sample_entry
                .write_u16::<BigEndian>(u16::try_from(sps_raw.len()).unwrap())
                .unwrap();
            sample_entry.extend_from_slice(sps_raw);
            sample_entry.push(1); // 1 PPS
            sample_entry
                .write_u16::<BigEndian>(u16::try_from(pps_raw.len()).unwrap())
                .unwrap();
            sample_entry.extend_from_slice(pps_raw);
        } else {
            sample_entry.extend_from_slice(extradata);
        }
        let cur_pos = sample_entry.len();
        BigEndian::write_u32(
            &mut sample_entry[avcc_len_pos..avcc_len_pos + 4],
            u32::try_from(cur_pos - avcc_len_pos).unwrap(),
        );

        let pasp = sps
            .vui_parameters
            .as_ref()
            .and_then(|v| v.aspect_ratio_info.as_ref())
            .and_then(|a| a.clone().get())
            .unwrap_or_else(|| default_pixel_aspect_ratio(width, height));
        if pasp != (1, 1) {
            sample_entry.extend_from_slice(b"\x00\x00\x00\x10pasp");
            sample_entry.write_u32::<BigEndian>(pasp.0.into()).unwrap();
            sample_entry.write_u32::<BigEndian>(pasp.1.into()).unwrap();
        }
        let cur_pos = sample_entry.len();
        BigEndian::write_u32(
            &mut sample_entry[avc1_len_pos..avc1_len_pos + 4],
            u32::try_from(cur_pos - avc1_len_pos).unwrap(),
        );

        let profile_idc = sample_entry[103];
        let constraint_flags = sample_entry[104];
        let level_idc = sample_entry[105];
        let rfc6381_codec = format!("avc1.{profile_idc:02x}{constraint_flags:02x}{level_idc:02x}");

        Ok(ExtraData {
            entry: VideoSampleEntry {
                data: sample_entry,
                rfc6381_codec,
                width,
                height,
                pasp_h_spacing: pasp.0,
                pasp_v_spacing: pasp.1,
            },
            need_transform,
        })
    }
}

/// Converts sample data from Annex B to length-prefixed AVC form. Called
/// iff the source's [`ExtraData::need_transform`] is true.
pub fn transform_sample_data(annexb_sample: &[u8], avc_sample: &mut Vec<u8>) -> Result<(), Error> {
    avc_sample.clear();
    avc_sample.reserve(annexb_sample.len() + 4);
    decode_h264_annex_b(annexb_sample, |unit| {
        avc_sample
            .write_u32::<BigEndian>(unit.len() as u32)
            .map_err(|e| err!(Internal, source(e)))?;
        avc_sample.extend_from_slice(unit);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    const ANNEX_B_TEST_INPUT: [u8; 35] = [
        0x00, 0x00, 0x00, 0x01, 0x67, 0x4d, 0x00, 0x1f,
        0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01,
        0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00,
        0x1d, 0x4c, 0x01, 0x00, 0x00, 0x00, 0x01, 0x68,
        0xee, 0x3c, 0x80,
    ];

    #[rustfmt::skip]
    const AVC_DECODER_CONFIG_TEST_INPUT: [u8; 38] = [
        0x01, 0x4d, 0x00, 0x1f, 0xff, 0xe1, 0x00, 0x17,
        0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66, 0x02, 0x80,
        0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40, 0x00,
        0x00, 0xfa, 0x00, 0x00, 0x1d, 0x4c, 0x01, 0x01,
        0x00, 0x04, 0x68, 0xee, 0x3c, 0x80,
    ];

    #[test]
    fn decode_splits_nal_units() {
        let mut pieces = Vec::new();
        decode_h264_annex_b(&ANNEX_B_TEST_INPUT, |p| {
            pieces.push(p);
            Ok(())
        })
        .unwrap();
        assert_eq!(&pieces, &[&ANNEX_B_TEST_INPUT[4..27], &ANNEX_B_TEST_INPUT[31..]]);
    }

    #[test]
    fn sample_entry_from_avc_decoder_config() {
        let e = ExtraData::parse(&AVC_DECODER_CONFIG_TEST_INPUT, 1280, 720).unwrap();
        assert_eq!(e.entry.width, 1280);
        assert_eq!(e.entry.height, 720);
        assert_eq!(e.entry.rfc6381_codec, "avc1.4d001f");
        assert!(!e.need_transform);
    }

    #[test]
    fn sample_entry_from_annex_b() {
        let e = ExtraData::parse(&ANNEX_B_TEST_INPUT, 1280, 720).unwrap();
        assert_eq!(e.entry.width, 1280);
        assert_eq!(e.entry.height, 720);
        assert!(e.need_transform);
    }

    #[test]
    fn transform_sample_data_prefixes_lengths() {
        #[rustfmt::skip]
        const INPUT: [u8; 16] = [
            0x00, 0x00, 0x00, 0x01, 0x68, 0xee, 0x3c, 0x80,
            0x00, 0x00, 0x00, 0x01, 0x06, 0x06, 0x01, 0xc4,
        ];
        let mut out = Vec::new();
        transform_sample_data(&INPUT, &mut out).unwrap();
        assert_eq!(&out[0..4], &[0, 0, 0, 4]);
        assert_eq!(&out[4..8], &INPUT[4..8]);
        assert_eq!(&out[8..12], &[0, 0, 0, 4]);
        assert_eq!(&out[12..16], &INPUT[12..16]);
    }
}
