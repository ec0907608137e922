// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2016 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Ingest sources: opens a camera URL and yields a sequence of encoded
//! video frames. [`Opener`]/[`Stream`] are traits so the supervisor can be
//! tested against a scripted double instead of a real network connection.

use crate::codec::VideoSampleEntry;
use base::{bail, err, Error};
use bytes::Bytes;
use futures::StreamExt;
use retina::client::Demuxed;
use retina::codec::CodecItem;
use std::pin::Pin;
use std::result::Result;
use tracing::Instrument;
use url::Url;

static RETINA_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// For certain common sub stream anamorphic resolutions, add a pixel aspect ratio box.
// Assume the camera is 16x9. These are just the standard wide mode; default_pixel_aspect_ratio
// tries the transpose also.
const PIXEL_ASPECT_RATIOS: [((u16, u16), (u16, u16)); 6] = [
    ((320, 240), (4, 3)),
    ((352, 240), (40, 33)),
    ((640, 352), (44, 45)),
    ((640, 480), (4, 3)),
    ((704, 480), (40, 33)),
    ((720, 480), (32, 27)),
];

fn default_pixel_aspect_ratio(width: u16, height: u16) -> (u16, u16) {
    if width >= height {
        PIXEL_ASPECT_RATIOS
            .iter()
            .find(|r| r.0 == (width, height))
            .map(|r| r.1)
            .unwrap_or((1, 1))
    } else {
        PIXEL_ASPECT_RATIOS
            .iter()
            .find(|r| r.0 == (height, width))
            .map(|r| (r.1 .1, r.1 .0))
            .unwrap_or((1, 1))
    }
}

#[derive(Clone)]
pub struct Options {
    pub session: retina::client::SessionOptions,
    pub setup: retina::client::SetupOptions,
}

/// Opens a camera source. Implemented once per ingest transport (RTSP,
/// HTTP-MJPEG); the stream supervisor is generic over this trait so tests
/// can inject a scripted double.
pub trait Opener: Send + Sync {
    /// Opens `url`, blocking until the first frame has been received.
    ///
    /// Despite the blocking signature, this expects to run on a thread
    /// that has access to a multithreaded tokio runtime with IO and time
    /// enabled; the RTSP opener bridges into it internally.
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Stream>, Error>;
}

pub struct VideoFrame {
    /// Presentation timestamp, in the source's own clock units (elapsed
    /// nanoseconds for RTSP sources).
    pub pts: i64,
    pub is_key: bool,
    pub data: Bytes,

    /// True iff [`Stream::video_sample_entry`] changed as a result of
    /// returning this frame; the caller must roll to a new sample entry.
    pub new_video_sample_entry: bool,
}

pub trait Stream: Send {
    fn tool(&self) -> Option<&retina::client::Tool>;
    fn video_sample_entry(&self) -> &VideoSampleEntry;
    fn next(&mut self) -> Result<VideoFrame, Error>;
}

pub struct RealOpener;

pub const OPENER: RealOpener = RealOpener;

impl Opener for RealOpener {
    fn open(
        &self,
        label: String,
        url: Url,
        mut options: Options,
    ) -> Result<Box<dyn Stream>, Error> {
        options.session = options
            .session
            .user_agent(format!("LightNVR {}", env!("CARGO_PKG_VERSION")));
        let rt_handle = tokio::runtime::Handle::current();
        let (inner, first_frame) = rt_handle
            .block_on(
                rt_handle.spawn(
                    tokio::time::timeout(
                        RETINA_TIMEOUT,
                        RetinaStreamInner::play(label, url, options),
                    )
                    .in_current_span(),
                ),
            )
            .expect("RetinaStream::play task panicked, see earlier error")
            .map_err(|e| {
                err!(
                    PacketTimeout,
                    msg("unable to play stream and get first frame within {RETINA_TIMEOUT:?}"),
                    source(e)
                )
            })??;
        Ok(Box::new(RetinaStream {
            inner: Some(inner),
            rt_handle,
            first_frame: Some(first_frame),
        }))
    }
}

/// Real stream, implemented with the Retina library.
///
/// Retina is asynchronous and tokio-based; the supervisor's worker thread
/// is synchronous, so this blocks via `handle.block_on(handle.spawn(...))`
/// per frame, handing the inner state back and forth across the boundary.
struct RetinaStream {
    inner: Option<Box<RetinaStreamInner>>,
    rt_handle: tokio::runtime::Handle,
    first_frame: Option<retina::codec::VideoFrame>,
}

struct RetinaStreamInner {
    label: String,
    session: Demuxed,
    video_sample_entry: VideoSampleEntry,
}

fn params_to_sample_entry(
    params: &retina::codec::VideoParameters,
) -> Result<VideoSampleEntry, Error> {
    let (width, height) = params.pixel_dimensions();
    let width = u16::try_from(width).map_err(|e| err!(Internal, source(e)))?;
    let height = u16::try_from(height).map_err(|e| err!(Internal, source(e)))?;
    let aspect = default_pixel_aspect_ratio(width, height);
    Ok(VideoSampleEntry {
        data: params
            .mp4_sample_entry()
            .with_aspect_ratio(aspect)
            .build()
            .map_err(|e| err!(OpenFailed, source(e)))?,
        rfc6381_codec: params.rfc6381_codec().to_owned(),
        width,
        height,
        pasp_h_spacing: aspect.0,
        pasp_v_spacing: aspect.1,
    })
}

impl RetinaStreamInner {
    /// Plays to first frame. No timeout; that's the caller's responsibility.
    async fn play(
        label: String,
        url: Url,
        options: Options,
    ) -> Result<(Box<Self>, retina::codec::VideoFrame), Error> {
        let mut session = retina::client::Session::describe(url, options.session)
            .await
            .map_err(|e| err!(OpenFailed, source(e)))?;
        tracing::debug!(%label, tool = ?session.tool(), "connected");
        let video_i = session
            .streams()
            .iter()
            .position(|s| {
                s.media() == "video" && matches!(s.encoding_name(), "h264" | "h265" | "jpeg")
            })
            .ok_or_else(|| err!(NoVideoTrack, msg("no supported video stream in SDP")))?;
        session
            .setup(video_i, options.setup)
            .await
            .map_err(|e| err!(OpenFailed, source(e)))?;
        let session = session
            .play(retina::client::PlayOptions::default())
            .await
            .map_err(|e| err!(OpenFailed, source(e)))?;
        let mut session = session.demuxed().map_err(|e| err!(OpenFailed, source(e)))?;

        let first_frame = loop {
            match Pin::new(&mut session).next().await {
                None => bail!(ReadError, msg("stream closed before first frame")),
                Some(Err(e)) => bail!(ReadError, msg("unable to get first frame"), source(e)),
                Some(Ok(CodecItem::VideoFrame(v))) => {
                    if v.is_random_access_point() {
                        break v;
                    }
                }
                Some(Ok(_)) => {}
            }
        };
        let video_params = match session.streams()[video_i].parameters() {
            Some(retina::codec::ParametersRef::Video(v)) => v.clone(),
            Some(_) => bail!(NoVideoTrack, msg("selected stream is not video")),
            None => bail!(NoVideoTrack, msg("no video parameters available")),
        };
        let video_sample_entry = params_to_sample_entry(&video_params)?;
        let self_ = Box::new(Self {
            label,
            session,
            video_sample_entry,
        });
        Ok((self_, first_frame))
    }

    /// Fetches a non-initial frame.
    async fn fetch_next_frame(
        mut self: Box<Self>,
    ) -> Result<
        (
            Box<Self>,
            retina::codec::VideoFrame,
            Option<retina::codec::VideoParameters>,
        ),
        Error,
    > {
        loop {
            match Pin::new(&mut self.session)
                .next()
                .await
                .transpose()
                .map_err(|e| err!(ReadError, source(e)))?
            {
                None => bail!(ReadError, msg("end of stream")),
                Some(CodecItem::VideoFrame(v)) => {
                    if v.loss() > 0 {
                        tracing::warn!(
                            label = %self.label,
                            lost = v.loss(),
                            ctx = %v.start_ctx(),
                            "lost RTP packets"
                        );
                    }
                    let p = if v.has_new_parameters() {
                        Some(match self.session.streams()[v.stream_id()].parameters() {
                            Some(retina::codec::ParametersRef::Video(v)) => v.clone(),
                            _ => unreachable!(),
                        })
                    } else {
                        None
                    };
                    return Ok((self, v, p));
                }
                Some(_) => {}
            }
        }
    }
}

impl Stream for RetinaStream {
    fn tool(&self) -> Option<&retina::client::Tool> {
        self.inner.as_ref().unwrap().session.tool()
    }

    fn video_sample_entry(&self) -> &VideoSampleEntry {
        &self.inner.as_ref().unwrap().video_sample_entry
    }

    fn next(&mut self) -> Result<VideoFrame, Error> {
        let (frame, new_video_sample_entry) = self
            .first_frame
            .take()
            .map(|f| Ok((f, false)))
            .unwrap_or_else(move || {
                let inner = self.inner.take().unwrap();
                let (mut inner, frame, new_parameters) = self
                    .rt_handle
                    .block_on(
                        self.rt_handle.spawn(
                            tokio::time::timeout(RETINA_TIMEOUT, inner.fetch_next_frame())
                                .in_current_span(),
                        ),
                    )
                    .expect("fetch_next_frame task panicked, see earlier error")
                    .map_err(|e| {
                        err!(
                            PacketTimeout,
                            msg("unable to get next frame within {RETINA_TIMEOUT:?}"),
                            source(e)
                        )
                    })??;
                let mut new_video_sample_entry = false;
                if let Some(p) = new_parameters {
                    let video_sample_entry = params_to_sample_entry(&p)?;
                    if video_sample_entry != inner.video_sample_entry {
                        inner.video_sample_entry = video_sample_entry;
                        new_video_sample_entry = true;
                    }
                }
                self.inner = Some(inner);
                Ok::<_, Error>((frame, new_video_sample_entry))
            })?;
        Ok(VideoFrame {
            pts: frame.timestamp().elapsed(),
            is_key: frame.is_random_access_point(),
            data: frame.into_data().into(),
            new_video_sample_entry,
        })
    }
}

/// Opens a HTTP-MJPEG source (a bare motion-jpeg stream, as exposed by some
/// low-end cameras alongside or instead of RTSP). Each multipart boundary
/// becomes a key frame; there is no inter-frame prediction, so no
/// `need_transform`/`avcC` machinery applies.
pub struct MjpegOpener {
    pub client: reqwest::blocking::Client,
}

impl Opener for MjpegOpener {
    fn open(&self, _label: String, url: Url, _options: Options) -> Result<Box<dyn Stream>, Error> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| err!(OpenFailed, source(e)))?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| err!(OpenFailed, msg("missing content-type")))?
            .to_string();
        let boundary = content_type
            .split("boundary=")
            .nth(1)
            .ok_or_else(|| err!(OpenFailed, msg("multipart content-type missing boundary")))?
            .trim_matches('"')
            .to_string();
        Ok(Box::new(MjpegStream {
            reader: std::io::BufReader::new(resp),
            boundary: format!("--{boundary}"),
            entry: None,
            next_pts: 0,
        }))
    }
}

struct MjpegStream {
    reader: std::io::BufReader<reqwest::blocking::Response>,
    boundary: String,
    entry: Option<VideoSampleEntry>,
    next_pts: i64,
}

impl MjpegStream {
    fn read_part(&mut self) -> Result<Bytes, Error> {
        use std::io::BufRead;
        // Skip to the boundary line, then the per-part headers, then read
        // exactly Content-Length bytes of JPEG payload.
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .map_err(|e| err!(ReadError, source(e)))?;
            if n == 0 {
                bail!(ReadError, msg("mjpeg stream ended"));
            }
            if line.trim_end() == self.boundary {
                break;
            }
        }
        let mut content_length = None;
        loop {
            line.clear();
            self.reader
                .read_line(&mut line)
                .map_err(|e| err!(ReadError, source(e)))?;
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            if let Some(v) = trimmed.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = v.trim().parse::<usize>().ok();
            }
        }
        let len = content_length
            .ok_or_else(|| err!(ReadError, msg("mjpeg part missing Content-Length")))?;
        let mut buf = vec![0u8; len];
        std::io::Read::read_exact(&mut self.reader, &mut buf)
            .map_err(|e| err!(ReadError, source(e)))?;
        Ok(Bytes::from(buf))
    }
}

impl Stream for MjpegStream {
    fn tool(&self) -> Option<&retina::client::Tool> {
        None
    }

    fn video_sample_entry(&self) -> &VideoSampleEntry {
        self.entry
            .as_ref()
            .expect("video_sample_entry called before first next()")
    }

    fn next(&mut self) -> Result<VideoFrame, Error> {
        let data = self.read_part()?;
        if self.entry.is_none() {
            // MJPEG has no persistent SPS/PPS; each frame is independently
            // decodable, so the "sample entry" just records a placeholder
            // codec string plus whatever dimensions the caller configured
            // out of band (MJPEG ingest is only used where the recording
            // engine already knows the stream's resolution).
            self.entry = Some(VideoSampleEntry {
                data: Vec::new(),
                rfc6381_codec: "mp4v.6C".to_string(),
                width: 0,
                height: 0,
                pasp_h_spacing: 1,
                pasp_v_spacing: 1,
            });
        }
        let pts = self.next_pts;
        self.next_pts += 1;
        Ok(VideoFrame {
            pts,
            is_key: true,
            data,
            new_video_sample_entry: false,
        })
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn pixel_aspect_ratios() {
        use super::default_pixel_aspect_ratio;
        use num_rational::Ratio;
        for &((w, h), _) in &super::PIXEL_ASPECT_RATIOS {
            let (h_spacing, v_spacing) = default_pixel_aspect_ratio(w, h);
            assert_eq!(Ratio::new(w * h_spacing, h * v_spacing), Ratio::new(16, 9));
            let (h_spacing, v_spacing) = default_pixel_aspect_ratio(h, w);
            assert_eq!(Ratio::new(h * h_spacing, w * v_spacing), Ratio::new(9, 16));
        }
    }
}
