//! RTSP pull-stream frame source.
//!
//! This module provides `RtspSource` for cameras that serve RTSP. Decoding goes through
//! GStreamer (`rtspsrc ! decodebin ! videoconvert ! appsink`) behind the `rtsp-gstreamer`
//! feature. Credentials are handed to `rtspsrc` through its `user-id`/`user-pw`
//! properties, never through the URL.
//!
//! Without the feature every RTSP candidate fails to open with an explicit reason, so the
//! probe moves on to the HTTP candidates.

use std::time::Duration;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::Instant;

use super::FrameReader;
use crate::endpoint::Credentials;
use crate::error::{ReadError, TransportError};
use crate::frame::CapturedImage;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.108:554/cam/realmonitor?channel=1&subtype=0")
    pub url: String,
    pub credentials: Credentials,
    /// Upper bound on waiting for a decoded sample.
    pub timeout: Duration,
}

/// RTSP frame source.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self, TransportError> {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(Self {
                backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
            })
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(TransportError::Unsupported(format!(
                "{} requires the rtsp-gstreamer feature",
                config.url
            )))
        }
    }

    /// Start the pipeline.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        match &mut self.backend {
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
            #[cfg(not(feature = "rtsp-gstreamer"))]
            _ => unreachable!("RtspSource cannot be constructed without a backend"),
        }
    }
}

impl FrameReader for RtspSource {
    fn next_frame(&mut self) -> Result<CapturedImage, ReadError> {
        match &mut self.backend {
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
            #[cfg(not(feature = "rtsp-gstreamer"))]
            _ => Err(ReadError::Closed),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_healthy(),
            #[cfg(not(feature = "rtsp-gstreamer"))]
            _ => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Result<Self, TransportError> {
        use gstreamer::prelude::*;

        let open = |e: String| TransportError::Open(e);
        gstreamer::init().map_err(|e| open(format!("initialize gstreamer: {e}")))?;

        let pipeline_description = format!(
            "rtspsrc name=src location=\"{}\" latency=0 protocols=tcp ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .map_err(|e| open(format!("build RTSP pipeline: {e}")))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| open("RTSP pipeline is not a Pipeline".to_string()))?;

        if !config.credentials.is_empty() {
            let src = pipeline
                .by_name("src")
                .ok_or_else(|| open("rtspsrc element missing from pipeline".to_string()))?;
            src.set_property("user-id", config.credentials.username.as_str());
            src.set_property("user-pw", config.credentials.password());
        }

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| open("appsink element missing from pipeline".to_string()))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| open("appsink element has unexpected type".to_string()))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        use gstreamer::prelude::*;

        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| TransportError::Open(format!("set RTSP pipeline to Playing: {e}")))?;
        self.connected_at = Some(Instant::now());
        log::debug!("RtspSource: pipeline playing for {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CapturedImage, ReadError> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(ReadError::Transport(err.clone()));
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.config.timeout.as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or(ReadError::Stalled(self.config.timeout))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(CapturedImage::new(pixels, width, height))
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let grace = self.config.timeout.max(Duration::from_secs(2));
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= grace;
        };
        last_frame_at.elapsed() <= grace
    }

    fn poll_bus(&mut self) {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        use gstreamer::prelude::*;

        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32), ReadError> {
    let decode = |msg: String| ReadError::Decode(msg);
    let buffer = sample
        .buffer()
        .ok_or_else(|| decode("RTSP sample missing buffer".to_string()))?;
    let caps = sample
        .caps()
        .ok_or_else(|| decode("RTSP sample missing caps".to_string()))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|e| decode(format!("parse RTSP caps as video info: {e}")))?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer
        .map_readable()
        .map_err(|e| decode(format!("map RTSP buffer: {e}")))?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| decode("RTSP buffer row is out of bounds".to_string()))?,
        );
    }

    Ok((pixels, width, height))
}
