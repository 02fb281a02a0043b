//! Frame ingestion transports.
//!
//! This module provides the transports a camera may answer on:
//! - HTTP pull (MJPEG multipart streams or discrete JPEG fetches)
//! - RTSP pull streams (feature: rtsp-gstreamer)
//! - Synthetic sources (host `stub`, demos and tests)
//!
//! A `Connector` opens one candidate and hands back a `FrameReader`. The reader is the
//! transport handle: dropping it releases the connection. `FrameSource` wraps a reader for
//! the supervisor.
//!
//! Transports MUST NOT:
//! - Embed credentials in URLs or logs
//! - Retain frames beyond handoff to the supervisor

pub mod http;
pub mod rtsp;
pub mod source;
pub mod synthetic;

use std::time::Duration;

use crate::candidates::{TransportCandidate, TransportScheme};
use crate::endpoint::Credentials;
use crate::error::{ReadError, TransportError};
use crate::frame::CapturedImage;

pub use http::{HttpConfig, HttpSource};
pub use rtsp::{RtspConfig, RtspSource};
pub use source::FrameSource;
pub use synthetic::{CandidateScript, SyntheticConnector};

/// An opened transport handle.
pub trait FrameReader: Send {
    /// Block until the next frame arrives or the transport fails.
    fn next_frame(&mut self) -> Result<CapturedImage, ReadError>;

    /// Transport-level health, checked after every read.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Opens transport candidates.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        candidate: &TransportCandidate,
        timeout: Duration,
    ) -> Result<Box<dyn FrameReader>, TransportError>;
}

/// Real network transports, dispatched on candidate scheme.
#[derive(Clone, Debug)]
pub struct NetworkConnector {
    credentials: Credentials,
}

impl NetworkConnector {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl Connector for NetworkConnector {
    fn open(
        &self,
        candidate: &TransportCandidate,
        timeout: Duration,
    ) -> Result<Box<dyn FrameReader>, TransportError> {
        match candidate.scheme {
            TransportScheme::HttpPull => {
                let config = HttpConfig {
                    url: candidate.url.clone(),
                    credentials: self.credentials.clone(),
                    timeout,
                };
                let mut source = HttpSource::new(config);
                source.connect()?;
                Ok(Box::new(source))
            }
            TransportScheme::PullStream => {
                let config = RtspConfig {
                    url: candidate.url.clone(),
                    credentials: self.credentials.clone(),
                    timeout,
                };
                let mut source = RtspSource::new(config)?;
                source.connect()?;
                Ok(Box::new(source))
            }
        }
    }
}
