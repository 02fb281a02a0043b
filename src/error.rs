//! Error taxonomy for the relay core.
//!
//! Transport failures are recovered inside the supervisor and never reach stream consumers.
//! Only configuration errors are fatal; snapshot and info callers get structured failures.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::candidates::TransportCandidate;

/// Malformed endpoint or relay configuration. Fatal at construction, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("camera host must not be empty")]
    EmptyHost,

    #[error("camera host '{0}' is not a bare hostname or address")]
    InvalidHost(String),

    #[error("{field} must be non-zero")]
    ZeroPort { field: &'static str },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why opening a transport failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("open failed: {0}")]
    Open(String),

    #[error("unsupported transport: {0}")]
    Unsupported(String),
}

/// A previously opened source stopped yielding usable frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("transport read failed: {0}")]
    Transport(String),

    /// Bytes arrived but did not decode into an image.
    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("transport returned an empty frame")]
    EmptyFrame,

    #[error("source reported unhealthy")]
    Unhealthy,

    #[error("no frame within {0:?}")]
    Stalled(Duration),

    #[error("frame source closed")]
    Closed,
}

impl ReadError {
    /// Decode errors keep the handle open; everything else tears the source down.
    pub fn is_decode(&self) -> bool {
        matches!(self, ReadError::Decode(_))
    }
}

/// Reason a single candidate was rejected during one probing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailureReason {
    Open(TransportError),
    Read(ReadError),
    EmptyFrame,
    TimedOut(Duration),
}

impl fmt::Display for ProbeFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailureReason::Open(err) => write!(f, "{err}"),
            ProbeFailureReason::Read(err) => write!(f, "{err}"),
            ProbeFailureReason::EmptyFrame => write!(f, "opened but first frame was empty"),
            ProbeFailureReason::TimedOut(timeout) => write!(f, "timed out after {timeout:?}"),
        }
    }
}

/// One candidate that failed to open or yield a frame. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateProbeFailure {
    pub candidate: TransportCandidate,
    pub reason: ProbeFailureReason,
}

impl fmt::Display for CandidateProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.candidate.url, self.candidate.scheme, self.reason)
    }
}

/// Every candidate in one probing pass failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no working candidate among {} attempted", attempts.len())]
pub struct NoWorkingCandidate {
    pub attempts: Vec<CandidateProbeFailure>,
}

impl NoWorkingCandidate {
    /// Multi-line summary for logs and `/info`.
    pub fn summary(&self) -> String {
        let mut out = self.to_string();
        for attempt in &self.attempts {
            out.push_str("\n  ");
            out.push_str(&attempt.to_string());
        }
        out
    }
}

/// JPEG encode or decode failure.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("jpeg decode failed: {0}")]
    Decode(#[source] image::ImageError),

    #[error("pixel buffer of {len} bytes does not match {width}x{height} rgb")]
    BufferSize { len: usize, width: u32, height: u32 },

    #[error("jpeg encode failed: {0}")]
    Encode(#[source] image::ImageError),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no frame has been captured yet")]
    NoFrameAvailable,

    #[error("snapshot quality {0} is outside 1..=100")]
    InvalidQuality(u8),

    #[error(transparent)]
    Encode(#[from] CodecError),

    #[error("snapshot write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A stream consumer went away. Ends that session only.
#[derive(Debug, Error)]
#[error("stream consumer disconnected: {0}")]
pub struct ConsumerWriteError(#[from] pub std::io::Error);

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The camera context already has a running supervisor.
    #[error("a supervisor is already attached to camera {0}")]
    AlreadyAttached(String),

    #[error("failed to spawn supervisor thread: {0}")]
    Spawn(#[from] std::io::Error),
}
