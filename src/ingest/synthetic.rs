//! Synthetic transports for demos and tests.
//!
//! `SyntheticConnector` answers candidates from a per-URL script instead of the network:
//! refuse to open, open but yield an empty frame, hang, or stream generated test patterns
//! that may fail after a number of frames. Every `open` is recorded so callers can check
//! which candidates were attempted and in what order.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::{Connector, FrameReader};
use crate::candidates::{TransportCandidate, TransportScheme};
use crate::error::{ReadError, TransportError};
use crate::frame::CapturedImage;

/// Behaviour of one `open` of a candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CandidateScript {
    /// Opening fails with the given reason.
    Refuse(String),
    /// Opening succeeds but the first frame is empty.
    EmptyFrame,
    /// Opening blocks for the duration, then refuses.
    Hang(Duration),
    /// Opening succeeds and frames are generated.
    Stream(StreamScript),
}

impl CandidateScript {
    pub fn refuse(reason: &str) -> Self {
        CandidateScript::Refuse(reason.to_string())
    }

    pub fn stream() -> Self {
        CandidateScript::Stream(StreamScript::default())
    }

    /// Stream that fails with a transport error after `frames` good frames.
    pub fn stream_failing_after(frames: u64) -> Self {
        CandidateScript::Stream(StreamScript {
            frames_before_failure: Some(frames),
            ..StreamScript::default()
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamScript {
    pub width: u32,
    pub height: u32,
    /// Delay before each frame, standing in for the camera's frame rate.
    pub interval: Duration,
    /// Good frames before the transport errors out; `None` streams forever.
    pub frames_before_failure: Option<u64>,
    /// After this many good frames, yield `decode_error_count` decode errors.
    pub decode_errors_after: Option<u64>,
    pub decode_error_count: u64,
}

impl Default for StreamScript {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            interval: Duration::from_millis(5),
            frames_before_failure: None,
            decode_errors_after: None,
            decode_error_count: 0,
        }
    }
}

/// Scripted connector. Candidates without a script fall back to the per-scheme default.
#[derive(Debug, Default)]
pub struct SyntheticConnector {
    scripts: HashMap<String, Vec<CandidateScript>>,
    defaults: HashMap<TransportScheme, CandidateScript>,
    opens: Mutex<HashMap<String, usize>>,
    attempts: Mutex<Vec<String>>,
}

impl SyntheticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// RTSP refuses, HTTP streams a 640x480 pattern at ~30 fps.
    pub fn demo() -> Self {
        Self::new()
            .with_default(
                TransportScheme::PullStream,
                CandidateScript::refuse("connection refused"),
            )
            .with_default(
                TransportScheme::HttpPull,
                CandidateScript::Stream(StreamScript {
                    width: 640,
                    height: 480,
                    interval: Duration::from_millis(33),
                    ..StreamScript::default()
                }),
            )
    }

    /// Script successive opens of one URL; the last entry repeats.
    pub fn with_script(mut self, url: &str, scripts: Vec<CandidateScript>) -> Self {
        self.scripts.insert(url.to_string(), scripts);
        self
    }

    pub fn with_default(mut self, scheme: TransportScheme, script: CandidateScript) -> Self {
        self.defaults.insert(scheme, script);
        self
    }

    /// URLs passed to `open`, in call order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_script(&self, candidate: &TransportCandidate) -> CandidateScript {
        let mut opens = self.opens.lock().unwrap_or_else(PoisonError::into_inner);
        let count = opens.entry(candidate.url.clone()).or_insert(0);
        let index = *count;
        *count += 1;

        match self.scripts.get(&candidate.url) {
            Some(scripts) if !scripts.is_empty() => scripts[index.min(scripts.len() - 1)].clone(),
            _ => self
                .defaults
                .get(&candidate.scheme)
                .cloned()
                .unwrap_or_else(|| CandidateScript::refuse("no synthetic script")),
        }
    }
}

impl Connector for SyntheticConnector {
    fn open(
        &self,
        candidate: &TransportCandidate,
        _timeout: Duration,
    ) -> Result<Box<dyn FrameReader>, TransportError> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(candidate.url.clone());

        match self.next_script(candidate) {
            CandidateScript::Refuse(reason) => Err(TransportError::Open(reason)),
            CandidateScript::Hang(duration) => {
                thread::sleep(duration);
                Err(TransportError::Open("hung transport gave up".to_string()))
            }
            CandidateScript::EmptyFrame => Ok(Box::new(EmptyReader)),
            CandidateScript::Stream(script) => {
                log::debug!("SyntheticConnector: streaming {}", candidate.url);
                Ok(Box::new(SyntheticReader::new(script)))
            }
        }
    }
}

struct EmptyReader;

impl FrameReader for EmptyReader {
    fn next_frame(&mut self) -> Result<CapturedImage, ReadError> {
        Ok(CapturedImage::new(Vec::new(), 0, 0))
    }
}

struct SyntheticReader {
    script: StreamScript,
    frame_count: u64,
    decode_errors_emitted: u64,
    /// Simulated scene state, shifts every 50 frames.
    scene_state: u8,
}

impl SyntheticReader {
    fn new(script: StreamScript) -> Self {
        Self {
            script,
            frame_count: 0,
            decode_errors_emitted: 0,
            scene_state: 0,
        }
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let width = self.script.width as usize;
        let height = self.script.height as usize;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(37);
        }
        let shift = self.frame_count as usize;
        let mut pixels = vec![0u8; width * height * 3];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = i % width;
            let y = i / width;
            px[0] = ((x + shift) % 256) as u8;
            px[1] = ((y + shift / 2) % 256) as u8;
            px[2] = self.scene_state;
        }
        pixels
    }
}

impl FrameReader for SyntheticReader {
    fn next_frame(&mut self) -> Result<CapturedImage, ReadError> {
        if !self.script.interval.is_zero() {
            thread::sleep(self.script.interval);
        }
        if let Some(limit) = self.script.frames_before_failure {
            if self.frame_count >= limit {
                return Err(ReadError::Transport("synthetic stream dropped".to_string()));
            }
        }
        if let Some(after) = self.script.decode_errors_after {
            if self.frame_count >= after && self.decode_errors_emitted < self.script.decode_error_count {
                self.decode_errors_emitted += 1;
                return Err(ReadError::Decode("synthetic corrupt jpeg".to_string()));
            }
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(CapturedImage::new(pixels, self.script.width, self.script.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(url: &str) -> TransportCandidate {
        TransportCandidate::new(TransportScheme::HttpPull, "/x", url.to_string())
    }

    #[test]
    fn scripts_advance_per_open_and_repeat_last() {
        let connector = SyntheticConnector::new().with_script(
            "http://cam/a",
            vec![CandidateScript::refuse("first"), CandidateScript::stream()],
        );
        let c = candidate("http://cam/a");
        assert!(connector.open(&c, Duration::from_secs(1)).is_err());
        assert!(connector.open(&c, Duration::from_secs(1)).is_ok());
        assert!(connector.open(&c, Duration::from_secs(1)).is_ok());
        assert_eq!(connector.attempts().len(), 3);
    }

    #[test]
    fn stream_fails_after_configured_frames() {
        let connector = SyntheticConnector::new()
            .with_script("http://cam/a", vec![CandidateScript::stream_failing_after(2)]);
        let mut reader = connector
            .open(&candidate("http://cam/a"), Duration::from_secs(1))
            .unwrap();
        assert!(!reader.next_frame().unwrap().is_empty());
        assert!(!reader.next_frame().unwrap().is_empty());
        assert!(matches!(reader.next_frame(), Err(ReadError::Transport(_))));
    }

    #[test]
    fn unscripted_candidates_use_scheme_default() {
        let connector = SyntheticConnector::demo();
        let rtsp = TransportCandidate::new(
            TransportScheme::PullStream,
            "/stream1",
            "rtsp://cam/stream1".to_string(),
        );
        assert!(connector.open(&rtsp, Duration::from_secs(1)).is_err());
        let mut reader = connector
            .open(&candidate("http://cam/mjpeg"), Duration::from_secs(1))
            .unwrap();
        let frame = reader.next_frame().unwrap();
        assert_eq!((frame.width, frame.height), (640, 480));
    }
}
