//! HTTP pull frame source.
//!
//! This module provides `HttpSource` for cameras that serve MJPEG multipart streams or
//! single JPEG images over HTTP.
//!
//! The HTTP source is responsible for:
//! - Authenticating with an HTTP Basic `Authorization` header
//! - Splitting multipart MJPEG bodies into JPEG frames
//! - Re-fetching single-image endpoints once per frame
//! - Decoding JPEG frames in-memory

use std::io::Read;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::FrameReader;
use crate::codec::decode_jpeg;
use crate::endpoint::Credentials;
use crate::error::{ReadError, TransportError};
use crate::frame::CapturedImage;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub url: String,
    pub credentials: Credentials,
    /// Connect and per-read timeout.
    pub timeout: Duration,
}

/// HTTP MJPEG/JPEG frame source.
pub struct HttpSource {
    config: HttpConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    /// Body fetched during `connect` for single-image endpoints.
    pending: Option<Vec<u8>>,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
    last_error: Option<String>,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl HttpSource {
    pub fn new(config: HttpConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.timeout)
            .timeout_read(config.timeout)
            .user_agent(concat!("camrelay/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            config,
            agent,
            stream: None,
            pending: None,
            connected_at: None,
            last_frame_at: None,
            frame_count: 0,
            last_error: None,
        }
    }

    /// Issue the initial request and classify the response body.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        let response = self
            .get()
            .map_err(|e| TransportError::Open(describe_ureq_error(&e)))?;
        let content_type = response
            .header("Content-Type")
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.contains("multipart") {
            let reader: Box<dyn Read + Send> = Box::new(response.into_reader());
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(reader)));
        } else if content_type.is_empty() || content_type.starts_with("image/") {
            let body = read_body(response).map_err(|e| TransportError::Open(e.to_string()))?;
            self.pending = Some(body);
            self.stream = Some(HttpStream::SingleJpeg);
        } else {
            return Err(TransportError::Open(format!(
                "unexpected content type '{content_type}'"
            )));
        }
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::debug!("HttpSource: connected to {}", self.config.url);
        Ok(())
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn get(&self) -> Result<ureq::Response, ureq::Error> {
        let request = self.agent.get(&self.config.url);
        match basic_auth_header(&self.config.credentials) {
            Some(value) => request.set("Authorization", &value).call(),
            None => request.call(),
        }
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>, ReadError> {
        if let Some(body) = self.pending.take() {
            return Ok(body);
        }
        match self.stream.as_mut() {
            Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg(),
            Some(HttpStream::SingleJpeg) => {
                let response = self
                    .get()
                    .map_err(|e| ReadError::Transport(describe_ureq_error(&e)))?;
                read_body(response).map_err(|e| ReadError::Transport(e.to_string()))
            }
            None => Err(ReadError::Transport(
                "http source not connected; call connect() first".to_string(),
            )),
        }
    }

    fn health_grace(&self) -> Duration {
        self.config.timeout.max(Duration::from_secs(2))
    }
}

impl FrameReader for HttpSource {
    fn next_frame(&mut self) -> Result<CapturedImage, ReadError> {
        let jpeg_bytes = match self.next_jpeg() {
            Ok(bytes) => bytes,
            Err(err) => {
                self.last_error = Some(err.to_string());
                return Err(err);
            }
        };
        if jpeg_bytes.is_empty() {
            return Err(ReadError::EmptyFrame);
        }
        let (pixels, width, height) = decode_jpeg(&jpeg_bytes).map_err(|e| ReadError::Decode(e.to_string()))?;
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
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= self.health_grace();
        };
        last_frame_at.elapsed() <= self.health_grace()
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>, ReadError> {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .map_err(|e| ReadError::Transport(format!("read mjpeg chunk: {e}")))?;
            if read == 0 {
                return Err(ReadError::Transport("mjpeg stream ended".to_string()));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn basic_auth_header(credentials: &Credentials) -> Option<String> {
    if credentials.is_empty() {
        return None;
    }
    let token = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password()));
    Some(format!("Basic {token}"))
}

fn describe_ureq_error(err: &ureq::Error) -> String {
    match err {
        ureq::Error::Status(code, _) => format!("http status {code}"),
        ureq::Error::Transport(transport) => transport.to_string(),
    }
}

fn read_body(response: ureq::Response) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
