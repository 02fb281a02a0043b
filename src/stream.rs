//! Multi-consumer MJPEG stream multiplexer.
//!
//! Every consumer gets its own `StreamSession` reading the camera's shared frame slot. A
//! session emits a frame only when the slot holds a newer sequence than the one it last
//! delivered, and never faster than the target frame rate. Once the camera has been without
//! live frames for longer than the grace period, the session emits the placeholder card at
//! a slow cadence instead, so consumers stay connected through outages.
//!
//! Chunks use the `multipart/x-mixed-replace` framing browsers understand for `<img>` streams.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;

use crate::codec::encode_rgb_image;
use crate::error::{CodecError, ConsumerWriteError};
use crate::frame::Frame;
use crate::overlay::{annotate_frame, placeholder};
use crate::supervisor::{CameraContext, ConnectionState};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub target_fps: u32,
    /// JPEG quality for stream chunks.
    pub quality: u8,
    /// How long the camera may be without live frames before placeholders are sent.
    pub grace: Duration,
    pub placeholder_interval: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            target_fps: 30,
            quality: 85,
            grace: Duration::from_secs(2),
            placeholder_interval: Duration::from_secs(1),
        }
    }
}

impl StreamSettings {
    /// Minimum spacing between frames, derived from the target rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps.max(1)))
    }
}

/// Frame one multipart part around an encoded JPEG.
pub fn encode_chunk(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut chunk = Vec::with_capacity(header.len() + jpeg.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

/// What a chunk carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Emission {
    Frame { sequence: u64 },
    Placeholder { state: ConnectionState },
}

#[derive(Clone, Debug)]
pub struct Chunk {
    pub emission: Emission,
    /// Complete multipart part, ready to write.
    pub bytes: Vec<u8>,
}

type Registry = Arc<Mutex<HashMap<u64, String>>>;

fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<u64, String>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serves any number of sessions from one camera context.
#[derive(Debug)]
pub struct StreamMultiplexer {
    context: Arc<CameraContext>,
    settings: StreamSettings,
    sessions: Registry,
    next_id: AtomicU64,
}

impl StreamMultiplexer {
    pub fn new(context: Arc<CameraContext>, settings: StreamSettings) -> Self {
        Self {
            context,
            settings,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn subscribe(&self, consumer: &str) -> StreamSession {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock_registry(&self.sessions).insert(id, consumer.to_string());
        log::info!("stream session {id} opened for {consumer}");
        StreamSession {
            id,
            consumer: consumer.to_string(),
            started_at: Instant::now(),
            last_sequence: 0,
            last_frame_at: None,
            last_placeholder_at: None,
            delivered: 0,
            context: Arc::clone(&self.context),
            settings: self.settings.clone(),
            registry: Arc::clone(&self.sessions),
        }
    }

    pub fn active_sessions(&self) -> usize {
        lock_registry(&self.sessions).len()
    }

    /// Stream chunks into `writer` until the consumer goes away or `cancelled` returns true.
    pub fn serve<W: Write>(
        &self,
        writer: &mut W,
        consumer: &str,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<(), ConsumerWriteError> {
        let mut session = self.subscribe(consumer);
        while let Some(chunk) = session.next_chunk(cancelled) {
            writer.write_all(&chunk.bytes)?;
            writer.flush()?;
        }
        Ok(())
    }
}

/// One consumer's subscription. Deregisters itself when dropped.
pub struct StreamSession {
    id: u64,
    consumer: String,
    started_at: Instant,
    last_sequence: u64,
    last_frame_at: Option<Instant>,
    last_placeholder_at: Option<Instant>,
    delivered: u64,
    context: Arc<CameraContext>,
    settings: StreamSettings,
    registry: Registry,
}

impl StreamSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Sequence of the last real frame delivered, 0 if none yet.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Block until the next chunk is due. Returns `None` once `cancelled` reports true.
    pub fn next_chunk(&mut self, cancelled: &dyn Fn() -> bool) -> Option<Chunk> {
        let frame_interval = self.settings.frame_interval();
        loop {
            if cancelled() {
                return None;
            }

            let outage = self
                .context
                .unhealthy_for()
                .filter(|unhealthy| *unhealthy >= self.settings.grace);
            if outage.is_some() {
                let due = self
                    .last_placeholder_at
                    .map_or(Duration::ZERO, |at| {
                        self.settings.placeholder_interval.saturating_sub(at.elapsed())
                    });
                if due.is_zero() {
                    if let Some(chunk) = self.placeholder_chunk() {
                        return Some(chunk);
                    }
                }
                thread::sleep(due.min(frame_interval).max(Duration::from_millis(1)));
                continue;
            }

            if let Some(at) = self.last_frame_at {
                let since = at.elapsed();
                if since < frame_interval {
                    thread::sleep(frame_interval - since);
                }
            }
            let Some(frame) = self
                .context
                .slot()
                .wait_newer(self.last_sequence, frame_interval)
            else {
                continue;
            };
            if let Some(chunk) = self.frame_chunk(&frame) {
                return Some(chunk);
            }
        }
    }

    fn frame_chunk(&mut self, frame: &Frame) -> Option<Chunk> {
        self.last_sequence = frame.sequence;
        let encoded = annotate_frame(frame)
            .ok_or(CodecError::BufferSize {
                len: frame.pixels().len(),
                width: frame.width,
                height: frame.height,
            })
            .and_then(|image| encode_rgb_image(&image, self.settings.quality));
        match encoded {
            Ok(jpeg) => {
                self.last_frame_at = Some(Instant::now());
                self.last_placeholder_at = None;
                self.delivered += 1;
                Some(Chunk {
                    emission: Emission::Frame {
                        sequence: frame.sequence,
                    },
                    bytes: encode_chunk(&jpeg),
                })
            }
            Err(err) => {
                log::warn!(
                    "stream session {}: skipping frame {}: {}",
                    self.id,
                    frame.sequence,
                    err
                );
                None
            }
        }
    }

    fn placeholder_chunk(&mut self) -> Option<Chunk> {
        let state = self.context.state();
        self.last_placeholder_at = Some(Instant::now());
        match encode_rgb_image(&placeholder(state, Local::now()), self.settings.quality) {
            Ok(jpeg) => {
                log::debug!("stream session {}: placeholder ({})", self.id, state);
                self.delivered += 1;
                Some(Chunk {
                    emission: Emission::Placeholder { state },
                    bytes: encode_chunk(&jpeg),
                })
            }
            Err(err) => {
                log::warn!("stream session {}: placeholder encode failed: {}", self.id, err);
                None
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        lock_registry(&self.registry).remove(&self.id);
        log::info!(
            "stream session {} closed for {} after {:?} ({} chunks)",
            self.id,
            self.consumer,
            self.started_at.elapsed(),
            self.delivered
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{CameraEndpoint, Credentials};
    use crate::frame::CapturedImage;

    fn context() -> Arc<CameraContext> {
        CameraContext::new(
            CameraEndpoint::new("cam", Credentials::default(), 80, 554, "test").unwrap(),
        )
    }

    fn fast_settings() -> StreamSettings {
        StreamSettings {
            target_fps: 200,
            quality: 70,
            grace: Duration::from_millis(50),
            placeholder_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn chunk_framing_is_multipart() {
        let chunk = encode_chunk(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(chunk.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }

    #[test]
    fn frame_interval_follows_target_fps() {
        let settings = StreamSettings::default();
        let interval = settings.frame_interval();
        assert!(interval > Duration::from_millis(33) && interval < Duration::from_millis(34));
    }

    #[test]
    fn fresh_camera_gets_placeholders_after_grace() {
        let context = context();
        let mux = StreamMultiplexer::new(Arc::clone(&context), fast_settings());
        let mut session = mux.subscribe("test");
        assert_eq!(mux.active_sessions(), 1);

        let started = Instant::now();
        let chunk = session.next_chunk(&|| false).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(
            chunk.emission,
            Emission::Placeholder {
                state: ConnectionState::Disconnected
            }
        );
        drop(session);
        assert_eq!(mux.active_sessions(), 0);
    }

    #[test]
    fn cancelled_session_returns_none() {
        let mux = StreamMultiplexer::new(context(), fast_settings());
        let mut session = mux.subscribe("test");
        assert!(session.next_chunk(&|| true).is_none());
    }

    #[test]
    fn frames_in_slot_are_delivered_once() {
        let context = context();
        let mux = StreamMultiplexer::new(
            Arc::clone(&context),
            StreamSettings {
                grace: Duration::from_secs(60),
                ..fast_settings()
            },
        );
        let mut session = mux.subscribe("test");
        context
            .slot()
            .publish(Frame::new(CapturedImage::new(vec![10; 16 * 16 * 3], 16, 16), 4));

        let chunk = session.next_chunk(&|| false).unwrap();
        assert_eq!(chunk.emission, Emission::Frame { sequence: 4 });
        assert_eq!(session.last_sequence(), 4);

        let deadline = Instant::now() + Duration::from_millis(100);
        let none = session.next_chunk(&|| Instant::now() > deadline);
        assert!(none.is_none(), "same sequence must not be delivered twice");
    }

    #[test]
    fn serve_stops_on_write_failure() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mux = StreamMultiplexer::new(context(), fast_settings());
        let err = mux.serve(&mut Broken, "broken", &|| false).unwrap_err();
        assert_eq!(err.0.kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(mux.active_sessions(), 0);
    }
}
