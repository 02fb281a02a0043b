//! Frames and the shared latest-frame slot.
//!
//! - `CapturedImage`: decoded RGB pixels straight from a transport, not yet sequenced.
//! - `Frame`: immutable, sequenced capture. Shared read-only behind `Arc`.
//! - `FrameSlot`: single-value, latest-wins holder. One writer (the supervisor), any number
//!   of readers. Readers clone the `Arc` and release the lock before encoding or I/O.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

/// RGB8 pixels as handed over by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl CapturedImage {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            pixels,
            width,
            height,
        }
    }

    /// True when there is nothing to show: zero dimensions or a short buffer.
    pub fn is_empty(&self) -> bool {
        let expected = (self.width as usize) * (self.height as usize) * 3;
        expected == 0 || self.pixels.len() < expected
    }
}

/// A sequenced capture.
#[derive(Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture instant (ages, rate computation).
    pub captured_at: Instant,
    /// Wall-clock capture time (overlay, filenames).
    pub captured_wall: DateTime<Local>,
    /// Strictly increasing for the lifetime of a supervisor.
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: CapturedImage, sequence: u64) -> Self {
        Self {
            pixels: image.pixels,
            width: image.width,
            height: image.height,
            captured_at: Instant::now(),
            captured_wall: Local::now(),
            sequence,
        }
    }

    /// RGB8 pixel data, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

/// Latest-wins frame holder.
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Arc<Frame>>>,
    updated: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame and wake waiting readers. Supervisor only.
    pub(crate) fn publish(&self, frame: Frame) -> Arc<Frame> {
        let frame = Arc::new(frame);
        {
            let mut latest = self.lock();
            if let Some(current) = latest.as_ref() {
                debug_assert!(frame.sequence > current.sequence);
            }
            *latest = Some(Arc::clone(&frame));
        }
        self.updated.notify_all();
        frame
    }

    /// Snapshot of the current value, if any frame was ever published.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.lock().clone()
    }

    /// Sequence of the current frame, 0 when empty.
    pub fn latest_sequence(&self) -> u64 {
        self.lock().as_ref().map_or(0, |frame| frame.sequence)
    }

    /// Wait up to `timeout` for a frame with a sequence greater than `after`.
    pub fn wait_newer(&self, after: u64, timeout: Duration) -> Option<Arc<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut latest = self.lock();
        loop {
            if let Some(frame) = latest.as_ref() {
                if frame.sequence > after {
                    return Some(Arc::clone(frame));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .updated
                .wait_timeout(latest, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            latest = guard;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Frame>>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn image(value: u8) -> CapturedImage {
        CapturedImage::new(vec![value; 4 * 4 * 3], 4, 4)
    }

    #[test]
    fn empty_images_are_detected() {
        assert!(CapturedImage::new(Vec::new(), 0, 0).is_empty());
        assert!(CapturedImage::new(vec![0; 10], 4, 4).is_empty());
        assert!(!image(1).is_empty());
    }

    #[test]
    fn slot_keeps_only_latest_frame() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());
        assert_eq!(slot.latest_sequence(), 0);

        slot.publish(Frame::new(image(1), 1));
        slot.publish(Frame::new(image(2), 2));

        let latest = slot.latest().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.pixels()[0], 2);
        assert_eq!(slot.latest_sequence(), 2);
    }

    #[test]
    fn wait_newer_times_out_without_update() {
        let slot = FrameSlot::new();
        slot.publish(Frame::new(image(1), 1));
        let started = Instant::now();
        assert!(slot.wait_newer(1, Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_newer_wakes_on_publish() {
        let slot = Arc::new(FrameSlot::new());
        let writer = Arc::clone(&slot);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.publish(Frame::new(image(7), 7));
        });
        let frame = slot.wait_newer(0, Duration::from_secs(5)).unwrap();
        assert_eq!(frame.sequence, 7);
        handle.join().unwrap();
    }

    #[test]
    fn readers_keep_their_frame_after_overwrite() {
        let slot = FrameSlot::new();
        slot.publish(Frame::new(image(1), 1));
        let held = slot.latest().unwrap();
        slot.publish(Frame::new(image(2), 2));
        assert_eq!(held.sequence, 1);
        assert_eq!(held.pixels()[0], 1);
    }
}
