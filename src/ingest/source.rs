//! FrameSource: one opened transport handle, read on its own pump thread.
//!
//! Transports may block inside a read for longer than they should. The pump thread owns the
//! reader and hands results over a one-slot channel, so the supervisor can bound every wait
//! with a watchdog and abandon a hung reader. The reader (and its connection) is dropped when
//! the pump exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::FrameReader;
use crate::error::ReadError;
use crate::frame::CapturedImage;

type ReadResult = Result<CapturedImage, ReadError>;

pub struct FrameSource {
    label: String,
    receiver: Option<Receiver<ReadResult>>,
    stop: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
}

impl FrameSource {
    /// Take ownership of an opened reader and start pumping frames from it.
    pub fn start(label: &str, reader: Box<dyn FrameReader>) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        let stop = Arc::new(AtomicBool::new(false));
        let healthy = Arc::new(AtomicBool::new(true));

        let pump_stop = Arc::clone(&stop);
        let pump_healthy = Arc::clone(&healthy);
        let pump_label = label.to_string();
        let spawned = thread::Builder::new()
            .name("frame-pump".to_string())
            .spawn(move || pump(reader, tx, pump_stop, pump_healthy, &pump_label));
        if let Err(err) = spawned {
            log::error!("FrameSource: failed to spawn pump for {label}: {err}");
            healthy.store(false, Ordering::SeqCst);
        }

        Self {
            label: label.to_string(),
            receiver: Some(rx),
            stop,
            healthy,
        }
    }

    /// Block until the next frame, a read failure, or the watchdog expires.
    pub fn next_frame(&mut self, watchdog: Duration) -> ReadResult {
        let Some(receiver) = self.receiver.as_ref() else {
            return Err(ReadError::Closed);
        };
        match receiver.recv_timeout(watchdog) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.healthy.store(false, Ordering::SeqCst);
                Err(ReadError::Stalled(watchdog))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.healthy.store(false, Ordering::SeqCst);
                Err(ReadError::Closed)
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.receiver.is_some() && self.healthy.load(Ordering::SeqCst)
    }

    /// Release the handle. A pump blocked in a read exits once that read returns.
    pub fn close(&mut self) {
        if self.receiver.take().is_some() {
            self.stop.store(true, Ordering::SeqCst);
            self.healthy.store(false, Ordering::SeqCst);
            log::debug!("FrameSource: closed {}", self.label);
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn pump(
    mut reader: Box<dyn FrameReader>,
    tx: SyncSender<ReadResult>,
    stop: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
    label: &str,
) {
    while !stop.load(Ordering::SeqCst) {
        let result = reader.next_frame();
        let result = match result {
            Ok(_) if !reader.is_healthy() => Err(ReadError::Unhealthy),
            other => other,
        };
        let keep_going = match &result {
            Ok(_) => true,
            Err(err) => err.is_decode(),
        };
        if !keep_going {
            healthy.store(false, Ordering::SeqCst);
        }
        if tx.send(result).is_err() || !keep_going {
            break;
        }
    }
    // Release the connection before the channel reports disconnection.
    drop(reader);
    drop(tx);
    log::debug!("FrameSource: pump for {label} exited");
}
