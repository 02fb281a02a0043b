//! Reconnect supervision for one camera.
//!
//! The supervisor thread is the only writer of the camera's connection state and frame slot,
//! and the only owner of the open `FrameSource`. It cycles:
//!
//! ```text
//! Disconnected -> Probing -> Connected <-> Degraded
//!                    ^           |
//!                    |           v
//!                    +------ Reconnecting
//! ```
//!
//! A failed probing pass stays in `Probing` and waits out the backoff delay. A dropped
//! connection goes through `Reconnecting`: the first drop reprobes immediately, further
//! consecutive drops wait out the backoff delay. A connection that stayed up for at least
//! `backoff.max` resets the drop count. Shutdown is observed at the next suspension point and
//! always ends in `Disconnected`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use rand::Rng;
use serde::Serialize;

use crate::candidates::{generate_candidates, TransportCandidate};
use crate::endpoint::CameraEndpoint;
use crate::error::{ConfigError, ReadError, SupervisorError};
use crate::frame::{CapturedImage, Frame, FrameSlot};
use crate::ingest::{Connector, FrameSource};
use crate::probe::{probe_cancellable, DEFAULT_PROBE_TIMEOUT};

const HISTORY_LIMIT: usize = 64;
const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Probing,
    Connected,
    /// Frames still arrive but keep failing to decode.
    Degraded,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Probing => "probing",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// Only `Connected` carries trustworthy live frames.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff with a cap and proportional jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay, e.g. 0.2 spreads delays by +/-20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        let spread = if jitter > 0.0 {
            rng.gen_range(-jitter..=jitter)
        } else {
            0.0
        };
        let secs = (base * (1.0 + spread)).clamp(0.0, self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub probe_timeout: Duration,
    /// Upper bound on waiting for one frame from a connected source.
    pub read_watchdog: Duration,
    pub backoff: BackoffPolicy,
    /// Consecutive failed probing passes before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Consecutive decode errors before `Connected` becomes `Degraded`.
    pub degraded_after: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            read_watchdog: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            max_retries: None,
            degraded_after: 3,
        }
    }
}

/// Interruptible stop flag.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    raised: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub fn raise(&self) {
        *self.lock() = true;
        self.wake.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.lock()
    }

    /// Sleep up to `timeout`; returns true if shutdown was raised.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.raised.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Frames observed over the last second.
#[derive(Debug, Default)]
struct FpsMeter {
    stamps: VecDeque<Instant>,
}

impl FpsMeter {
    fn record(&mut self, at: Instant) {
        self.stamps.push_back(at);
        self.trim(at);
    }

    fn fps(&mut self, now: Instant) -> f64 {
        self.trim(now);
        self.stamps.len() as f64 / FPS_WINDOW.as_secs_f64()
    }

    fn trim(&mut self, now: Instant) {
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) > FPS_WINDOW {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug)]
struct StatusInner {
    state: ConnectionState,
    state_since: Instant,
    /// Set while not `Connected`; the multiplexer's grace period counts from here.
    unhealthy_since: Option<Instant>,
    history: VecDeque<ConnectionState>,
    candidate: Option<TransportCandidate>,
    width: u32,
    height: u32,
    frames_total: u64,
    fps: FpsMeter,
    last_error: Option<String>,
    failed_passes: u32,
    reconnects: u64,
}

/// Point-in-time copy of a camera's supervision status.
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub state_for: Duration,
    pub unhealthy_for: Option<Duration>,
    pub candidate: Option<TransportCandidate>,
    pub width: u32,
    pub height: u32,
    pub frames_total: u64,
    pub fps: f64,
    pub last_error: Option<String>,
    pub failed_passes: u32,
    pub reconnects: u64,
    pub started_at: DateTime<Local>,
    pub uptime: Duration,
}

/// Everything that belongs to one camera: endpoint, frame slot, status and shutdown signal.
/// Passed explicitly to every component; there is no process-wide camera state.
#[derive(Debug)]
pub struct CameraContext {
    endpoint: CameraEndpoint,
    slot: FrameSlot,
    status: Mutex<StatusInner>,
    shutdown: ShutdownSignal,
    attached: AtomicBool,
    started: Instant,
    started_wall: DateTime<Local>,
}

impl CameraContext {
    pub fn new(endpoint: CameraEndpoint) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            endpoint,
            slot: FrameSlot::new(),
            status: Mutex::new(StatusInner {
                state: ConnectionState::Disconnected,
                state_since: now,
                unhealthy_since: Some(now),
                history: VecDeque::new(),
                candidate: None,
                width: 0,
                height: 0,
                frames_total: 0,
                fps: FpsMeter::default(),
                last_error: None,
                failed_passes: 0,
                reconnects: 0,
            }),
            shutdown: ShutdownSignal::default(),
            attached: AtomicBool::new(false),
            started: now,
            started_wall: Local::now(),
        })
    }

    pub fn endpoint(&self) -> &CameraEndpoint {
        &self.endpoint
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_status().state
    }

    /// How long the camera has been without live frames, `None` while `Connected`.
    pub fn unhealthy_for(&self) -> Option<Duration> {
        self.lock_status().unhealthy_since.map(|since| since.elapsed())
    }

    /// States entered so far, oldest first (bounded).
    pub fn history(&self) -> Vec<ConnectionState> {
        self.lock_status().history.iter().copied().collect()
    }

    pub fn status(&self) -> StatusSnapshot {
        let mut status = self.lock_status();
        let now = Instant::now();
        let fps = status.fps.fps(now);
        StatusSnapshot {
            state: status.state,
            state_for: now.duration_since(status.state_since),
            unhealthy_for: status.unhealthy_since.map(|since| now.duration_since(since)),
            candidate: status.candidate.clone(),
            width: status.width,
            height: status.height,
            frames_total: status.frames_total,
            fps,
            last_error: status.last_error.clone(),
            failed_passes: status.failed_passes,
            reconnects: status.reconnects,
            started_at: self.started_wall,
            uptime: now.duration_since(self.started),
        }
    }

    fn transition(&self, next: ConnectionState) {
        let mut status = self.lock_status();
        let previous = status.state;
        if previous == next {
            return;
        }
        let now = Instant::now();
        status.state = next;
        status.state_since = now;
        if next.is_live() {
            status.unhealthy_since = None;
        } else if status.unhealthy_since.is_none() {
            status.unhealthy_since = Some(now);
        }
        if status.history.len() == HISTORY_LIMIT {
            status.history.pop_front();
        }
        status.history.push_back(next);
        drop(status);
        log::info!("camera {}: {} -> {}", self.endpoint.host(), previous, next);
    }

    fn record_connected(&self, candidate: &TransportCandidate) {
        let mut status = self.lock_status();
        status.candidate = Some(candidate.clone());
        status.failed_passes = 0;
        status.last_error = None;
    }

    fn record_frame(&self, frame: &Frame) {
        let mut status = self.lock_status();
        status.frames_total += 1;
        status.width = frame.width;
        status.height = frame.height;
        status.fps.record(frame.captured_at);
    }

    fn record_error(&self, error: String) {
        self.lock_status().last_error = Some(error);
    }

    fn record_failed_pass(&self, error: String) -> u32 {
        let mut status = self.lock_status();
        status.failed_passes += 1;
        status.last_error = Some(error);
        status.failed_passes
    }

    fn record_reconnect(&self) {
        self.lock_status().reconnects += 1;
    }

    fn lock_status(&self) -> MutexGuard<'_, StatusInner> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns reconnection policy and the frame production loop for one camera.
pub struct ReconnectSupervisor {
    context: Arc<CameraContext>,
    connector: Arc<dyn Connector>,
    candidates: Vec<TransportCandidate>,
    settings: SupervisorSettings,
}

enum StreamEnd {
    Shutdown,
    Failed(ReadError),
}

impl ReconnectSupervisor {
    pub fn new(
        context: Arc<CameraContext>,
        connector: Arc<dyn Connector>,
        settings: SupervisorSettings,
    ) -> Result<Self, ConfigError> {
        let candidates = generate_candidates(context.endpoint())?;
        Ok(Self {
            context,
            connector,
            candidates,
            settings,
        })
    }

    pub fn candidates(&self) -> &[TransportCandidate] {
        &self.candidates
    }

    /// Start the supervisor thread. Fails if the camera already has a supervisor.
    pub fn spawn(self) -> Result<SupervisorHandle, SupervisorError> {
        let context = Arc::clone(&self.context);
        if context.attached.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyAttached(
                context.endpoint().host().to_string(),
            ));
        }
        let spawned = thread::Builder::new()
            .name(format!("supervisor-{}", context.endpoint().host()))
            .spawn(move || self.run());
        let join = match spawned {
            Ok(join) => join,
            Err(err) => {
                context.attached.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };
        Ok(SupervisorHandle {
            context,
            join: Some(join),
        })
    }

    fn run(self) {
        let context = Arc::clone(&self.context);
        let mut sequence = context.slot().latest_sequence();
        let mut drops = 0u32;
        log::info!(
            "camera {} ({}): supervising {} candidates",
            context.endpoint().host(),
            context.endpoint().model(),
            self.candidates.len()
        );

        while !context.shutdown().is_raised() {
            context.transition(ConnectionState::Probing);
            let cancelled = || context.shutdown().is_raised();
            let outcome = probe_cancellable(
                &self.connector,
                &self.candidates,
                self.settings.probe_timeout,
                &cancelled,
            );
            match outcome {
                Ok(success) => {
                    context.record_connected(&success.candidate);
                    sequence += 1;
                    self.publish(success.first_image, sequence);
                    context.transition(ConnectionState::Connected);

                    let connected_at = Instant::now();
                    let mut source = FrameSource::start(&success.candidate.url, success.reader);
                    let end = self.stream_frames(&mut source, &mut sequence);
                    source.close();
                    match end {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Failed(err) => {
                            log::warn!(
                                "camera {}: lost {} ({})",
                                context.endpoint().host(),
                                success.candidate.url,
                                err
                            );
                            context.record_error(err.to_string());
                            context.record_reconnect();
                            context.transition(ConnectionState::Reconnecting);

                            if connected_at.elapsed() >= self.settings.backoff.max {
                                drops = 0;
                            }
                            drops += 1;
                            if drops > 1 {
                                let delay = self.settings.backoff.delay(drops - 2);
                                log::debug!(
                                    "camera {}: drop {} in a row, reprobing in {:?}",
                                    context.endpoint().host(),
                                    drops,
                                    delay
                                );
                                if context.shutdown().wait(delay) {
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    if context.shutdown().is_raised() {
                        break;
                    }
                    let failed = context.record_failed_pass(err.summary());
                    log::warn!(
                        "camera {}: probing pass {} failed: {}",
                        context.endpoint().host(),
                        failed,
                        err
                    );
                    log::debug!("{}", err.summary());
                    if let Some(max) = self.settings.max_retries {
                        if failed >= max {
                            log::error!(
                                "camera {}: giving up after {} failed probing passes",
                                context.endpoint().host(),
                                failed
                            );
                            break;
                        }
                    }
                    let delay = self.settings.backoff.delay(failed - 1);
                    log::debug!("camera {}: next probe in {:?}", context.endpoint().host(), delay);
                    if context.shutdown().wait(delay) {
                        break;
                    }
                }
            }
        }

        context.transition(ConnectionState::Disconnected);
    }

    fn stream_frames(&self, source: &mut FrameSource, sequence: &mut u64) -> StreamEnd {
        let context = &self.context;
        let mut decode_errors = 0u32;
        loop {
            if context.shutdown().is_raised() {
                return StreamEnd::Shutdown;
            }
            match source.next_frame(self.settings.read_watchdog) {
                Ok(image) if image.is_empty() => return StreamEnd::Failed(ReadError::EmptyFrame),
                Ok(image) => {
                    *sequence += 1;
                    self.publish(image, *sequence);
                    if decode_errors > 0 {
                        decode_errors = 0;
                        if context.state() == ConnectionState::Degraded {
                            context.transition(ConnectionState::Connected);
                        }
                    }
                }
                Err(err) if err.is_decode() => {
                    decode_errors += 1;
                    log::debug!("camera {}: {}", context.endpoint().host(), err);
                    if decode_errors == self.settings.degraded_after.max(1) {
                        context.record_error(err.to_string());
                        context.transition(ConnectionState::Degraded);
                    }
                }
                Err(err) => return StreamEnd::Failed(err),
            }
        }
    }

    fn publish(&self, image: CapturedImage, sequence: u64) {
        let frame = self.context.slot().publish(Frame::new(image, sequence));
        self.context.record_frame(&frame);
    }
}

/// Handle to a running supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    context: Arc<CameraContext>,
    join: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn context(&self) -> &Arc<CameraContext> {
        &self.context
    }

    /// True once the supervisor thread has exited (shutdown or retries exhausted).
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Raise shutdown and wait for the supervisor to release its handle.
    pub fn stop(mut self) -> Result<()> {
        self.context.shutdown().raise();
        self.join_thread()
    }

    /// Wait for the supervisor to exit on its own.
    pub fn join(mut self) -> Result<()> {
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("supervisor thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.context.shutdown().raise();
        }
    }
}
