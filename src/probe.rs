//! One-shot connection probe.
//!
//! Walks the candidate list in order. A candidate is accepted only when it opens and then
//! yields one non-empty frame within the per-attempt timeout. Rejected handles are released
//! before the next candidate is tried. Each attempt runs on a worker thread so a transport
//! that hangs inside `open` or `read` cannot stall the pass; an abandoned worker drops its
//! handle as soon as the transport call returns.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::candidates::TransportCandidate;
use crate::error::{
    CandidateProbeFailure, NoWorkingCandidate, ProbeFailureReason, ReadError, TransportError,
};
use crate::frame::CapturedImage;
use crate::ingest::{Connector, FrameReader};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// The accepted candidate together with its opened handle and the frame that proved it.
pub struct ProbeSuccess {
    pub candidate: TransportCandidate,
    pub reader: Box<dyn FrameReader>,
    pub first_image: CapturedImage,
    /// Candidates rejected earlier in the same pass.
    pub rejected: Vec<CandidateProbeFailure>,
}

impl std::fmt::Debug for ProbeSuccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSuccess")
            .field("candidate", &self.candidate)
            .field("width", &self.first_image.width)
            .field("height", &self.first_image.height)
            .field("rejected", &self.rejected.len())
            .finish()
    }
}

type AttemptResult = Result<(Box<dyn FrameReader>, CapturedImage), ProbeFailureReason>;

/// Run one probing pass.
pub fn probe(
    connector: &Arc<dyn Connector>,
    candidates: &[TransportCandidate],
    timeout: Duration,
) -> Result<ProbeSuccess, NoWorkingCandidate> {
    probe_cancellable(connector, candidates, timeout, &|| false)
}

/// Like [`probe`], but stops before the next candidate once `cancelled` returns true.
pub fn probe_cancellable(
    connector: &Arc<dyn Connector>,
    candidates: &[TransportCandidate],
    timeout: Duration,
    cancelled: &dyn Fn() -> bool,
) -> Result<ProbeSuccess, NoWorkingCandidate> {
    let mut rejected = Vec::new();
    for candidate in candidates {
        if cancelled() {
            log::debug!("probe: pass cancelled after {} attempts", rejected.len());
            break;
        }
        let started = Instant::now();
        match attempt(connector, candidate, timeout) {
            Ok((reader, first_image)) => {
                log::info!(
                    "probe: accepted {} ({}) {}x{} after {:?}",
                    candidate.url,
                    candidate.scheme,
                    first_image.width,
                    first_image.height,
                    started.elapsed()
                );
                return Ok(ProbeSuccess {
                    candidate: candidate.clone(),
                    reader,
                    first_image,
                    rejected,
                });
            }
            Err(reason) => {
                log::debug!("probe: rejected {} ({}): {}", candidate.url, candidate.scheme, reason);
                rejected.push(CandidateProbeFailure {
                    candidate: candidate.clone(),
                    reason,
                });
            }
        }
    }
    Err(NoWorkingCandidate { attempts: rejected })
}

fn attempt(
    connector: &Arc<dyn Connector>,
    candidate: &TransportCandidate,
    timeout: Duration,
) -> AttemptResult {
    let (tx, rx) = mpsc::channel::<AttemptResult>();
    let worker_connector = Arc::clone(connector);
    let worker_candidate = candidate.clone();
    thread::Builder::new()
        .name("probe-attempt".to_string())
        .spawn(move || {
            let result = open_and_read(worker_connector.as_ref(), &worker_candidate, timeout);
            if let Err(mpsc::SendError(Ok((reader, _)))) = tx.send(result) {
                log::debug!(
                    "probe: releasing late handle for {}",
                    worker_candidate.url
                );
                drop(reader);
            }
        })
        .map_err(|err| {
            ProbeFailureReason::Open(TransportError::Open(format!("spawn probe worker: {err}")))
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ProbeFailureReason::TimedOut(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ProbeFailureReason::Read(ReadError::Closed)),
    }
}

fn open_and_read(
    connector: &dyn Connector,
    candidate: &TransportCandidate,
    timeout: Duration,
) -> AttemptResult {
    let mut reader = connector
        .open(candidate, timeout)
        .map_err(ProbeFailureReason::Open)?;
    let image = reader.next_frame().map_err(ProbeFailureReason::Read)?;
    if image.is_empty() {
        return Err(ProbeFailureReason::EmptyFrame);
    }
    Ok((reader, image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::TransportScheme;
    use crate::ingest::{CandidateScript, SyntheticConnector};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn candidates(n: usize) -> Vec<TransportCandidate> {
        (1..=n)
            .map(|i| {
                TransportCandidate::new(
                    TransportScheme::HttpPull,
                    "/c",
                    format!("http://cam/c{i}"),
                )
            })
            .collect()
    }

    fn run(
        connector: &Arc<SyntheticConnector>,
        list: &[TransportCandidate],
    ) -> Result<ProbeSuccess, NoWorkingCandidate> {
        let dyn_connector: Arc<dyn Connector> = connector.clone();
        probe(&dyn_connector, list, Duration::from_secs(2))
    }

    #[test]
    fn selects_third_candidate_and_never_tries_fourth() {
        let list = candidates(4);
        let connector = Arc::new(
            SyntheticConnector::new()
                .with_script(&list[0].url, vec![CandidateScript::refuse("refused")])
                .with_script(&list[1].url, vec![CandidateScript::refuse("refused")])
                .with_script(&list[2].url, vec![CandidateScript::stream()])
                .with_script(&list[3].url, vec![CandidateScript::stream()]),
        );

        let success = run(&connector, &list).unwrap();
        assert_eq!(success.candidate, list[2]);
        assert!(!success.first_image.is_empty());
        assert_eq!(success.rejected.len(), 2);
        assert_eq!(
            connector.attempts(),
            vec![list[0].url.clone(), list[1].url.clone(), list[2].url.clone()]
        );
    }

    #[test]
    fn all_failing_enumerates_every_attempt() {
        let list = candidates(3);
        let connector = Arc::new(
            SyntheticConnector::new()
                .with_script(&list[0].url, vec![CandidateScript::refuse("refused")])
                .with_script(&list[1].url, vec![CandidateScript::EmptyFrame])
                .with_script(&list[2].url, vec![CandidateScript::stream_failing_after(0)]),
        );

        let err = run(&connector, &list).unwrap_err();
        let attempted: Vec<_> = err.attempts.iter().map(|a| a.candidate.clone()).collect();
        assert_eq!(attempted, list);
        assert_eq!(
            err.attempts[0].reason,
            ProbeFailureReason::Open(TransportError::Open("refused".into()))
        );
        assert_eq!(err.attempts[1].reason, ProbeFailureReason::EmptyFrame);
        assert!(matches!(err.attempts[2].reason, ProbeFailureReason::Read(_)));
        assert!(err.summary().contains("http://cam/c2"));
    }

    #[test]
    fn hung_candidate_is_abandoned_after_timeout() {
        let list = candidates(2);
        let connector = Arc::new(
            SyntheticConnector::new()
                .with_script(&list[0].url, vec![CandidateScript::Hang(Duration::from_secs(3))])
                .with_script(&list[1].url, vec![CandidateScript::stream()]),
        );
        let dyn_connector: Arc<dyn Connector> = connector.clone();

        let started = Instant::now();
        let success = probe(&dyn_connector, &list, Duration::from_millis(100)).unwrap();
        assert_eq!(success.candidate, list[1]);
        assert_eq!(
            success.rejected[0].reason,
            ProbeFailureReason::TimedOut(Duration::from_millis(100))
        );
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    struct Counted {
        first: Result<CapturedImage, ReadError>,
        dropped: Arc<AtomicUsize>,
    }

    impl FrameReader for Counted {
        fn next_frame(&mut self) -> Result<CapturedImage, ReadError> {
            std::mem::replace(&mut self.first, Err(ReadError::Closed))
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Opens readers whose first read fails, is empty, then succeeds, in candidate order.
    /// Records how many earlier readers were already dropped at each open.
    struct ReleaseTracking {
        dropped: Arc<AtomicUsize>,
        dropped_at_open: Mutex<Vec<usize>>,
    }

    impl Connector for ReleaseTracking {
        fn open(
            &self,
            _candidate: &TransportCandidate,
            _timeout: Duration,
        ) -> Result<Box<dyn FrameReader>, TransportError> {
            let mut seen = self.dropped_at_open.lock().unwrap();
            let first = match seen.len() {
                0 => Err(ReadError::Transport("reset by peer".into())),
                1 => Ok(CapturedImage::new(Vec::new(), 0, 0)),
                _ => Ok(CapturedImage::new(vec![7; 4 * 4 * 3], 4, 4)),
            };
            seen.push(self.dropped.load(Ordering::SeqCst));
            Ok(Box::new(Counted {
                first,
                dropped: Arc::clone(&self.dropped),
            }))
        }
    }

    #[test]
    fn rejected_handles_are_released_before_next_candidate() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let tracking = Arc::new(ReleaseTracking {
            dropped: Arc::clone(&dropped),
            dropped_at_open: Mutex::new(Vec::new()),
        });
        let connector: Arc<dyn Connector> = tracking.clone();
        let list = candidates(3);

        let success = probe(&connector, &list, Duration::from_secs(2)).unwrap();
        assert_eq!(success.candidate, list[2]);
        assert_eq!(success.rejected.len(), 2);
        assert_eq!(success.rejected[1].reason, ProbeFailureReason::EmptyFrame);
        assert_eq!(*tracking.dropped_at_open.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);

        drop(success);
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn empty_candidate_list_is_no_working_candidate() {
        let connector = Arc::new(SyntheticConnector::new());
        let err = run(&connector, &[]).unwrap_err();
        assert!(err.attempts.is_empty());
    }
}
