//! camrelay: camera transport discovery and stream relay
//!
//! This crate finds a working media transport on a network camera whose stream URL is not
//! documented, keeps a live frame feed from it through failures, and re-serves that feed to
//! any number of consumers as one multipart MJPEG stream.
//!
//! # Architecture
//!
//! ```text
//! config -> candidates -> probe (one pass) -> supervisor (loop, owns FrameSource)
//!                                                  |
//!                                            FrameSlot (latest frame)
//!                                             /              \
//!                                  stream sessions         snapshots
//! ```
//!
//! Invariants held by construction:
//!
//! 1. **One supervisor per camera**: a `CameraContext` accepts a single supervisor.
//! 2. **Monotonic sequences**: frame sequence numbers never reset, even across reconnects.
//! 3. **Latest-wins slot**: the slot holds one frame; readers never block the writer.
//! 4. **No credentials in URLs**: cameras are authenticated through the transport itself.
//! 5. **Consumers outlive outages**: stream sessions get placeholder frames, not disconnects.
//!
//! # Module Structure
//!
//! - `endpoint`, `candidates`: camera identity and the ordered transport candidate list
//! - `probe`: one-shot candidate selection
//! - `ingest`: transports (HTTP pull, RTSP pull, synthetic) and the `FrameSource` pump
//! - `supervisor`: connection state machine, backoff, per-camera context
//! - `frame`: frames and the shared slot
//! - `stream`, `overlay`: the multiplexed MJPEG stream and its drawing
//! - `snapshot`: on-demand stills
//! - `api`, `config`: HTTP surface and configuration loading

pub mod api;
pub mod candidates;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod overlay;
pub mod probe;
pub mod snapshot;
pub mod stream;
pub mod supervisor;

pub use api::{ApiConfig, ApiHandle, ApiServer, RelayServices};
pub use candidates::{generate_candidates, TransportCandidate, TransportScheme};
pub use config::RelayConfig;
pub use endpoint::{CameraEndpoint, Credentials};
pub use error::{
    CandidateProbeFailure, CodecError, ConfigError, ConsumerWriteError, NoWorkingCandidate,
    ProbeFailureReason, ReadError, SnapshotError, SupervisorError, TransportError,
};
pub use frame::{CapturedImage, Frame, FrameSlot};
pub use ingest::{
    CandidateScript, Connector, FrameReader, FrameSource, NetworkConnector, SyntheticConnector,
};
pub use probe::{probe, ProbeSuccess};
pub use snapshot::{SnapshotResult, SnapshotService};
pub use stream::{Chunk, Emission, StreamMultiplexer, StreamSession, StreamSettings};
pub use supervisor::{
    BackoffPolicy, CameraContext, ConnectionState, ReconnectSupervisor, StatusSnapshot,
    SupervisorHandle, SupervisorSettings,
};
