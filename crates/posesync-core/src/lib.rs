//! Spatial precision tracking and multi-user synchronization.
//!
//! A [`Session`] owns one shared scene: the authoritative object store
//! ([`SyncCoordinator`]), the declared connections ([`ConnectionRegistry`]),
//! per-participant anchoring ([`AnchorTracker`]), and the tick pipeline that
//! validates connections ([`PrecisionValidator`]), nudges them back into
//! tolerance ([`CorrectionEngine`]) and watches session health
//! ([`SessionMonitor`]). [`spawn_session`] runs a session as a tokio task
//! behind a cloneable [`SessionHandle`].

pub mod anchor;
pub mod coordinator;
pub mod correction;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod types;
pub mod validator;

pub use anchor::{AnchorEstimate, AnchorState, AnchorTracker, CorrespondenceOutcome};
pub use coordinator::{CorrectionOutcome, SyncCoordinator};
pub use correction::{CorrectionEngine, CorrectionOp};
pub use error::{Result, SessionError, SyncError};
pub use monitor::{
    DegradedReason, MetricsSnapshot, Observation, SessionMode, SessionMonitor, SessionSignal,
};
pub use registry::{ConnectionPoint, ConnectionRegistry, ConnectionSpec};
pub use runtime::{spawn_session, SessionHandle};
pub use session::{AppliedCorrection, LocalizedDelta, Session, TickReport};
pub use types::{
    ConnectionId, DeltaKind, ObjectId, Sequence, StateDelta, TrackedObject, UpdateSource,
    WorldSnapshot,
};
pub use validator::{
    precision_score, ConnectionState, ConnectionStatus, CorrectionRequest, PrecisionValidator,
};
