//! posesync: keep logically connected 3D objects aligned while several
//! participants move them at once.
//!
//! This crate re-exports the workspace members:
//! - [`spatial`]: pose math (`compose`, `inverse`, `difference`, `lerp`, `slerp`)
//! - [`config`]: `SessionConfig` and TOML loading
//! - [`sync`]: anchors, connections, validation, correction, the sync
//!   coordinator, monitoring and the async session runtime

pub use posesync_config as config;
pub use posesync_core as sync;
pub use posesync_spatial as spatial;

pub use posesync_config::SessionConfig;
pub use posesync_core::{
    spawn_session, ConnectionPoint, ConnectionSpec, ConnectionState, ConnectionStatus,
    CorrectionOutcome, MetricsSnapshot, Session, SessionHandle, SessionSignal, StateDelta,
    SyncError,
};
pub use posesync_spatial::{FramedPose, Pose, Quaternion, ReferenceFrame, Vector3D};
