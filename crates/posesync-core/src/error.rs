//! Error types for the synchronization core.
//!
//! Every [`SyncError`] is an expected, recoverable outcome returned to the
//! caller. They happen routinely under concurrent use and are never panics.

use crate::types::{ConnectionId, ObjectId};
use posesync_config::ConfigError;
use posesync_spatial::{FrameMismatch, ParticipantId};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("participant {participant} does not own object {object_id}")]
    NotOwner {
        participant: ParticipantId,
        object_id: ObjectId,
        owner: Option<ParticipantId>,
    },

    #[error("stale sequence {submitted} for object {object_id} (last accepted {last_accepted})")]
    StaleSequence {
        object_id: ObjectId,
        submitted: u64,
        last_accepted: u64,
    },

    #[error("unknown object: {0}")]
    ObjectUnknown(ObjectId),

    #[error("object {object_id} is already owned by {owner}")]
    ConflictingOwner {
        object_id: ObjectId,
        owner: ParticipantId,
    },

    #[error("connection point {object_id}.{point} is already claimed by connection {claimed_by}")]
    DuplicateConnectionPoint {
        object_id: ObjectId,
        point: String,
        claimed_by: ConnectionId,
    },

    #[error("unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    #[error("connection already registered: {0}")]
    DuplicateConnection(ConnectionId),

    #[error("object already registered: {0}")]
    ObjectExists(ObjectId),

    #[error("invalid connection {connection_id}: {reason}")]
    InvalidConnection {
        connection_id: ConnectionId,
        reason: String,
    },

    #[error("non-finite pose submitted for object {0}")]
    InvalidPose(ObjectId),

    #[error(transparent)]
    FrameMismatch(#[from] FrameMismatch),

    #[error("session is closed")]
    SessionClosed,
}

/// Failure to construct a session. Only raised before any tick runs.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
