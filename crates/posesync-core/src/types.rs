//! Common types shared by the synchronization components.

use chrono::{DateTime, Utc};
use posesync_spatial::{ParticipantId, Pose};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable identifier of a tracked object.
pub type ObjectId = String;

/// Identifier of a declared connection between two objects.
pub type ConnectionId = String;

/// Logical sequence number (monotonic, never wall clock).
pub type Sequence = u64;

/// One object with spatial identity in the shared scene.
///
/// Mutated only by the [`SyncCoordinator`](crate::SyncCoordinator); everyone
/// else works with cloned, read-only projections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: ObjectId,
    /// Authoritative pose, always in SharedWorld
    pub pose: Pose,
    /// Current owner; unowned objects are static/background
    pub owner: Option<ParticipantId>,
    /// Per-object sequence, bumped on every accepted change
    pub sequence: Sequence,
    /// Prioritizes correction and bandwidth only, never correctness (0.0 to 1.0)
    pub importance: f64,
    /// Session-wide revision of the most recent change to this object
    pub last_revision: Sequence,
    /// Number of participant-submitted pose updates accepted so far
    pub participant_revision: u64,
    /// When the owner last moved this object
    pub last_owner_update_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedObject {
    pub fn new(id: ObjectId, pose: Pose, importance: f64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            pose,
            owner: None,
            sequence: 0,
            importance: if importance.is_finite() {
                importance.clamp(0.0, 1.0)
            } else {
                0.0
            },
            last_revision: 0,
            participant_revision: 0,
            last_owner_update_at: None,
            updated_at: now,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }
}

/// A consistent copy of the authoritative store taken at one revision.
#[derive(Debug, Clone, Default)]
pub struct WorldSnapshot {
    pub revision: Sequence,
    pub objects: HashMap<ObjectId, TrackedObject>,
}

impl WorldSnapshot {
    pub fn get(&self, object_id: &str) -> Option<&TrackedObject> {
        self.objects.get(object_id)
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.objects.contains_key(object_id)
    }

    /// Replace one object with a fresher copy.
    pub fn refresh(&mut self, object: TrackedObject) {
        self.revision = self.revision.max(object.last_revision);
        self.objects.insert(object.id.clone(), object);
    }
}

/// What produced a pose change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Participant(ParticipantId),
    Correction {
        op_id: String,
        connection_id: ConnectionId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Registered,
    PoseUpdated { source: UpdateSource },
    OwnershipChanged,
    Removed,
}

/// One authoritative change, broadcast to every participant.
///
/// Clients drop any delta whose `sequence` is not newer than the last one
/// they applied for `object_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub object_id: ObjectId,
    pub sequence: Sequence,
    pub revision: Sequence,
    pub kind: DeltaKind,
    /// Pose after the change, in SharedWorld (absent for removals)
    pub pose: Option<Pose>,
    pub owner: Option<ParticipantId>,
    pub at: DateTime<Utc>,
}
