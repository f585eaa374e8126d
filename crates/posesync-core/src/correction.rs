//! Bounded corrective transforms for violated connections

use crate::registry::{ConnectionPoint, ConnectionSpec};
use crate::types::{ConnectionId, ObjectId, Sequence, TrackedObject, WorldSnapshot};
use crate::validator::{point_pose, ConnectionState};
use chrono::{DateTime, Utc};
use posesync_config::CorrectionConfig;
use posesync_spatial::{compose, inverse, Pose, Quaternion, Vector3D};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;
use uuid::Uuid;

/// Below this a proposed step is treated as no step at all
const NEGLIGIBLE_STEP_M: f64 = 1e-12;
const NEGLIGIBLE_STEP_DEG: f64 = 1e-9;

/// A small adjustment to one object, proposed to resolve a violated connection.
///
/// Only valid while the target has not been moved by a participant since it
/// was proposed; the coordinator discards it otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionOp {
    pub id: String,
    pub object_id: ObjectId,
    /// World-space translation plus a rotation pre-multiplied onto the current rotation
    pub delta: Pose,
    /// Displacement of the connection point, not of the object origin
    pub magnitude_m: f64,
    pub magnitude_deg: f64,
    pub connection_id: ConnectionId,
    /// State that triggered this correction
    pub reason: ConnectionState,
    pub proposed_at: DateTime<Utc>,
    /// Target's participant revision when proposed (eligibility window)
    pub participant_revision: u64,
    /// Target's sequence when proposed
    pub base_sequence: Sequence,
}

impl CorrectionOp {
    /// Pose of the target after the correction; scale is preserved.
    pub fn apply_to(&self, current: &Pose) -> Pose {
        let moved = Pose::new(
            current.position() + self.delta.position(),
            self.delta.rotation() * current.rotation(),
        );
        match current.scale() {
            Some(scale) => moved.with_scale(scale),
            None => moved,
        }
    }
}

/// Turns violated connection states into bounded [`CorrectionOp`]s.
#[derive(Debug, Clone)]
pub struct CorrectionEngine {
    config: CorrectionConfig,
}

impl CorrectionEngine {
    pub fn new(config: CorrectionConfig) -> Self {
        Self { config }
    }

    /// Propose one step toward alignment for `spec`, or `None` when nothing
    /// should move this tick.
    ///
    /// The target is the unowned side if there is one, otherwise the side
    /// with lower importance, otherwise the one changed most recently. No op
    /// is produced while the target's owner moved it within the grace period.
    pub fn propose(
        &self,
        state: &ConnectionState,
        spec: &ConnectionSpec,
        world: &WorldSnapshot,
        now: DateTime<Utc>,
    ) -> Option<CorrectionOp> {
        let object_a = world.get(&spec.point_a.object_id)?;
        let object_b = world.get(&spec.point_b.object_id)?;
        let (target, point, anchor_point) = if prefer_first(object_a, object_b) {
            (object_a, &spec.point_a, &spec.point_b)
        } else {
            (object_b, &spec.point_b, &spec.point_a)
        };

        if let (Some(owner), Some(moved_at)) = (&target.owner, target.last_owner_update_at) {
            let since_ms = (now - moved_at).num_milliseconds();
            if since_ms >= 0 && (since_ms as u64) < self.config.grace_period_ms {
                debug!(
                    "Holding correction of {} for {}: {} moved it {} ms ago",
                    target.id, spec.id, owner, since_ms
                );
                return None;
            }
        }

        let goal = point_pose(world, anchor_point)?;
        let (delta, magnitude_m) = self.bounded_step(&target.pose, point, &goal);
        let magnitude_deg = delta.rotation().angle().to_degrees();
        if magnitude_m < NEGLIGIBLE_STEP_M && magnitude_deg < NEGLIGIBLE_STEP_DEG {
            return None;
        }

        debug!(
            "Proposing correction of {} for {}: {:.6} m, {:.4} deg",
            target.id, spec.id, magnitude_m, magnitude_deg
        );
        Some(CorrectionOp {
            id: Uuid::new_v4().to_string(),
            object_id: target.id.clone(),
            delta,
            magnitude_m,
            magnitude_deg,
            connection_id: spec.id.clone(),
            reason: state.clone(),
            proposed_at: now,
            participant_revision: target.participant_revision,
            base_sequence: target.sequence,
        })
    }

    /// Step that moves `point` on an object at `current` toward `goal`,
    /// limited to the configured per-tick bounds.
    ///
    /// The rotation pivots about the connection point, so only the clamped
    /// shift moves it. Returns the delta and the point's displacement.
    fn bounded_step(&self, current: &Pose, point: &ConnectionPoint, goal: &Pose) -> (Pose, f64) {
        let desired = compose(goal, &inverse(&point.local_pose));
        let full = (desired.rotation() * current.rotation().conjugate())
            .normalize()
            .aligned_with(&Quaternion::IDENTITY);

        let max_rad = self.config.max_step_deg.to_radians();
        let angle = full.angle();
        let rotation = if angle > max_rad {
            let axis = Vector3D::new(full.x, full.y, full.z);
            Quaternion::from_axis_angle(axis, max_rad)
        } else {
            full
        };

        let offset = point
            .local_pose
            .position()
            .component_mul(&current.effective_scale());
        let point_now = current.position() + current.rotation().rotate_vector(offset);
        let rotated = rotation * current.rotation();
        let pivot = point_now - rotated.rotate_vector(offset) - current.position();
        let shift = (goal.position() - point_now).clamp_magnitude(self.config.max_step_m);

        (Pose::new(pivot + shift, rotation), shift.magnitude())
    }
}

/// Whether `a` is the better side to correct.
fn prefer_first(a: &TrackedObject, b: &TrackedObject) -> bool {
    match (a.is_owned(), b.is_owned()) {
        (false, true) => return true,
        (true, false) => return false,
        _ => {}
    }
    match a.importance.partial_cmp(&b.importance) {
        Some(Ordering::Less) => return true,
        Some(Ordering::Greater) => return false,
        _ => {}
    }
    a.last_revision >= b.last_revision
}
