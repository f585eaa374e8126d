//! Per-connection precision evaluation with hysteresis

use crate::registry::{ConnectionPoint, ConnectionRegistry, ConnectionSpec};
use crate::types::{ConnectionId, Sequence, WorldSnapshot};
use chrono::{DateTime, Utc};
use posesync_config::PrecisionConfig;
use posesync_spatial::{compose, difference, Pose, PoseError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Satisfied,
    Degraded,
    Violated,
    /// One of the connected objects no longer exists; never corrected
    Inert,
}

impl ConnectionStatus {
    fn level(self) -> Option<u8> {
        match self {
            ConnectionStatus::Satisfied => Some(0),
            ConnectionStatus::Degraded => Some(1),
            ConnectionStatus::Violated => Some(2),
            ConnectionStatus::Inert => None,
        }
    }

    fn from_level(level: u8) -> Self {
        match level {
            0 => ConnectionStatus::Satisfied,
            1 => ConnectionStatus::Degraded,
            _ => ConnectionStatus::Violated,
        }
    }
}

/// Latest evaluation of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub connection_id: ConnectionId,
    pub position_error_m: f64,
    pub rotation_error_deg: f64,
    pub precision: f64,
    pub status: ConnectionStatus,
    /// World revision this state was computed from
    pub evaluated_revision: Sequence,
    /// Start of the current uninterrupted Violated stretch
    pub violated_since: Option<DateTime<Utc>>,
}

/// Ask the correction stage to pull a violated connection back into tolerance.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionRequest {
    pub connection_id: ConnectionId,
    pub state: ConnectionState,
    pub requested_at: DateTime<Utc>,
}

/// Combined precision score in [0, 1]; 1.0 means exact alignment.
///
/// Position and rotation scores are `max(0, 1 - error / tolerance)` each and
/// combine multiplicatively, so the result never increases as either error grows.
pub fn precision_score(error: &PoseError, position_tolerance_m: f64, rotation_tolerance_deg: f64) -> f64 {
    let position = (1.0 - error.position_error_m / position_tolerance_m).max(0.0);
    let rotation = (1.0 - error.rotation_error_deg / rotation_tolerance_deg).max(0.0);
    position * rotation
}

/// World pose of a connection point, if its object exists.
pub fn point_pose(world: &WorldSnapshot, point: &ConnectionPoint) -> Option<Pose> {
    world
        .get(&point.object_id)
        .map(|object| compose(&object.pose, &point.local_pose))
}

/// Evaluates every registered connection against the current world and keeps
/// the per-connection state machine.
#[derive(Debug)]
pub struct PrecisionValidator {
    config: PrecisionConfig,
    states: HashMap<ConnectionId, ConnectionState>,
    /// Connections with an unresolved correction request
    outstanding: HashSet<ConnectionId>,
    pending: Vec<CorrectionRequest>,
    /// Inert connections already reported for the current occurrence
    inert_reported: HashSet<ConnectionId>,
}

impl PrecisionValidator {
    pub fn new(config: PrecisionConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            outstanding: HashSet::new(),
            pending: Vec::new(),
            inert_reported: HashSet::new(),
        }
    }

    /// Evaluate all connections in registry order.
    ///
    /// `tolerance_scale` widens every tolerance (1.0 normally, larger in
    /// degraded mode). Violated connections queue at most one outstanding
    /// [`CorrectionRequest`] each.
    pub fn evaluate_all(
        &mut self,
        world: &WorldSnapshot,
        registry: &ConnectionRegistry,
        tolerance_scale: f64,
        now: DateTime<Utc>,
    ) -> Vec<ConnectionState> {
        let live: HashSet<&str> = registry.all().map(|s| s.id.as_str()).collect();
        self.states.retain(|id, _| live.contains(id.as_str()));
        self.outstanding.retain(|id| live.contains(id.as_str()));
        self.inert_reported.retain(|id| live.contains(id.as_str()));
        self.pending
            .retain(|r| live.contains(r.connection_id.as_str()));

        registry
            .all()
            .map(|spec| self.evaluate(spec, world, tolerance_scale, now))
            .collect()
    }

    fn evaluate(
        &mut self,
        spec: &ConnectionSpec,
        world: &WorldSnapshot,
        tolerance_scale: f64,
        now: DateTime<Utc>,
    ) -> ConnectionState {
        let previous = self.states.get(&spec.id);

        let (Some(pose_a), Some(pose_b)) = (
            point_pose(world, &spec.point_a),
            point_pose(world, &spec.point_b),
        ) else {
            if self.inert_reported.insert(spec.id.clone()) {
                warn!(
                    "Connection {} is inert: {} or {} no longer exists",
                    spec.id, spec.point_a.object_id, spec.point_b.object_id
                );
            }
            self.outstanding.remove(&spec.id);
            let state = ConnectionState {
                connection_id: spec.id.clone(),
                position_error_m: 0.0,
                rotation_error_deg: 0.0,
                precision: 0.0,
                status: ConnectionStatus::Inert,
                evaluated_revision: world.revision,
                violated_since: None,
            };
            self.states.insert(spec.id.clone(), state.clone());
            return state;
        };
        self.inert_reported.remove(&spec.id);

        let error = difference(&pose_a, &pose_b);
        let position_tolerance = spec.position_tolerance_m * tolerance_scale;
        let rotation_tolerance = spec.rotation_tolerance_deg * tolerance_scale;
        let precision = precision_score(&error, position_tolerance, rotation_tolerance);

        let measured = self.classify(spec, precision);
        let immediate = error.position_error_m
            > self.config.immediate_violation_factor * position_tolerance
            || error.rotation_error_deg > self.config.immediate_violation_factor * rotation_tolerance;
        let previous_status = previous
            .map(|s| s.status)
            .unwrap_or(ConnectionStatus::Satisfied);
        let status = next_status(previous_status, measured, immediate);

        let violated_since = match (status, previous) {
            (ConnectionStatus::Violated, Some(prev)) if prev.status == ConnectionStatus::Violated => {
                prev.violated_since.or(Some(now))
            }
            (ConnectionStatus::Violated, _) => Some(now),
            _ => None,
        };

        if previous_status != status {
            debug!(
                "Connection {} {:?} -> {:?} (precision {:.6}, {:.6} m, {:.4} deg)",
                spec.id,
                previous_status,
                status,
                precision,
                error.position_error_m,
                error.rotation_error_deg
            );
        }

        let state = ConnectionState {
            connection_id: spec.id.clone(),
            position_error_m: error.position_error_m,
            rotation_error_deg: error.rotation_error_deg,
            precision,
            status,
            evaluated_revision: world.revision,
            violated_since,
        };

        if status == ConnectionStatus::Violated {
            if self.outstanding.insert(spec.id.clone()) {
                self.pending.push(CorrectionRequest {
                    connection_id: spec.id.clone(),
                    state: state.clone(),
                    requested_at: now,
                });
            } else if let Some(request) = self
                .pending
                .iter_mut()
                .find(|r| r.connection_id == spec.id)
            {
                // Coalesce into the queued request
                request.state = state.clone();
            }
        }

        self.states.insert(spec.id.clone(), state.clone());
        state
    }

    fn classify(&self, spec: &ConnectionSpec, precision: f64) -> ConnectionStatus {
        if precision >= spec.min_connection_precision {
            ConnectionStatus::Satisfied
        } else if precision >= spec.min_connection_precision * self.config.degraded_ratio {
            ConnectionStatus::Degraded
        } else {
            ConnectionStatus::Violated
        }
    }

    /// Take the queued correction requests. Each stays outstanding until
    /// [`resolve`](Self::resolve) is called for its connection.
    pub fn drain_requests(&mut self) -> Vec<CorrectionRequest> {
        std::mem::take(&mut self.pending)
    }

    pub fn resolve(&mut self, connection_id: &str) {
        self.outstanding.remove(connection_id);
    }

    pub fn has_outstanding(&self, connection_id: &str) -> bool {
        self.outstanding.contains(connection_id)
    }

    pub fn state(&self, connection_id: &str) -> Option<&ConnectionState> {
        self.states.get(connection_id)
    }
}

/// Move at most one level per evaluation, except the jump to Violated when
/// the error exceeds the immediate-violation factor.
fn next_status(previous: ConnectionStatus, measured: ConnectionStatus, immediate: bool) -> ConnectionStatus {
    if measured == ConnectionStatus::Violated && immediate {
        return ConnectionStatus::Violated;
    }
    let (Some(from), Some(to)) = (previous.level(), measured.level()) else {
        // Coming back from Inert counts as coming from Satisfied
        return match measured {
            ConnectionStatus::Violated => ConnectionStatus::Degraded,
            other => other,
        };
    };
    if to > from {
        ConnectionStatus::from_level(from + 1)
    } else if to < from {
        ConnectionStatus::from_level(from - 1)
    } else {
        measured
    }
}
