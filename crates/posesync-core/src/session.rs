//! One shared scene: every component wired together behind a single writer

use crate::anchor::{AnchorState, AnchorTracker, CorrespondenceOutcome};
use crate::coordinator::{CorrectionOutcome, SyncCoordinator};
use crate::correction::{CorrectionEngine, CorrectionOp};
use crate::error::{Result, SessionError, SyncError};
use crate::monitor::{MetricsSnapshot, Observation, SessionMode, SessionMonitor, SessionSignal};
use crate::registry::{ConnectionRegistry, ConnectionSpec};
use crate::types::{ObjectId, Sequence, StateDelta, TrackedObject, WorldSnapshot};
use crate::validator::{ConnectionState, CorrectionRequest, PrecisionValidator};
use chrono::{DateTime, Utc};
use posesync_config::SessionConfig;
use posesync_spatial::{FrameMismatch, FramedPose, ParticipantId, Pose, ReferenceFrame};
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// An authoritative delta re-expressed for one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalizedDelta {
    pub delta: StateDelta,
    /// The delta's pose in the participant's tracking frame
    pub local_pose: Option<Pose>,
    /// Anchor transform used: `shared = compose(drift_adjustment, local)`
    pub drift_adjustment: Pose,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedCorrection {
    pub op: CorrectionOp,
    pub outcome: CorrectionOutcome,
}

/// Everything one tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    /// False on ticks skipped by degraded-mode throttling
    pub validated: bool,
    pub expired: Vec<(ObjectId, ParticipantId)>,
    pub states: Vec<ConnectionState>,
    pub corrections: Vec<AppliedCorrection>,
    pub metrics: MetricsSnapshot,
}

/// A running shared scene.
///
/// All mutation goes through `&mut self`, so a `Session` is the single
/// serialization point for its objects. [`crate::spawn_session`] wraps one in
/// an async task.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    registry: ConnectionRegistry,
    anchors: AnchorTracker,
    validator: PrecisionValidator,
    engine: CorrectionEngine,
    coordinator: SyncCoordinator,
    monitor: SessionMonitor,
    ticks: u64,
    states: Vec<ConnectionState>,
    metrics: MetricsSnapshot,
}

impl Session {
    /// Validate the configuration and build an empty session.
    pub fn new(config: SessionConfig) -> std::result::Result<Self, SessionError> {
        config.validate()?;
        info!(
            "Starting session at {} Hz (position tolerance {} m, rotation tolerance {} deg)",
            config.tick.rate_hz,
            config.precision.default_position_tolerance_m,
            config.precision.default_rotation_tolerance_deg
        );
        Ok(Self {
            registry: ConnectionRegistry::new(),
            anchors: AnchorTracker::new(config.anchor.clone()),
            validator: PrecisionValidator::new(config.precision.clone()),
            engine: CorrectionEngine::new(config.correction.clone()),
            coordinator: SyncCoordinator::new(
                config.ownership.clone(),
                config.channels.broadcast_capacity,
            ),
            monitor: SessionMonitor::new(config.monitor.clone(), config.channels.broadcast_capacity),
            ticks: 0,
            states: Vec::new(),
            metrics: MetricsSnapshot::empty(Utc::now()),
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn anchors(&self) -> &AnchorTracker {
        &self.anchors
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn mode(&self) -> &SessionMode {
        self.monitor.mode()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Connection states from the latest validating tick.
    pub fn states(&self) -> &[ConnectionState] {
        &self.states
    }

    /// Metrics from the latest tick.
    pub fn metrics(&self) -> &MetricsSnapshot {
        &self.metrics
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        self.coordinator.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateDelta> {
        self.coordinator.subscribe()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.monitor.subscribe()
    }

    pub(crate) fn delta_sender(&self) -> broadcast::Sender<StateDelta> {
        self.coordinator.delta_sender()
    }

    pub(crate) fn signal_sender(&self) -> broadcast::Sender<SessionSignal> {
        self.monitor.signal_sender()
    }

    pub fn register_object(
        &mut self,
        object_id: &str,
        pose: Pose,
        importance: f64,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        self.coordinator
            .register_object(object_id, pose, importance, now)
    }

    /// Destroy an object along with every connection that touches it.
    pub fn remove_object(&mut self, object_id: &str, now: DateTime<Utc>) -> Result<TrackedObject> {
        let object = self.coordinator.remove_object(object_id, now)?;
        self.registry.unregister(object_id);
        Ok(object)
    }

    pub fn register_connection(&mut self, spec: ConnectionSpec) -> Result<()> {
        self.registry.register(spec)
    }

    pub fn unregister_connections(&mut self, object_id: &str) -> Vec<ConnectionSpec> {
        self.registry.unregister(object_id)
    }

    /// Add a participant; it stays untrusted until its first correspondence.
    pub fn join(&mut self, participant: &str, now: DateTime<Utc>) -> bool {
        self.coordinator.heartbeat(participant, now);
        self.anchors.join(participant)
    }

    /// Remove a participant, dropping its anchor and releasing what it holds.
    pub fn leave(&mut self, participant: &str, now: DateTime<Utc>) -> Vec<ObjectId> {
        self.anchors.leave(participant);
        let released = self.coordinator.release_all(participant, now);
        info!(
            "{} left the session, released {} object(s)",
            participant,
            released.len()
        );
        released
    }

    pub fn heartbeat(&mut self, participant: &str, now: DateTime<Utc>) {
        self.coordinator.heartbeat(participant, now);
    }

    pub fn update_correspondence(
        &mut self,
        participant: &str,
        local_pose: &Pose,
        shared_pose_hint: &Pose,
        hint_confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<CorrespondenceOutcome> {
        self.coordinator.heartbeat(participant, now);
        self.anchors.update_correspondence(
            participant,
            local_pose,
            shared_pose_hint,
            hint_confidence,
            now,
        )
    }

    pub fn acquire_ownership(
        &mut self,
        participant: &str,
        object_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        self.coordinator.acquire_ownership(participant, object_id, now)
    }

    pub fn release_ownership(
        &mut self,
        participant: &str,
        object_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        self.coordinator.release_ownership(participant, object_id, now)
    }

    /// Submit a pose in SharedWorld or in the submitting participant's own
    /// tracking frame; local poses go through the participant's anchor.
    pub fn submit_update(
        &mut self,
        participant: &str,
        object_id: &str,
        pose: FramedPose,
        client_sequence: Sequence,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        let shared = match &pose.frame {
            ReferenceFrame::SharedWorld => pose.pose,
            ReferenceFrame::LocalTracking(frame_owner) if frame_owner == participant => {
                self.anchors.to_shared(participant, &pose.pose)?
            }
            other => {
                return Err(SyncError::FrameMismatch(FrameMismatch {
                    expected: ReferenceFrame::LocalTracking(participant.to_string()),
                    actual: other.clone(),
                }))
            }
        };
        self.coordinator
            .submit_update(participant, object_id, shared, client_sequence, now)
    }

    pub fn submit_local_update(
        &mut self,
        participant: &str,
        object_id: &str,
        local_pose: Pose,
        client_sequence: Sequence,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        self.submit_update(
            participant,
            object_id,
            FramedPose::local(participant, local_pose),
            client_sequence,
            now,
        )
    }

    /// Re-express an authoritative delta in a participant's tracking frame.
    pub fn localize(&self, participant: &str, delta: &StateDelta) -> Result<LocalizedDelta> {
        let estimate = self
            .anchors
            .estimate(participant)
            .ok_or_else(|| SyncError::UnknownParticipant(participant.to_string()))?;
        let local_pose = match &delta.pose {
            Some(pose) => Some(self.anchors.to_local(participant, pose)?),
            None => None,
        };
        Ok(LocalizedDelta {
            delta: delta.clone(),
            local_pose,
            drift_adjustment: estimate.local_to_shared,
        })
    }

    pub fn record_sync_latency(&mut self, latency_ms: f64, now: DateTime<Utc>) {
        self.monitor.record_latency(latency_ms, now);
    }

    /// Participants whose poses must not drive corrections: still
    /// bootstrapping, or drifting faster than the monitor allows.
    pub fn untrusted_participants(&self) -> HashSet<ParticipantId> {
        let max_drift = self.config.monitor.max_drift_rate_mps;
        self.anchors
            .participants()
            .filter(|p| match self.anchors.state(p) {
                Some(AnchorState::Bootstrapping) => true,
                _ => self
                    .anchors
                    .estimated_drift_rate(p)
                    .is_some_and(|rate| rate > max_drift),
            })
            .cloned()
            .collect()
    }

    /// Run one pass: expire ownership, validate, correct, monitor.
    ///
    /// In degraded mode validation only runs every `degraded_divisor` ticks.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        self.ticks += 1;
        let expired = self.coordinator.expire_ownership(now);

        let divisor = if self.monitor.mode().is_degraded() {
            u64::from(self.config.tick.degraded_divisor.max(1))
        } else {
            1
        };
        let validated = self.ticks % divisor == 0;
        let untrusted = self.untrusted_participants();

        let mut corrections = Vec::new();
        if validated {
            let mut world = self.coordinator.snapshot();
            self.states = self.validator.evaluate_all(
                &world,
                &self.registry,
                self.monitor.tolerance_scale(),
                now,
            );
            for request in self.validator.drain_requests() {
                if let Some(applied) = self.correct(&request, &mut world, &untrusted, now) {
                    corrections.push(applied);
                }
                self.validator.resolve(&request.connection_id);
            }
        }

        let mut untrusted: Vec<ParticipantId> = untrusted.into_iter().collect();
        untrusted.sort();
        let metrics = self.monitor.observe(
            now,
            Observation {
                states: &self.states,
                drift_rates: self.anchors.drift_rates(),
                ownership_churn: self.coordinator.ownership_churn().clone(),
                untrusted,
            },
        );
        debug!(
            "Tick {}: {} connection(s), {} violated, {} correction(s)",
            self.ticks,
            self.states.len(),
            metrics.violated,
            corrections.len()
        );
        self.metrics = metrics.clone();

        TickReport {
            tick: self.ticks,
            validated,
            expired,
            states: self.states.clone(),
            corrections,
            metrics,
        }
    }

    /// Propose and apply one correction against the freshest object state.
    fn correct(
        &mut self,
        request: &CorrectionRequest,
        world: &mut WorldSnapshot,
        untrusted: &HashSet<ParticipantId>,
        now: DateTime<Utc>,
    ) -> Option<AppliedCorrection> {
        let spec = self.registry.get(&request.connection_id)?;
        for object_id in [&spec.point_a.object_id, &spec.point_b.object_id] {
            let owner = world.get(object_id).and_then(|o| o.owner.as_ref());
            if let Some(owner) = owner.filter(|o| untrusted.contains(*o)) {
                debug!(
                    "Skipping correction for {}: {} is not anchored reliably",
                    spec.id, owner
                );
                return None;
            }
        }

        let op = self.engine.propose(&request.state, spec, world, now)?;
        let outcome = match self.coordinator.apply_correction(&op, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Correction {} dropped: {}", op.id, e);
                return None;
            }
        };
        self.monitor.record_correction(outcome, now);
        if let Some(object) = self.coordinator.get(&op.object_id) {
            world.refresh(object.clone());
        }
        Some(AppliedCorrection { op, outcome })
    }
}
