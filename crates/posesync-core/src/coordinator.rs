//! Authoritative store of tracked objects and the only place they change

use crate::correction::CorrectionOp;
use crate::error::{Result, SyncError};
use crate::types::{
    DeltaKind, ObjectId, Sequence, StateDelta, TrackedObject, UpdateSource, WorldSnapshot,
};
use chrono::{DateTime, Duration, Utc};
use posesync_config::OwnershipConfig;
use posesync_spatial::{ParticipantId, Pose};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Outcome of [`SyncCoordinator::apply_correction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// Applied; carries the object's new sequence
    Applied { sequence: Sequence },
    /// A participant moved the object after the op was proposed
    Superseded,
}

/// Single writer of [`TrackedObject`] state.
///
/// Accepts participant updates and corrections, enforces ownership and
/// per-participant sequence ordering, and publishes exactly one
/// [`StateDelta`] per accepted change.
#[derive(Debug)]
pub struct SyncCoordinator {
    config: OwnershipConfig,
    objects: HashMap<ObjectId, TrackedObject>,
    /// Last accepted client sequence per (participant, object). Kept for the
    /// whole session so late redeliveries stay stale across leave and rejoin.
    client_sequences: HashMap<(ParticipantId, ObjectId), Sequence>,
    heartbeats: HashMap<ParticipantId, DateTime<Utc>>,
    /// Ownership changes per participant (acquire, release, expiry)
    ownership_churn: HashMap<ParticipantId, u64>,
    revision: Sequence,
    deltas: broadcast::Sender<StateDelta>,
}

impl SyncCoordinator {
    pub fn new(config: OwnershipConfig, broadcast_capacity: usize) -> Self {
        let (deltas, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            config,
            objects: HashMap::new(),
            client_sequences: HashMap::new(),
            heartbeats: HashMap::new(),
            ownership_churn: HashMap::new(),
            revision: 0,
            deltas,
        }
    }

    /// Receive every delta published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StateDelta> {
        self.deltas.subscribe()
    }

    /// Sender side of the delta stream, for handing out new subscriptions.
    pub fn delta_sender(&self) -> broadcast::Sender<StateDelta> {
        self.deltas.clone()
    }

    pub fn register_object(
        &mut self,
        object_id: &str,
        pose: Pose,
        importance: f64,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        if self.objects.contains_key(object_id) {
            return Err(SyncError::ObjectExists(object_id.to_string()));
        }
        if !pose.is_finite() {
            return Err(SyncError::InvalidPose(object_id.to_string()));
        }
        let object = TrackedObject::new(object_id.to_string(), pose, importance, now);
        info!(
            "Registered object {} (importance {:.2})",
            object_id, object.importance
        );
        self.objects.insert(object_id.to_string(), object);
        Ok(self.commit(object_id, DeltaKind::Registered, now))
    }

    pub fn remove_object(&mut self, object_id: &str, now: DateTime<Utc>) -> Result<TrackedObject> {
        let mut object = self
            .objects
            .remove(object_id)
            .ok_or_else(|| SyncError::ObjectUnknown(object_id.to_string()))?;

        self.revision += 1;
        object.sequence += 1;
        object.last_revision = self.revision;
        info!("Removed object {}", object_id);
        self.publish(StateDelta {
            object_id: object.id.clone(),
            sequence: object.sequence,
            revision: self.revision,
            kind: DeltaKind::Removed,
            pose: None,
            owner: None,
            at: now,
        });
        Ok(object)
    }

    /// Record that a participant is alive.
    pub fn heartbeat(&mut self, participant: &str, now: DateTime<Utc>) {
        let entry = self
            .heartbeats
            .entry(participant.to_string())
            .or_insert(now);
        if now > *entry {
            *entry = now;
        }
    }

    /// First come, first served. Re-acquiring an object already held by the
    /// same participant succeeds without publishing anything.
    pub fn acquire_ownership(
        &mut self,
        participant: &str,
        object_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        self.expire_ownership(now);
        let object = self
            .objects
            .get_mut(object_id)
            .ok_or_else(|| SyncError::ObjectUnknown(object_id.to_string()))?;
        match object.owner.clone() {
            Some(owner) if owner == participant => {
                let sequence = object.sequence;
                self.heartbeat(participant, now);
                return Ok(sequence);
            }
            Some(owner) => {
                debug!(
                    "Ownership of {} refused for {}: held by {}",
                    object_id, participant, owner
                );
                return Err(SyncError::ConflictingOwner {
                    object_id: object_id.to_string(),
                    owner,
                });
            }
            None => {
                object.owner = Some(participant.to_string());
                object.last_owner_update_at = None;
            }
        }

        self.heartbeat(participant, now);
        *self
            .ownership_churn
            .entry(participant.to_string())
            .or_default() += 1;
        info!("{} acquired ownership of {}", participant, object_id);
        Ok(self.commit(object_id, DeltaKind::OwnershipChanged, now))
    }

    pub fn release_ownership(
        &mut self,
        participant: &str,
        object_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        let object = self
            .objects
            .get_mut(object_id)
            .ok_or_else(|| SyncError::ObjectUnknown(object_id.to_string()))?;
        if object.owner.as_deref() != Some(participant) {
            return Err(SyncError::NotOwner {
                participant: participant.to_string(),
                object_id: object_id.to_string(),
                owner: object.owner.clone(),
            });
        }
        object.owner = None;
        object.last_owner_update_at = None;
        *self
            .ownership_churn
            .entry(participant.to_string())
            .or_default() += 1;
        info!("{} released ownership of {}", participant, object_id);
        Ok(self.commit(object_id, DeltaKind::OwnershipChanged, now))
    }

    /// Release everything a participant holds and forget its liveness.
    /// Accepted client sequences are kept.
    pub fn release_all(&mut self, participant: &str, now: DateTime<Utc>) -> Vec<ObjectId> {
        let held = self.objects_owned_by(participant);
        for object_id in &held {
            // Ownership was just checked, so this cannot be refused
            let _ = self.release_ownership(participant, object_id, now);
        }
        self.heartbeats.remove(participant);
        held
    }

    /// Release ownership held by participants whose heartbeat is older than
    /// the ownership timeout. Returns the released (object, former owner) pairs.
    pub fn expire_ownership(&mut self, now: DateTime<Utc>) -> Vec<(ObjectId, ParticipantId)> {
        let timeout = Duration::milliseconds(self.config.timeout_ms as i64);
        let mut expired: Vec<(ObjectId, ParticipantId)> = self
            .objects
            .values()
            .filter_map(|object| {
                let owner = object.owner.as_ref()?;
                let lapsed = match self.heartbeats.get(owner) {
                    Some(last_seen) => now - *last_seen > timeout,
                    None => true,
                };
                lapsed.then(|| (object.id.clone(), owner.clone()))
            })
            .collect();
        expired.sort();

        for (object_id, owner) in &expired {
            if let Some(object) = self.objects.get_mut(object_id) {
                object.owner = None;
                object.last_owner_update_at = None;
            }
            *self.ownership_churn.entry(owner.clone()).or_default() += 1;
            warn!(
                "Ownership of {} released: heartbeat from {} lapsed",
                object_id, owner
            );
            self.commit(object_id, DeltaKind::OwnershipChanged, now);
        }
        expired
    }

    /// Accept a participant's proposed pose (already in SharedWorld).
    ///
    /// Checks run in order: unknown object, non-finite pose, stale client
    /// sequence, ownership. A resubmitted sequence is therefore always
    /// reported as stale and never applied twice.
    pub fn submit_update(
        &mut self,
        participant: &str,
        object_id: &str,
        pose: Pose,
        client_sequence: Sequence,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        self.expire_ownership(now);
        let object = self
            .objects
            .get_mut(object_id)
            .ok_or_else(|| SyncError::ObjectUnknown(object_id.to_string()))?;
        if !pose.is_finite() {
            return Err(SyncError::InvalidPose(object_id.to_string()));
        }
        let key = (participant.to_string(), object_id.to_string());
        if let Some(&last_accepted) = self.client_sequences.get(&key) {
            if client_sequence <= last_accepted {
                debug!(
                    "Stale update from {} for {}: {} <= {}",
                    participant, object_id, client_sequence, last_accepted
                );
                return Err(SyncError::StaleSequence {
                    object_id: object_id.to_string(),
                    submitted: client_sequence,
                    last_accepted,
                });
            }
        }
        if object.owner.as_deref() != Some(participant) {
            debug!(
                "Update from {} for {} refused: owner is {:?}",
                participant, object_id, object.owner
            );
            return Err(SyncError::NotOwner {
                participant: participant.to_string(),
                object_id: object_id.to_string(),
                owner: object.owner.clone(),
            });
        }

        object.pose = pose;
        object.participant_revision += 1;
        object.last_owner_update_at = Some(now);
        self.client_sequences.insert(key, client_sequence);
        self.heartbeat(participant, now);
        let sequence = self.commit(
            object_id,
            DeltaKind::PoseUpdated {
                source: UpdateSource::Participant(participant.to_string()),
            },
            now,
        );
        debug!(
            "Accepted update {} from {} for {} (sequence {})",
            client_sequence, participant, object_id, sequence
        );
        Ok(sequence)
    }

    /// Apply a correction unless a participant moved the object since it was proposed.
    pub fn apply_correction(
        &mut self,
        op: &CorrectionOp,
        now: DateTime<Utc>,
    ) -> Result<CorrectionOutcome> {
        let object = self
            .objects
            .get_mut(&op.object_id)
            .ok_or_else(|| SyncError::ObjectUnknown(op.object_id.clone()))?;
        if object.participant_revision != op.participant_revision {
            debug!(
                "Correction {} for {} superseded by a participant update",
                op.id, op.object_id
            );
            return Ok(CorrectionOutcome::Superseded);
        }
        object.pose = op.apply_to(&object.pose);
        let sequence = self.commit(
            &op.object_id,
            DeltaKind::PoseUpdated {
                source: UpdateSource::Correction {
                    op_id: op.id.clone(),
                    connection_id: op.connection_id.clone(),
                },
            },
            now,
        );
        Ok(CorrectionOutcome::Applied { sequence })
    }

    /// Consistent copy of every object at the current revision.
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            revision: self.revision,
            objects: self.objects.clone(),
        }
    }

    pub fn get(&self, object_id: &str) -> Option<&TrackedObject> {
        self.objects.get(object_id)
    }

    pub fn owner_of(&self, object_id: &str) -> Option<&ParticipantId> {
        self.objects.get(object_id).and_then(|o| o.owner.as_ref())
    }

    pub fn objects_owned_by(&self, participant: &str) -> Vec<ObjectId> {
        let mut owned: Vec<ObjectId> = self
            .objects
            .values()
            .filter(|o| o.owner.as_deref() == Some(participant))
            .map(|o| o.id.clone())
            .collect();
        owned.sort();
        owned
    }

    pub fn ownership_churn(&self) -> &HashMap<ParticipantId, u64> {
        &self.ownership_churn
    }

    pub fn revision(&self) -> Sequence {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Bump sequence and revision for a changed object and publish its delta.
    fn commit(&mut self, object_id: &str, kind: DeltaKind, now: DateTime<Utc>) -> Sequence {
        self.revision += 1;
        let revision = self.revision;
        let Some(object) = self.objects.get_mut(object_id) else {
            return 0;
        };
        object.sequence += 1;
        object.last_revision = revision;
        object.updated_at = now;
        let delta = StateDelta {
            object_id: object.id.clone(),
            sequence: object.sequence,
            revision,
            kind,
            pose: Some(object.pose),
            owner: object.owner.clone(),
            at: now,
        };
        let sequence = object.sequence;
        self.publish(delta);
        sequence
    }

    fn publish(&self, delta: StateDelta) {
        // No subscribers is not an error
        let _ = self.deltas.send(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{ConnectionState, ConnectionStatus};
    use posesync_spatial::{Quaternion, Vector3D};

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    fn coordinator() -> SyncCoordinator {
        let mut c = SyncCoordinator::new(OwnershipConfig::default(), 64);
        c.register_object("x", Pose::IDENTITY, 0.5, t(0)).unwrap();
        c
    }

    fn at(x: f64) -> Pose {
        Pose::from_position(Vector3D::new(x, 0.0, 0.0))
    }

    fn op(object_id: &str, participant_revision: u64) -> CorrectionOp {
        CorrectionOp {
            id: "op-1".to_string(),
            object_id: object_id.to_string(),
            delta: at(0.01),
            magnitude_m: 0.01,
            magnitude_deg: 0.0,
            connection_id: "c1".to_string(),
            reason: ConnectionState {
                connection_id: "c1".to_string(),
                position_error_m: 0.02,
                rotation_error_deg: 0.0,
                precision: 0.0,
                status: ConnectionStatus::Violated,
                evaluated_revision: 1,
                violated_since: None,
            },
            proposed_at: t(0),
            participant_revision,
            base_sequence: 1,
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut c = coordinator();
        assert_eq!(
            c.register_object("x", Pose::IDENTITY, 0.5, t(1)),
            Err(SyncError::ObjectExists("x".to_string()))
        );
        let bad = Pose::from_position(Vector3D::new(f64::NAN, 0.0, 0.0));
        assert_eq!(
            c.register_object("y", bad, 0.5, t(1)),
            Err(SyncError::InvalidPose("y".to_string()))
        );
    }

    #[test]
    fn ownership_is_exclusive() {
        let mut c = coordinator();
        c.acquire_ownership("p1", "x", t(0)).unwrap();
        assert_eq!(
            c.acquire_ownership("p2", "x", t(1)),
            Err(SyncError::ConflictingOwner {
                object_id: "x".to_string(),
                owner: "p1".to_string(),
            })
        );
        // Re-acquire by the holder is a no-op success
        let seq = c.get("x").unwrap().sequence;
        assert_eq!(c.acquire_ownership("p1", "x", t(2)), Ok(seq));
        assert_eq!(c.owner_of("x"), Some(&"p1".to_string()));
    }

    #[test]
    fn update_requires_ownership() {
        let mut c = coordinator();
        assert_eq!(
            c.submit_update("p1", "x", at(1.0), 1, t(0)),
            Err(SyncError::NotOwner {
                participant: "p1".to_string(),
                object_id: "x".to_string(),
                owner: None,
            })
        );
        c.acquire_ownership("p2", "x", t(0)).unwrap();
        assert!(matches!(
            c.submit_update("p1", "x", at(1.0), 1, t(1)),
            Err(SyncError::NotOwner { owner: Some(_), .. })
        ));
        assert_eq!(
            c.submit_update("p1", "nope", at(1.0), 1, t(1)),
            Err(SyncError::ObjectUnknown("nope".to_string()))
        );
    }

    #[test]
    fn resubmitted_sequence_is_stale() {
        let mut c = coordinator();
        c.acquire_ownership("p1", "x", t(0)).unwrap();
        c.submit_update("p1", "x", at(1.0), 7, t(10)).unwrap();

        assert_eq!(
            c.submit_update("p1", "x", at(2.0), 7, t(20)),
            Err(SyncError::StaleSequence {
                object_id: "x".to_string(),
                submitted: 7,
                last_accepted: 7,
            })
        );
        assert!(c.submit_update("p1", "x", at(2.0), 3, t(20)).is_err());
        assert_eq!(c.get("x").unwrap().pose, at(1.0));
        assert_eq!(c.get("x").unwrap().participant_revision, 1);

        // Gaps are fine
        c.submit_update("p1", "x", at(3.0), 12, t(30)).unwrap();
        assert_eq!(c.get("x").unwrap().pose, at(3.0));
    }

    #[test]
    fn every_accepted_change_publishes_one_delta() {
        let mut c = coordinator();
        let mut rx = c.subscribe();
        c.acquire_ownership("p1", "x", t(0)).unwrap();
        c.submit_update("p1", "x", at(1.0), 1, t(10)).unwrap();
        let _ = c.submit_update("p1", "x", at(5.0), 1, t(20));
        c.release_ownership("p1", "x", t(30)).unwrap();

        let mut deltas = Vec::new();
        while let Ok(delta) = rx.try_recv() {
            deltas.push(delta);
        }
        assert_eq!(deltas.len(), 3);
        let sequences: Vec<u64> = deltas.iter().map(|d| d.sequence).collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(deltas[0].kind, DeltaKind::OwnershipChanged);
        assert_eq!(
            deltas[1].kind,
            DeltaKind::PoseUpdated {
                source: UpdateSource::Participant("p1".to_string())
            }
        );
        assert_eq!(deltas[1].pose, Some(at(1.0)));
        assert_eq!(deltas[2].owner, None);
    }

    #[test]
    fn lapsed_heartbeat_releases_ownership() {
        let mut c = coordinator();
        c.acquire_ownership("p1", "x", t(0)).unwrap();
        c.heartbeat("p1", t(2000));
        assert!(c.expire_ownership(t(4000)).is_empty());

        let released = c.expire_ownership(t(5500));
        assert_eq!(released, vec![("x".to_string(), "p1".to_string())]);
        assert_eq!(c.owner_of("x"), None);
        c.acquire_ownership("p2", "x", t(5600)).unwrap();
        assert_eq!(c.ownership_churn().get("p1"), Some(&2));
    }

    #[test]
    fn release_by_non_owner_is_refused() {
        let mut c = coordinator();
        c.acquire_ownership("p1", "x", t(0)).unwrap();
        assert!(matches!(
            c.release_ownership("p2", "x", t(1)),
            Err(SyncError::NotOwner { .. })
        ));
        assert_eq!(c.release_all("p1", t(2)), vec!["x".to_string()]);
        assert_eq!(c.owner_of("x"), None);
    }

    #[test]
    fn correction_is_superseded_by_newer_participant_update() {
        let mut c = coordinator();
        c.acquire_ownership("p1", "x", t(0)).unwrap();
        let stale = op("x", c.get("x").unwrap().participant_revision);
        c.submit_update("p1", "x", at(1.0), 1, t(10)).unwrap();

        assert_eq!(c.apply_correction(&stale, t(20)), Ok(CorrectionOutcome::Superseded));
        assert_eq!(c.get("x").unwrap().pose, at(1.0));

        let fresh = op("x", c.get("x").unwrap().participant_revision);
        let outcome = c.apply_correction(&fresh, t(30)).unwrap();
        assert!(matches!(outcome, CorrectionOutcome::Applied { .. }));
        assert!((c.get("x").unwrap().pose.position().x - 1.01).abs() < 1e-12);
    }

    #[test]
    fn correction_preserves_rotation_and_scale() {
        let mut c = SyncCoordinator::new(OwnershipConfig::default(), 8);
        let rot = Quaternion::from_axis_angle(Vector3D::UP, 0.3);
        let pose = Pose::new(Vector3D::ZERO, rot).with_scale(Vector3D::new(2.0, 2.0, 2.0));
        c.register_object("s", pose, 0.5, t(0)).unwrap();
        c.apply_correction(&op("s", 0), t(1)).unwrap();

        let after = c.get("s").unwrap().pose;
        assert_eq!(after.scale(), Some(Vector3D::new(2.0, 2.0, 2.0)));
        assert!(after.rotation().angle_to(&rot) < 1e-9);
    }

    #[test]
    fn removal_publishes_and_keeps_sequences() {
        let mut c = coordinator();
        c.acquire_ownership("p1", "x", t(0)).unwrap();
        c.submit_update("p1", "x", at(1.0), 5, t(1)).unwrap();
        let mut rx = c.subscribe();

        let removed = c.remove_object("x", t(2)).unwrap();
        assert_eq!(removed.id, "x");
        let delta = rx.try_recv().unwrap();
        assert_eq!(delta.kind, DeltaKind::Removed);
        assert_eq!(delta.pose, None);
        assert!(c.is_empty());
        assert_eq!(
            c.apply_correction(&op("x", 1), t(3)),
            Err(SyncError::ObjectUnknown("x".to_string()))
        );

        // Same id registered again: an old redelivery is still stale
        c.register_object("x", Pose::IDENTITY, 0.5, t(4)).unwrap();
        c.acquire_ownership("p1", "x", t(5)).unwrap();
        assert!(matches!(
            c.submit_update("p1", "x", at(1.0), 5, t(6)),
            Err(SyncError::StaleSequence { last_accepted: 5, .. })
        ));
        assert_eq!(c.get("x").unwrap().pose, Pose::IDENTITY);
    }

    #[test]
    fn release_all_keeps_accepted_sequences() {
        let mut c = coordinator();
        c.acquire_ownership("p1", "x", t(0)).unwrap();
        c.submit_update("p1", "x", at(1.0), 7, t(1)).unwrap();
        c.submit_update("p1", "x", at(2.0), 8, t(2)).unwrap();
        c.release_all("p1", t(3));

        c.acquire_ownership("p1", "x", t(4)).unwrap();
        assert_eq!(
            c.submit_update("p1", "x", at(1.0), 7, t(5)),
            Err(SyncError::StaleSequence {
                object_id: "x".to_string(),
                submitted: 7,
                last_accepted: 8,
            })
        );
        assert_eq!(c.get("x").unwrap().pose, at(2.0));
    }

    #[test]
    fn ownership_change_clears_previous_owner_move_time() {
        let mut c = coordinator();
        c.acquire_ownership("p1", "x", t(0)).unwrap();
        c.submit_update("p1", "x", at(1.0), 1, t(10)).unwrap();
        assert_eq!(c.get("x").unwrap().last_owner_update_at, Some(t(10)));

        c.release_ownership("p1", "x", t(20)).unwrap();
        assert_eq!(c.get("x").unwrap().last_owner_update_at, None);

        c.acquire_ownership("p1", "x", t(30)).unwrap();
        c.submit_update("p1", "x", at(2.0), 2, t(40)).unwrap();
        c.expire_ownership(t(5000));
        assert_eq!(c.get("x").unwrap().last_owner_update_at, None);

        c.acquire_ownership("p2", "x", t(5010)).unwrap();
        assert_eq!(c.get("x").unwrap().last_owner_update_at, None);
    }
}
