//! Per-participant anchoring of local tracking frames into the shared world

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use posesync_config::AnchorConfig;
use posesync_spatial::{compose, inverse, lerp, ParticipantId, Pose, Vector3D};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Where a participant is in the anchoring lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorState {
    /// Joined, but no correspondence yet; poses cannot be trusted
    Bootstrapping,
    /// An estimate exists
    Tracking,
}

/// Result of feeding one correspondence to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrespondenceOutcome {
    /// First correspondence; the estimate was created from it
    Bootstrapped,
    /// Blended into the running estimate
    Updated,
    /// Older than the staleness window; ignored
    Stale,
}

/// Mapping from one participant's tracking frame into SharedWorld
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorEstimate {
    /// `shared = compose(local_to_shared, local)`
    pub local_to_shared: Pose,
    /// Rate of change of the estimate over the drift window, meters/second
    pub drift_rate_mps: f64,
    /// Confidence in the estimate (0.0 to 1.0)
    pub confidence: f64,
    /// Observation time of the newest correspondence incorporated
    pub updated_at: DateTime<Utc>,
    /// Number of correspondences incorporated
    pub correspondences: u64,
}

#[derive(Debug, Default)]
struct ParticipantAnchor {
    estimate: Option<AnchorEstimate>,
    /// Recent estimate origins, oldest first
    history: VecDeque<(DateTime<Utc>, Vector3D)>,
}

/// Maintains an [`AnchorEstimate`] per participant.
///
/// The only writer of anchor estimates; other components read through
/// [`AnchorTracker::estimate`] and the conversion helpers.
#[derive(Debug)]
pub struct AnchorTracker {
    config: AnchorConfig,
    participants: HashMap<ParticipantId, ParticipantAnchor>,
}

impl AnchorTracker {
    pub fn new(config: AnchorConfig) -> Self {
        Self {
            config,
            participants: HashMap::new(),
        }
    }

    /// Start tracking a participant. Returns false if already known.
    pub fn join(&mut self, participant: &str) -> bool {
        if self.participants.contains_key(participant) {
            return false;
        }
        info!("Participant {} joined, bootstrapping anchor", participant);
        self.participants
            .insert(participant.to_string(), ParticipantAnchor::default());
        true
    }

    /// Forget a participant and destroy its estimate.
    pub fn leave(&mut self, participant: &str) -> bool {
        let removed = self.participants.remove(participant).is_some();
        if removed {
            info!("Participant {} left, anchor estimate dropped", participant);
        }
        removed
    }

    pub fn state(&self, participant: &str) -> Option<AnchorState> {
        self.participants.get(participant).map(|p| match p.estimate {
            Some(_) => AnchorState::Tracking,
            None => AnchorState::Bootstrapping,
        })
    }

    pub fn estimate(&self, participant: &str) -> Option<&AnchorEstimate> {
        self.participants
            .get(participant)
            .and_then(|p| p.estimate.as_ref())
    }

    pub fn participants(&self) -> impl Iterator<Item = &ParticipantId> {
        self.participants.keys()
    }

    /// Incorporate one observed correspondence between a pose in the
    /// participant's local frame and where it is known to be in SharedWorld.
    ///
    /// The new observation's weight grows with `hint_confidence`; the running
    /// estimate's weight halves every `decay_half_life_ms` since its last
    /// update, so recent correspondences dominate stale ones.
    pub fn update_correspondence(
        &mut self,
        participant: &str,
        local_pose: &Pose,
        shared_pose_hint: &Pose,
        hint_confidence: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<CorrespondenceOutcome> {
        if !local_pose.is_finite() || !shared_pose_hint.is_finite() {
            return Err(SyncError::InvalidPose(format!("anchor:{}", participant)));
        }
        self.join(participant);
        let half_life_ms = self.config.decay_half_life_ms as f64;
        let staleness_ms = self.config.staleness_window_ms as i64;
        let drift_window = self.config.drift_window;

        let Some(anchor) = self.participants.get_mut(participant) else {
            return Err(SyncError::UnknownParticipant(participant.to_string()));
        };

        let observed = compose(shared_pose_hint, &inverse(local_pose));
        let incoming = if hint_confidence.is_finite() {
            hint_confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let outcome = match anchor.estimate.as_mut() {
            None => {
                anchor.estimate = Some(AnchorEstimate {
                    local_to_shared: observed,
                    drift_rate_mps: 0.0,
                    confidence: incoming,
                    updated_at: observed_at,
                    correspondences: 1,
                });
                info!("Anchor for {} bootstrapped", participant);
                CorrespondenceOutcome::Bootstrapped
            }
            Some(estimate) => {
                let age_ms = (estimate.updated_at - observed_at).num_milliseconds();
                if age_ms > staleness_ms {
                    warn!(
                        "Dropping stale correspondence for {} ({} ms older than newest)",
                        participant, age_ms
                    );
                    return Ok(CorrespondenceOutcome::Stale);
                }

                let (retained, incoming) = if age_ms >= 0 {
                    // Out-of-order but still fresh: the observation itself decays
                    (estimate.confidence, incoming * decay(age_ms as f64, half_life_ms))
                } else {
                    let elapsed = -age_ms as f64;
                    (estimate.confidence * decay(elapsed, half_life_ms), incoming)
                };
                let total = retained + incoming;
                let alpha = if total > 0.0 { incoming / total } else { 1.0 };

                estimate.local_to_shared = lerp(&estimate.local_to_shared, &observed, alpha);
                estimate.confidence = 1.0 - (1.0 - retained) * (1.0 - incoming);
                if observed_at > estimate.updated_at {
                    estimate.updated_at = observed_at;
                }
                estimate.correspondences += 1;
                debug!(
                    "Anchor for {} updated (alpha {:.3}, confidence {:.3})",
                    participant, alpha, estimate.confidence
                );
                CorrespondenceOutcome::Updated
            }
        };

        if let Some(estimate) = anchor.estimate.as_mut() {
            anchor
                .history
                .push_back((estimate.updated_at, estimate.local_to_shared.position()));
            while anchor.history.len() > drift_window {
                anchor.history.pop_front();
            }
            estimate.drift_rate_mps = drift_rate(&anchor.history);
        }

        Ok(outcome)
    }

    /// Express a local-frame pose in SharedWorld.
    pub fn to_shared(&self, participant: &str, local_pose: &Pose) -> Result<Pose> {
        let estimate = self
            .estimate(participant)
            .ok_or_else(|| SyncError::UnknownParticipant(participant.to_string()))?;
        Ok(compose(&estimate.local_to_shared, local_pose))
    }

    /// Express a SharedWorld pose in the participant's local frame.
    pub fn to_local(&self, participant: &str, shared_pose: &Pose) -> Result<Pose> {
        let estimate = self
            .estimate(participant)
            .ok_or_else(|| SyncError::UnknownParticipant(participant.to_string()))?;
        Ok(compose(&inverse(&estimate.local_to_shared), shared_pose))
    }

    /// Drift rate of a participant's frame, if it has an estimate.
    pub fn estimated_drift_rate(&self, participant: &str) -> Option<f64> {
        self.estimate(participant).map(|e| e.drift_rate_mps)
    }

    /// Drift rate of every participant with an estimate.
    pub fn drift_rates(&self) -> HashMap<ParticipantId, f64> {
        self.participants
            .iter()
            .filter_map(|(id, p)| p.estimate.as_ref().map(|e| (id.clone(), e.drift_rate_mps)))
            .collect()
    }
}

fn decay(elapsed_ms: f64, half_life_ms: f64) -> f64 {
    0.5f64.powf(elapsed_ms / half_life_ms)
}

/// Path length of the estimate origin over the window, per second.
fn drift_rate(history: &VecDeque<(DateTime<Utc>, Vector3D)>) -> f64 {
    let (Some(first), Some(last)) = (history.front(), history.back()) else {
        return 0.0;
    };
    let span_secs = (last.0 - first.0).num_milliseconds() as f64 / 1000.0;
    if span_secs <= 0.0 {
        return 0.0;
    }
    let path: f64 = history
        .iter()
        .zip(history.iter().skip(1))
        .map(|((_, a), (_, b))| a.distance(b))
        .sum();
    path / span_secs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use posesync_spatial::{difference, Quaternion};
    use std::f64::consts::PI;

    fn tracker() -> AnchorTracker {
        AnchorTracker::new(AnchorConfig::default())
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn offset_frame() -> Pose {
        Pose::new(
            Vector3D::new(1.0, 0.0, -2.0),
            Quaternion::from_axis_angle(Vector3D::UP, PI / 2.0),
        )
    }

    #[test]
    fn bootstrapping_participant_cannot_convert() {
        let mut anchors = tracker();
        anchors.join("p1");
        assert_eq!(anchors.state("p1"), Some(AnchorState::Bootstrapping));
        assert_eq!(
            anchors.to_shared("p1", &Pose::IDENTITY),
            Err(SyncError::UnknownParticipant("p1".to_string()))
        );
        assert!(anchors.to_shared("nobody", &Pose::IDENTITY).is_err());
    }

    #[test]
    fn first_correspondence_recovers_frame() {
        let mut anchors = tracker();
        let frame = offset_frame();
        let local = Pose::from_position(Vector3D::new(0.3, 1.2, 0.5));
        let shared = compose(&frame, &local);

        let outcome = anchors
            .update_correspondence("p1", &local, &shared, 0.9, t0())
            .unwrap();
        assert_eq!(outcome, CorrespondenceOutcome::Bootstrapped);
        assert_eq!(anchors.state("p1"), Some(AnchorState::Tracking));

        let probe = Pose::from_position(Vector3D::new(-0.4, 0.0, 0.7));
        let converted = anchors.to_shared("p1", &probe).unwrap();
        let err = difference(&converted, &compose(&frame, &probe));
        assert!(err.position_error_m < 1e-9);
        assert!(err.rotation_error_deg < 1e-6);

        let back = anchors.to_local("p1", &converted).unwrap();
        assert!(difference(&back, &probe).position_error_m < 1e-9);
    }

    #[test]
    fn recent_correspondence_dominates_stale_estimate() {
        let mut anchors = tracker();
        let local = Pose::IDENTITY;
        let old = Pose::from_position(Vector3D::new(0.0, 0.0, 0.0));
        let new = Pose::from_position(Vector3D::new(0.1, 0.0, 0.0));

        anchors
            .update_correspondence("p1", &local, &old, 1.0, t0())
            .unwrap();
        // Ten half-lives later the old estimate carries almost no weight
        anchors
            .update_correspondence("p1", &local, &new, 0.5, t0() + Duration::seconds(10))
            .unwrap();

        let estimate = anchors.estimate("p1").unwrap();
        assert!((estimate.local_to_shared.position().x - 0.1).abs() < 1e-3);
        assert_eq!(estimate.correspondences, 2);
    }

    #[test]
    fn simultaneous_correspondences_blend_by_confidence() {
        let mut anchors = tracker();
        let local = Pose::IDENTITY;
        anchors
            .update_correspondence("p1", &local, &Pose::IDENTITY, 1.0, t0())
            .unwrap();
        anchors
            .update_correspondence(
                "p1",
                &local,
                &Pose::from_position(Vector3D::new(0.2, 0.0, 0.0)),
                1.0,
                t0(),
            )
            .unwrap();
        let x = anchors.estimate("p1").unwrap().local_to_shared.position().x;
        assert!((x - 0.1).abs() < 1e-12);
    }

    #[test]
    fn correspondence_beyond_staleness_window_is_dropped() {
        let mut anchors = tracker();
        let later = t0() + Duration::seconds(60);
        anchors
            .update_correspondence("p1", &Pose::IDENTITY, &Pose::IDENTITY, 1.0, later)
            .unwrap();
        let outcome = anchors
            .update_correspondence(
                "p1",
                &Pose::IDENTITY,
                &Pose::from_position(Vector3D::new(5.0, 0.0, 0.0)),
                1.0,
                t0(),
            )
            .unwrap();
        assert_eq!(outcome, CorrespondenceOutcome::Stale);
        assert_eq!(
            anchors.estimate("p1").unwrap().local_to_shared.position(),
            Vector3D::ZERO
        );
    }

    #[test]
    fn drift_rate_tracks_moving_estimate() {
        let mut anchors = tracker();
        // Estimate walks 1 mm per 100 ms, fully trusted each time
        for i in 0..10 {
            let shared = Pose::from_position(Vector3D::new(0.001 * i as f64, 0.0, 0.0));
            anchors
                .update_correspondence(
                    "p1",
                    &Pose::IDENTITY,
                    &shared,
                    1.0,
                    t0() + Duration::milliseconds(100 * i),
                )
                .unwrap();
        }
        let rate = anchors.estimated_drift_rate("p1").unwrap();
        assert!(rate > 0.005 && rate < 0.011, "rate {}", rate);
        assert!(anchors.drift_rates().contains_key("p1"));
    }

    #[test]
    fn drift_window_is_bounded() {
        let mut config = AnchorConfig::default();
        config.drift_window = 3;
        let mut anchors = AnchorTracker::new(config);
        for i in 0..10 {
            anchors
                .update_correspondence(
                    "p1",
                    &Pose::IDENTITY,
                    &Pose::IDENTITY,
                    1.0,
                    t0() + Duration::milliseconds(10 * i),
                )
                .unwrap();
        }
        assert_eq!(anchors.participants.get("p1").unwrap().history.len(), 3);
        assert_eq!(anchors.estimated_drift_rate("p1"), Some(0.0));
    }

    #[test]
    fn leave_destroys_estimate() {
        let mut anchors = tracker();
        anchors
            .update_correspondence("p1", &Pose::IDENTITY, &Pose::IDENTITY, 1.0, t0())
            .unwrap();
        assert!(anchors.leave("p1"));
        assert!(!anchors.leave("p1"));
        assert_eq!(anchors.state("p1"), None);
        assert!(anchors.estimate("p1").is_none());
    }
}
