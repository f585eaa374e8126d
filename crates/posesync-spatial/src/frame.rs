//! Coordinate frames a pose can be expressed in

use super::Pose;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a session participant (one headset / client).
pub type ParticipantId = String;

/// The coordinate space a [`Pose`] is expressed in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceFrame {
    /// The single authoritative frame shared by every participant
    SharedWorld,
    /// A participant's own tracking origin
    LocalTracking(ParticipantId),
}

impl fmt::Display for ReferenceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceFrame::SharedWorld => write!(f, "shared-world"),
            ReferenceFrame::LocalTracking(participant) => write!(f, "local:{}", participant),
        }
    }
}

/// Raised when a pose is used in a frame other than the one required.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("pose is expressed in {actual}, expected {expected}")]
pub struct FrameMismatch {
    pub expected: ReferenceFrame,
    pub actual: ReferenceFrame,
}

/// A pose tagged with the frame it is expressed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramedPose {
    pub frame: ReferenceFrame,
    pub pose: Pose,
}

impl FramedPose {
    pub fn shared(pose: Pose) -> Self {
        Self {
            frame: ReferenceFrame::SharedWorld,
            pose,
        }
    }

    pub fn local(participant: impl Into<ParticipantId>, pose: Pose) -> Self {
        Self {
            frame: ReferenceFrame::LocalTracking(participant.into()),
            pose,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.frame == ReferenceFrame::SharedWorld
    }

    /// Unwrap the pose, refusing anything not already in `SharedWorld`.
    ///
    /// Poses are only ever compared or corrected in the shared frame.
    pub fn into_shared(self) -> Result<Pose, FrameMismatch> {
        match self.frame {
            ReferenceFrame::SharedWorld => Ok(self.pose),
            actual => Err(FrameMismatch {
                expected: ReferenceFrame::SharedWorld,
                actual,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vector3D;

    #[test]
    fn shared_pose_unwraps() {
        let pose = Pose::from_position(Vector3D::new(1.0, 2.0, 3.0));
        assert_eq!(FramedPose::shared(pose).into_shared(), Ok(pose));
    }

    #[test]
    fn local_pose_is_refused() {
        let framed = FramedPose::local("p1", Pose::IDENTITY);
        let err = framed.into_shared().unwrap_err();
        assert_eq!(
            err.actual,
            ReferenceFrame::LocalTracking("p1".to_string())
        );
        assert_eq!(
            err.to_string(),
            "pose is expressed in local:p1, expected shared-world"
        );
    }
}
