//! posesync-spatial: fixed-precision pose math for shared-space objects
//!
//! Uses a right-handed coordinate system, distances in meters:
//! - X: Right (+) / Left (-)
//! - Y: Up (+) / Down (-)
//! - Z: Forward (+) / Backward (-)
//!
//! Everything here is a pure value or a pure function; no shared state.

mod frame;
mod pose;
mod quaternion;
mod vector3d;

pub use frame::{FrameMismatch, FramedPose, ParticipantId, ReferenceFrame};
pub use pose::{compose, difference, inverse, lerp, slerp, Pose, PoseError};
pub use quaternion::Quaternion;
pub use vector3d::Vector3D;
