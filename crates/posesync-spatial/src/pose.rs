//! Pose representation (position, rotation and optional scale) and the pure
//! functions used to compare and blend poses.

use super::{Quaternion, Vector3D};
use serde::{Deserialize, Serialize};

/// An immutable rigid pose in 3D space.
///
/// The rotation is re-normalized on construction and after every composition,
/// so a `Pose` never carries a denormalized quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "PoseRepr", into = "PoseRepr")]
pub struct Pose {
    position: Vector3D,
    rotation: Quaternion,
    scale: Option<Vector3D>,
}

/// Wire shape of a pose; normalized on the way in.
#[derive(Serialize, Deserialize)]
struct PoseRepr {
    position: Vector3D,
    rotation: Quaternion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scale: Option<Vector3D>,
}

impl From<PoseRepr> for Pose {
    fn from(repr: PoseRepr) -> Self {
        let pose = Pose::new(repr.position, repr.rotation);
        match repr.scale {
            Some(scale) => pose.with_scale(scale),
            None => pose,
        }
    }
}

impl From<Pose> for PoseRepr {
    fn from(pose: Pose) -> Self {
        Self {
            position: pose.position,
            rotation: pose.rotation,
            scale: pose.scale,
        }
    }
}

/// Measured disagreement between two poses.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseError {
    /// Euclidean distance between the two origins, in meters
    pub position_error_m: f64,
    /// Geodesic angle between the two rotations, in degrees
    pub rotation_error_deg: f64,
}

impl Pose {
    /// Identity pose (origin, no rotation, no scale)
    pub const IDENTITY: Self = Self {
        position: Vector3D::ZERO,
        rotation: Quaternion::IDENTITY,
        scale: None,
    };

    /// Create a pose; the rotation is normalized
    pub fn new(position: Vector3D, rotation: Quaternion) -> Self {
        Self {
            position,
            rotation: rotation.normalize(),
            scale: None,
        }
    }

    /// Create a pose with just position
    pub fn from_position(position: Vector3D) -> Self {
        Self::new(position, Quaternion::IDENTITY)
    }

    /// Attach a scale
    pub fn with_scale(mut self, scale: Vector3D) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn position(&self) -> Vector3D {
        self.position
    }

    pub fn rotation(&self) -> Quaternion {
        self.rotation
    }

    pub fn scale(&self) -> Option<Vector3D> {
        self.scale
    }

    /// Scale, treating a missing scale as unit scale
    pub fn effective_scale(&self) -> Vector3D {
        self.scale.unwrap_or(Vector3D::ONE)
    }

    /// A pose with every component finite and, if present, a non-zero scale
    pub fn is_finite(&self) -> bool {
        let scale_ok = self
            .scale
            .map(|s| s.is_finite() && s.x != 0.0 && s.y != 0.0 && s.z != 0.0)
            .unwrap_or(true);
        self.position.is_finite() && self.rotation.is_finite() && scale_ok
    }

    /// Transform a point from this pose's local space into its parent space
    pub fn transform_point(&self, local: Vector3D) -> Vector3D {
        let scaled = local.component_mul(&self.effective_scale());
        self.position + self.rotation.rotate_vector(scaled)
    }

    /// Apply `other` in this pose's frame (see [`compose`])
    pub fn compose(&self, other: &Pose) -> Pose {
        compose(self, other)
    }

    /// See [`inverse`]
    pub fn inverse(&self) -> Pose {
        inverse(self)
    }

    /// See [`difference`]
    pub fn difference(&self, other: &Pose) -> PoseError {
        difference(self, other)
    }

    /// See [`lerp`]
    pub fn lerp(&self, other: &Pose, t: f64) -> Pose {
        lerp(self, other, t)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Apply `b` in `a`'s frame. Associative (for uniform scale), not commutative.
pub fn compose(a: &Pose, b: &Pose) -> Pose {
    let scale = match (a.scale, b.scale) {
        (None, None) => None,
        _ => Some(a.effective_scale().component_mul(&b.effective_scale())),
    };
    Pose {
        position: a.transform_point(b.position),
        rotation: (a.rotation * b.rotation).normalize(),
        scale,
    }
}

/// The pose `q` such that `compose(p, q)` is the identity.
pub fn inverse(p: &Pose) -> Pose {
    let rotation = p.rotation.conjugate();
    let inv_scale = p.scale.map(|s| s.recip());
    let unrotated = rotation.rotate_vector(p.position);
    let position = -unrotated.component_mul(&inv_scale.unwrap_or(Vector3D::ONE));
    Pose {
        position,
        rotation,
        scale: inv_scale,
    }
}

/// Position and rotation error between two poses expressed in the same frame.
pub fn difference(a: &Pose, b: &Pose) -> PoseError {
    PoseError {
        position_error_m: a.position.distance(&b.position),
        rotation_error_deg: a.rotation.angle_to(&b.rotation).to_degrees(),
    }
}

/// Blend two poses: linear in position and scale, spherical in rotation.
pub fn lerp(a: &Pose, b: &Pose, t: f64) -> Pose {
    let scale = match (a.scale, b.scale) {
        (None, None) => None,
        _ => Some(a.effective_scale().lerp(&b.effective_scale(), t)),
    };
    Pose {
        position: a.position.lerp(&b.position, t),
        rotation: slerp(&a.rotation, &b.rotation, t),
        scale,
    }
}

/// Shortest-path spherical interpolation between two rotations.
pub fn slerp(a: &Quaternion, b: &Quaternion, t: f64) -> Quaternion {
    a.slerp(b, t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::f64::consts::PI;

    fn random_pose(rng: &mut StdRng, with_scale: bool) -> Pose {
        let position = Vector3D::new(
            rng.gen_range(-10.0..10.0),
            rng.gen_range(-10.0..10.0),
            rng.gen_range(-10.0..10.0),
        );
        let rotation = Quaternion::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        );
        let pose = Pose::new(position, rotation);
        if with_scale {
            pose.with_scale(Vector3D::new(
                rng.gen_range(0.5..2.0),
                rng.gen_range(0.5..2.0),
                rng.gen_range(0.5..2.0),
            ))
        } else {
            pose
        }
    }

    fn assert_identity(p: &Pose, eps: f64) {
        assert!(p.position().magnitude() < eps, "position {:?}", p.position());
        assert!(p.rotation().angle() < 1e-6, "rotation {:?}", p.rotation());
        if let Some(scale) = p.scale() {
            assert!((scale - Vector3D::ONE).magnitude() < eps);
        }
    }

    #[test]
    fn compose_with_inverse_is_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..1000 {
            let p = random_pose(&mut rng, i % 2 == 0);
            let round_trip = compose(&p, &inverse(&p));
            assert_identity(&round_trip, 1e-9);
            assert!(round_trip.position().magnitude() < 1e-9);
        }
    }

    #[test]
    fn compose_is_associative() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let a = random_pose(&mut rng, false);
            let b = random_pose(&mut rng, false);
            let c = random_pose(&mut rng, false);
            let left = compose(&compose(&a, &b), &c);
            let right = compose(&a, &compose(&b, &c));
            let err = difference(&left, &right);
            assert!(err.position_error_m < 1e-9);
            assert!(err.rotation_error_deg < 1e-6);
        }
    }

    #[test]
    fn compose_is_not_commutative() {
        let a = Pose::new(
            Vector3D::new(1.0, 0.0, 0.0),
            Quaternion::from_axis_angle(Vector3D::UP, PI / 2.0),
        );
        let b = Pose::from_position(Vector3D::new(0.0, 0.0, 1.0));
        let ab = compose(&a, &b);
        let ba = compose(&b, &a);
        assert!(difference(&ab, &ba).position_error_m > 0.5);
    }

    #[test]
    fn rotation_stays_normalized_after_composition() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut acc = Pose::IDENTITY;
        for _ in 0..10_000 {
            acc = compose(&acc, &random_pose(&mut rng, false));
        }
        assert!((acc.rotation().magnitude() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn difference_measures_distance_and_angle() {
        let a = Pose::from_position(Vector3D::ZERO);
        let b = Pose::new(
            Vector3D::new(0.003, 0.004, 0.0),
            Quaternion::from_axis_angle(Vector3D::FORWARD, PI / 2.0),
        );
        let err = difference(&a, &b);
        assert!((err.position_error_m - 0.005).abs() < 1e-12);
        assert!((err.rotation_error_deg - 90.0).abs() < 1e-9);
    }

    #[test]
    fn difference_treats_antipodal_rotation_as_equal() {
        let q = Quaternion::from_axis_angle(Vector3D::RIGHT, 0.7);
        let a = Pose::new(Vector3D::ZERO, q);
        let b = Pose::new(Vector3D::ZERO, q.negated());
        assert!(difference(&a, &b).rotation_error_deg < 1e-6);
    }

    #[test]
    fn lerp_midpoint() {
        let a = Pose::from_position(Vector3D::ZERO);
        let b = Pose::new(
            Vector3D::new(0.0, 0.0, 0.02),
            Quaternion::from_axis_angle(Vector3D::UP, 0.4),
        );
        let mid = lerp(&a, &b, 0.5);
        assert!((mid.position().z - 0.01).abs() < 1e-12);
        let expected = Quaternion::from_axis_angle(Vector3D::UP, 0.2);
        assert!(mid.rotation().angle_to(&expected) < 1e-9);
        assert_eq!(mid.scale(), None);
    }

    #[test]
    fn transform_point_applies_scale_then_rotation() {
        let pose = Pose::new(
            Vector3D::new(10.0, 0.0, 0.0),
            Quaternion::from_axis_angle(Vector3D::UP, PI / 2.0),
        )
        .with_scale(Vector3D::new(2.0, 2.0, 2.0));
        let world = pose.transform_point(Vector3D::FORWARD);
        assert!((world.x - 12.0).abs() < 1e-12);
        assert!(world.z.abs() < 1e-12);
    }

    #[test]
    fn deserialized_rotation_is_normalized() {
        let json = r#"{"position":{"x":0.0,"y":0.0,"z":0.0},"rotation":{"x":0.0,"y":0.0,"z":0.0,"w":2.0}}"#;
        let pose: Pose = serde_json::from_str(json).unwrap();
        assert_eq!(pose.rotation(), Quaternion::IDENTITY);
        assert_eq!(pose.scale(), None);
    }
}
