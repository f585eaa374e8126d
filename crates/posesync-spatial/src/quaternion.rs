//! Unit quaternions for 3D rotations

use super::Vector3D;
use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// A quaternion for representing 3D rotations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    /// Identity quaternion (no rotation)
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Create a new quaternion (not normalized)
    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    /// Create a quaternion from axis-angle representation
    pub fn from_axis_angle(axis: Vector3D, angle_radians: f64) -> Self {
        let half_angle = angle_radians / 2.0;
        let sin_half = half_angle.sin();
        let normalized = axis.normalize();

        Self {
            x: normalized.x * sin_half,
            y: normalized.y * sin_half,
            z: normalized.z * sin_half,
            w: half_angle.cos(),
        }
    }

    /// Get the magnitude of the quaternion
    pub fn magnitude(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Normalize the quaternion; degenerate input collapses to identity
    pub fn normalize(&self) -> Self {
        let mag = self.magnitude();
        if mag > 0.0 && mag.is_finite() {
            Self {
                x: self.x / mag,
                y: self.y / mag,
                z: self.z / mag,
                w: self.w / mag,
            }
        } else {
            Self::IDENTITY
        }
    }

    /// Four-component dot product
    pub fn dot(&self, other: &Quaternion) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z + self.w * other.w
    }

    /// Get the conjugate of the quaternion
    pub fn conjugate(&self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
            z: -self.z,
            w: self.w,
        }
    }

    /// Get the inverse of the quaternion
    pub fn inverse(&self) -> Self {
        let mag_sq = self.dot(self);
        if mag_sq > 0.0 {
            let inv_mag_sq = 1.0 / mag_sq;
            Self {
                x: -self.x * inv_mag_sq,
                y: -self.y * inv_mag_sq,
                z: -self.z * inv_mag_sq,
                w: self.w * inv_mag_sq,
            }
        } else {
            Self::IDENTITY
        }
    }

    /// The same rotation with all components negated (q and -q are equivalent)
    pub fn negated(&self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
            z: -self.z,
            w: -self.w,
        }
    }

    /// Return whichever of `self` / `-self` lies in the hemisphere of `reference`
    pub fn aligned_with(&self, reference: &Quaternion) -> Self {
        if self.dot(reference) < 0.0 {
            self.negated()
        } else {
            *self
        }
    }

    /// Rotate a vector by this quaternion
    pub fn rotate_vector(&self, v: Vector3D) -> Vector3D {
        let q_vec = Vector3D::new(self.x, self.y, self.z);
        let uv = q_vec.cross(&v);
        let uuv = q_vec.cross(&uv);
        v + (uv * self.w + uuv) * 2.0
    }

    /// Geodesic angle between two rotations, in radians.
    ///
    /// `|dot|` is clamped to [0, 1] before `acos` so rounding never yields NaN,
    /// and antipodal quaternions compare as the same rotation. Near zero the
    /// equivalent `atan2` form of the relative rotation is used, since `acos`
    /// cannot resolve angles below ~1e-8 rad.
    pub fn angle_to(&self, other: &Quaternion) -> f64 {
        let a = self.normalize();
        let b = other.normalize();
        let dot = a.dot(&b).abs().clamp(0.0, 1.0);
        if dot < 0.9999 {
            return 2.0 * dot.acos();
        }
        let rel = a.conjugate() * b;
        let sin_half = (rel.x * rel.x + rel.y * rel.y + rel.z * rel.z).sqrt();
        2.0 * sin_half.atan2(rel.w.abs())
    }

    /// Rotation angle of this quaternion around its axis, in radians, in [0, PI]
    pub fn angle(&self) -> f64 {
        self.angle_to(&Quaternion::IDENTITY)
    }

    /// Spherical linear interpolation between two quaternions (shortest path)
    pub fn slerp(&self, other: &Quaternion, t: f64) -> Self {
        // Pick the sign of `other` with a positive dot product first
        let other = other.aligned_with(self);
        let dot = self.dot(&other).clamp(-1.0, 1.0);

        // If quaternions are very close, use linear interpolation
        if dot > 0.9995 {
            return Quaternion::new(
                self.x + t * (other.x - self.x),
                self.y + t * (other.y - self.y),
                self.z + t * (other.z - self.z),
                self.w + t * (other.w - self.w),
            )
            .normalize();
        }

        let theta_0 = dot.acos();
        let theta = theta_0 * t;
        let sin_theta = theta.sin();
        let sin_theta_0 = theta_0.sin();

        let s0 = theta.cos() - dot * sin_theta / sin_theta_0;
        let s1 = sin_theta / sin_theta_0;

        Quaternion::new(
            s0 * self.x + s1 * other.x,
            s0 * self.y + s1 * other.y,
            s0 * self.z + s1 * other.z,
            s0 * self.w + s1 * other.w,
        )
        .normalize()
    }

    /// True when every component is finite
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite()
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Quaternion {
    type Output = Quaternion;

    fn mul(self, rhs: Self) -> Self::Output {
        Quaternion::new(
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
        )
    }
}
