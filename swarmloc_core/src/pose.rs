// swarmloc_core/src/pose.rs

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use std::f64::consts::{PI, TAU};
use std::fmt;
use std::ops::Mul;

/// Wraps an angle into (-π, π].
pub fn wrap_angle(angle: f64) -> f64 {
    let a = angle % TAU;
    if a > PI {
        a - TAU
    } else if a <= -PI {
        a + TAU
    } else {
        a
    }
}

/// A rigid-body pose: position plus attitude.
///
/// Estimates in the pose graph only carry yaw (roll and pitch are observable
/// from gravity and taken from odometry), so most algebra here is done on the
/// yaw-only projection. A full attitude is kept for odometry poses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    position: Vector3<f64>,
    attitude: UnitQuaternion<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub fn new(position: Vector3<f64>, attitude: UnitQuaternion<f64>) -> Self {
        Self { position, attitude }
    }

    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    /// A pose whose attitude is a pure rotation about the z axis.
    pub fn from_xyz_yaw(position: Vector3<f64>, yaw: f64) -> Self {
        Self::new(
            position,
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), wrap_angle(yaw)),
        )
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self::new(iso.translation.vector, iso.rotation)
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.attitude)
    }

    pub fn position(&self) -> &Vector3<f64> {
        &self.position
    }

    pub fn attitude(&self) -> &UnitQuaternion<f64> {
        &self.attitude
    }

    pub fn set_position(&mut self, position: Vector3<f64>) {
        self.position = position;
    }

    pub fn set_attitude(&mut self, attitude: UnitQuaternion<f64>) {
        self.attitude = attitude;
    }

    /// Heading angle in (-π, π].
    pub fn yaw(&self) -> f64 {
        wrap_angle(self.attitude.euler_angles().2)
    }

    /// Drops roll and pitch, keeping position and yaw.
    pub fn set_yaw_only(&mut self) {
        self.attitude = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), self.yaw());
    }

    pub fn yaw_only(&self) -> Self {
        let mut p = *self;
        p.set_yaw_only();
        p
    }

    pub fn inverse(&self) -> Self {
        Self::from_isometry(&self.to_isometry().inverse())
    }

    /// The pose of `b` expressed in the frame of `a`, i.e. `a⁻¹ * b`.
    /// With `yaw_only` both poses are projected to position + yaw first.
    pub fn delta_pose(a: &Pose, b: &Pose, yaw_only: bool) -> Pose {
        if yaw_only {
            a.yaw_only().inverse() * b.yaw_only()
        } else {
            a.inverse() * *b
        }
    }

    /// Flat `[x, y, z, yaw]` parameter vector.
    pub fn to_xyzyaw(&self) -> [f64; 4] {
        [self.position.x, self.position.y, self.position.z, self.yaw()]
    }

    /// Rebuilds a yaw-only pose from the first four entries of a parameter block.
    pub fn from_xyzyaw(p: &[f64]) -> Self {
        Self::from_xyz_yaw(Vector3::new(p[0], p[1], p[2]), p[3])
    }
}

impl Mul for Pose {
    type Output = Pose;

    fn mul(self, rhs: Pose) -> Pose {
        Pose::from_isometry(&(self.to_isometry() * rhs.to_isometry()))
    }
}

impl Mul for &Pose {
    type Output = Pose;

    fn mul(self, rhs: &Pose) -> Pose {
        *self * *rhs
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.3}, {:.3}, {:.3}] yaw {:.2}deg",
            self.position.x,
            self.position.y,
            self.position.z,
            self.yaw().to_degrees()
        )
    }
}
