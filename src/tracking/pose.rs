//! Pose published by the tracker.

use nalgebra::{Matrix4, Vector3};

use crate::geometry::SE3;
use crate::tracking::TrackingQuality;

/// Device pose relative to the tracker origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub timestamp_s: f64,
    /// Device-to-origin homogeneous transform.
    pub transform: Matrix4<f64>,
    /// Linear velocity in the origin frame (m/s).
    pub velocity: Vector3<f64>,
    /// Body angular velocity (rad/s).
    pub angular_velocity: Vector3<f64>,
    pub quality: TrackingQuality,
    /// True when derived purely from inertial dead reckoning.
    pub origin_only: bool,
}

impl Pose {
    /// Pose at the origin with zero motion.
    pub fn origin(timestamp_s: f64, quality: TrackingQuality) -> Self {
        Self {
            timestamp_s,
            transform: Matrix4::identity(),
            velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            quality,
            origin_only: true,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(
            self.transform[(0, 3)],
            self.transform[(1, 3)],
            self.transform[(2, 3)],
        )
    }

    pub fn se3(&self) -> SE3 {
        SE3::from_matrix(self.transform)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::origin(0.0, TrackingQuality::Unavailable)
    }
}
