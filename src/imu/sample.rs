use nalgebra::{UnitQuaternion, Vector3};

/// Nominal inertial rate the tracker is tuned for (Hz).
pub const INERTIAL_RATE_HZ: f64 = 100.0;

/// Single inertial measurement as delivered by the motion sensor.
///
/// `accel` is user acceleration (gravity already removed) in the body frame,
/// m/s². `orientation` is the sensor-fused attitude of the body in the world
/// frame, used to rotate `accel` before integration.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub timestamp_s: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    /// Integration step since the previous sample (seconds).
    pub dt: f64,
}

impl ImuSample {
    pub fn new(
        timestamp_s: f64,
        accel: Vector3<f64>,
        gyro: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
        dt: f64,
    ) -> Self {
        Self {
            timestamp_s,
            accel,
            gyro,
            orientation,
            dt,
        }
    }

    /// Acceleration rotated into the world frame.
    #[inline]
    pub fn world_accel(&self) -> Vector3<f64> {
        self.orientation * self.accel
    }
}
