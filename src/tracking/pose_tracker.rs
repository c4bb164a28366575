//! Inertial + visual pose fusion.
//!
//! Two independent streams feed the tracker:
//! - inertial samples at ~100 Hz, integrated by Euler dead reckoning with
//!   velocity damping to bound runaway drift
//! - visual poses at frame rate, which are trusted as-is and also used to
//!   estimate a smoothed drift offset for the inertial estimate
//!
//! Between visual poses the tracker publishes the drift-corrected inertial
//! pose tagged `origin_only`. All state sits behind one mutex so the two
//! streams may arrive from different threads.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use nalgebra::{Matrix4, UnitQuaternion, Vector3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::geometry::SE3;
use crate::imu::ImuSample;
use crate::tracking::{Pose, TrackingQuality};

/// Per-subscriber buffer. Slow subscribers miss poses rather than stall
/// the inertial lane.
const POSE_CHANNEL_CAPACITY: usize = 256;

/// Tuning for the pose tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Fraction of the observed drift folded into the offset per visual pose.
    pub correction_factor: f64,
    /// Fraction of velocity removed per inertial step.
    pub velocity_damping: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            correction_factor: 0.1,
            velocity_damping: 0.02,
        }
    }
}

struct TrackerState {
    running: bool,

    /// Reference transform (world frame); published poses are relative to it.
    origin: SE3,
    origin_inv: SE3,

    /// Dead-reckoned position and velocity in the origin frame.
    position: Vector3<f64>,
    velocity: Vector3<f64>,
    angular_velocity: Vector3<f64>,
    /// Latest inertial attitude in the origin frame.
    attitude: UnitQuaternion<f64>,

    /// Smoothed correction applied to the inertial position.
    drift_offset: Vector3<f64>,

    /// Latest visual pose, world frame.
    last_visual: Option<SE3>,
    quality: TrackingQuality,
    clock_s: f64,

    current: Pose,
    subscribers: Vec<Sender<Pose>>,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            running: false,
            origin: SE3::identity(),
            origin_inv: SE3::identity(),
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            attitude: UnitQuaternion::identity(),
            drift_offset: Vector3::zeros(),
            last_visual: None,
            quality: TrackingQuality::Unavailable,
            clock_s: 0.0,
            current: Pose::default(),
            subscribers: Vec::new(),
        }
    }

    fn publish(&mut self, pose: Pose) {
        self.current = pose;
        self.subscribers
            .retain(|tx| !matches!(tx.try_send(pose), Err(TrySendError::Disconnected(_))));
    }
}

/// Fuses inertial and visual input into a continuous pose stream.
pub struct PoseTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
}

impl PoseTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState::new()),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Begin accepting samples.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if !state.running {
            state.running = true;
            info!("Pose tracker started");
        }
    }

    /// Stop accepting samples. The last pose stays readable.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.running {
            state.running = false;
            info!("Pose tracker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Redefine the origin as the latest visual pose and zero the integrator.
    pub fn reset_origin(&self) {
        let mut state = self.state.lock();
        state.origin = state.last_visual.unwrap_or_else(SE3::identity);
        state.origin_inv = state.origin.inverse();
        state.position = Vector3::zeros();
        state.velocity = Vector3::zeros();
        state.angular_velocity = Vector3::zeros();
        state.attitude = UnitQuaternion::identity();
        state.drift_offset = Vector3::zeros();

        let pose = Pose::origin(state.clock_s, state.quality);
        state.publish(pose);
        debug!("Pose tracker origin reset at t={:.3}", state.clock_s);
    }

    /// Integrate one inertial sample.
    pub fn ingest_inertial_sample(&self, sample: &ImuSample) {
        if sample.dt <= 0.0
            || !sample.dt.is_finite()
            || !sample.accel.iter().chain(sample.gyro.iter()).all(|v| v.is_finite())
        {
            return;
        }

        let mut state = self.state.lock();
        if !state.running {
            return;
        }

        let accel = state.origin_inv.rotation * sample.world_accel();
        let dt = sample.dt;

        state.velocity += accel * dt;
        state.velocity *= 1.0 - self.config.velocity_damping;
        let step = state.velocity * dt;
        state.position += step;
        state.angular_velocity = sample.gyro;
        state.attitude = state.origin_inv.rotation * sample.orientation;
        state.clock_s = if sample.timestamp_s > 0.0 {
            sample.timestamp_s
        } else {
            state.clock_s + dt
        };

        let corrected = SE3::from_rt(state.attitude, state.position + state.drift_offset);
        let pose = Pose {
            timestamp_s: state.clock_s,
            transform: corrected.to_matrix(),
            velocity: state.velocity,
            angular_velocity: state.angular_velocity,
            quality: state.quality,
            origin_only: true,
        };
        state.publish(pose);
    }

    /// Apply a visual pose (world frame camera-to-world transform).
    ///
    /// Poses with a non-finite transform or timestamp are dropped.
    ///
    /// The visual pose is published directly; the drift between it and the
    /// corrected inertial estimate is only partially folded into the offset
    /// so inertial poses never jump.
    pub fn ingest_visual_pose(
        &self,
        transform: &Matrix4<f64>,
        timestamp_s: f64,
        quality: TrackingQuality,
    ) {
        if !timestamp_s.is_finite() || !transform.iter().all(|v| v.is_finite()) {
            warn!("Ignoring non-finite visual pose at t={}", timestamp_s);
            return;
        }

        let mut state = self.state.lock();
        if !state.running {
            return;
        }

        let world = SE3::from_matrix(*transform);
        let relative = state.origin_inv.compose(&world);

        let drift = relative.translation - (state.position + state.drift_offset);
        state.drift_offset += drift * self.config.correction_factor;

        state.last_visual = Some(world);
        state.quality = quality;
        state.clock_s = timestamp_s;

        let pose = Pose {
            timestamp_s,
            transform: relative.to_matrix(),
            velocity: state.velocity,
            angular_velocity: state.angular_velocity,
            quality,
            origin_only: false,
        };
        state.publish(pose);
    }

    /// Latest published pose.
    pub fn current_pose(&self) -> Pose {
        self.state.lock().current
    }

    pub fn drift_offset(&self) -> Vector3<f64> {
        self.state.lock().drift_offset
    }

    pub fn quality(&self) -> TrackingQuality {
        self.state.lock().quality
    }

    /// Receive every pose published from now on.
    pub fn subscribe(&self) -> Receiver<Pose> {
        let (tx, rx) = bounded(POSE_CHANNEL_CAPACITY);
        self.state.lock().subscribers.push(tx);
        rx
    }
}

impl Default for PoseTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(accel: Vector3<f64>, dt: f64) -> ImuSample {
        ImuSample::new(0.0, accel, Vector3::zeros(), UnitQuaternion::identity(), dt)
    }

    fn translation(x: f64, y: f64, z: f64) -> Matrix4<f64> {
        Matrix4::new_translation(&Vector3::new(x, y, z))
    }

    #[test]
    fn test_ignores_samples_while_stopped() {
        let tracker = PoseTracker::default();
        tracker.ingest_inertial_sample(&sample(Vector3::new(1.0, 0.0, 0.0), 0.01));
        tracker.ingest_visual_pose(&translation(1.0, 0.0, 0.0), 1.0, TrackingQuality::Normal);

        let pose = tracker.current_pose();
        assert_eq!(pose.position(), Vector3::zeros());
        assert_eq!(pose.quality, TrackingQuality::Unavailable);
    }

    #[test]
    fn test_dead_reckoning_with_damping() {
        let tracker = PoseTracker::default();
        tracker.start();

        tracker.ingest_inertial_sample(&sample(Vector3::new(1.0, 0.0, 0.0), 0.01));
        let pose = tracker.current_pose();

        // v = (0 + 1 * 0.01) * 0.98, p = v * 0.01
        assert_relative_eq!(pose.velocity.x, 0.0098, epsilon = 1e-12);
        assert_relative_eq!(pose.position().x, 0.000098, epsilon = 1e-12);
        assert!(pose.origin_only);
    }

    #[test]
    fn test_damping_bounds_velocity_without_input() {
        let tracker = PoseTracker::default();
        tracker.start();
        tracker.ingest_inertial_sample(&sample(Vector3::new(10.0, 0.0, 0.0), 0.01));
        let v0 = tracker.current_pose().velocity.norm();

        for _ in 0..200 {
            tracker.ingest_inertial_sample(&sample(Vector3::zeros(), 0.01));
        }
        let v1 = tracker.current_pose().velocity.norm();
        assert!(v1 < v0 * 0.05, "velocity should decay, got {} -> {}", v0, v1);
    }

    #[test]
    fn test_orientation_rotates_acceleration() {
        let tracker = PoseTracker::default();
        tracker.start();
        let yaw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f64::consts::FRAC_PI_2);
        tracker.ingest_inertial_sample(&ImuSample::new(
            0.0,
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::zeros(),
            yaw,
            0.01,
        ));

        let v = tracker.current_pose().velocity;
        assert_relative_eq!(v.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(v.z, -0.0098, epsilon = 1e-12);
    }

    #[test]
    fn test_visual_pose_published_directly() {
        let tracker = PoseTracker::default();
        tracker.start();
        tracker.ingest_visual_pose(&translation(2.0, 0.0, 1.0), 0.5, TrackingQuality::Normal);

        let pose = tracker.current_pose();
        assert!(!pose.origin_only);
        assert_eq!(pose.quality, TrackingQuality::Normal);
        assert_relative_eq!(pose.position(), Vector3::new(2.0, 0.0, 1.0), epsilon = 1e-12);
        assert_relative_eq!(pose.timestamp_s, 0.5);
    }

    #[test]
    fn test_drift_correction_is_smooth() {
        let config = TrackerConfig::default();
        let tracker = PoseTracker::new(config.clone());
        tracker.start();

        for step in 0..20 {
            // No inertial input, so the corrected inertial estimate is the offset itself.
            let before = tracker.drift_offset();
            let visual = Vector3::new(1.0 + step as f64 * 0.1, 0.0, -0.5);
            let drift = visual - before;

            tracker.ingest_visual_pose(
                &translation(visual.x, visual.y, visual.z),
                step as f64,
                TrackingQuality::Normal,
            );
            let jump = (tracker.drift_offset() - before).norm();
            assert!(
                jump <= config.correction_factor * drift.norm() + 1e-12,
                "jump {} exceeds bound {}",
                jump,
                config.correction_factor * drift.norm()
            );
        }
    }

    #[test]
    fn test_drift_offset_converges_to_visual() {
        let tracker = PoseTracker::default();
        tracker.start();
        for i in 0..200 {
            tracker.ingest_visual_pose(&translation(1.0, 0.0, 0.0), i as f64, TrackingQuality::High);
        }
        assert_relative_eq!(tracker.drift_offset(), Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-6);

        // Inertial pose now sits on the visual estimate instead of jumping back.
        tracker.ingest_inertial_sample(&sample(Vector3::zeros(), 0.01));
        let pose = tracker.current_pose();
        assert!(pose.origin_only);
        assert_relative_eq!(pose.position().x, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_non_finite_visual_pose_is_ignored() {
        let tracker = PoseTracker::default();
        tracker.start();
        tracker.ingest_visual_pose(&translation(1.0, 0.0, 0.0), 1.0, TrackingQuality::Normal);

        let mut bad = translation(2.0, 0.0, 0.0);
        bad[(0, 3)] = f64::NAN;
        tracker.ingest_visual_pose(&bad, 2.0, TrackingQuality::Normal);
        tracker.ingest_visual_pose(&translation(2.0, 0.0, 0.0), f64::INFINITY, TrackingQuality::Normal);
        assert_relative_eq!(tracker.current_pose().timestamp_s, 1.0);

        for i in 0..5 {
            tracker.ingest_visual_pose(&Matrix4::identity(), 3.0 + i as f64, TrackingQuality::Normal);
        }
        tracker.ingest_inertial_sample(&sample(Vector3::zeros(), 0.01));

        assert!(tracker.drift_offset().iter().all(|v| v.is_finite()));
        let pose = tracker.current_pose();
        assert!(pose.origin_only);
        assert!(pose.transform.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_reset_origin_zeroes_pose() {
        let tracker = PoseTracker::default();
        tracker.start();
        tracker.ingest_visual_pose(&translation(3.0, 1.0, 0.0), 1.0, TrackingQuality::Normal);
        for _ in 0..10 {
            tracker.ingest_inertial_sample(&sample(Vector3::new(0.5, 0.0, 0.2), 0.01));
        }

        tracker.reset_origin();
        let pose = tracker.current_pose();
        assert_relative_eq!(pose.position(), Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(pose.velocity, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(tracker.drift_offset(), Vector3::zeros(), epsilon = 1e-12);

        // The previous visual pose is the new origin.
        tracker.ingest_visual_pose(&translation(3.0, 1.0, 0.0), 2.0, TrackingQuality::Normal);
        assert_relative_eq!(tracker.current_pose().position(), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_subscribers_receive_poses_in_order() {
        let tracker = PoseTracker::default();
        let rx = tracker.subscribe();
        tracker.start();

        tracker.ingest_visual_pose(&translation(1.0, 0.0, 0.0), 1.0, TrackingQuality::Normal);
        tracker.ingest_visual_pose(&translation(2.0, 0.0, 0.0), 2.0, TrackingQuality::Normal);

        let received: Vec<Pose> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert!(received[0].timestamp_s < received[1].timestamp_s);
    }

    #[test]
    fn test_concurrent_ingest() {
        use std::sync::Arc;
        use std::thread;

        let tracker = Arc::new(PoseTracker::default());
        tracker.start();

        let inertial = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for _ in 0..500 {
                    tracker.ingest_inertial_sample(&sample(Vector3::new(0.1, 0.0, 0.0), 0.01));
                }
            })
        };
        let visual = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for i in 0..50 {
                    tracker.ingest_visual_pose(
                        &translation(0.01 * i as f64, 0.0, 0.0),
                        i as f64,
                        TrackingQuality::Normal,
                    );
                }
            })
        };
        inertial.join().unwrap();
        visual.join().unwrap();

        let pose = tracker.current_pose();
        assert!(pose.transform.iter().all(|v| v.is_finite()));
    }
}
