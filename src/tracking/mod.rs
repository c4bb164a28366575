//! Pose tracking: high-rate inertial dead reckoning corrected by
//! lower-rate visual poses.

pub mod pose;
pub mod pose_tracker;
pub mod state;

pub use pose::Pose;
pub use pose_tracker::{PoseTracker, TrackerConfig};
pub use state::TrackingQuality;
