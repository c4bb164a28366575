//! Pipeline orchestration and thread management.
//!
//! `PipelineCoordinator` owns the tracker, point store, fitter and
//! exporter, and runs their work on dedicated lanes connected by channels.

mod coordinator;
pub mod messages;
pub mod shared_state;
pub mod statistics;

pub use coordinator::{ClusterQuery, CoordinatorConfig, PipelineCoordinator};
pub use messages::FrameDisposition;
pub use shared_state::PipelineShared;
pub use statistics::PipelineSnapshot;
