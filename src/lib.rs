pub mod config;
pub mod export;
pub mod fitting;
pub mod geometry;
pub mod imu;
pub mod io;
pub mod points;
pub mod system;
pub mod tracking;
pub mod voxel;

pub use config::{ConfigError, PipelineConfig};
pub use system::{PipelineCoordinator, PipelineSnapshot};
