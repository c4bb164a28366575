//! Geometric primitive fitting over point clusters.

mod circle;
mod cylinder;
pub mod eigen;
pub mod fitter;
mod plane;
pub mod primitive;
mod sphere;

pub use fitter::{FitterConfig, PrimitiveFitter};
pub use plane::PLANE_RMSE_SCALE;
pub use primitive::{DetectedPrimitive, PrimitiveId, PrimitiveKind};
