//! Point-cloud export to a binary PLY artifact.

pub mod device;
pub mod error;
pub mod exporter;
pub mod packing;
pub mod ply;

pub use device::{AssembledMesh, ComputeDevice, HostDevice};
pub use error::ExportError;
pub use exporter::{
    ChunkedExporter, ExportConfig, ExportHandle, ExportOutcome, ExportPhase, ExportProgress,
};
pub use packing::{VERTEX_STRIDE_BYTES, triplet_indices};
