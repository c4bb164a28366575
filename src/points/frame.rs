//! Per-frame input from the capture collaborator.

use std::sync::Arc;

use nalgebra::{Matrix4, Vector3, Vector4};

use crate::points::{BufferView, SourceId};
use crate::tracking::TrackingQuality;

/// Color lookup for world-space points.
///
/// Sampling the camera image is the collaborator's job; the core only asks
/// for a color at a point seen from the frame's camera.
pub trait ColorSampler: Send + Sync {
    fn sample(&self, world_point: &Vector3<f64>, camera_transform: &Matrix4<f64>)
    -> Option<Vector4<f64>>;
}

/// Sampler returning one fixed color. Used when no image is available.
#[derive(Debug, Clone, Copy)]
pub struct UniformColor(pub Vector4<f64>);

impl Default for UniformColor {
    fn default() -> Self {
        Self(Vector4::new(0.5, 0.5, 0.5, 1.0))
    }
}

impl ColorSampler for UniformColor {
    fn sample(&self, _: &Vector3<f64>, _: &Matrix4<f64>) -> Option<Vector4<f64>> {
        Some(self.0)
    }
}

/// One reconstructed mesh chunk delivered with a frame.
#[derive(Debug, Clone)]
pub struct MeshPayload {
    pub source: SourceId,
    /// Mesh-local to world transform.
    pub transform: Matrix4<f64>,
    pub vertices: BufferView,
    pub normals: BufferView,
    /// Per-vertex 8-bit classification codes, if the sensor provides them.
    pub classifications: Option<BufferView>,
}

impl MeshPayload {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }
}

/// A raw frame as handed over by the capture session.
#[derive(Clone)]
pub struct CaptureFrame {
    pub timestamp_s: f64,
    /// Camera-to-world transform from the visual tracker.
    pub camera_transform: Matrix4<f64>,
    pub quality: TrackingQuality,
    pub meshes: Vec<MeshPayload>,
    pub color: Option<Arc<dyn ColorSampler>>,
}

impl CaptureFrame {
    pub fn new(timestamp_s: f64, camera_transform: Matrix4<f64>, quality: TrackingQuality) -> Self {
        Self {
            timestamp_s,
            camera_transform,
            quality,
            meshes: Vec::new(),
            color: None,
        }
    }

    pub fn with_mesh(mut self, mesh: MeshPayload) -> Self {
        self.meshes.push(mesh);
        self
    }

    pub fn with_color(mut self, sampler: Arc<dyn ColorSampler>) -> Self {
        self.color = Some(sampler);
        self
    }

    pub fn vertex_count(&self) -> usize {
        self.meshes.iter().map(MeshPayload::vertex_count).sum()
    }
}

impl std::fmt::Debug for CaptureFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureFrame")
            .field("timestamp_s", &self.timestamp_s)
            .field("quality", &self.quality)
            .field("meshes", &self.meshes.len())
            .field("has_color", &self.color.is_some())
            .finish()
    }
}
