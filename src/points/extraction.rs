//! Turn mesh payloads into world-space sample batches.

use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::points::{
    CaptureFrame, Classification, ColorSampler, MeshPayload, Sample, SampleBatch, UniformColor,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Take every `vertex_step`-th vertex of each mesh.
    pub vertex_step: usize,
    /// Hard cap on samples taken from a single frame (0 = unlimited).
    pub max_samples_per_frame: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            vertex_step: 1,
            max_samples_per_frame: 0,
        }
    }
}

/// Reads mesh vertices out of a frame and moves them into world space.
pub struct SampleExtractor {
    config: ExtractionConfig,
    fallback_color: UniformColor,
}

impl SampleExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self {
            config,
            fallback_color: UniformColor::default(),
        }
    }

    /// One batch per mesh payload, in payload order. Empty meshes are skipped.
    pub fn extract(&self, frame: &CaptureFrame) -> Vec<SampleBatch> {
        let mut budget = match self.config.max_samples_per_frame {
            0 => usize::MAX,
            n => n,
        };

        let mut batches = Vec::with_capacity(frame.meshes.len());
        for mesh in &frame.meshes {
            if budget == 0 {
                break;
            }
            let batch = self.extract_mesh(frame, mesh, budget);
            budget -= batch.len();
            if !batch.is_empty() {
                batches.push(batch);
            }
        }
        batches
    }

    fn extract_mesh(&self, frame: &CaptureFrame, mesh: &MeshPayload, budget: usize) -> SampleBatch {
        let to_world = SE3::from_matrix(mesh.transform);
        let sampler: &dyn ColorSampler = match &frame.color {
            Some(sampler) => sampler.as_ref(),
            None => &self.fallback_color,
        };
        let step = self.config.vertex_step.max(1);

        let mut samples = Vec::with_capacity((mesh.vertex_count() / step).min(budget));
        for i in (0..mesh.vertex_count()).step_by(step) {
            if samples.len() >= budget {
                break;
            }
            let Some(local) = mesh.vertices.read_vec3(i) else {
                continue;
            };
            if !local.iter().all(|v| v.is_finite()) {
                continue;
            }
            let position = to_world.transform_point(&local);

            let normal = mesh
                .normals
                .read_vec3(i)
                .map(|n| to_world.rotate_vector(&n))
                .and_then(|n| n.try_normalize(1e-12))
                .unwrap_or_else(Vector3::zeros);

            let classification = mesh
                .classifications
                .as_ref()
                .and_then(|c| c.read_u8(i))
                .map(Classification::from_code)
                .unwrap_or_default();

            let color = sampler
                .sample(&position, &frame.camera_transform)
                .unwrap_or_else(|| Vector4::new(0.5, 0.5, 0.5, 1.0));

            samples.push(
                Sample::new(position)
                    .with_normal(normal)
                    .with_color(color)
                    .with_classification(classification)
                    .with_timestamp(frame.timestamp_s),
            );
        }

        SampleBatch {
            samples,
            timestamp_s: frame.timestamp_s,
            camera_transform: frame.camera_transform,
            source: mesh.source,
        }
    }
}

impl Default for SampleExtractor {
    fn default() -> Self {
        Self::new(ExtractionConfig::default())
    }
}
