//! Voxel cells: one representative sample plus running averages.

use nalgebra::{Vector3, Vector4};

use crate::points::Sample;

/// Aggregate of every sample that landed in one voxel.
///
/// The representative position is the first sample's and never moves;
/// color, normal and intensity are running averages.
#[derive(Debug, Clone)]
pub struct VoxelCell {
    representative: Sample,
    count: u32,
    color_sum: Vector4<f64>,
    normal_sum: Vector3<f64>,
    intensity_sum: f64,
}

impl VoxelCell {
    pub fn new(sample: Sample) -> Self {
        Self {
            representative: sample,
            count: 1,
            color_sum: sample.color,
            normal_sum: sample.normal,
            intensity_sum: sample.intensity,
        }
    }

    /// Fold another sample into the averages.
    pub fn accumulate(&mut self, sample: &Sample) {
        self.count += 1;
        self.color_sum += sample.color;
        self.normal_sum += sample.normal;
        self.intensity_sum += sample.intensity;
        self.refresh();
    }

    /// Fold in a whole cell (used when the grid is rebuilt at a coarser size).
    pub fn merge(&mut self, other: &VoxelCell) {
        self.count += other.count;
        self.color_sum += other.color_sum;
        self.normal_sum += other.normal_sum;
        self.intensity_sum += other.intensity_sum;
        self.refresh();
    }

    fn refresh(&mut self) {
        let n = self.count as f64;
        self.representative.color = self.color_sum / n;
        self.representative.intensity = self.intensity_sum / n;
        if let Some(normal) = self.normal_sum.try_normalize(1e-12) {
            self.representative.normal = normal;
        }
    }

    pub fn representative(&self) -> &Sample {
        &self.representative
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
