//! Primitive fitting facade.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::circle::fit_circle_2d;
use super::cylinder::fit_cylinder;
use super::plane::fit_plane;
use super::primitive::{
    DetectedPrimitive, PrimitiveEstimate, PrimitiveId, PrimitiveKind, orientation_for_axis,
};
use super::sphere::fit_sphere;

/// Residual tolerance added to `3·rmse` when picking inliers.
const INLIER_SLACK: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterConfig {
    pub max_iterations: usize,
    /// Stop once an accepted step improves the squared error by less than this.
    pub convergence_threshold: f64,
    pub min_points_for_fit: usize,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            convergence_threshold: 1e-6,
            min_points_for_fit: 10,
        }
    }
}

/// Fits circles, planes, cylinders and spheres to point clusters.
///
/// Every `fit_*` returns `None` for clusters smaller than
/// `min_points_for_fit` or when the numerical solve degenerates.
#[derive(Debug)]
pub struct PrimitiveFitter {
    config: FitterConfig,
    next_id: AtomicU64,
}

impl PrimitiveFitter {
    pub fn new(config: FitterConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &FitterConfig {
        &self.config
    }

    pub fn configure(
        &mut self,
        max_iterations: usize,
        convergence_threshold: f64,
        min_points_for_fit: usize,
    ) {
        self.config = FitterConfig {
            max_iterations,
            convergence_threshold,
            min_points_for_fit,
        };
    }

    fn enough_points(&self, points: &[Vector3<f64>]) -> bool {
        points.len() >= self.config.min_points_for_fit.max(1)
    }

    /// Circle in the horizontal (XZ) plane.
    pub fn fit_circle(&self, points: &[Vector3<f64>]) -> Option<DetectedPrimitive> {
        if !self.enough_points(points) {
            return None;
        }
        let projected: Vec<Vector2<f64>> = points.iter().map(|p| Vector2::new(p.x, p.z)).collect();
        let circle = fit_circle_2d(
            &projected,
            self.config.max_iterations,
            self.config.convergence_threshold,
        )?;
        let mean_y = points.iter().map(|p| p.y).sum::<f64>() / points.len() as f64;
        let diameter = 2.0 * circle.radius;

        let estimate = PrimitiveEstimate {
            kind: PrimitiveKind::Circle,
            center: Vector3::new(circle.center.x, mean_y, circle.center.y),
            dimensions: Vector3::new(diameter, 0.0, diameter),
            orientation: orientation_for_axis(&Vector3::y()),
            confidence: circle.confidence(),
            rmse: circle.rmse,
            residuals: circle.residuals,
            iterations: circle.iterations,
        };
        Some(self.finish(estimate))
    }

    pub fn fit_plane(&self, points: &[Vector3<f64>]) -> Option<DetectedPrimitive> {
        if !self.enough_points(points) {
            return None;
        }
        fit_plane(points).map(|e| self.finish(e))
    }

    pub fn fit_cylinder(&self, points: &[Vector3<f64>]) -> Option<DetectedPrimitive> {
        if !self.enough_points(points) {
            return None;
        }
        fit_cylinder(
            points,
            self.config.max_iterations,
            self.config.convergence_threshold,
        )
        .map(|e| self.finish(e))
    }

    pub fn fit_sphere(&self, points: &[Vector3<f64>]) -> Option<DetectedPrimitive> {
        if !self.enough_points(points) {
            return None;
        }
        fit_sphere(
            points,
            self.config.max_iterations,
            self.config.convergence_threshold,
        )
        .map(|e| self.finish(e))
    }

    pub fn fit(&self, kind: PrimitiveKind, points: &[Vector3<f64>]) -> Option<DetectedPrimitive> {
        match kind {
            PrimitiveKind::Circle => self.fit_circle(points),
            PrimitiveKind::Plane => self.fit_plane(points),
            PrimitiveKind::Cylinder => self.fit_cylinder(points),
            PrimitiveKind::Sphere => self.fit_sphere(points),
            PrimitiveKind::Box | PrimitiveKind::Unknown => None,
        }
    }

    /// Highest-confidence fit among `kinds`. Ties keep the earlier kind.
    pub fn fit_best(
        &self,
        points: &[Vector3<f64>],
        kinds: &[PrimitiveKind],
    ) -> Option<DetectedPrimitive> {
        let mut best: Option<DetectedPrimitive> = None;
        for &kind in kinds {
            let Some(candidate) = self.fit(kind, points) else {
                continue;
            };
            if best.as_ref().is_none_or(|b| candidate.confidence > b.confidence) {
                best = Some(candidate);
            }
        }
        best
    }

    fn finish(&self, estimate: PrimitiveEstimate) -> DetectedPrimitive {
        let id = PrimitiveId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tolerance = 3.0 * estimate.rmse + INLIER_SLACK;
        let point_indices: Vec<usize> = estimate
            .residuals
            .iter()
            .enumerate()
            .filter(|(_, r)| r.abs() <= tolerance)
            .map(|(i, _)| i)
            .collect();

        let mut metadata = BTreeMap::new();
        metadata.insert("rmse".to_string(), format!("{:.6}", estimate.rmse));
        metadata.insert("iterations".to_string(), estimate.iterations.to_string());
        metadata.insert("points".to_string(), estimate.residuals.len().to_string());
        metadata.insert("inliers".to_string(), point_indices.len().to_string());

        debug!(
            "Fitted {} {}: confidence={:.3}, rmse={:.5}, inliers={}/{}",
            estimate.kind,
            id,
            estimate.confidence,
            estimate.rmse,
            point_indices.len(),
            estimate.residuals.len()
        );

        DetectedPrimitive {
            id,
            kind: estimate.kind,
            center: estimate.center,
            dimensions: estimate.dimensions,
            orientation: estimate.orientation,
            confidence: estimate.confidence,
            point_indices,
            metadata,
        }
    }
}

impl Default for PrimitiveFitter {
    fn default() -> Self {
        Self::new(FitterConfig::default())
    }
}
