//! 2D circle fit by damped Gauss-Newton (Levenberg-Marquardt).
//!
//! Parameters are `(cx, cy, r)`. Residuals are `|p - c| - r`. Each step
//! solves `(JᵀJ + λI)δ = -Jᵀr` in closed form; a step is kept only when
//! the squared error drops.

use nalgebra::{Matrix3, Vector2, Vector3};

use super::eigen::{DEGENERATE_EPSILON, solve3};

const INITIAL_LAMBDA: f64 = 1e-3;
const LAMBDA_FACTOR: f64 = 10.0;
const MAX_LAMBDA: f64 = 1e12;

/// Error floor below which the fit is exact.
const EXACT_ERROR: f64 = 1e-24;

#[derive(Debug, Clone)]
pub(crate) struct CircleSolution {
    pub center: Vector2<f64>,
    pub radius: f64,
    pub rmse: f64,
    /// `|p - c| - r` per input point.
    pub residuals: Vec<f64>,
    pub iterations: usize,
}

impl CircleSolution {
    /// `max(0, 1 - rmse / r)`
    pub fn confidence(&self) -> f64 {
        (1.0 - self.rmse / self.radius).max(0.0)
    }
}

fn squared_error(points: &[Vector2<f64>], center: &Vector2<f64>, radius: f64) -> f64 {
    points
        .iter()
        .map(|p| {
            let r = (p - center).norm() - radius;
            r * r
        })
        .sum()
}

/// Fit a circle to planar points. `None` on degenerate input.
pub(crate) fn fit_circle_2d(
    points: &[Vector2<f64>],
    max_iterations: usize,
    convergence_threshold: f64,
) -> Option<CircleSolution> {
    if points.len() < 3 {
        return None;
    }
    let n = points.len() as f64;
    let mut center: Vector2<f64> = points.iter().sum::<Vector2<f64>>() / n;
    let mut radius = points.iter().map(|p| (p - center).norm()).sum::<f64>() / n;
    if !(radius > DEGENERATE_EPSILON) {
        return None;
    }

    let mut error = squared_error(points, &center, radius);
    let mut lambda = INITIAL_LAMBDA;
    let mut iterations = 0;

    while iterations < max_iterations && error > EXACT_ERROR {
        iterations += 1;

        let mut jtj = Matrix3::zeros();
        let mut jtr = Vector3::zeros();
        for p in points {
            let d = p - center;
            let dist = d.norm();
            if dist < DEGENERATE_EPSILON {
                // Point at the center: derivative undefined.
                continue;
            }
            let j = Vector3::new(-d.x / dist, -d.y / dist, -1.0);
            let r = dist - radius;
            jtj += j * j.transpose();
            jtr += j * r;
        }

        let damped = jtj + Matrix3::identity() * lambda;
        let Some(delta) = solve3(&damped, &(-jtr)) else {
            return None;
        };

        let next_center = center + Vector2::new(delta.x, delta.y);
        let next_radius = radius + delta.z;
        let next_error = squared_error(points, &next_center, next_radius);

        if next_error.is_finite() && next_error < error {
            let improvement = error - next_error;
            center = next_center;
            radius = next_radius;
            error = next_error;
            lambda /= LAMBDA_FACTOR;
            if improvement < convergence_threshold {
                break;
            }
        } else {
            lambda *= LAMBDA_FACTOR;
            if lambda > MAX_LAMBDA {
                break;
            }
        }
    }

    // A negative radius describes the same circle.
    let radius = radius.abs();
    if !(radius > DEGENERATE_EPSILON) || !center.iter().all(|v| v.is_finite()) {
        return None;
    }

    let residuals: Vec<f64> = points.iter().map(|p| (p - center).norm() - radius).collect();
    let rmse = (residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt();

    Some(CircleSolution {
        center,
        radius,
        rmse,
        residuals,
        iterations,
    })
}
