//! Small symmetric-matrix helpers for point-cloud fitting.
//!
//! Eigenvectors come from power iteration with a residual convergence
//! check, capped at `MAX_POWER_ITERATIONS`, seeded from a repeatedly
//! squared copy of the matrix. A degenerate matrix yields `None` instead
//! of NaN.

use nalgebra::{Matrix3, Vector3};

pub const MAX_POWER_ITERATIONS: usize = 20;

/// Squarings of the seed matrix: eigenvalue ratios are raised to `2^16`.
const SEED_SQUARINGS: usize = 16;

/// Relative residual `|Mv - (v·Mv)v| / |M|` accepted as converged.
const CONVERGENCE_TOLERANCE: f64 = 1e-12;

/// Relative diagonal shift applied before inverse iteration.
const INVERSE_SHIFT: f64 = 1e-9;

/// Lengths below this are treated as zero.
pub const DEGENERATE_EPSILON: f64 = 1e-12;

pub fn centroid(points: &[Vector3<f64>]) -> Option<Vector3<f64>> {
    if points.is_empty() {
        return None;
    }
    let sum: Vector3<f64> = points.iter().sum();
    Some(sum / points.len() as f64)
}

/// Population covariance about `center`.
pub fn covariance(points: &[Vector3<f64>], center: &Vector3<f64>) -> Matrix3<f64> {
    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p - center;
        cov += d * d.transpose();
    }
    cov / points.len().max(1) as f64
}

/// Eigenvector of the largest eigenvalue of a symmetric PSD matrix, with
/// its eigenvalue.
///
/// `M^(2^k)` is close to `λ₁^(2^k) v₁v₁ᵀ` even when `λ₂/λ₁` is near one, so
/// its strongest column starts the iteration on the dominant eigenvector
/// regardless of how the columns of `M` are aligned.
pub fn dominant_eigenvector(m: &Matrix3<f64>) -> Option<(Vector3<f64>, f64)> {
    let scale = m.norm();
    if !(scale > DEGENERATE_EPSILON) {
        return None;
    }

    let mut seed = m / scale;
    for _ in 0..SEED_SQUARINGS {
        let squared = seed * seed;
        let norm = squared.norm();
        if !(norm > 0.0 && norm.is_finite()) {
            break;
        }
        seed = squared / norm;
    }

    let mut v = (0..3)
        .map(|i| seed.column(i).into_owned())
        .max_by(|a, b| a.norm_squared().total_cmp(&b.norm_squared()))?
        .try_normalize(DEGENERATE_EPSILON)?;

    for _ in 0..MAX_POWER_ITERATIONS {
        let mv = m * v;
        let next = mv.try_normalize(DEGENERATE_EPSILON)?;
        let lambda = next.dot(&(m * next));
        let residual = (m * next - next * lambda).norm() / scale;
        v = next;
        if residual < CONVERGENCE_TOLERANCE {
            break;
        }
    }

    let lambda = v.dot(&(m * v));
    v.iter().all(|x| x.is_finite()).then_some((v, lambda))
}

/// Eigenvector of the smallest eigenvalue of a covariance matrix.
///
/// Inverse power iteration on `C + δI`, with `δ` a small fraction of the
/// trace so that exactly planar input stays invertible.
pub fn smallest_eigenvector(cov: &Matrix3<f64>) -> Option<(Vector3<f64>, f64)> {
    let trace = cov.trace();
    if !(trace > DEGENERATE_EPSILON) {
        return None;
    }
    let shifted = cov + Matrix3::identity() * (trace * INVERSE_SHIFT);
    let inverse = shifted.try_inverse()?;
    let (v, _) = dominant_eigenvector(&inverse)?;
    let lambda = v.dot(&(cov * v));
    Some((v, lambda))
}

/// Two unit vectors completing `n` to an orthonormal basis.
pub fn orthonormal_basis(n: &Vector3<f64>) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let n = n.try_normalize(DEGENERATE_EPSILON)?;
    // Cross with the axis least aligned with n.
    let helper = if n.x.abs() <= n.y.abs() && n.x.abs() <= n.z.abs() {
        Vector3::x()
    } else if n.y.abs() <= n.z.abs() {
        Vector3::y()
    } else {
        Vector3::z()
    };
    let u = n.cross(&helper).try_normalize(DEGENERATE_EPSILON)?;
    let v = n.cross(&u);
    Some((u, v))
}

/// Closed-form solve of a 3×3 system by Cramer's rule.
pub fn solve3(a: &Matrix3<f64>, b: &Vector3<f64>) -> Option<Vector3<f64>> {
    let det = a.determinant();
    let scale = a.norm().powi(3).max(f64::MIN_POSITIVE);
    if !(det.abs() > DEGENERATE_EPSILON * scale) {
        return None;
    }
    let mut x = Vector3::zeros();
    for i in 0..3 {
        let mut ai = *a;
        ai.set_column(i, b);
        x[i] = ai.determinant() / det;
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}
