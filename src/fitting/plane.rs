use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use super::eigen::{self, DEGENERATE_EPSILON};
use super::primitive::{PrimitiveEstimate, PrimitiveKind};

/// RMSE at which plane confidence reaches zero, in metres.
pub const PLANE_RMSE_SCALE: f64 = 0.1;

/// Total-least-squares plane through `points`.
///
/// Returns `None` when the points are collinear or coincident.
pub(crate) fn fit_plane(points: &[Vector3<f64>]) -> Option<PrimitiveEstimate> {
    if points.len() < 3 {
        return None;
    }
    let centroid = eigen::centroid(points)?;
    let cov = eigen::covariance(points, &centroid);

    let (mut normal, lambda_min) = eigen::smallest_eigenvector(&cov)?;
    let (_, lambda_max) = eigen::dominant_eigenvector(&cov)?;
    let lambda_mid = cov.trace() - lambda_max - lambda_min;
    if !(lambda_mid > DEGENERATE_EPSILON * cov.norm().max(1.0)) {
        // Collinear: no unique plane.
        return None;
    }

    if normal.y < 0.0 {
        normal = -normal;
    }
    let (u, v) = eigen::orthonormal_basis(&normal)?;

    let mut residuals = Vec::with_capacity(points.len());
    let (mut u_min, mut u_max) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut v_min, mut v_max) = (f64::INFINITY, f64::NEG_INFINITY);
    for p in points {
        let d = p - centroid;
        residuals.push(d.dot(&normal));
        let (pu, pv) = (d.dot(&u), d.dot(&v));
        u_min = u_min.min(pu);
        u_max = u_max.max(pu);
        v_min = v_min.min(pv);
        v_max = v_max.max(pv);
    }
    let rmse = (residuals.iter().map(|r| r * r).sum::<f64>() / points.len() as f64).sqrt();

    let center = centroid + u * (0.5 * (u_min + u_max)) + v * (0.5 * (v_min + v_max));

    // Local X -> u, local Y -> normal, local Z -> u × normal = -v.
    let basis = Matrix3::from_columns(&[u, normal, -v]);
    let orientation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(basis));

    Some(PrimitiveEstimate {
        kind: PrimitiveKind::Plane,
        center,
        dimensions: Vector3::new(u_max - u_min, 0.0, v_max - v_min),
        orientation,
        confidence: (1.0 - rmse / PLANE_RMSE_SCALE).max(0.0),
        rmse,
        residuals,
        iterations: 0,
    })
}
