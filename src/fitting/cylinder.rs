use nalgebra::{Vector2, Vector3};

use super::circle::fit_circle_2d;
use super::eigen;
use super::primitive::{PrimitiveEstimate, PrimitiveKind, orientation_for_axis};

/// Cylinder from the principal axis and a circle fit across it.
pub(crate) fn fit_cylinder(
    points: &[Vector3<f64>],
    max_iterations: usize,
    convergence_threshold: f64,
) -> Option<PrimitiveEstimate> {
    let centroid = eigen::centroid(points)?;
    let cov = eigen::covariance(points, &centroid);
    let (mut axis, _) = eigen::dominant_eigenvector(&cov)?;
    if axis.y < 0.0 {
        axis = -axis;
    }
    let (u, v) = eigen::orthonormal_basis(&axis)?;

    let mut projected = Vec::with_capacity(points.len());
    let (mut h_min, mut h_max) = (f64::INFINITY, f64::NEG_INFINITY);
    for p in points {
        let d = p - centroid;
        projected.push(Vector2::new(d.dot(&u), d.dot(&v)));
        let h = d.dot(&axis);
        h_min = h_min.min(h);
        h_max = h_max.max(h);
    }

    let circle = fit_circle_2d(&projected, max_iterations, convergence_threshold)?;
    let confidence = circle.confidence();
    let center = centroid
        + u * circle.center.x
        + v * circle.center.y
        + axis * (0.5 * (h_min + h_max));
    let diameter = 2.0 * circle.radius;

    Some(PrimitiveEstimate {
        kind: PrimitiveKind::Cylinder,
        center,
        dimensions: Vector3::new(diameter, h_max - h_min, diameter),
        orientation: orientation_for_axis(&axis),
        confidence,
        rmse: circle.rmse,
        residuals: circle.residuals,
        iterations: circle.iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn cylinder_points(
        base: Vector3<f64>,
        axis: Vector3<f64>,
        radius: f64,
        height: f64,
    ) -> Vec<Vector3<f64>> {
        let axis = axis.normalize();
        let (u, v) = eigen::orthonormal_basis(&axis).unwrap();
        let mut pts = Vec::new();
        for k in 0..=20 {
            let h = height * k as f64 / 20.0;
            for i in 0..24 {
                let t = i as f64 / 24.0 * std::f64::consts::TAU;
                pts.push(base + axis * h + (u * t.cos() + v * t.sin()) * radius);
            }
        }
        pts
    }

    #[test]
    fn test_vertical_cylinder() {
        let pts = cylinder_points(Vector3::new(1.0, 0.0, -2.0), Vector3::y(), 0.3, 2.0);
        let est = fit_cylinder(&pts, 50, 1e-12).unwrap();

        assert_eq!(est.kind, PrimitiveKind::Cylinder);
        assert_relative_eq!(est.center, Vector3::new(1.0, 1.0, -2.0), epsilon = 1e-6);
        assert_relative_eq!(est.dimensions, Vector3::new(0.6, 2.0, 0.6), epsilon = 1e-6);
        let axis = est.orientation * Vector3::y();
        assert_relative_eq!(axis, Vector3::y(), epsilon = 1e-6);
        assert!(est.confidence > 0.99);
    }

    #[test]
    fn test_tilted_cylinder() {
        let dir = Vector3::new(1.0, 1.0, 0.0).normalize();
        let pts = cylinder_points(Vector3::zeros(), dir, 0.5, 4.0);
        let est = fit_cylinder(&pts, 50, 1e-12).unwrap();

        let axis = est.orientation * Vector3::y();
        assert!(axis.dot(&dir).abs() > 1.0 - 1e-6);
        assert_relative_eq!(est.dimensions.x, 1.0, epsilon = 1e-4);
        assert_relative_eq!(est.dimensions.y, 4.0, epsilon = 1e-4);
        assert!(est.orientation.angle_to(&UnitQuaternion::identity()) > 0.1);
    }

    #[test]
    fn test_squat_cylinder_keeps_major_axis() {
        // Spread along the axis barely exceeds the radial spread.
        let dir = Vector3::new(0.0, 1.0, 1.0).normalize();
        let pts = cylinder_points(Vector3::new(0.5, 0.0, 0.0), dir, 0.83, 2.0);
        let est = fit_cylinder(&pts, 50, 1e-12).unwrap();

        let axis = est.orientation * Vector3::y();
        assert!(axis.dot(&dir) > 1.0 - 1e-6, "axis {:?}", axis);
        assert_relative_eq!(est.dimensions.x, 1.66, epsilon = 1e-4);
        assert_relative_eq!(est.dimensions.y, 2.0, epsilon = 1e-4);
    }
}
