//! Sphere fit: algebraic initial guess refined with the
//! `levenberg-marquardt` solver.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DVector, Dyn, Matrix4, OMatrix, U4, UnitQuaternion, Vector3, Vector4, storage::Owned};

use super::eigen::{self, DEGENERATE_EPSILON};
use super::primitive::{PrimitiveEstimate, PrimitiveKind};

/// Smallest-to-total variance ratio below which points count as coplanar.
const COPLANAR_RATIO: f64 = 1e-9;

/// Geometric sphere residuals `|p - c| - r` over parameters `(cx, cy, cz, r)`.
struct SphereProblem<'a> {
    points: &'a [Vector3<f64>],
    params: Vector4<f64>,
}

impl SphereProblem<'_> {
    fn center(&self) -> Vector3<f64> {
        self.params.xyz()
    }
}

impl LeastSquaresProblem<f64, Dyn, U4> for SphereProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U4>;
    type ParameterStorage = Owned<f64, U4>;

    fn set_params(&mut self, x: &Vector4<f64>) {
        self.params = *x;
    }

    fn params(&self) -> Vector4<f64> {
        self.params
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let c = self.center();
        let r = self.params.w;
        Some(DVector::from_iterator(
            self.points.len(),
            self.points.iter().map(|p| (p - c).norm() - r),
        ))
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U4>> {
        let c = self.center();
        let mut jac = OMatrix::<f64, Dyn, U4>::zeros(self.points.len());
        for (i, p) in self.points.iter().enumerate() {
            let d = p - c;
            let dist = d.norm();
            if dist < DEGENERATE_EPSILON {
                // Point at the center: derivative undefined.
                return None;
            }
            jac[(i, 0)] = -d.x / dist;
            jac[(i, 1)] = -d.y / dist;
            jac[(i, 2)] = -d.z / dist;
            jac[(i, 3)] = -1.0;
        }
        Some(jac)
    }
}

/// Linear least squares on `|p|² = 2c·p + k`, `k = r² - |c|²`.
fn algebraic_guess(points: &[Vector3<f64>]) -> Option<Vector4<f64>> {
    let mut ata = Matrix4::zeros();
    let mut atb = Vector4::zeros();
    for p in points {
        let row = Vector4::new(2.0 * p.x, 2.0 * p.y, 2.0 * p.z, 1.0);
        ata += row * row.transpose();
        atb += row * p.norm_squared();
    }
    let sol = ata.lu().solve(&atb)?;
    let center = sol.xyz();
    let r2 = sol.w + center.norm_squared();
    if !(r2 > DEGENERATE_EPSILON) {
        return None;
    }
    Some(Vector4::new(center.x, center.y, center.z, r2.sqrt()))
}

pub(crate) fn fit_sphere(
    points: &[Vector3<f64>],
    max_iterations: usize,
    convergence_threshold: f64,
) -> Option<PrimitiveEstimate> {
    if points.len() < 4 {
        return None;
    }
    // Coplanar points fit infinitely many spheres.
    let centroid = eigen::centroid(points)?;
    let cov = eigen::covariance(points, &centroid);
    let (_, lambda_min) = eigen::smallest_eigenvector(&cov)?;
    if lambda_min <= COPLANAR_RATIO * cov.trace() {
        return None;
    }

    let initial = algebraic_guess(points)?;
    if !initial.iter().all(|v| v.is_finite()) {
        return None;
    }

    let problem = SphereProblem {
        points,
        params: initial,
    };
    let tol = convergence_threshold.max(f64::EPSILON);
    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(max_iterations.max(1))
        .with_ftol(tol)
        .with_xtol(tol)
        .minimize(problem);

    let params = problem.params;
    let radius = params.w.abs();
    if !params.iter().all(|v| v.is_finite()) || !(radius > DEGENERATE_EPSILON) {
        return None;
    }

    let center = params.xyz();
    let residuals: Vec<f64> = points.iter().map(|p| (p - center).norm() - radius).collect();
    let rmse = (residuals.iter().map(|r| r * r).sum::<f64>() / points.len() as f64).sqrt();
    let diameter = 2.0 * radius;

    Some(PrimitiveEstimate {
        kind: PrimitiveKind::Sphere,
        center,
        dimensions: Vector3::new(diameter, diameter, diameter),
        orientation: UnitQuaternion::identity(),
        confidence: (1.0 - rmse / radius).max(0.0),
        rmse,
        residuals,
        iterations: report.number_of_evaluations,
    })
}
