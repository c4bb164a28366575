//! Detected geometric primitives.

use std::collections::BTreeMap;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Sequential identifier assigned by the fitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimitiveId(pub u64);

impl std::fmt::Display for PrimitiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PRIM{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Circle,
    Plane,
    Cylinder,
    Sphere,
    Box,
    Unknown,
}

impl std::fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Circle => "circle",
            Self::Plane => "plane",
            Self::Cylinder => "cylinder",
            Self::Sphere => "sphere",
            Self::Box => "box",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A fitted primitive.
///
/// The primitive's local +Y axis is its normal (plane) or axis (circle,
/// cylinder); `orientation` rotates local +Y onto it. `dimensions` are
/// extents in that local frame: circle `(2r, 0, 2r)`, plane
/// `(width, 0, depth)`, cylinder `(2r, height, 2r)`, sphere `(2r, 2r, 2r)`.
#[derive(Debug, Clone)]
pub struct DetectedPrimitive {
    pub id: PrimitiveId,
    pub kind: PrimitiveKind,
    pub center: Vector3<f64>,
    pub dimensions: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    /// 0..1
    pub confidence: f64,
    /// Indices into the fitted point slice of the points the model explains.
    pub point_indices: Vec<usize>,
    pub metadata: BTreeMap<String, String>,
}

impl DetectedPrimitive {
    /// Local +Y in world coordinates.
    pub fn axis(&self) -> Vector3<f64> {
        self.orientation * Vector3::y()
    }

    pub fn rmse(&self) -> Option<f64> {
        self.metadata.get("rmse").and_then(|v| v.parse().ok())
    }
}

/// Shape-specific fit result before an id is assigned.
#[derive(Debug, Clone)]
pub(crate) struct PrimitiveEstimate {
    pub kind: PrimitiveKind,
    pub center: Vector3<f64>,
    pub dimensions: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub confidence: f64,
    pub rmse: f64,
    /// Signed per-point model residuals, same order as the input.
    pub residuals: Vec<f64>,
    pub iterations: usize,
}

/// Orientation taking local +Y onto `axis`.
pub(crate) fn orientation_for_axis(axis: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::rotation_between(&Vector3::y(), axis).unwrap_or_else(|| {
        // Antiparallel: half turn about any perpendicular axis.
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI)
    })
}
