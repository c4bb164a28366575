//! Point samples and per-frame batches.

use std::hash::{Hash, Hasher};

use nalgebra::{Matrix4, Vector3, Vector4};
use serde::{Deserialize, Serialize};

/// Semantic class attached to a sample by the capture collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    #[default]
    Unclassified,
    Ground,
    Wall,
    Ceiling,
    Furniture,
    Object,
}

impl Classification {
    /// Map the collaborator's 8-bit mesh classification code.
    ///
    /// Codes: 0 none, 1 wall, 2 floor, 3 ceiling, 4 table, 5 seat,
    /// 6 window, 7 door. Unknown codes are unclassified.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Wall,
            2 => Self::Ground,
            3 => Self::Ceiling,
            4 | 5 => Self::Furniture,
            6 | 7 => Self::Object,
            _ => Self::Unclassified,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Unclassified => 0,
            Self::Wall => 1,
            Self::Ground => 2,
            Self::Ceiling => 3,
            Self::Furniture => 4,
            Self::Object => 6,
        }
    }
}

/// A single filtered depth sample.
///
/// Equality and hashing consider the position only, so two samples at the
/// same location compare equal regardless of color or normal.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub position: Vector3<f64>,
    pub normal: Vector3<f64>,
    /// RGBA in 0..1.
    pub color: Vector4<f64>,
    pub intensity: f64,
    pub timestamp_s: f64,
    pub classification: Classification,
}

impl Sample {
    pub fn new(position: Vector3<f64>) -> Self {
        Self {
            position,
            normal: Vector3::zeros(),
            color: Vector4::new(1.0, 1.0, 1.0, 1.0),
            intensity: 1.0,
            timestamp_s: 0.0,
            classification: Classification::Unclassified,
        }
    }

    pub fn with_color(mut self, color: Vector4<f64>) -> Self {
        self.color = color;
        self.intensity = luminance(&color);
        self
    }

    pub fn with_normal(mut self, normal: Vector3<f64>) -> Self {
        self.normal = normal;
        self
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = classification;
        self
    }

    pub fn with_timestamp(mut self, timestamp_s: f64) -> Self {
        self.timestamp_s = timestamp_s;
        self
    }

    fn position_bits(&self) -> [u64; 3] {
        // +0.0 and -0.0 must hash identically since they compare equal.
        let canon = |v: f64| if v == 0.0 { 0u64 } else { v.to_bits() };
        [
            canon(self.position.x),
            canon(self.position.y),
            canon(self.position.z),
        ]
    }
}

impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        self.position_bits() == other.position_bits()
    }
}

impl Eq for Sample {}

impl Hash for Sample {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.position_bits().hash(state);
    }
}

/// Rec. 601 luma of an RGBA color.
pub fn luminance(color: &Vector4<f64>) -> f64 {
    0.299 * color.x + 0.587 * color.y + 0.114 * color.z
}

/// Opaque handle correlating a batch with the mesh or anchor it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SRC{}", self.0)
    }
}

/// Samples extracted from one processed frame.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub samples: Vec<Sample>,
    pub timestamp_s: f64,
    /// Camera-to-world transform of the frame.
    pub camera_transform: Matrix4<f64>,
    pub source: SourceId,
}

impl SampleBatch {
    pub fn new(samples: Vec<Sample>, timestamp_s: f64, source: SourceId) -> Self {
        Self {
            samples,
            timestamp_s,
            camera_transform: Matrix4::identity(),
            source,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_attributes() {
        let a = Sample::new(Vector3::new(1.0, 2.0, 3.0)).with_color(Vector4::new(1.0, 0.0, 0.0, 1.0));
        let b = Sample::new(Vector3::new(1.0, 2.0, 3.0))
            .with_color(Vector4::new(0.0, 0.0, 1.0, 1.0))
            .with_classification(Classification::Wall);
        let c = Sample::new(Vector3::new(1.0, 2.0, 3.5));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_dedups_by_position() {
        let mut set = HashSet::new();
        set.insert(Sample::new(Vector3::new(0.0, 1.0, 0.0)));
        set.insert(Sample::new(Vector3::new(-0.0, 1.0, 0.0)).with_normal(Vector3::y()));
        set.insert(Sample::new(Vector3::new(0.0, 2.0, 0.0)));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_classification_codes() {
        assert_eq!(Classification::from_code(2), Classification::Ground);
        assert_eq!(Classification::from_code(5), Classification::Furniture);
        assert_eq!(Classification::from_code(200), Classification::Unclassified);
        for class in [
            Classification::Unclassified,
            Classification::Ground,
            Classification::Wall,
            Classification::Ceiling,
            Classification::Furniture,
            Classification::Object,
        ] {
            assert_eq!(Classification::from_code(class.code()), class);
        }
    }
}
