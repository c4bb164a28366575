//! Integer voxel keys and axis-aligned bounds.

use nalgebra::Vector3;

/// Grid coordinate `floor(position / voxel_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoxelKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelKey {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Quantize a position. Coordinates beyond the i32 range saturate.
    #[inline]
    pub fn from_position(position: &Vector3<f64>, voxel_size: f64) -> Self {
        Self {
            x: quantize(position.x, voxel_size),
            y: quantize(position.y, voxel_size),
            z: quantize(position.z, voxel_size),
        }
    }
}

#[inline]
pub fn quantize(value: f64, voxel_size: f64) -> i32 {
    (value / voxel_size).floor() as i32
}

impl std::fmt::Display for VoxelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl Aabb {
    pub fn from_point(p: Vector3<f64>) -> Self {
        Self { min: p, max: p }
    }

    /// Box spanning two arbitrary corners.
    pub fn from_corners(a: Vector3<f64>, b: Vector3<f64>) -> Self {
        Self {
            min: a.inf(&b),
            max: a.sup(&b),
        }
    }

    pub fn extend(&mut self, p: &Vector3<f64>) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn contains(&self, p: &Vector3<f64>) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    pub fn intersection(&self, other: &Aabb) -> Option<Aabb> {
        let min = self.min.sup(&other.min);
        let max = self.max.inf(&other.max);
        (0..3).all(|i| min[i] <= max[i]).then_some(Aabb { min, max })
    }

    pub fn size(&self) -> Vector3<f64> {
        self.max - self.min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_floors_negative_values() {
        let key = VoxelKey::from_position(&Vector3::new(-0.01, 0.0, 0.19), 0.1);
        assert_eq!(key, VoxelKey::new(-1, 0, 1));
    }

    #[test]
    fn test_aabb_intersection() {
        let a = Aabb::from_corners(Vector3::new(0.0, 0.0, 0.0), Vector3::new(2.0, 2.0, 2.0));
        let b = Aabb::from_corners(Vector3::new(3.0, 1.0, 1.0), Vector3::new(1.0, 5.0, 5.0));
        let c = Aabb::from_corners(Vector3::new(3.0, 3.0, 3.0), Vector3::new(4.0, 4.0, 4.0));

        let i = a.intersection(&b).unwrap();
        assert_eq!(i.min, Vector3::new(1.0, 1.0, 1.0));
        assert_eq!(i.max, Vector3::new(2.0, 2.0, 2.0));
        assert!(a.intersection(&c).is_none());
    }
}
