//! Streaming voxel-grid point store.
//!
//! Raw samples are hashed to integer voxel keys. The first sample landing in
//! an empty voxel creates a cell and is reported as new; later samples only
//! update the cell's running averages. An elevation index keyed by the
//! vertical voxel coordinate serves horizontal slice queries without a full
//! scan.
//!
//! One mutex guards the grid, the index and the bounds.

use std::collections::{BTreeMap, HashMap};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use nalgebra::Vector3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::points::{Sample, SampleBatch};

use super::cell::VoxelCell;
use super::key::{Aabb, VoxelKey, quantize};

/// Capacity of each new-point subscriber channel, in batches.
const LISTENER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Edge length of a voxel in meters.
    pub voxel_size: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { voxel_size: 0.02 }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("voxel size must be finite and positive, got {0}")]
    InvalidVoxelSize(f64),
}

/// Point-in-time store summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreStatistics {
    pub voxel_count: usize,
    pub total_processed: u64,
    /// `voxel_count / total_processed`; 1.0 for an empty store.
    pub compression_ratio: f64,
    pub bounds: Option<Aabb>,
}

struct StoreInner {
    voxel_size: f64,
    cells: HashMap<VoxelKey, VoxelCell>,
    /// Keys in creation order, so point listings are stable.
    order: Vec<VoxelKey>,
    /// Vertical voxel coordinate -> keys in that layer.
    elevation_index: BTreeMap<i32, Vec<VoxelKey>>,
    bounds: Option<Aabb>,
    total_processed: u64,
    listeners: Vec<Sender<Vec<Sample>>>,
}

impl StoreInner {
    fn new(voxel_size: f64) -> Self {
        Self {
            voxel_size,
            cells: HashMap::new(),
            order: Vec::new(),
            elevation_index: BTreeMap::new(),
            bounds: None,
            total_processed: 0,
            listeners: Vec::new(),
        }
    }

    fn insert_cell(&mut self, key: VoxelKey, cell: VoxelCell) {
        let position = cell.representative().position;
        match &mut self.bounds {
            Some(bounds) => bounds.extend(&position),
            None => self.bounds = Some(Aabb::from_point(position)),
        }
        self.elevation_index.entry(key.y).or_default().push(key);
        self.order.push(key);
        self.cells.insert(key, cell);
    }

    fn reset_grid(&mut self) {
        self.cells.clear();
        self.order.clear();
        self.elevation_index.clear();
        self.bounds = None;
    }

    fn points_matching(
        &self,
        keys: impl Iterator<Item = VoxelKey>,
        filter: impl Fn(&Vector3<f64>) -> bool,
    ) -> Vec<Sample> {
        keys.filter_map(|k| self.cells.get(&k))
            .map(|c| *c.representative())
            .filter(|s| filter(&s.position))
            .collect()
    }

    /// Representatives inside `region`, walking the key range directly when
    /// it is smaller than the store and scanning otherwise.
    fn query_region(&self, region: &Aabb, filter: impl Fn(&Vector3<f64>) -> bool) -> Vec<Sample> {
        let Some(region) = self.bounds.and_then(|b| b.intersection(region)) else {
            return Vec::new();
        };

        let lo = VoxelKey::from_position(&region.min, self.voxel_size);
        let hi = VoxelKey::from_position(&region.max, self.voxel_size);
        let span = |a: i32, b: i32| (b as i64 - a as i64 + 1) as u128;
        let volume = span(lo.x, hi.x) * span(lo.y, hi.y) * span(lo.z, hi.z);

        if volume > self.cells.len() as u128 {
            return self.points_matching(self.order.iter().copied(), filter);
        }

        let keys = (lo.x..=hi.x).flat_map(move |x| {
            (lo.y..=hi.y).flat_map(move |y| (lo.z..=hi.z).map(move |z| VoxelKey::new(x, y, z)))
        });
        self.points_matching(keys, filter)
    }
}

/// Voxel-grid filter over the incoming sample stream.
pub struct VoxelPointStore {
    inner: Mutex<StoreInner>,
}

impl VoxelPointStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        validate_voxel_size(config.voxel_size)?;
        Ok(Self {
            inner: Mutex::new(StoreInner::new(config.voxel_size)),
        })
    }

    pub fn voxel_size(&self) -> f64 {
        self.inner.lock().voxel_size
    }

    /// Change the grid resolution.
    ///
    /// Every cell is re-keyed from its representative point, merging cells
    /// that now share a voxel. This walks the whole store under the lock, so
    /// avoid it while a capture is running.
    pub fn set_voxel_size(&self, voxel_size: f64) -> Result<(), StoreError> {
        validate_voxel_size(voxel_size)?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.voxel_size == voxel_size {
            return Ok(());
        }

        let old_order = std::mem::take(&mut inner.order);
        let mut old_cells = std::mem::take(&mut inner.cells);
        let before = old_order.len();
        inner.reset_grid();
        inner.voxel_size = voxel_size;

        for old_key in old_order {
            let Some(cell) = old_cells.remove(&old_key) else {
                continue;
            };
            let key = VoxelKey::from_position(&cell.representative().position, voxel_size);
            match inner.cells.get_mut(&key) {
                Some(existing) => existing.merge(&cell),
                None => inner.insert_cell(key, cell),
            }
        }

        info!(
            "Voxel grid rebuilt at {:.4} m: {} -> {} cells",
            voxel_size,
            before,
            inner.cells.len()
        );
        Ok(())
    }

    /// Insert a batch and return the samples that created new cells.
    ///
    /// Only new points are forwarded to subscribers.
    pub fn insert(&self, batch: &SampleBatch) -> Vec<Sample> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let voxel_size = inner.voxel_size;
        let mut created = Vec::new();

        for sample in &batch.samples {
            if !sample.position.iter().all(|v| v.is_finite()) {
                continue;
            }
            inner.total_processed += 1;

            let key = VoxelKey::from_position(&sample.position, voxel_size);
            match inner.cells.get_mut(&key) {
                Some(cell) => cell.accumulate(sample),
                None => {
                    inner.insert_cell(key, VoxelCell::new(*sample));
                    created.push(*sample);
                }
            }
        }

        if !created.is_empty() && !inner.listeners.is_empty() {
            let payload = created.clone();
            inner.listeners.retain(|tx| {
                !matches!(tx.try_send(payload.clone()), Err(TrySendError::Disconnected(_)))
            });
        }

        debug!(
            "Inserted batch {} ({} samples): {} new cells, {} total",
            batch.source,
            batch.len(),
            created.len(),
            inner.cells.len()
        );
        created
    }

    /// Representatives whose vertical coordinate lies in `[min_y, max_y]`.
    pub fn query_elevation(&self, min_y: f64, max_y: f64) -> Vec<Sample> {
        if !(min_y <= max_y) {
            return Vec::new();
        }
        let inner = self.inner.lock();
        let lo = quantize(min_y, inner.voxel_size);
        let hi = quantize(max_y, inner.voxel_size);

        let keys = inner
            .elevation_index
            .range(lo..=hi)
            .flat_map(|(_, keys)| keys.iter().copied());
        inner.points_matching(keys, |p| p.y >= min_y && p.y <= max_y)
    }

    /// Representatives inside the box spanned by two corners (inclusive).
    pub fn query_box(&self, corner_a: &Vector3<f64>, corner_b: &Vector3<f64>) -> Vec<Sample> {
        let region = Aabb::from_corners(*corner_a, *corner_b);
        let inner = self.inner.lock();
        inner.query_region(&region, |p| region.contains(p))
    }

    /// Representatives within `radius` of `center` (inclusive).
    pub fn query_sphere(&self, center: &Vector3<f64>, radius: f64) -> Vec<Sample> {
        if !(radius >= 0.0) {
            return Vec::new();
        }
        let extent = Vector3::repeat(radius);
        let region = Aabb {
            min: center - extent,
            max: center + extent,
        };
        let radius_sq = radius * radius;
        let inner = self.inner.lock();
        inner.query_region(&region, |p| (p - center).norm_squared() <= radius_sq)
    }

    /// Every representative, in creation order.
    pub fn all_points(&self) -> Vec<Sample> {
        let inner = self.inner.lock();
        inner.points_matching(inner.order.iter().copied(), |_| true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cell and reset the counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.reset_grid();
        inner.total_processed = 0;
        info!("Voxel store cleared");
    }

    pub fn statistics(&self) -> StoreStatistics {
        let inner = self.inner.lock();
        let voxel_count = inner.cells.len();
        let compression_ratio = if inner.total_processed == 0 {
            1.0
        } else {
            voxel_count as f64 / inner.total_processed as f64
        };
        StoreStatistics {
            voxel_count,
            total_processed: inner.total_processed,
            compression_ratio,
            bounds: inner.bounds,
        }
    }

    /// Receive every batch of newly created points from now on.
    pub fn subscribe(&self) -> Receiver<Vec<Sample>> {
        let (tx, rx) = bounded(LISTENER_CHANNEL_CAPACITY);
        self.inner.lock().listeners.push(tx);
        rx
    }
}

fn validate_voxel_size(voxel_size: f64) -> Result<(), StoreError> {
    if voxel_size.is_finite() && voxel_size > 0.0 {
        Ok(())
    } else {
        Err(StoreError::InvalidVoxelSize(voxel_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::SourceId;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn store(voxel_size: f64) -> VoxelPointStore {
        VoxelPointStore::new(StoreConfig { voxel_size }).unwrap()
    }

    fn batch(points: &[Vector3<f64>]) -> SampleBatch {
        SampleBatch::new(
            points.iter().map(|p| Sample::new(*p)).collect(),
            0.0,
            SourceId(1),
        )
    }

    fn random_points(rng: &mut StdRng, n: usize) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-5.0..5.0),
                    rng.gen_range(-2.0..3.0),
                    rng.gen_range(-5.0..5.0),
                )
            })
            .collect()
    }

    #[test]
    fn test_rejects_invalid_voxel_size() {
        assert!(VoxelPointStore::new(StoreConfig { voxel_size: 0.0 }).is_err());
        assert!(VoxelPointStore::new(StoreConfig { voxel_size: f64::NAN }).is_err());
        assert_eq!(
            store(0.1).set_voxel_size(-1.0),
            Err(StoreError::InvalidVoxelSize(-1.0))
        );
    }

    #[test]
    fn test_duplicate_position_never_adds_voxel() {
        let store = store(0.05);
        let p = Vector3::new(1.0, 2.0, 3.0);

        let first = store.insert(&batch(&[p]));
        let second = store.insert(&batch(&[p, p]));

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        let stats = store.statistics();
        assert_eq!(stats.voxel_count, 1);
        assert_eq!(stats.total_processed, 3);
    }

    #[test]
    fn test_compression_ratio_tracks_counts() {
        let store = store(0.1);
        assert_relative_eq!(store.statistics().compression_ratio, 1.0);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            store.insert(&batch(&random_points(&mut rng, 400)));
            let stats = store.statistics();
            assert_relative_eq!(
                stats.compression_ratio,
                stats.voxel_count as f64 / stats.total_processed as f64
            );
        }
    }

    #[test]
    fn test_same_cell_averages_color() {
        let store = store(0.1);
        let colors = [
            Vector4::new(1.0, 0.0, 0.0, 1.0),
            Vector4::new(0.0, 1.0, 0.0, 1.0),
            Vector4::new(0.0, 0.0, 1.0, 0.5),
            Vector4::new(1.0, 1.0, 0.0, 1.0),
        ];
        let positions = [
            Vector3::new(0.01, 0.01, 0.01),
            Vector3::new(0.05, 0.02, 0.09),
            Vector3::new(0.099, 0.0, 0.03),
            Vector3::new(0.02, 0.08, 0.02),
        ];
        let samples: Vec<Sample> = positions
            .iter()
            .zip(colors.iter())
            .map(|(p, c)| Sample::new(*p).with_color(*c))
            .collect();
        store.insert(&SampleBatch::new(samples, 0.0, SourceId(0)));

        let points = store.all_points();
        assert_eq!(points.len(), 1);
        let expected = colors.iter().sum::<Vector4<f64>>() / 4.0;
        assert_relative_eq!(points[0].color, expected, epsilon = 1e-12);
        assert_eq!(points[0].position, positions[0]);
    }

    #[test]
    fn test_elevation_query_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(42);
        for voxel_size in [0.03, 0.1, 0.5] {
            let store = store(voxel_size);
            store.insert(&batch(&random_points(&mut rng, 2000)));
            let all = store.all_points();

            for _ in 0..20 {
                let a: f64 = rng.gen_range(-3.0..4.0);
                let b: f64 = rng.gen_range(-3.0..4.0);
                let (min_y, max_y) = (a.min(b), a.max(b));

                let mut got: Vec<_> = store
                    .query_elevation(min_y, max_y)
                    .iter()
                    .map(|s| s.position)
                    .collect();
                let mut want: Vec<_> = all
                    .iter()
                    .filter(|s| s.position.y >= min_y && s.position.y <= max_y)
                    .map(|s| s.position)
                    .collect();
                let key = |p: &Vector3<f64>| (p.x.to_bits(), p.y.to_bits(), p.z.to_bits());
                got.sort_by_key(key);
                want.sort_by_key(key);
                assert_eq!(got, want);
            }
        }
    }

    #[test]
    fn test_elevation_query_inverted_range_is_empty() {
        let store = store(0.1);
        store.insert(&batch(&[Vector3::new(0.0, 1.0, 0.0)]));
        assert!(store.query_elevation(2.0, 0.0).is_empty());
    }

    #[test]
    fn test_box_and_sphere_queries() {
        let mut rng = StdRng::seed_from_u64(3);
        let store = store(0.05);
        store.insert(&batch(&random_points(&mut rng, 3000)));
        let all = store.all_points();

        let lo = Vector3::new(-1.0, -0.5, 0.0);
        let hi = Vector3::new(0.5, 1.0, 2.0);
        let in_box = store.query_box(&hi, &lo);
        let expected = all
            .iter()
            .filter(|s| (0..3).all(|i| s.position[i] >= lo[i] && s.position[i] <= hi[i]))
            .count();
        assert_eq!(in_box.len(), expected);

        let center = Vector3::new(1.0, 0.5, -1.0);
        let in_sphere = store.query_sphere(&center, 1.5);
        let expected = all
            .iter()
            .filter(|s| (s.position - center).norm() <= 1.5)
            .count();
        assert_eq!(in_sphere.len(), expected);

        // Small region: walks the key range directly.
        let lo = Vector3::new(0.0, 0.0, 0.0);
        let hi = Vector3::new(0.4, 0.4, 0.4);
        let small = store.query_box(&lo, &hi);
        let expected = all
            .iter()
            .filter(|s| (0..3).all(|i| s.position[i] >= lo[i] && s.position[i] <= hi[i]))
            .count();
        assert_eq!(small.len(), expected);

        // Larger than the store: exercises the scan path.
        assert_eq!(store.query_sphere(&Vector3::zeros(), 100.0).len(), all.len());
    }

    #[test]
    fn test_query_outside_bounds_is_empty() {
        let store = store(0.1);
        store.insert(&batch(&[Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 1.0, 1.0)]));
        assert!(store
            .query_box(&Vector3::new(5.0, 5.0, 5.0), &Vector3::new(6.0, 6.0, 6.0))
            .is_empty());
    }

    #[test]
    fn test_bounds_update_on_creation() {
        let store = store(0.5);
        store.insert(&batch(&[Vector3::new(0.1, 0.1, 0.1), Vector3::new(0.2, 0.4, 0.3)]));
        let bounds = store.statistics().bounds.unwrap();
        // The second sample joined the first cell and must not move the bounds.
        assert_eq!(bounds.max, Vector3::new(0.1, 0.1, 0.1));

        store.insert(&batch(&[Vector3::new(-1.0, 2.0, 0.0)]));
        let bounds = store.statistics().bounds.unwrap();
        assert_eq!(bounds.min, Vector3::new(-1.0, 0.1, 0.0));
        assert_eq!(bounds.max, Vector3::new(0.1, 2.0, 0.1));
    }

    #[test]
    fn test_voxel_size_change_rebuilds() {
        let store = store(0.1);
        let points: Vec<_> = (0..10).map(|i| Vector3::new(i as f64 * 0.1 + 0.01, 0.0, 0.0)).collect();
        store.insert(&batch(&points));
        assert_eq!(store.len(), 10);

        store.set_voxel_size(0.5).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.statistics().total_processed, 10);
        assert_eq!(store.query_elevation(-0.1, 0.1).len(), 2);

        // Keys are stable again at the new size.
        let again = store.insert(&batch(&[Vector3::new(0.02, 0.0, 0.0)]));
        assert!(again.is_empty());
    }

    #[test]
    fn test_subscribers_only_see_new_points() {
        let store = store(0.1);
        let rx = store.subscribe();

        store.insert(&batch(&[Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.01, 0.0, 0.0)]));
        store.insert(&batch(&[Vector3::new(0.02, 0.0, 0.0)]));
        store.insert(&batch(&[Vector3::new(1.0, 0.0, 0.0)]));

        let received: Vec<Vec<Sample>> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].len(), 1);
        assert_eq!(received[1][0].position, Vector3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_clear_resets_everything() {
        let store = store(0.1);
        store.insert(&batch(&[Vector3::new(0.0, 0.0, 0.0)]));
        store.clear();

        let stats = store.statistics();
        assert_eq!(stats.voxel_count, 0);
        assert_eq!(stats.total_processed, 0);
        assert!(stats.bounds.is_none());
        assert!(store.all_points().is_empty());
    }
}
