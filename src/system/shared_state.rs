//! State shared between the coordinator and its lanes.
//!
//! The tracker and the store each guard their own state with one mutex;
//! everything here is either one of those components or an atomic flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use super::statistics::{PipelineCounters, PipelineSnapshot, StatsWindow};
use crate::export::ChunkedExporter;
use crate::fitting::PrimitiveFitter;
use crate::points::SampleExtractor;
use crate::tracking::PoseTracker;
use crate::voxel::VoxelPointStore;

pub struct PipelineShared {
    pub tracker: PoseTracker,
    pub store: VoxelPointStore,
    pub exporter: ChunkedExporter,
    /// Read for fits, written by `configure`.
    pub fitter: RwLock<PrimitiveFitter>,
    pub extractor: SampleExtractor,

    pub(crate) counters: PipelineCounters,
    stats_window: Mutex<StatsWindow>,
    snapshot: RwLock<PipelineSnapshot>,

    running: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl PipelineShared {
    pub fn new(
        tracker: PoseTracker,
        store: VoxelPointStore,
        exporter: ChunkedExporter,
        fitter: PrimitiveFitter,
        extractor: SampleExtractor,
    ) -> Self {
        Self {
            tracker,
            store,
            exporter,
            fitter: RwLock::new(fitter),
            extractor,
            counters: PipelineCounters::default(),
            stats_window: Mutex::new(StatsWindow::new(Instant::now())),
            snapshot: RwLock::new(PipelineSnapshot::default()),
            running: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> PipelineSnapshot {
        self.snapshot.read().clone()
    }

    /// Recompute and publish the snapshot.
    pub fn refresh_statistics(&self) -> PipelineSnapshot {
        let voxel_count = self.store.len();
        let quality = self.tracker.quality();
        let snapshot =
            self.stats_window
                .lock()
                .update(&self.counters, voxel_count, quality, Instant::now());
        *self.snapshot.write() = snapshot.clone();
        snapshot
    }

    pub fn reset_statistics(&self) {
        self.stats_window
            .lock()
            .reset(&self.counters, Instant::now());
    }
}
