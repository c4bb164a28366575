//! Pipeline coordinator: owns the tracker, store, fitter and exporter and
//! schedules work across four named lanes.
//!
//! - `inertial`: integrates queued inertial samples.
//! - `extraction`: turns every Nth frame's meshes into samples and inserts
//!   them into the store.
//! - `stats`: recomputes the statistics snapshot on a fixed tick.
//! - `export`: runs exports one at a time.
//!
//! The frame-delivery lane is whoever calls [`PipelineCoordinator::process_frame`];
//! it only updates the pose and enqueues, never waits on insertion.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{
    Receiver, RecvTimeoutError, Sender, TrySendError, bounded, select, tick,
};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::messages::{ExportJob, ExtractionJob, FrameDisposition};
use super::shared_state::PipelineShared;
use super::statistics::PipelineSnapshot;
use crate::config::PipelineConfig;
use crate::export::{
    ChunkedExporter, ComputeDevice, ExportConfig, ExportError, ExportHandle, ExportOutcome,
    HostDevice, triplet_indices,
};
use crate::fitting::{DetectedPrimitive, PrimitiveFitter, PrimitiveKind};
use crate::imu::ImuSample;
use crate::points::{CaptureFrame, Sample, SampleExtractor};
use crate::tracking::{Pose, PoseTracker};
use crate::voxel::VoxelPointStore;

/// Poll interval of the queue-driven lanes, so they notice shutdown.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Run extraction on every `frame_divisor`-th frame.
    pub frame_divisor: u64,
    pub statistics_interval_ms: u64,
    /// Frames waiting for extraction before new ones are dropped.
    pub extraction_queue_capacity: usize,
    pub inertial_queue_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            frame_divisor: 3,
            statistics_interval_ms: 500,
            extraction_queue_capacity: 4,
            inertial_queue_capacity: 512,
        }
    }
}

/// Store region to fit primitives over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClusterQuery {
    All,
    Elevation { min_y: f64, max_y: f64 },
    Box { min: Vector3<f64>, max: Vector3<f64> },
    Sphere { center: Vector3<f64>, radius: f64 },
}

pub struct PipelineCoordinator {
    config: CoordinatorConfig,
    export_config: ExportConfig,
    shared: Arc<PipelineShared>,
    frame_counter: AtomicU64,

    inertial_tx: Option<Sender<ImuSample>>,
    extraction_tx: Option<Sender<ExtractionJob>>,
    export_tx: Option<Sender<ExportJob>>,
    stats_stop_tx: Option<Sender<()>>,
    lanes: Vec<JoinHandle<()>>,
}

impl PipelineCoordinator {
    /// Build the components from `config` and spawn the lanes.
    ///
    /// The pipeline starts stopped; call [`start`](Self::start).
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_device(config, Some(Arc::new(HostDevice)))
    }

    /// Like [`new`](Self::new) with an explicit export compute device.
    pub fn with_device(
        config: PipelineConfig,
        device: Option<Arc<dyn ComputeDevice>>,
    ) -> Result<Self> {
        config.validate().context("Invalid pipeline configuration")?;

        let store = VoxelPointStore::new(config.store.clone()).context("Failed to create point store")?;
        let shared = Arc::new(PipelineShared::new(
            PoseTracker::new(config.tracker.clone()),
            store,
            ChunkedExporter::new(device),
            PrimitiveFitter::new(config.fitter.clone()),
            SampleExtractor::new(config.extraction.clone()),
        ));

        let pipeline = config.pipeline.clone();
        let (inertial_tx, inertial_rx) = bounded(pipeline.inertial_queue_capacity.max(1));
        let (extraction_tx, extraction_rx) = bounded(pipeline.extraction_queue_capacity.max(1));
        let (export_tx, export_rx) = bounded(1);
        let (stats_stop_tx, stats_stop_rx) = bounded::<()>(0);

        let mut lanes = Vec::with_capacity(4);
        lanes.push(spawn_lane("inertial", {
            let shared = Arc::clone(&shared);
            move || run_inertial_lane(shared, inertial_rx)
        })?);
        lanes.push(spawn_lane("extraction", {
            let shared = Arc::clone(&shared);
            move || run_extraction_lane(shared, extraction_rx)
        })?);
        let interval = Duration::from_millis(pipeline.statistics_interval_ms.max(1));
        lanes.push(spawn_lane("stats", {
            let shared = Arc::clone(&shared);
            move || run_stats_lane(shared, stats_stop_rx, interval)
        })?);
        let chunk_size = config.exporter.chunk_size;
        lanes.push(spawn_lane("export", {
            let shared = Arc::clone(&shared);
            move || run_export_lane(shared, export_rx, chunk_size)
        })?);

        info!(
            "Pipeline ready: voxel_size={}, frame_divisor={}, stats every {:?}",
            shared.store.voxel_size(),
            pipeline.frame_divisor,
            interval
        );

        Ok(Self {
            config: pipeline,
            export_config: config.exporter,
            shared,
            frame_counter: AtomicU64::new(0),
            inertial_tx: Some(inertial_tx),
            extraction_tx: Some(extraction_tx),
            export_tx: Some(export_tx),
            stats_stop_tx: Some(stats_stop_tx),
            lanes,
        })
    }

    pub fn start(&self) {
        if self.shared.is_running() {
            return;
        }
        self.shared.reset_statistics();
        self.shared.tracker.start();
        self.shared.set_running(true);
        info!("Pipeline started");
    }

    /// Halt tracking and frame intake. Accumulated points stay for export;
    /// a running export is not cancelled.
    pub fn stop(&self) {
        if !self.shared.is_running() {
            return;
        }
        self.shared.set_running(false);
        self.shared.tracker.stop();
        info!("Pipeline stopped ({} voxels kept)", self.shared.store.len());
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Handle one frame from the capture session.
    ///
    /// The pose is updated on every frame. Mesh work for every Nth frame is
    /// queued for the extraction lane without blocking; a full queue drops it.
    pub fn process_frame(&self, frame: CaptureFrame) -> FrameDisposition {
        if !self.shared.is_running() {
            return FrameDisposition::Stopped;
        }
        self.shared.counters.record_frame();
        self.shared
            .tracker
            .ingest_visual_pose(&frame.camera_transform, frame.timestamp_s, frame.quality);

        let index = self.frame_counter.fetch_add(1, Ordering::Relaxed);
        if index % self.config.frame_divisor.max(1) != 0 || frame.meshes.is_empty() {
            return FrameDisposition::Tracked;
        }

        let Some(tx) = self.extraction_tx.as_ref() else {
            return FrameDisposition::Dropped;
        };
        let job = ExtractionJob {
            frame,
            frame_index: index,
            queued_at: Instant::now(),
        };
        // Counted before sending so the lane never sees an uncounted job.
        self.shared.counters.record_queued();
        match tx.try_send(job) {
            Ok(()) => FrameDisposition::Queued,
            Err(TrySendError::Full(job)) => {
                self.shared.counters.record_drop();
                debug!("Extraction queue full, dropping mesh work of frame {}", job.frame_index);
                FrameDisposition::Dropped
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.counters.record_drop();
                FrameDisposition::Dropped
            }
        }
    }

    /// Wait until every queued extraction has been inserted into the store.
    ///
    /// Returns `false` if work is still pending after `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.counters.wait_idle(timeout)
    }

    /// Queue an inertial sample for the inertial lane.
    ///
    /// Returns `false` when the sample was dropped (queue full or closed).
    pub fn submit_inertial(&self, sample: ImuSample) -> bool {
        match self.inertial_tx.as_ref() {
            Some(tx) => tx.try_send(sample).is_ok(),
            None => false,
        }
    }

    /// Queue an export of the full point set to `path`.
    ///
    /// The receiver yields the result once the export lane finishes.
    pub fn start_export(
        &self,
        path: impl Into<PathBuf>,
    ) -> Result<Receiver<Result<ExportOutcome, ExportError>>, ExportError> {
        let tx = self.export_tx.as_ref().ok_or(ExportError::PipelineClosed)?;
        let (reply, rx) = bounded(1);
        let job = ExportJob {
            path: path.into(),
            reply,
        };
        match tx.try_send(job) {
            Ok(()) => Ok(rx),
            Err(TrySendError::Full(_)) => Err(ExportError::Busy),
            Err(TrySendError::Disconnected(_)) => Err(ExportError::PipelineClosed),
        }
    }

    /// Export the full point set to `path` and wait for the outcome.
    pub fn export_scan(&self, path: impl Into<PathBuf>) -> Result<ExportOutcome, ExportError> {
        self.start_export(path)?
            .recv()
            .map_err(|_| ExportError::PipelineClosed)?
    }

    pub fn cancel_export(&self) {
        self.shared.exporter.cancel();
    }

    pub fn export_handle(&self) -> ExportHandle {
        self.shared.exporter.handle()
    }

    pub fn export_config(&self) -> &ExportConfig {
        &self.export_config
    }

    /// Fit each requested kind to the points selected by `query`, most
    /// confident first. Kinds that fail to fit are left out.
    pub fn fit_primitives(
        &self,
        query: ClusterQuery,
        kinds: &[PrimitiveKind],
    ) -> Vec<DetectedPrimitive> {
        let samples = self.query(query);
        let positions: Vec<Vector3<f64>> = samples.iter().map(|s| s.position).collect();
        let fitter = self.shared.fitter.read();
        let mut found: Vec<DetectedPrimitive> = kinds
            .iter()
            .filter_map(|&kind| fitter.fit(kind, &positions))
            .collect();
        found.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        debug!(
            "Fitted {} primitive(s) over {} points",
            found.len(),
            positions.len()
        );
        found
    }

    pub fn configure_fitter(
        &self,
        max_iterations: usize,
        convergence_threshold: f64,
        min_points_for_fit: usize,
    ) {
        self.shared
            .fitter
            .write()
            .configure(max_iterations, convergence_threshold, min_points_for_fit);
    }

    pub fn query(&self, query: ClusterQuery) -> Vec<Sample> {
        let store = &self.shared.store;
        match query {
            ClusterQuery::All => store.all_points(),
            ClusterQuery::Elevation { min_y, max_y } => store.query_elevation(min_y, max_y),
            ClusterQuery::Box { min, max } => store.query_box(&min, &max),
            ClusterQuery::Sphere { center, radius } => store.query_sphere(&center, radius),
        }
    }

    /// Latest snapshot from the statistics lane.
    pub fn statistics(&self) -> PipelineSnapshot {
        self.shared.snapshot()
    }

    /// Recompute the snapshot now instead of waiting for the next tick.
    pub fn refresh_statistics(&self) -> PipelineSnapshot {
        self.shared.refresh_statistics()
    }

    pub fn current_pose(&self) -> Pose {
        self.shared.tracker.current_pose()
    }

    pub fn subscribe_poses(&self) -> Receiver<Pose> {
        self.shared.tracker.subscribe()
    }

    /// Newly created points, one message per inserted batch.
    pub fn subscribe_points(&self) -> Receiver<Vec<Sample>> {
        self.shared.store.subscribe()
    }

    pub fn tracker(&self) -> &PoseTracker {
        &self.shared.tracker
    }

    pub fn store(&self) -> &VoxelPointStore {
        &self.shared.store
    }

    /// Stop the lanes and wait for them. Called on drop.
    pub fn shutdown(&mut self) {
        if self.lanes.is_empty() {
            return;
        }
        self.stop();
        self.shared.request_shutdown();
        self.inertial_tx.take();
        self.extraction_tx.take();
        self.export_tx.take();
        self.stats_stop_tx.take();

        for handle in self.lanes.drain(..) {
            let name = handle.thread().name().unwrap_or("lane").to_string();
            if handle.join().is_err() {
                warn!("{} lane panicked", name);
            }
        }
        info!("Pipeline shut down");
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_lane<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .with_context(|| format!("Failed to spawn {name} lane"))
}

fn run_inertial_lane(shared: Arc<PipelineShared>, rx: Receiver<ImuSample>) {
    debug!("Inertial lane started");
    loop {
        if shared.is_shutdown_requested() {
            break;
        }
        match rx.recv_timeout(RECV_TIMEOUT) {
            Ok(sample) => shared.tracker.ingest_inertial_sample(&sample),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Inertial lane exiting");
}

fn run_extraction_lane(shared: Arc<PipelineShared>, rx: Receiver<ExtractionJob>) {
    debug!("Extraction lane started");
    loop {
        if shared.is_shutdown_requested() {
            break;
        }
        let job = match rx.recv_timeout(RECV_TIMEOUT) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut created = 0;
        for batch in shared.extractor.extract(&job.frame) {
            created += shared.store.insert(&batch).len();
        }
        shared
            .counters
            .record_extraction(created, job.queued_at.elapsed());
        debug!(
            "Frame {} extracted: {} new points ({} voxels)",
            job.frame_index,
            created,
            shared.store.len()
        );
    }
    debug!("Extraction lane exiting");
}

fn run_stats_lane(shared: Arc<PipelineShared>, stop_rx: Receiver<()>, interval: Duration) {
    debug!("Statistics lane started");
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                if shared.is_running() {
                    shared.refresh_statistics();
                }
            }
            recv(stop_rx) -> _ => break,
        }
    }
    debug!("Statistics lane exiting");
}

fn run_export_lane(shared: Arc<PipelineShared>, rx: Receiver<ExportJob>, chunk_size: usize) {
    debug!("Export lane started");
    loop {
        if shared.is_shutdown_requested() {
            break;
        }
        let job = match rx.recv_timeout(RECV_TIMEOUT) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let points = shared.store.all_points();
        let indices = triplet_indices(points.len());
        info!(
            "Exporting {} points ({} faces) to {}",
            points.len(),
            indices.len() / 3,
            job.path.display()
        );
        let result = shared
            .exporter
            .export(&points, &indices, chunk_size, &job.path);
        let _ = job.reply.send(result);
    }
    debug!("Export lane exiting");
}
