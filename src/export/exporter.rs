//! Chunked, cancellable point-cloud export.
//!
//! An export runs on the caller's thread in four phases, each owning a fixed
//! band of the progress range:
//!
//! | phase            | progress  |
//! |------------------|-----------|
//! | vertex packing   | 0.0 - 0.4 |
//! | index packing    | 0.4 - 0.5 |
//! | mesh assembly    | 0.5 - 0.7 |
//! | artifact write   | 0.7 - 1.0 |
//!
//! Other threads observe and cancel it through an [`ExportHandle`].
//! Cancellation is cooperative: it is honoured at chunk and phase
//! boundaries, the partial artifact is removed and progress drops to 0.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::device::{AssembledMesh, ComputeDevice, HostDevice};
use super::error::ExportError;
use super::packing::{VERTEX_STRIDE_BYTES, pack_vertices};
use super::ply::PlyLayout;
use crate::points::Sample;

const PROGRESS_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Vertices per chunk.
    pub chunk_size: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self { chunk_size: 10_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExportPhase {
    PackVertices,
    PackIndices,
    Assemble,
    Write,
}

impl ExportPhase {
    /// Progress range owned by this phase.
    pub fn band(self) -> (f64, f64) {
        match self {
            Self::PackVertices => (0.0, 0.4),
            Self::PackIndices => (0.4, 0.5),
            Self::Assemble => (0.5, 0.7),
            Self::Write => (0.7, 1.0),
        }
    }

    fn at(self, fraction: f64) -> f64 {
        let (lo, hi) = self.band();
        if fraction >= 1.0 {
            return hi;
        }
        lo + (hi - lo) * fraction.max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportProgress {
    pub fraction: f64,
    pub phase: ExportPhase,
}

/// Summary of a completed export.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub path: PathBuf,
    pub point_count: usize,
    pub face_count: usize,
    pub byte_size: u64,
    pub duration: Duration,
}

struct ProgressState {
    fraction: f64,
    listeners: Vec<Sender<ExportProgress>>,
    /// Set while a run can still be cancelled; cleared on completion.
    cancellable: bool,
}

struct ExportShared {
    exporting: AtomicBool,
    cancel_requested: AtomicBool,
    progress: Mutex<ProgressState>,
}

impl ExportShared {
    fn progress(&self) -> f64 {
        self.progress.lock().fraction
    }

    /// Publish progress unless a cancel is pending.
    ///
    /// The cancel check and the update happen under the progress lock, so
    /// nothing is published once `cancel` has reset progress.
    fn report(&self, phase: ExportPhase, fraction: f64) -> Result<(), ExportError> {
        self.publish(phase, fraction, false)
    }

    /// Publish 1.0 and stop accepting cancellation.
    fn complete(&self) -> Result<(), ExportError> {
        self.publish(ExportPhase::Write, 1.0, true)
    }

    fn publish(&self, phase: ExportPhase, fraction: f64, last: bool) -> Result<(), ExportError> {
        let mut state = self.progress.lock();
        if self.cancel_requested.load(Ordering::Acquire) {
            return Err(ExportError::Cancelled);
        }
        if last {
            state.cancellable = false;
        }
        let value = phase.at(fraction).max(state.fraction);
        state.fraction = value;
        let event = ExportProgress {
            fraction: value,
            phase,
        };
        state
            .listeners
            .retain(|tx| !matches!(tx.try_send(event), Err(TrySendError::Disconnected(_))));
        Ok(())
    }

    fn check_cancel(&self) -> Result<(), ExportError> {
        if self.cancel_requested.load(Ordering::Acquire) {
            Err(ExportError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn cancel(&self) {
        let mut state = self.progress.lock();
        if !state.cancellable {
            return;
        }
        self.cancel_requested.store(true, Ordering::Release);
        state.fraction = 0.0;
    }

    /// Claim the exporter for a new run. Fails when one is already running.
    fn begin(&self) -> Result<(), ExportError> {
        let mut state = self.progress.lock();
        if self
            .exporting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ExportError::Busy);
        }
        self.cancel_requested.store(false, Ordering::Release);
        state.fraction = 0.0;
        state.cancellable = true;
        Ok(())
    }

    fn reset_progress(&self) {
        self.progress.lock().fraction = 0.0;
    }
}

/// Clears the exporting flag on every exit path.
struct ExportGuard<'a>(&'a ExportShared);

impl Drop for ExportGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.progress.lock();
        state.cancellable = false;
        self.0.cancel_requested.store(false, Ordering::Release);
        self.0.exporting.store(false, Ordering::Release);
    }
}

/// Cloneable view of an exporter for observers on other threads.
#[derive(Clone)]
pub struct ExportHandle {
    shared: Arc<ExportShared>,
}

impl ExportHandle {
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn progress(&self) -> f64 {
        self.shared.progress()
    }

    pub fn is_exporting(&self) -> bool {
        self.shared.exporting.load(Ordering::Acquire)
    }
}

pub struct ChunkedExporter {
    device: Option<Arc<dyn ComputeDevice>>,
    shared: Arc<ExportShared>,
}

impl ChunkedExporter {
    /// Exporter assembling on `device`. `None` models a host without a
    /// usable compute device; every export then fails fast.
    pub fn new(device: Option<Arc<dyn ComputeDevice>>) -> Self {
        Self {
            device,
            shared: Arc::new(ExportShared {
                exporting: AtomicBool::new(false),
                cancel_requested: AtomicBool::new(false),
                progress: Mutex::new(ProgressState {
                    fraction: 0.0,
                    listeners: Vec::new(),
                    cancellable: false,
                }),
            }),
        }
    }

    pub fn handle(&self) -> ExportHandle {
        ExportHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn progress(&self) -> f64 {
        self.shared.progress()
    }

    pub fn is_exporting(&self) -> bool {
        self.shared.exporting.load(Ordering::Acquire)
    }

    /// Request cancellation of the running export. No-op when idle.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn subscribe_progress(&self) -> Receiver<ExportProgress> {
        let (tx, rx) = bounded(PROGRESS_CHANNEL_CAPACITY);
        self.shared.progress.lock().listeners.push(tx);
        rx
    }

    /// Export `points` with triangle list `indices` to a PLY file at `path`.
    ///
    /// Blocks the calling thread until the artifact is written, the export
    /// fails, or another thread cancels it. Only one export runs at a time.
    pub fn export(
        &self,
        points: &[Sample],
        indices: &[u32],
        chunk_size: usize,
        path: &Path,
    ) -> Result<ExportOutcome, ExportError> {
        self.shared.begin()?;
        let _guard = ExportGuard(&self.shared);

        let started = Instant::now();
        let result = self.run(points, indices, chunk_size.max(1), path);

        match &result {
            Ok(outcome) => info!(
                "Export complete: {} points, {} faces, {} bytes in {:.2}s -> {}",
                outcome.point_count,
                outcome.face_count,
                outcome.byte_size,
                started.elapsed().as_secs_f64(),
                outcome.path.display()
            ),
            Err(ExportError::Cancelled) => {
                info!("Export cancelled");
                self.shared.reset_progress();
            }
            Err(e) => {
                warn!("Export failed: {}", e);
                self.shared.reset_progress();
            }
        }
        result.map(|mut outcome| {
            outcome.duration = started.elapsed();
            outcome
        })
    }

    fn run(
        &self,
        points: &[Sample],
        indices: &[u32],
        chunk_size: usize,
        path: &Path,
    ) -> Result<ExportOutcome, ExportError> {
        let device = self.device.as_ref().ok_or(ExportError::NoComputeDevice)?;
        if points.is_empty() {
            return Err(ExportError::EmptyInput);
        }
        validate_indices(indices, points.len())?;
        debug!(
            "Exporting {} points on {} in chunks of {}",
            points.len(),
            device.name(),
            chunk_size
        );

        let shared = &self.shared;

        // Phase 1: vertices.
        let mut vertices = Vec::with_capacity(points.len() * VERTEX_STRIDE_BYTES);
        let mut packed = 0;
        for chunk in points.chunks(chunk_size) {
            shared.check_cancel()?;
            pack_vertices(chunk, &mut vertices);
            packed += chunk.len();
            shared.report(ExportPhase::PackVertices, packed as f64 / points.len() as f64)?;
            thread::yield_now();
        }

        // Phase 2: indices.
        let mut packed_indices = Vec::with_capacity(indices.len());
        if indices.is_empty() {
            shared.report(ExportPhase::PackIndices, 1.0)?;
        }
        for chunk in indices.chunks(chunk_size * 3) {
            shared.check_cancel()?;
            packed_indices.extend_from_slice(chunk);
            shared.report(
                ExportPhase::PackIndices,
                packed_indices.len() as f64 / indices.len() as f64,
            )?;
            thread::yield_now();
        }

        // Phase 3: assembly.
        shared.check_cancel()?;
        let mesh = device.assemble(vertices, packed_indices, points.len())?;
        shared.report(ExportPhase::Assemble, 1.0)?;

        // Phase 4: write to a sibling temp file, renamed into place on success.
        let partial = partial_path(path);
        let written = write_artifact(shared, &mesh, chunk_size, &partial, path);
        if let Err(e) = written {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        fs::rename(&partial, path).map_err(|source| {
            let _ = fs::remove_file(&partial);
            ExportError::Write {
                path: path.to_path_buf(),
                source,
            }
        })?;

        if let Err(e) = shared.complete() {
            let _ = fs::remove_file(path);
            return Err(e);
        }

        let byte_size = fs::metadata(path)
            .map_err(|source| ExportError::Write {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        Ok(ExportOutcome {
            path: path.to_path_buf(),
            point_count: mesh.vertex_count,
            face_count: mesh.face_count(),
            byte_size,
            duration: Duration::ZERO,
        })
    }
}

impl Default for ChunkedExporter {
    fn default() -> Self {
        Self::new(Some(Arc::new(HostDevice)))
    }
}

fn validate_indices(indices: &[u32], vertex_count: usize) -> Result<(), ExportError> {
    if indices.len() % 3 != 0 {
        return Err(ExportError::InvalidIndices(format!(
            "{} indices do not form whole triangles",
            indices.len()
        )));
    }
    if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(ExportError::InvalidIndices(format!(
            "index {bad} out of range for {vertex_count} vertices"
        )));
    }
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

fn write_artifact(
    shared: &ExportShared,
    mesh: &AssembledMesh,
    chunk_size: usize,
    partial: &Path,
    target: &Path,
) -> Result<(), ExportError> {
    let io_err = |source| ExportError::Write {
        path: target.to_path_buf(),
        source,
    };

    let layout = PlyLayout::new(mesh.vertex_count, mesh.face_count());
    let file = File::create(partial).map_err(io_err)?;
    let mut w = BufWriter::new(file);
    layout.write_header(&mut w).map_err(io_err)?;

    let vertex_chunk = chunk_size * VERTEX_STRIDE_BYTES;
    let face_chunk = chunk_size * 3;
    let total = (mesh.vertices.len() / vertex_chunk.max(1) + 1)
        + (mesh.indices.len() / face_chunk.max(1) + 1);
    let mut done = 0usize;

    for chunk in mesh.vertices.chunks(vertex_chunk) {
        shared.check_cancel()?;
        layout.write_vertices(&mut w, chunk).map_err(io_err)?;
        done += 1;
        // Hold back the top of the band until the file is in place.
        shared.report(ExportPhase::Write, 0.95 * done as f64 / total as f64)?;
        thread::yield_now();
    }
    for chunk in mesh.indices.chunks(face_chunk) {
        shared.check_cancel()?;
        layout.write_faces(&mut w, chunk).map_err(io_err)?;
        done += 1;
        shared.report(ExportPhase::Write, 0.95 * done as f64 / total as f64)?;
        thread::yield_now();
    }

    shared.check_cancel()?;
    w.flush().map_err(io_err)?;
    w.get_ref().sync_all().map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::packing::triplet_indices;
    use crate::export::ply::FACE_RECORD_BYTES;
    use nalgebra::Vector3;

    fn cloud(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample::new(Vector3::new(i as f64 * 0.01, (i % 7) as f64, 0.0)))
            .collect()
    }

    #[test]
    fn test_progress_monotonic_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.ply");
        let exporter = ChunkedExporter::default();
        let rx = exporter.subscribe_progress();

        let points = cloud(2_500);
        let indices = triplet_indices(points.len());
        let outcome = exporter.export(&points, &indices, 100, &path).unwrap();

        let events: Vec<ExportProgress> = rx.try_iter().collect();
        assert!(events.len() > 25);
        for w in events.windows(2) {
            assert!(w[1].fraction >= w[0].fraction);
            assert!(w[1].phase >= w[0].phase);
        }
        assert_eq!(events.last().unwrap().fraction, 1.0);
        assert_eq!(exporter.progress(), 1.0);
        assert!(!exporter.is_exporting());

        assert_eq!(outcome.point_count, 2_500);
        assert_eq!(outcome.face_count, 833);
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, outcome.byte_size);
        assert!(bytes.starts_with(b"ply\n"));

        let header_end = bytes.windows(11).position(|w| w == b"end_header\n").unwrap() + 11;
        assert_eq!(
            bytes.len() - header_end,
            2_500 * VERTEX_STRIDE_BYTES + 833 * FACE_RECORD_BYTES
        );
        assert!(!partial_path(&path).exists());
    }

    /// Cancels through the handle while assembling, like a user pressing
    /// cancel mid-export.
    struct CancellingDevice {
        handle: Mutex<Option<ExportHandle>>,
    }

    impl ComputeDevice for CancellingDevice {
        fn name(&self) -> &str {
            "cancelling"
        }

        fn assemble(
            &self,
            vertices: Vec<u8>,
            indices: Vec<u32>,
            vertex_count: usize,
        ) -> Result<AssembledMesh, ExportError> {
            if let Some(handle) = self.handle.lock().as_ref() {
                handle.cancel();
            }
            HostDevice.assemble(vertices, indices, vertex_count)
        }
    }

    #[test]
    fn test_cancel_resets_and_stops_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.ply");
        let device = Arc::new(CancellingDevice {
            handle: Mutex::new(None),
        });
        let exporter = ChunkedExporter::new(Some(device.clone()));
        *device.handle.lock() = Some(exporter.handle());
        let rx = exporter.subscribe_progress();

        let points = cloud(1_000);
        let err = exporter
            .export(&points, &triplet_indices(1_000), 100, &path)
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(exporter.progress(), 0.0);
        assert!(!exporter.is_exporting());
        let events: Vec<_> = rx.try_iter().collect();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.fraction <= 0.5));
        assert!(!path.exists());
        assert!(!partial_path(&path).exists());

        // Ready for a retry once the device stops cancelling.
        *device.handle.lock() = None;
        let outcome = exporter
            .export(&points, &triplet_indices(1_000), 100, &path)
            .unwrap();
        assert_eq!(outcome.point_count, 1_000);
    }

    #[test]
    fn test_cancel_after_completion_keeps_result() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ChunkedExporter::default();
        let handle = exporter.handle();
        let points = cloud(600);
        let indices = triplet_indices(points.len());

        let rx = exporter.subscribe_progress();
        let observer = thread::spawn(move || {
            for event in rx.iter() {
                if event.fraction >= 1.0 {
                    handle.cancel();
                    break;
                }
            }
        });
        let outcome = exporter
            .export(&points, &indices, 10, &dir.path().join("b.ply"))
            .unwrap();
        observer.join().unwrap();
        assert_eq!(outcome.point_count, 600);
        assert_eq!(exporter.progress(), 1.0);
        assert!(outcome.path.exists());
    }

    #[test]
    fn test_cancel_when_idle_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ChunkedExporter::default();
        exporter.cancel();
        let path = dir.path().join("a.ply");
        assert!(exporter.export(&cloud(3), &[0, 1, 2], 10, &path).is_ok());
    }

    #[test]
    fn test_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ChunkedExporter::new(None);
        let err = exporter
            .export(&cloud(9), &[], 10, &dir.path().join("x.ply"))
            .unwrap_err();
        assert!(matches!(err, ExportError::NoComputeDevice));
        assert!(!exporter.is_exporting());
        assert_eq!(exporter.progress(), 0.0);
    }

    #[test]
    fn test_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ChunkedExporter::default();
        let err = exporter
            .export(&[], &[], 10, &dir.path().join("x.ply"))
            .unwrap_err();
        assert!(matches!(err, ExportError::EmptyInput));
    }

    #[test]
    fn test_invalid_indices() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ChunkedExporter::default();
        let path = dir.path().join("x.ply");
        let err = exporter.export(&cloud(3), &[0, 1, 3], 10, &path).unwrap_err();
        assert!(matches!(err, ExportError::InvalidIndices(_)));
        let err = exporter.export(&cloud(3), &[0, 1], 10, &path).unwrap_err();
        assert!(matches!(err, ExportError::InvalidIndices(_)));
    }

    #[test]
    fn test_write_failure_carries_cause() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("scan.ply");
        let exporter = ChunkedExporter::default();
        let err = exporter
            .export(&cloud(30), &triplet_indices(30), 10, &path)
            .unwrap_err();

        match err {
            ExportError::Write { path: p, source } => {
                assert_eq!(p, path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(exporter.progress(), 0.0);
        assert!(!exporter.is_exporting());
    }

    /// Blocks in assembly until released.
    struct GateDevice {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl ComputeDevice for GateDevice {
        fn name(&self) -> &str {
            "gate"
        }

        fn assemble(
            &self,
            vertices: Vec<u8>,
            indices: Vec<u32>,
            vertex_count: usize,
        ) -> Result<AssembledMesh, ExportError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            HostDevice.assemble(vertices, indices, vertex_count)
        }
    }

    #[test]
    fn test_second_export_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let exporter = Arc::new(ChunkedExporter::new(Some(Arc::new(GateDevice {
            entered: entered_tx,
            release: release_rx,
        }))));

        let path = dir.path().join("a.ply");
        let worker = {
            let exporter = Arc::clone(&exporter);
            let path = path.clone();
            thread::spawn(move || exporter.export(&cloud(6), &[0, 1, 2, 3, 4, 5], 10, &path))
        };

        entered_rx.recv().unwrap();
        assert!(exporter.is_exporting());
        let err = exporter
            .export(&cloud(3), &[], 10, &dir.path().join("b.ply"))
            .unwrap_err();
        assert!(matches!(err, ExportError::Busy));

        release_tx.send(()).unwrap();
        let outcome = worker.join().unwrap().unwrap();
        assert_eq!(outcome.face_count, 2);
    }
}
