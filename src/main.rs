use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use depthscan::PipelineConfig;
use depthscan::fitting::PrimitiveKind;
use depthscan::io::CaptureLog;
use depthscan::system::{ClusterQuery, FrameDisposition, PipelineCoordinator};

const DEFAULT_CONFIG: &str = "configs/depthscan.yaml";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("depthscan=info".parse()?),
        )
        .init();

    // Usage: depthscan-replay [capture_dir] [output.ply] [config.yaml]
    let args: Vec<String> = std::env::args().collect();
    let capture_dir = args.get(1).map(String::as_str).unwrap_or("data/capture");
    let output = PathBuf::from(args.get(2).map(String::as_str).unwrap_or("scan.ply"));

    let config = match args.get(3) {
        Some(path) => PipelineConfig::load(Path::new(path))
            .with_context(|| format!("Failed to load config {}", path))?,
        None if Path::new(DEFAULT_CONFIG).exists() => PipelineConfig::load(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("Failed to load config {}", DEFAULT_CONFIG))?,
        None => PipelineConfig::default(),
    };

    let log = CaptureLog::load(capture_dir)
        .with_context(|| format!("Failed to load capture from {}", capture_dir))?;
    let pipeline = PipelineCoordinator::new(config)?;
    pipeline.start();

    let started = Instant::now();
    let mut dropped = 0usize;
    let mut prev_ts = 0u64;
    for i in 0..log.len() {
        let ts = log
            .frame_timestamp(i)
            .with_context(|| format!("No frame at index {}", i))?;
        for sample in log.imu_between(prev_ts, ts) {
            if !pipeline.submit_inertial(sample) {
                warn!("Inertial queue full at frame {}", i);
            }
        }
        prev_ts = ts;

        let frame = log
            .frame(i)
            .with_context(|| format!("No frame at index {}", i))?;
        if pipeline.process_frame(frame) == FrameDisposition::Dropped {
            dropped += 1;
        }

        if i % 100 == 0 {
            let stats = pipeline.refresh_statistics();
            info!(
                "Frame {}/{}: {} voxels, {:.0} pts/s, latency {:.1} ms, quality {:?}",
                i,
                log.len(),
                stats.voxel_count,
                stats.points_per_second,
                stats.latency_ms,
                stats.quality
            );
        }
    }

    if !pipeline.wait_idle(Duration::from_secs(30)) {
        warn!("Extraction still busy after replay; exporting what is stored");
    }
    pipeline.stop();

    let stats = pipeline.store().statistics();
    info!(
        "Replayed {} frames in {:.2}s: {} voxels from {} samples (ratio {:.3}), {} frames dropped",
        log.len(),
        started.elapsed().as_secs_f64(),
        stats.voxel_count,
        stats.total_processed,
        stats.compression_ratio,
        dropped
    );

    let primitives = pipeline.fit_primitives(
        ClusterQuery::All,
        &[
            PrimitiveKind::Plane,
            PrimitiveKind::Cylinder,
            PrimitiveKind::Sphere,
        ],
    );
    for p in &primitives {
        info!(
            "{} {}: center=[{:.2}, {:.2}, {:.2}] confidence={:.2} inliers={}",
            p.kind,
            p.id,
            p.center.x,
            p.center.y,
            p.center.z,
            p.confidence,
            p.point_indices.len()
        );
    }

    let outcome = pipeline
        .export_scan(&output)
        .with_context(|| format!("Failed to export {}", output.display()))?;
    info!(
        "Wrote {} ({} points, {} faces, {} bytes) in {:.2}s",
        outcome.path.display(),
        outcome.point_count,
        outcome.face_count,
        outcome.byte_size,
        outcome.duration.as_secs_f64()
    );

    Ok(())
}
