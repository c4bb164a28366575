//! Recorded capture sessions stored as CSV.
//!
//! A capture directory holds three headerless CSV files (`#` comments
//! allowed):
//!
//! - `poses.csv`: `timestamp_ns, px, py, pz, qw, qx, qy, qz[, quality]`
//!   One row per frame. `quality` is 0 unavailable, 1 limited, 2 normal,
//!   3 high; it defaults to normal.
//! - `imu.csv`: `timestamp_ns, gx, gy, gz, ax, ay, az[, qw, qx, qy, qz]`
//!   Gravity-free acceleration in the body frame; the attitude defaults to
//!   identity.
//! - `points.csv` (optional): `timestamp_ns, x, y, z, nx, ny, nz[, class]`
//!   Mesh vertices in world coordinates, attached to the frame with the
//!   same timestamp.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, StringRecord};
use nalgebra::{UnitQuaternion, Vector3};
use tracing::{info, warn};

use crate::geometry::SE3;
use crate::imu::{INERTIAL_RATE_HZ, ImuSample};
use crate::points::{BufferView, CaptureFrame, MeshPayload, SourceId};
use crate::tracking::TrackingQuality;

#[derive(Debug, Clone)]
pub struct PoseEntry {
    pub timestamp_ns: u64,
    pub pose: SE3,
    pub quality: TrackingQuality,
}

#[derive(Debug, Clone)]
pub struct ImuEntry {
    pub timestamp_ns: u64,
    pub sample: ImuSample,
}

#[derive(Debug, Clone, Copy)]
pub struct PointEntry {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub class_code: u8,
}

#[derive(Debug)]
pub struct CaptureLog {
    root: PathBuf,
    pub poses: Vec<PoseEntry>,
    pub imu_entries: Vec<ImuEntry>,
    points: BTreeMap<u64, Vec<PointEntry>>,
}

impl CaptureLog {
    pub fn load<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let poses = load_poses(&root.join("poses.csv"))?;
        if poses.is_empty() {
            bail!("{} contains no poses", root.join("poses.csv").display());
        }
        let imu_entries = load_imu(&root.join("imu.csv"))?;

        let points_path = root.join("points.csv");
        let points = if points_path.exists() {
            load_points(&points_path)?
        } else {
            warn!("No points.csv in {}; frames carry no meshes", root.display());
            BTreeMap::new()
        };

        info!(
            "Loaded capture {}: {} frames, {} inertial samples, {} meshes",
            root.display(),
            poses.len(),
            imu_entries.len(),
            points.len()
        );

        Ok(Self {
            root,
            poses,
            imu_entries,
            points,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn frame_timestamp(&self, idx: usize) -> Option<u64> {
        self.poses.get(idx).map(|p| p.timestamp_ns)
    }

    /// Frame `idx` with its mesh, if any points were recorded for it.
    pub fn frame(&self, idx: usize) -> Option<CaptureFrame> {
        let entry = self.poses.get(idx)?;
        let mut frame = CaptureFrame::new(
            entry.timestamp_ns as f64 * 1e-9,
            entry.pose.to_matrix(),
            entry.quality,
        );

        if let Some(points) = self.points.get(&entry.timestamp_ns) {
            let positions: Vec<[f32; 3]> = points.iter().map(|p| p.position).collect();
            let normals: Vec<[f32; 3]> = points.iter().map(|p| p.normal).collect();
            let classes: Vec<u8> = points.iter().map(|p| p.class_code).collect();
            frame = frame.with_mesh(MeshPayload {
                source: SourceId(idx as u64),
                transform: nalgebra::Matrix4::identity(),
                vertices: BufferView::from_vec3s(&positions),
                normals: BufferView::from_vec3s(&normals),
                classifications: Some(BufferView::from_bytes(&classes)),
            });
        }
        Some(frame)
    }

    /// Inertial samples with `t_ns_start < t <= t_ns_end`.
    pub fn imu_between(&self, t_ns_start: u64, t_ns_end: u64) -> Vec<ImuSample> {
        let start = self
            .imu_entries
            .partition_point(|e| e.timestamp_ns <= t_ns_start);
        let end = self
            .imu_entries
            .partition_point(|e| e.timestamp_ns <= t_ns_end);
        self.imu_entries[start..end.max(start)]
            .iter()
            .map(|e| e.sample)
            .collect()
    }
}

fn reader(csv_path: &Path) -> Result<csv::Reader<std::fs::File>> {
    ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))
}

fn field<T: std::str::FromStr>(rec: &StringRecord, i: usize, path: &Path) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = rec
        .get(i)
        .with_context(|| format!("Missing column {} in {}", i, path.display()))?;
    raw.trim()
        .parse()
        .with_context(|| format!("Bad value {:?} in column {} of {}", raw, i, path.display()))
}

fn vec3(rec: &StringRecord, first: usize, path: &Path) -> Result<Vector3<f64>> {
    Ok(Vector3::new(
        field(rec, first, path)?,
        field(rec, first + 1, path)?,
        field(rec, first + 2, path)?,
    ))
}

fn quality_from_code(code: u8) -> TrackingQuality {
    match code {
        0 => TrackingQuality::Unavailable,
        1 => TrackingQuality::Limited,
        3 => TrackingQuality::High,
        _ => TrackingQuality::Normal,
    }
}

fn load_poses(csv_path: &Path) -> Result<Vec<PoseEntry>> {
    let mut rdr = reader(csv_path)?;
    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 8 {
            continue;
        }
        let timestamp_ns: u64 = field(&rec, 0, csv_path)?;
        let position = vec3(&rec, 1, csv_path)?;
        let pose = SE3::from_quaternion(
            field(&rec, 4, csv_path)?,
            field(&rec, 5, csv_path)?,
            field(&rec, 6, csv_path)?,
            field(&rec, 7, csv_path)?,
            position,
        );
        let quality = if rec.len() > 8 {
            quality_from_code(field(&rec, 8, csv_path)?)
        } else {
            TrackingQuality::Normal
        };
        entries.push(PoseEntry {
            timestamp_ns,
            pose,
            quality,
        });
    }
    entries.sort_by_key(|e| e.timestamp_ns);
    Ok(entries)
}

fn load_imu(csv_path: &Path) -> Result<Vec<ImuEntry>> {
    let mut rdr = reader(csv_path)?;
    let mut entries: Vec<ImuEntry> = Vec::new();
    let nominal_dt = 1.0 / INERTIAL_RATE_HZ;

    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 7 {
            continue;
        }
        let timestamp_ns: u64 = field(&rec, 0, csv_path)?;
        let gyro = vec3(&rec, 1, csv_path)?;
        let accel = vec3(&rec, 4, csv_path)?;
        let orientation = if rec.len() >= 11 {
            UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                field(&rec, 7, csv_path)?,
                field(&rec, 8, csv_path)?,
                field(&rec, 9, csv_path)?,
                field(&rec, 10, csv_path)?,
            ))
        } else {
            UnitQuaternion::identity()
        };

        let dt = match entries.last() {
            Some(prev) if timestamp_ns > prev.timestamp_ns => {
                (timestamp_ns - prev.timestamp_ns) as f64 * 1e-9
            }
            _ => nominal_dt,
        };

        entries.push(ImuEntry {
            timestamp_ns,
            sample: ImuSample::new(timestamp_ns as f64 * 1e-9, accel, gyro, orientation, dt),
        });
    }
    Ok(entries)
}

fn load_points(csv_path: &Path) -> Result<BTreeMap<u64, Vec<PointEntry>>> {
    let mut rdr = reader(csv_path)?;
    let mut by_frame: BTreeMap<u64, Vec<PointEntry>> = BTreeMap::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 7 {
            continue;
        }
        let timestamp_ns: u64 = field(&rec, 0, csv_path)?;
        let mut values = [0f32; 6];
        for (i, v) in values.iter_mut().enumerate() {
            *v = field(&rec, i + 1, csv_path)?;
        }
        let class_code = if rec.len() > 7 {
            field(&rec, 7, csv_path)?
        } else {
            0
        };
        by_frame.entry(timestamp_ns).or_default().push(PointEntry {
            position: [values[0], values[1], values[2]],
            normal: [values[3], values[4], values[5]],
            class_code,
        });
    }
    Ok(by_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::Classification;
    use approx::assert_relative_eq;
    use std::fs;

    fn write_capture(dir: &Path) {
        fs::write(
            dir.join("poses.csv"),
            "# timestamp, p, q, quality\n\
             1000000000,0,0,0,1,0,0,0,2\n\
             2000000000,0.5,0,0,1,0,0,0\n\
             1500000000,0.25,0,0,1,0,0,0,1\n",
        )
        .unwrap();
        fs::write(
            dir.join("imu.csv"),
            "1000000000,0,0,0,1,0,0\n\
             1010000000,0,0,0,1,0,0\n\
             1020000000,0,0,0,1,0,0,1,0,0,0\n\
             2000000000,0,0,0,0,0,0\n",
        )
        .unwrap();
        fs::write(
            dir.join("points.csv"),
            "1000000000,0,0,0,0,1,0,2\n\
             1000000000,1,0,0,0,1,0,2\n\
             2000000000,0,1,0,1,0,0\n",
        )
        .unwrap();
    }

    #[test]
    fn test_load_capture() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(dir.path());
        let log = CaptureLog::load(dir.path()).unwrap();

        assert_eq!(log.len(), 3);
        // Rows are sorted by time.
        assert_eq!(log.frame_timestamp(1), Some(1_500_000_000));
        assert_eq!(log.poses[1].quality, TrackingQuality::Limited);
        assert_eq!(log.poses[0].quality, TrackingQuality::Normal);

        let frame = log.frame(0).unwrap();
        assert_relative_eq!(frame.timestamp_s, 1.0);
        assert_eq!(frame.meshes.len(), 1);
        let mesh = &frame.meshes[0];
        assert_eq!(mesh.vertex_count(), 2);
        assert_eq!(mesh.vertices.read_vec3(1), Some(Vector3::new(1.0, 0.0, 0.0)));
        assert_eq!(
            mesh.classifications.as_ref().and_then(|c| c.read_u8(0)).map(Classification::from_code),
            Some(Classification::Ground)
        );

        // No points for the middle frame.
        assert!(log.frame(1).unwrap().meshes.is_empty());
        assert_relative_eq!(log.frame(2).unwrap().camera_transform[(0, 3)], 0.5);
        assert!(log.frame(3).is_none());
    }

    #[test]
    fn test_imu_between_and_dt() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(dir.path());
        let log = CaptureLog::load(dir.path()).unwrap();

        let window = log.imu_between(1_000_000_000, 2_000_000_000);
        assert_eq!(window.len(), 3);
        assert_relative_eq!(window[0].dt, 0.01, epsilon = 1e-12);
        assert_relative_eq!(window[2].dt, 0.98, epsilon = 1e-12);
        assert_relative_eq!(log.imu_entries[0].sample.dt, 1.0 / INERTIAL_RATE_HZ);
        assert!(log.imu_between(2_000_000_000, 3_000_000_000).is_empty());
    }

    #[test]
    fn test_missing_poses_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CaptureLog::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("poses.csv"));
    }
}
