//! EuRoC MAV sequences (monocular `cam0`).
//!
//! Layout: `<seq>/mav0/cam0/{data.csv,data/,sensor.yaml}` and
//! `<seq>/mav0/state_groundtruth_estimate0/data.csv`. The `mav0` level is
//! optional.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use csv::ReaderBuilder;
use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::Deserialize;
use tracing::{info, warn};

use super::{FrameRef, Sequence, intrinsics_matrix};
use crate::geometry::pose;

/// Ground truth further than this from an image timestamp is not used.
const MAX_GT_OFFSET_NS: u64 = 20_000_000;

#[derive(Debug, Clone)]
struct ImageEntry {
    timestamp_ns: u64,
    filename: String,
}

#[derive(Debug, Clone)]
struct GroundTruthEntry {
    timestamp_ns: u64,
    /// Body-to-world.
    pose: Matrix4<f64>,
}

#[derive(Debug)]
pub struct EurocSequence {
    name: String,
    cam_dir: PathBuf,
    images: Vec<ImageEntry>,
    /// Camera-to-world pose per image, when ground truth covers it.
    ground_truth: Vec<Option<Matrix4<f64>>>,
    intrinsics: Matrix3<f64>,
}

impl EurocSequence {
    pub fn load<P: AsRef<Path>>(root: P, name: &str) -> Result<Self> {
        let root = root.as_ref();
        let base = if root.join("mav0").is_dir() {
            root.join("mav0")
        } else {
            root.to_path_buf()
        };
        if !base.is_dir() {
            bail!("EuRoC sequence directory {} does not exist", base.display());
        }

        let cam_dir = base.join("cam0");
        let images = load_image_list(cam_dir.join("data.csv"))?;
        let calib = load_camera_yaml(&cam_dir.join("sensor.yaml"))?;

        let groundtruth = load_groundtruth_list(base.join("state_groundtruth_estimate0/data.csv"))
            .unwrap_or_else(|e| {
                warn!("Could not load ground truth: {:#}. Continuing without it.", e);
                Vec::new()
            });

        // T_world_cam = T_world_body * T_body_cam
        let ground_truth = images
            .iter()
            .map(|img| {
                nearest_groundtruth(&groundtruth, img.timestamp_ns).map(|gt| gt.pose * calib.t_bs)
            })
            .collect::<Vec<_>>();

        info!(
            sequence = name,
            frames = images.len(),
            with_gt = ground_truth.iter().filter(|g| g.is_some()).count(),
            "Loaded EuRoC sequence"
        );

        Ok(Self {
            name: name.to_string(),
            cam_dir,
            images,
            ground_truth,
            intrinsics: calib.k,
        })
    }
}

impl Sequence for EurocSequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.images.len()
    }

    fn frame(&self, index: usize) -> Option<FrameRef> {
        let entry = self.images.get(index)?;
        let t0 = self.images.first().map(|e| e.timestamp_ns).unwrap_or(0);
        Some(FrameRef {
            index,
            timestamp: entry.timestamp_ns.saturating_sub(t0) as f64 * 1e-9,
            image_path: self.cam_dir.join("data").join(&entry.filename),
            ground_truth: self.ground_truth.get(index).copied().flatten(),
        })
    }

    fn intrinsics(&self) -> Matrix3<f64> {
        self.intrinsics
    }
}

fn nearest_groundtruth(gt: &[GroundTruthEntry], timestamp_ns: u64) -> Option<&GroundTruthEntry> {
    let idx = gt.partition_point(|e| e.timestamp_ns < timestamp_ns);
    let after = gt.get(idx);
    let before = idx.checked_sub(1).and_then(|i| gt.get(i));
    let best = match (before, after) {
        (Some(b), Some(a)) => {
            if timestamp_ns - b.timestamp_ns <= a.timestamp_ns - timestamp_ns {
                b
            } else {
                a
            }
        }
        (Some(b), None) => b,
        (None, Some(a)) => a,
        (None, None) => return None,
    };
    (best.timestamp_ns.abs_diff(timestamp_ns) <= MAX_GT_OFFSET_NS).then_some(best)
}

fn load_image_list(csv_path: PathBuf) -> Result<Vec<ImageEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        let ts: u64 = rec[0].trim().parse()?;
        let filename = rec[1].trim().to_string();
        entries.push(ImageEntry {
            timestamp_ns: ts,
            filename,
        });
    }
    Ok(entries)
}

fn load_groundtruth_list(csv_path: PathBuf) -> Result<Vec<GroundTruthEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        // timestamp, p_RS_R xyz, q_RS wxyz, ...
        if rec.len() < 8 {
            continue;
        }
        let field = |i: usize| -> Result<f64> {
            rec[i]
                .trim()
                .parse()
                .with_context(|| format!("Bad ground-truth value '{}'", &rec[i]))
        };
        let ts: u64 = rec[0].trim().parse()?;
        let position = Vector3::new(field(1)?, field(2)?, field(3)?);
        let pose = pose::from_quaternion(field(4)?, field(5)?, field(6)?, field(7)?, position);
        entries.push(GroundTruthEntry {
            timestamp_ns: ts,
            pose,
        });
    }
    entries.sort_by_key(|e| e.timestamp_ns);
    Ok(entries)
}

#[derive(Debug, Deserialize)]
struct TransformYaml {
    data: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct CameraYaml {
    #[serde(rename = "T_BS")]
    t_bs: TransformYaml,
    /// [fx, fy, cx, cy]
    intrinsics: Vec<f64>,
}

struct CameraCalibration {
    k: Matrix3<f64>,
    /// Sensor-to-body.
    t_bs: Matrix4<f64>,
}

fn load_camera_yaml(path: &Path) -> Result<CameraCalibration> {
    let cam: CameraYaml = serde_yaml::from_reader(
        File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
    )
    .with_context(|| format!("Failed to parse {:?}", path))?;

    if cam.intrinsics.len() != 4 {
        bail!(
            "Expected 4 intrinsics [fx, fy, cx, cy], got {}",
            cam.intrinsics.len()
        );
    }
    if cam.t_bs.data.len() != 16 {
        bail!("Expected 16 elements for T_BS, got {}", cam.t_bs.data.len());
    }
    let i = &cam.intrinsics;
    Ok(CameraCalibration {
        k: intrinsics_matrix(i[0], i[1], i[2], i[3]),
        t_bs: Matrix4::from_row_slice(&cam.t_bs.data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::fs;

    const SENSOR_YAML: &str = "\
sensor_type: camera
T_BS:
  cols: 4
  rows: 4
  data: [1.0, 0.0, 0.0, 0.5,
         0.0, 1.0, 0.0, 0.0,
         0.0, 0.0, 1.0, 0.0,
         0.0, 0.0, 0.0, 1.0]
rate_hz: 20
resolution: [752, 480]
intrinsics: [458.654, 457.296, 367.215, 248.375]
";

    fn write_sequence(dir: &Path) {
        let cam = dir.join("mav0/cam0");
        fs::create_dir_all(cam.join("data")).unwrap();
        fs::write(cam.join("sensor.yaml"), SENSOR_YAML).unwrap();
        fs::write(
            cam.join("data.csv"),
            "#timestamp [ns],filename\n\
             1000000000,1000000000.png\n\
             1050000000,1050000000.png\n\
             2000000000,2000000000.png\n",
        )
        .unwrap();
        let gt = dir.join("mav0/state_groundtruth_estimate0");
        fs::create_dir_all(&gt).unwrap();
        fs::write(
            gt.join("data.csv"),
            "#timestamp,p_x,p_y,p_z,q_w,q_x,q_y,q_z\n\
             1000000000,1.0,2.0,3.0,1.0,0.0,0.0,0.0\n\
             1049000000,1.5,2.0,3.0,1.0,0.0,0.0,0.0\n",
        )
        .unwrap();
    }

    #[test]
    fn test_load_sequence() {
        let dir = tempfile::tempdir().unwrap();
        write_sequence(dir.path());
        let seq = EurocSequence::load(dir.path(), "MH_test").unwrap();

        assert_eq!(seq.len(), 3);
        assert_relative_eq!(seq.intrinsics()[(0, 0)], 458.654);
        assert_relative_eq!(seq.intrinsics()[(1, 2)], 248.375);

        let f0 = seq.frame(0).unwrap();
        assert_eq!(f0.timestamp, 0.0);
        assert!(f0.image_path.ends_with("cam0/data/1000000000.png"));
        // Camera sits 0.5 m along body x.
        let p0 = pose::position(&f0.ground_truth.unwrap());
        assert_relative_eq!(p0, Vector3::new(1.5, 2.0, 3.0));

        let f1 = seq.frame(1).unwrap();
        assert_relative_eq!(f1.timestamp, 0.05, epsilon = 1e-9);
        assert_relative_eq!(pose::position(&f1.ground_truth.unwrap()).x, 2.0);

        // No ground truth within tolerance of the last image.
        assert!(seq.frame(2).unwrap().ground_truth.is_none());
        assert!(seq.frame(3).is_none());
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EurocSequence::load(dir.path().join("nope"), "nope").is_err());
    }
}
