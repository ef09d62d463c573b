//! KITTI odometry sequences (left grayscale camera).
//!
//! Layout: `<root>/sequences/<seq>/{image_0/,times.txt,calib.txt}` and
//! `<root>/poses/<seq>.txt` (ground truth exists for sequences 00-10 only).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, Trim};
use nalgebra::{Matrix3, Matrix4};
use tracing::{info, warn};

use super::{FrameRef, Sequence, intrinsics_matrix};

#[derive(Debug)]
pub struct KittiSequence {
    name: String,
    image_dir: PathBuf,
    timestamps: Vec<f64>,
    poses: Vec<Matrix4<f64>>,
    intrinsics: Matrix3<f64>,
}

impl KittiSequence {
    pub fn load(root: &Path, name: &str) -> Result<Self> {
        let seq_dir = root.join("sequences").join(name);
        if !seq_dir.is_dir() {
            bail!("KITTI sequence directory {} does not exist", seq_dir.display());
        }

        let timestamps = load_rows(&seq_dir.join("times.txt"))?
            .into_iter()
            .filter_map(|row| row.first().copied())
            .collect::<Vec<_>>();
        let intrinsics = load_calibration(&seq_dir.join("calib.txt"))?;

        let poses_path = root.join("poses").join(format!("{}.txt", name));
        let poses = if poses_path.exists() {
            load_poses(&poses_path)?
        } else {
            warn!(sequence = name, "No KITTI ground truth, continuing without it");
            Vec::new()
        };
        if !poses.is_empty() && poses.len() != timestamps.len() {
            warn!(
                poses = poses.len(),
                frames = timestamps.len(),
                "KITTI pose count differs from frame count"
            );
        }

        info!(sequence = name, frames = timestamps.len(), "Loaded KITTI sequence");
        Ok(Self {
            name: name.to_string(),
            image_dir: seq_dir.join("image_0"),
            timestamps,
            poses,
            intrinsics,
        })
    }
}

impl Sequence for KittiSequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.timestamps.len()
    }

    fn frame(&self, index: usize) -> Option<FrameRef> {
        let timestamp = *self.timestamps.get(index)?;
        Some(FrameRef {
            index,
            timestamp,
            image_path: self.image_dir.join(format!("{:06}.png", index)),
            ground_truth: self.poses.get(index).copied(),
        })
    }

    fn intrinsics(&self) -> Matrix3<f64> {
        self.intrinsics
    }
}

/// Whitespace-separated numeric rows.
fn load_rows(path: &Path) -> Result<Vec<Vec<f64>>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut rows = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let row = rec
            .iter()
            .filter(|f| !f.is_empty())
            .map(|f| {
                f.parse::<f64>()
                    .with_context(|| format!("Bad number '{}' in {}", f, path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        if !row.is_empty() {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// 3x4 row-major camera-to-world poses, one per line.
fn load_poses(path: &Path) -> Result<Vec<Matrix4<f64>>> {
    load_rows(path)?
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            if row.len() != 12 {
                bail!("Pose line {} has {} values, expected 12", i + 1, row.len());
            }
            let mut m = Matrix4::identity();
            for r in 0..3 {
                for c in 0..4 {
                    m[(r, c)] = row[r * 4 + c];
                }
            }
            Ok(m)
        })
        .collect()
}

/// K of the left grayscale camera from the `P0:` projection matrix.
fn load_calibration(path: &Path) -> Result<Matrix3<f64>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    for line in text.lines() {
        let Some(values) = line.strip_prefix("P0:") else {
            continue;
        };
        let p = values
            .split_whitespace()
            .map(|v| v.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Bad P0 entry in {}", path.display()))?;
        if p.len() != 12 {
            bail!("P0 has {} values, expected 12", p.len());
        }
        return Ok(intrinsics_matrix(p[0], p[5], p[2], p[6]));
    }
    bail!("No P0 entry in {}", path.display())
}
