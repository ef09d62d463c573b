//! Image sequences with optional ground truth.

pub mod euroc;
pub mod kitti;

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use nalgebra::{Matrix3, Matrix4};
use serde::{Deserialize, Serialize};

pub use euroc::EurocSequence;
pub use kitti::KittiSequence;

/// One frame of a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRef {
    pub index: usize,
    /// Seconds since the start of the recording.
    pub timestamp: f64,
    pub image_path: PathBuf,
    /// Camera-to-world pose.
    pub ground_truth: Option<Matrix4<f64>>,
}

pub trait Sequence: Send + Sync {
    fn name(&self) -> &str;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn frame(&self, index: usize) -> Option<FrameRef>;

    /// Pinhole camera matrix K.
    fn intrinsics(&self) -> Matrix3<f64>;
}

/// Resolves sequence names to loaded sequences.
pub trait SequenceLoader: Send + Sync {
    fn load(&self, sequence: &str) -> Result<Box<dyn Sequence>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    #[default]
    Euroc,
    Kitti,
}

/// Loads sequences of one dataset layout under a common root.
#[derive(Debug, Clone)]
pub struct DatasetLoader {
    kind: DatasetKind,
    root: PathBuf,
}

impl DatasetLoader {
    pub fn new(kind: DatasetKind, root: impl AsRef<Path>) -> Self {
        Self {
            kind,
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl SequenceLoader for DatasetLoader {
    fn load(&self, sequence: &str) -> Result<Box<dyn Sequence>> {
        if sequence.is_empty() || sequence.contains("..") {
            bail!("invalid sequence name '{}'", sequence);
        }
        Ok(match self.kind {
            DatasetKind::Euroc => Box::new(EurocSequence::load(self.root.join(sequence), sequence)?),
            DatasetKind::Kitti => Box::new(KittiSequence::load(&self.root, sequence)?),
        })
    }
}

/// Sequence held entirely in memory.
#[derive(Debug, Clone)]
pub struct FrameListSequence {
    name: String,
    frames: Vec<FrameRef>,
    intrinsics: Matrix3<f64>,
}

impl FrameListSequence {
    pub fn new(name: impl Into<String>, frames: Vec<FrameRef>, intrinsics: Matrix3<f64>) -> Self {
        Self {
            name: name.into(),
            frames,
            intrinsics,
        }
    }
}

impl Sequence for FrameListSequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self, index: usize) -> Option<FrameRef> {
        self.frames.get(index).cloned()
    }

    fn intrinsics(&self) -> Matrix3<f64> {
        self.intrinsics
    }
}

pub(crate) fn intrinsics_matrix(fx: f64, fy: f64, cx: f64, cy: f64) -> Matrix3<f64> {
    Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0)
}
