//! Similarity transform used to register an estimated trajectory onto its
//! ground truth.
//!
//! Monocular estimates only recover translation up to scale, so the
//! registration may carry a scale factor besides the rigid part.

use nalgebra::{Matrix3, Matrix4, Rotation3, Vector3};

use super::pose;

/// `x -> scale * rotation * x + translation`
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    /// Build from a rotation matrix. The matrix must already be orthonormal.
    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation: Rotation3::from_matrix_unchecked(rotation),
            translation,
            scale,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        *self.rotation.matrix()
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        (self.rotation * p) * self.scale + self.translation
    }

    /// Move a camera-to-world pose into the target frame.
    ///
    /// Only the camera centre is scaled, the returned pose is rigid.
    pub fn transform_pose(&self, camera: &Matrix4<f64>) -> Matrix4<f64> {
        let orientation = self.rotation_matrix() * pose::rotation(camera);
        let centre = self.transform_point(&pose::position(camera));
        pose::from_rt(&orientation, &centre)
    }
}
