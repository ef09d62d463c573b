//! Helpers for 4x4 homogeneous rigid transforms.
//!
//! Poses are stored as plain `Matrix4<f64>` so they serialize cleanly into
//! frame results. Convention: `T_wc`, camera to world.

use nalgebra::{Matrix3, Matrix4, Quaternion, UnitQuaternion, Vector3};

/// Tolerance used when deciding whether a matrix is a valid rigid transform.
pub const RIGID_TOLERANCE: f64 = 1e-3;

/// Build a pose from rotation block and translation.
pub fn from_rt(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix4<f64> {
    let mut pose = Matrix4::identity();
    pose.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    pose.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    pose
}

/// Build a pose from a w-first quaternion and a position.
pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, position: Vector3<f64>) -> Matrix4<f64> {
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz));
    from_rt(&rotation.to_rotation_matrix().into_inner(), &position)
}

pub fn rotation(pose: &Matrix4<f64>) -> Matrix3<f64> {
    pose.fixed_view::<3, 3>(0, 0).into_owned()
}

pub fn position(pose: &Matrix4<f64>) -> Vector3<f64> {
    Vector3::new(pose[(0, 3)], pose[(1, 3)], pose[(2, 3)])
}

/// Inverse of a rigid transform: [R^T | -R^T t].
pub fn rigid_inverse(pose: &Matrix4<f64>) -> Matrix4<f64> {
    let r_t = rotation(pose).transpose();
    let t = -(r_t * position(pose));
    from_rt(&r_t, &t)
}

/// Relative motion from `a` to `b`: inv(a) * b.
pub fn relative(a: &Matrix4<f64>, b: &Matrix4<f64>) -> Matrix4<f64> {
    rigid_inverse(a) * b
}

/// Check that `pose` is a proper rigid transform within `tolerance`:
/// orthonormal rotation block, unit determinant and a `[0, 0, 0, 1]` bottom row.
pub fn is_valid_rigid_transform(pose: &Matrix4<f64>, tolerance: f64) -> bool {
    if pose.iter().any(|v| !v.is_finite()) {
        return false;
    }

    let bottom = [pose[(3, 0)], pose[(3, 1)], pose[(3, 2)], pose[(3, 3)]];
    let expected = [0.0, 0.0, 0.0, 1.0];
    if bottom
        .iter()
        .zip(expected.iter())
        .any(|(a, b)| (a - b).abs() > tolerance)
    {
        return false;
    }

    let r = rotation(pose);
    let orthogonality = r.transpose() * r - Matrix3::identity();
    if orthogonality.iter().any(|v| v.abs() > tolerance) {
        return false;
    }

    (r.determinant() - 1.0).abs() <= tolerance
}

/// Rotation angle (degrees) of a rotation matrix.
pub fn rotation_angle_deg(rotation: &Matrix3<f64>) -> f64 {
    let cos = ((rotation.trace() - 1.0) / 2.0).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

/// Angle (degrees) between two direction vectors; 0 when either is degenerate.
pub fn direction_angle_deg(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let na = a.norm();
    let nb = b.norm();
    if na < 1e-12 || nb < 1e-12 {
        return 0.0;
    }
    let cos = (a.dot(b) / (na * nb)).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rotated_pose() -> Matrix4<f64> {
        let rot = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.3);
        from_rt(&rot.to_rotation_matrix().into_inner(), &Vector3::new(1.0, -2.0, 0.5))
    }

    #[test]
    fn test_rigid_inverse_composes_to_identity() {
        let pose = rotated_pose();
        let composed = pose * rigid_inverse(&pose);
        assert_relative_eq!(composed, Matrix4::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_valid_rigid_transform() {
        assert!(is_valid_rigid_transform(&Matrix4::identity(), RIGID_TOLERANCE));
        assert!(is_valid_rigid_transform(&rotated_pose(), RIGID_TOLERANCE));
    }

    #[test]
    fn test_rejects_scaled_and_reflected_blocks() {
        let mut scaled = rotated_pose();
        scaled.fixed_view_mut::<3, 3>(0, 0).scale_mut(1.01);
        assert!(!is_valid_rigid_transform(&scaled, RIGID_TOLERANCE));

        let reflection = from_rt(
            &Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0)),
            &Vector3::zeros(),
        );
        assert!(!is_valid_rigid_transform(&reflection, RIGID_TOLERANCE));

        let mut bad_row = Matrix4::identity();
        bad_row[(3, 0)] = 0.5;
        assert!(!is_valid_rigid_transform(&bad_row, RIGID_TOLERANCE));

        let mut nan = Matrix4::identity();
        nan[(0, 3)] = f64::NAN;
        assert!(!is_valid_rigid_transform(&nan, RIGID_TOLERANCE));
    }

    #[test]
    fn test_relative_motion() {
        let a = from_rt(&Matrix3::identity(), &Vector3::new(1.0, 0.0, 0.0));
        let b = from_rt(&Matrix3::identity(), &Vector3::new(3.0, 0.0, 0.0));
        let rel = relative(&a, &b);
        assert_relative_eq!(position(&rel), Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-12);
    }
}
