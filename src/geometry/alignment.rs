//! Closed-form trajectory alignment (Horn / Umeyama).
//!
//! Finds the similarity transformation S minimizing sum ||S * src_i - dst_i||².

use nalgebra::{Matrix3, Vector3};

use super::Sim3;

/// Compute the similarity mapping `source` onto `target`.
///
/// Algorithm:
/// 1. Compute centroids of both point sets
/// 2. Center the points
/// 3. Compute scale (if requested): s = sqrt(sum(||dst||²) / sum(||src||²))
/// 4. Compute rotation via SVD of the cross-covariance matrix, flipping the
///    singular vector of the smallest singular value when det(R) < 0
/// 5. Compute translation: t = c_dst - s * R * c_src
///
/// Returns `None` for mismatched or degenerate input.
pub fn align_points(
    source: &[Vector3<f64>],
    target: &[Vector3<f64>],
    with_scale: bool,
) -> Option<Sim3> {
    let n = source.len();
    if n < 2 || n != target.len() {
        return None;
    }

    let centroid_src = centroid(source);
    let centroid_dst = centroid(target);

    let centered_src: Vec<_> = source.iter().map(|p| p - centroid_src).collect();
    let centered_dst: Vec<_> = target.iter().map(|p| p - centroid_dst).collect();

    let scale = if with_scale {
        let sum_sq_src: f64 = centered_src.iter().map(|p| p.norm_squared()).sum();
        let sum_sq_dst: f64 = centered_dst.iter().map(|p| p.norm_squared()).sum();
        if sum_sq_src < 1e-12 {
            return None;
        }
        (sum_sq_dst / sum_sq_src).sqrt()
    } else {
        1.0
    };

    // H = sum(src_i * dst_i^T)
    let mut h = Matrix3::zeros();
    for (s, d) in centered_src.iter().zip(centered_dst.iter()) {
        h += s * d.transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v = svd.v_t?.transpose();

    // R = V * U^T
    let mut rotation_mat = v * u.transpose();

    // Reflection: flip the singular vector paired with the smallest singular value.
    if rotation_mat.determinant() < 0.0 {
        let smallest = svd.singular_values.imin();
        let mut v_fixed = v;
        for i in 0..3 {
            v_fixed[(i, smallest)] = -v_fixed[(i, smallest)];
        }
        rotation_mat = v_fixed * u.transpose();
    }

    if rotation_mat.iter().any(|x| !x.is_finite()) || !scale.is_finite() {
        return None;
    }

    let translation = centroid_dst - scale * (rotation_mat * centroid_src);
    Some(Sim3::from_rts(rotation_mat, translation, scale))
}

/// Compute centroid of a set of 3D points.
fn centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len() as f64
}
