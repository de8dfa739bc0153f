//! Essential matrix decomposition.

use super::{Pose, PoseError};
use crate::geometry::skew;
use nalgebra::{Matrix3, Vector3};

/// Relative singular value below which an essential matrix is degenerate.
const DEGENERATE_TOLERANCE: f64 = 1e-12;

/// `E = [t]x R` for the pose `P2 = R * P1 + t`.
pub fn essential_from_pose(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix3<f64> {
    skew(translation) * rotation
}

/// Nearest essential matrix: the two largest singular values are replaced
/// by their mean and the smallest by zero.
///
/// # Errors
///
/// * [`PoseError::NonFinite`] for non-finite input.
/// * [`PoseError::DegenerateEssential`] if the two largest singular values
///   vanish.
pub fn project_to_essential(e: &Matrix3<f64>) -> Result<Matrix3<f64>, PoseError> {
    if e.iter().any(|v| !v.is_finite()) {
        return Err(PoseError::NonFinite);
    }
    let svd = e.svd(true, true);
    let u = svd.u.ok_or(PoseError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(PoseError::SvdFailed)?;
    let s = svd.singular_values;
    let scale = e.norm().max(f64::MIN_POSITIVE);
    if s[1] <= DEGENERATE_TOLERANCE * scale {
        return Err(PoseError::DegenerateEssential(format!(
            "singular values {:.3e}, {:.3e}, {:.3e}",
            s[0], s[1], s[2]
        )));
    }
    let sigma = 0.5 * (s[0] + s[1]);
    Ok(u * Matrix3::from_diagonal(&Vector3::new(sigma, sigma, 0.0)) * v_t)
}

/// The four relative poses consistent with `e`.
///
/// Returns `{R1, +t}, {R1, -t}, {R2, +t}, {R2, -t}` with `R1 = U W V^T`,
/// `R2 = U W^T V^T` and `[t]x = U Z U^T`; `t` has unit length. Choosing the
/// physical one needs a positive-depth test on triangulated points.
///
/// # Examples
///
/// ```rust
/// use camgeom::pose::{decompose_essential, essential_from_pose};
/// use nalgebra::{Matrix3, Vector3};
///
/// let e = essential_from_pose(&Matrix3::identity(), &Vector3::new(1.0, 0.0, 0.0));
/// let poses = decompose_essential(&e).unwrap();
/// assert_eq!(poses.len(), 4);
/// ```
pub fn decompose_essential(e: &Matrix3<f64>) -> Result<[Pose; 4], PoseError> {
    let projected = project_to_essential(e)?;
    let svd = projected.svd(true, true);
    let mut u = svd.u.ok_or(PoseError::SvdFailed)?;
    let mut v_t = svd.v_t.ok_or(PoseError::SvdFailed)?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }

    let w = Matrix3::new(
        0.0, -1.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0,
    );
    let z = Matrix3::new(
        0.0, 1.0, 0.0, //
        -1.0, 0.0, 0.0, //
        0.0, 0.0, 0.0,
    );

    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let tx = u * z * u.transpose();
    let t = Vector3::new(tx[(2, 1)], tx[(0, 2)], tx[(1, 0)]).normalize();

    Ok([
        Pose::new(r1, t),
        Pose::new(r1, -t),
        Pose::new(r2, t),
        Pose::new(r2, -t),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::vector_to_matrix;
    use approx::assert_relative_eq;

    #[test]
    fn test_recovers_pose() {
        let (rotation, _) = vector_to_matrix(&Vector3::new(0.1, -0.05, 0.2));
        let t = Vector3::new(0.1, 0.02, -0.03);
        let poses = decompose_essential(&essential_from_pose(&rotation, &t)).unwrap();
        let direction = t.normalize();
        let found = poses.iter().any(|pose| {
            (pose.rotation - rotation).norm() < 1e-9 && (pose.translation - direction).norm() < 1e-9
        });
        assert!(found);
        for pose in &poses {
            assert_relative_eq!(pose.rotation.determinant(), 1.0, epsilon = 1e-9);
            assert_relative_eq!(
                pose.rotation * pose.rotation.transpose(),
                Matrix3::identity(),
                epsilon = 1e-9
            );
            assert_relative_eq!(pose.translation.norm(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_projection_equalizes_singular_values() {
        let e = Matrix3::new(1.0, 0.2, 0.0, -0.1, 2.0, 0.3, 0.0, 0.1, 0.05);
        let projected = project_to_essential(&e).unwrap();
        let s = projected.singular_values();
        assert_relative_eq!(s[0], s[1], epsilon = 1e-9);
        assert_relative_eq!(s[2], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate() {
        assert!(matches!(
            decompose_essential(&Matrix3::zeros()),
            Err(PoseError::DegenerateEssential(_))
        ));
        let rank_one = Vector3::new(1.0, 2.0, 3.0) * Vector3::new(0.0, 1.0, 1.0).transpose();
        assert!(matches!(
            decompose_essential(&rank_one),
            Err(PoseError::DegenerateEssential(_))
        ));
    }
}
