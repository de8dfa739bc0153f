//! Minimal pose solvers.
//!
//! * [`p3p`] - absolute pose from three 2D-3D correspondences.
//! * [`essential`] - the four relative poses consistent with an essential
//!   matrix.
//!
//! Poses map world points into the camera frame, `P_c = R * P_w + t`.

pub mod essential;
pub mod p3p;

pub use essential::{decompose_essential, essential_from_pose, project_to_essential};
pub use p3p::{classify_configuration, solve_p3p, P3pCase};

use crate::geometry::{matrix_to_vector, GeometryError};
use nalgebra::{Matrix3, Vector3};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PoseError {
    #[error("Expected {expected} correspondences, got {got}")]
    CorrespondenceCount { expected: usize, got: usize },
    #[error("Intrinsic matrix is not invertible")]
    SingularIntrinsics,
    #[error("Degenerate essential matrix: {0}")]
    DegenerateEssential(String),
    #[error("SVD did not converge")]
    SvdFailed,
    #[error("Point configuration is degenerate")]
    DegeneratePoints,
    #[error("Input contains non-finite values")]
    NonFinite,
}

/// A rigid world-to-camera transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Pose { rotation, translation }
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// Camera center in world coordinates, `-R^T t`.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.transpose() * self.translation)
    }

    pub fn rotation_vector(&self) -> Result<Vector3<f64>, GeometryError> {
        matrix_to_vector(&self.rotation).map(|(r, _)| r)
    }
}

/// Rigid alignment of world points onto their camera-frame positions
/// (Kabsch).
///
/// # Errors
///
/// * [`PoseError::DegeneratePoints`] for fewer than three pairs or
///   mismatched lengths.
/// * [`PoseError::SvdFailed`] if the SVD does not produce both factors.
pub fn pose_from_points(
    world: &[Vector3<f64>],
    camera: &[Vector3<f64>],
) -> Result<Pose, PoseError> {
    if world.len() != camera.len() || world.len() < 3 {
        return Err(PoseError::DegeneratePoints);
    }

    let n = world.len() as f64;
    let c_w = world.iter().sum::<Vector3<f64>>() / n;
    let c_c = camera.iter().sum::<Vector3<f64>>() / n;

    let h = world
        .iter()
        .zip(camera.iter())
        .fold(Matrix3::zeros(), |acc, (pw, pc)| acc + (pc - c_c) * (pw - c_w).transpose());

    let svd = h.svd(true, true);
    let u = svd.u.ok_or(PoseError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(PoseError::SvdFailed)?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fix = u;
        u_fix.column_mut(2).neg_mut();
        r = u_fix * v_t;
    }

    Ok(Pose::new(r, c_c - r * c_w))
}
