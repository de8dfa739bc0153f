//! Low-level geometric building blocks shared by the camera, stereo and pose
//! modules.
//!
//! * [`rotation`] converts between axis-angle vectors and rotation matrices and
//!   provides the Jacobians needed by gradient based refinement.
//! * [`polynomial`] holds the root finding and least-squares fitting helpers
//!   used by the fisheye projection and the P3P solver.

use nalgebra::{Matrix3, Vector2, Vector3};

pub mod polynomial;
pub mod rotation;

pub use polynomial::{polyval, positive_real_roots, real_roots, FittedPolynomial};
pub use rotation::{
    compose_motion, matrix_product_derivative, matrix_to_vector, skew, vector_to_matrix,
    ComposedMotion,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Matrix dimensions do not agree: {0}")]
    DimensionMismatch(String),
    #[error("Matrix is not a proper rotation (det = {det}, orthogonality error = {orthogonality})")]
    NotARotation { det: f64, orthogonality: f64 },
    #[error("Polynomial fit failed: {0}")]
    FitFailed(String),
}

/// Apply a 3x3 homography to a pixel and dehomogenize.
///
/// Returns a non-finite point when the homogeneous scale vanishes.
pub fn apply_homography(h: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    Vector2::new(q.x / q.z, q.y / q.z)
}
