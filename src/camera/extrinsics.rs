//! Per-pattern extrinsics shared by the pinhole and fisheye models.

use super::CameraModelError;
use crate::geometry::vector_to_matrix;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Rotation and translation vectors, one pair per calibration pattern.
///
/// A world point `P` on pattern `i` maps to camera coordinates as
/// `R_i * P + t_i` where `R_i = exp([r_i]x)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternExtrinsics {
    rotation_vectors: Vec<Vector3<f64>>,
    translation_vectors: Vec<Vector3<f64>>,
}

impl PatternExtrinsics {
    /// # Errors
    ///
    /// * [`CameraModelError::ExtrinsicsCountMismatch`] if the two arrays have
    ///   different lengths.
    /// * [`CameraModelError::InvalidParams`] if any entry is not finite.
    pub fn new(
        rotation_vectors: Vec<Vector3<f64>>,
        translation_vectors: Vec<Vector3<f64>>,
    ) -> Result<Self, CameraModelError> {
        if rotation_vectors.len() != translation_vectors.len() {
            return Err(CameraModelError::ExtrinsicsCountMismatch {
                rotations: rotation_vectors.len(),
                translations: translation_vectors.len(),
            });
        }
        if rotation_vectors
            .iter()
            .chain(translation_vectors.iter())
            .any(|v| v.iter().any(|c| !c.is_finite()))
        {
            return Err(CameraModelError::InvalidParams(
                "extrinsics must be finite".to_string(),
            ));
        }
        Ok(PatternExtrinsics {
            rotation_vectors,
            translation_vectors,
        })
    }

    pub fn empty() -> Self {
        PatternExtrinsics::default()
    }

    pub fn len(&self) -> usize {
        self.rotation_vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rotation_vectors.is_empty()
    }

    pub fn rotation_vectors(&self) -> &[Vector3<f64>] {
        &self.rotation_vectors
    }

    pub fn translation_vectors(&self) -> &[Vector3<f64>] {
        &self.translation_vectors
    }

    pub fn rotation_matrices(&self) -> Vec<Matrix3<f64>> {
        self.rotation_vectors
            .iter()
            .map(|r| vector_to_matrix(r).0)
            .collect()
    }

    /// Rotation matrix and translation of pattern `index`.
    pub fn pose(&self, index: usize) -> Option<(Matrix3<f64>, Vector3<f64>)> {
        let r = self.rotation_vectors.get(index)?;
        let t = self.translation_vectors.get(index)?;
        Some((vector_to_matrix(r).0, *t))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Matrix3<f64>, Vector3<f64>)> + '_ {
        self.rotation_vectors
            .iter()
            .zip(self.translation_vectors.iter())
            .map(|(r, t)| (vector_to_matrix(r).0, *t))
    }
}
