//! Brown-Conrady radial and tangential lens distortion.
//!
//! With normalized coordinates `(x, y)` and `r^2 = x^2 + y^2`:
//!
//! ```text
//! a  = k1 r^2 + k2 r^4 + k3 r^6
//! xd = x (1 + a) + 2 p1 x y + p2 (r^2 + 2 x^2)
//! yd = y (1 + a) + p1 (r^2 + 2 y^2) + 2 p2 x y
//! ```

use super::CameraModelError;
use crate::geometry::positive_real_roots;
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

/// Radial `[k1, k2, k3]` and tangential `[p1, p2]` coefficients.
///
/// `k3` is zero when only two radial terms were estimated; `num_radial`
/// remembers which form the caller supplied so snapshots round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistortionCoefficients {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
    num_radial: usize,
}

/// Settings for the iterative inversion of the distortion model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UndistortOptions {
    pub max_iterations: u32,
    /// Convergence threshold on the normalized residual.
    pub tolerance: f64,
}

impl Default for UndistortOptions {
    fn default() -> Self {
        UndistortOptions {
            max_iterations: 50,
            tolerance: 1e-12,
        }
    }
}

impl Default for DistortionCoefficients {
    fn default() -> Self {
        DistortionCoefficients::zero()
    }
}

impl DistortionCoefficients {
    pub fn zero() -> Self {
        DistortionCoefficients {
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
            num_radial: 2,
        }
    }

    /// Builds coefficients from a radial vector of length 2 or 3 and a
    /// tangential vector of length 2.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidRadialDistortion`] for other radial lengths.
    /// * [`CameraModelError::InvalidTangentialDistortion`] for other tangential lengths.
    /// * [`CameraModelError::InvalidParams`] if any coefficient is not finite.
    pub fn from_slices(radial: &[f64], tangential: &[f64]) -> Result<Self, CameraModelError> {
        if radial.len() != 2 && radial.len() != 3 {
            return Err(CameraModelError::InvalidRadialDistortion(radial.len()));
        }
        if tangential.len() != 2 {
            return Err(CameraModelError::InvalidTangentialDistortion(
                tangential.len(),
            ));
        }
        if radial.iter().chain(tangential).any(|v| !v.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(DistortionCoefficients {
            k1: radial[0],
            k2: radial[1],
            k3: radial.get(2).copied().unwrap_or(0.0),
            p1: tangential[0],
            p2: tangential[1],
            num_radial: radial.len(),
        })
    }

    pub fn radial(&self) -> Vec<f64> {
        let all = [self.k1, self.k2, self.k3];
        all[..self.num_radial].to_vec()
    }

    pub fn tangential(&self) -> [f64; 2] {
        [self.p1, self.p2]
    }

    pub fn is_zero(&self) -> bool {
        [self.k1, self.k2, self.k3, self.p1, self.p2]
            .iter()
            .all(|&v| v == 0.0)
    }

    /// Applies the distortion model to a normalized point.
    pub fn distort_normalized(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (point.x, point.y);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;

        Vector2::new(
            x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        )
    }

    /// Jacobian of [`Self::distort_normalized`] with respect to the point.
    pub fn distort_jacobian(&self, point: &Vector2<f64>) -> Matrix2<f64> {
        let (x, y) = (point.x, point.y);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r4 * r2;
        let d_radial_d_r2 = self.k1 + 2.0 * self.k2 * r2 + 3.0 * self.k3 * r4;
        let (p1, p2) = (self.p1, self.p2);

        let j00 = radial + 2.0 * x * x * d_radial_d_r2 + 2.0 * p1 * y + 6.0 * p2 * x;
        let j01 = 2.0 * x * y * d_radial_d_r2 + 2.0 * p1 * x + 2.0 * p2 * y;
        let j10 = 2.0 * x * y * d_radial_d_r2 + 2.0 * p1 * x + 2.0 * p2 * y;
        let j11 = radial + 2.0 * y * y * d_radial_d_r2 + 6.0 * p1 * y + 2.0 * p2 * x;
        Matrix2::new(j00, j01, j10, j11)
    }

    /// Smallest normalized radius at which the radial profile
    /// `r (1 + k1 r^2 + k2 r^4 + k3 r^6)` stops increasing, if any.
    ///
    /// Beyond this radius the model folds the image plane onto itself and
    /// undistortion is ambiguous.
    pub fn fold_radius(&self) -> Option<f64> {
        positive_real_roots(&[1.0, 3.0 * self.k1, 5.0 * self.k2, 7.0 * self.k3])
            .first()
            .map(|s| s.sqrt())
    }

    /// Inverts the distortion model with Newton's method.
    ///
    /// Returns `None` if the Jacobian becomes singular, the iteration does not
    /// converge, or the solution lies beyond [`Self::fold_radius`], i.e. in a
    /// region that is not connected to the image center.
    pub fn undistort_normalized(
        &self,
        distorted: &Vector2<f64>,
        options: &UndistortOptions,
    ) -> Option<Vector2<f64>> {
        if self.is_zero() {
            return Some(*distorted);
        }

        let mut point = *distorted;
        let mut converged = false;
        for _ in 0..options.max_iterations {
            let error = self.distort_normalized(&point) - distorted;
            if error.norm() < options.tolerance {
                converged = true;
                break;
            }
            let delta = self.distort_jacobian(&point).try_inverse()? * error;
            point -= delta;
            if !point.x.is_finite() || !point.y.is_finite() {
                return None;
            }
            if delta.norm() < options.tolerance {
                converged = true;
                break;
            }
        }

        if !converged {
            let residual = (self.distort_normalized(&point) - distorted).norm();
            if residual > options.tolerance.sqrt() {
                return None;
            }
        }
        if let Some(fold) = self.fold_radius() {
            if point.norm() > fold {
                return None;
            }
        }
        Some(point)
    }
}
