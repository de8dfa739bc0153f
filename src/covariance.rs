//! Parameter standard errors from a least-squares Jacobian.
//!
//! For `m` residuals and `n` parameters the covariance is
//! `sigma^2 (J^T J)^-1` with `sigma^2 = |r|^2 / (m - n)`.
//! [`CovarianceStrategy::Qr`] inverts only the triangular factor of `J`;
//! [`CovarianceStrategy::PseudoInverse`] tolerates rank deficiency at the
//! cost of an SVD of `J^T J`.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Diagonal entries of `R` below this fraction of the largest one mark a
/// rank-deficient Jacobian.
const RANK_TOLERANCE: f64 = 1e-12;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CovarianceError {
    #[error("Jacobian has {rows} rows but there are {residuals} residuals")]
    ShapeMismatch { rows: usize, residuals: usize },
    #[error("{observations} residuals leave no degrees of freedom for {parameters} parameters")]
    NoDegreesOfFreedom { observations: usize, parameters: usize },
    #[error("Jacobian has rank {rank} for {parameters} parameters")]
    RankDeficient { rank: usize, parameters: usize },
    #[error("Entry ({row}, {col}) lies outside a {rows}x{cols} Jacobian")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },
    #[error("Pseudo-inverse failed: {0}")]
    PseudoInverse(String),
    #[error("Input contains non-finite values")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CovarianceStrategy {
    #[default]
    Qr,
    PseudoInverse,
}

/// A Jacobian stored as `(row, col, value)` triplets. Repeated positions
/// are summed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseJacobian {
    rows: usize,
    cols: usize,
    triplets: Vec<(usize, usize, f64)>,
}

impl SparseJacobian {
    pub fn new(rows: usize, cols: usize) -> Self {
        SparseJacobian {
            rows,
            cols,
            triplets: Vec::new(),
        }
    }

    pub fn from_triplets(
        rows: usize,
        cols: usize,
        triplets: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Result<Self, CovarianceError> {
        let mut jacobian = SparseJacobian::new(rows, cols);
        for (row, col, value) in triplets {
            jacobian.push(row, col, value)?;
        }
        Ok(jacobian)
    }

    pub fn push(&mut self, row: usize, col: usize, value: f64) -> Result<(), CovarianceError> {
        if row >= self.rows || col >= self.cols {
            return Err(CovarianceError::IndexOutOfBounds {
                row,
                col,
                rows: self.rows,
                cols: self.cols,
            });
        }
        self.triplets.push((row, col, value));
        Ok(())
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.cols
    }

    /// Number of stored triplets.
    pub fn nnz(&self) -> usize {
        self.triplets.len()
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.rows, self.cols);
        for &(row, col, value) in &self.triplets {
            dense[(row, col)] += value;
        }
        dense
    }
}

/// Scaled covariance and the standard errors read from its diagonal.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceEstimate {
    pub covariance: DMatrix<f64>,
    pub standard_errors: DVector<f64>,
    /// `sigma^2`, the residual variance.
    pub variance_factor: f64,
}

fn check_inputs(jacobian: &DMatrix<f64>, residuals: &DVector<f64>) -> Result<f64, CovarianceError> {
    let (m, n) = jacobian.shape();
    if m != residuals.len() {
        return Err(CovarianceError::ShapeMismatch {
            rows: m,
            residuals: residuals.len(),
        });
    }
    if jacobian.iter().chain(residuals.iter()).any(|v| !v.is_finite()) {
        return Err(CovarianceError::NonFinite);
    }
    if m <= n {
        return Err(CovarianceError::NoDegreesOfFreedom {
            observations: m,
            parameters: n,
        });
    }
    Ok(residuals.norm_squared() / (m - n) as f64)
}

fn inverse_normal_qr(jacobian: &DMatrix<f64>) -> Result<DMatrix<f64>, CovarianceError> {
    let n = jacobian.ncols();
    let r = jacobian.clone().qr().r();
    let diagonal = r.diagonal();
    let largest = diagonal.iter().fold(0.0_f64, |m, d| m.max(d.abs()));
    let rank = diagonal
        .iter()
        .filter(|d| d.abs() > RANK_TOLERANCE * largest)
        .count();
    if rank < n || largest == 0.0 {
        return Err(CovarianceError::RankDeficient { rank, parameters: n });
    }
    let r_inv = r
        .solve_upper_triangular(&DMatrix::identity(n, n))
        .ok_or(CovarianceError::RankDeficient { rank, parameters: n })?;
    Ok(&r_inv * r_inv.transpose())
}

fn inverse_normal_pinv(jacobian: &DMatrix<f64>) -> Result<DMatrix<f64>, CovarianceError> {
    let normal = jacobian.transpose() * jacobian;
    let eps = RANK_TOLERANCE * normal.norm().max(f64::MIN_POSITIVE);
    normal
        .pseudo_inverse(eps)
        .map_err(|e| CovarianceError::PseudoInverse(e.to_string()))
}

/// Covariance of the parameters of a least-squares fit.
///
/// # Arguments
///
/// * `jacobian` - `m x n` derivative of the residuals at the solution.
/// * `residuals` - The `m` residuals at the solution.
/// * `strategy` - How `(J^T J)^-1` is formed.
///
/// # Errors
///
/// * [`CovarianceError::ShapeMismatch`] if the row count differs from the
///   residual count.
/// * [`CovarianceError::NoDegreesOfFreedom`] unless `m > n`.
/// * [`CovarianceError::RankDeficient`] for a rank-deficient Jacobian with
///   [`CovarianceStrategy::Qr`].
pub fn estimate_covariance(
    jacobian: &DMatrix<f64>,
    residuals: &DVector<f64>,
    strategy: CovarianceStrategy,
) -> Result<CovarianceEstimate, CovarianceError> {
    let variance_factor = check_inputs(jacobian, residuals)?;
    let inverse_normal = match strategy {
        CovarianceStrategy::Qr => inverse_normal_qr(jacobian)?,
        CovarianceStrategy::PseudoInverse => inverse_normal_pinv(jacobian)?,
    };
    let covariance = inverse_normal * variance_factor;
    let standard_errors = covariance.diagonal().map(|v| v.max(0.0).sqrt());
    log::debug!(
        "covariance of {} parameters from {} residuals, sigma^2 = {variance_factor:.3e}",
        jacobian.ncols(),
        jacobian.nrows()
    );
    Ok(CovarianceEstimate {
        covariance,
        standard_errors,
        variance_factor,
    })
}

/// Per-parameter standard errors, see [`estimate_covariance`].
pub fn standard_errors(
    jacobian: &DMatrix<f64>,
    residuals: &DVector<f64>,
    strategy: CovarianceStrategy,
) -> Result<DVector<f64>, CovarianceError> {
    estimate_covariance(jacobian, residuals, strategy).map(|e| e.standard_errors)
}

/// [`estimate_covariance`] for a triplet Jacobian.
pub fn estimate_covariance_sparse(
    jacobian: &SparseJacobian,
    residuals: &DVector<f64>,
    strategy: CovarianceStrategy,
) -> Result<CovarianceEstimate, CovarianceError> {
    estimate_covariance(&jacobian.to_dense(), residuals, strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Straight-line fit `y = a + b x`.
    fn line_fit() -> (DMatrix<f64>, DVector<f64>) {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let jacobian = DMatrix::from_fn(5, 2, |i, j| if j == 0 { 1.0 } else { x[i] });
        let residuals = DVector::from_vec(vec![0.1, -0.2, 0.05, 0.1, -0.05]);
        (jacobian, residuals)
    }

    #[test]
    fn test_line_fit_standard_errors() {
        let (jacobian, residuals) = line_fit();
        let estimate = estimate_covariance(&jacobian, &residuals, CovarianceStrategy::Qr).unwrap();
        let sigma2 = residuals.norm_squared() / 3.0;
        assert_relative_eq!(estimate.variance_factor, sigma2);

        // (J^T J)^-1 for x = 0..4: [[0.6, -0.2], [-0.2, 0.1]]
        assert_relative_eq!(estimate.standard_errors[0], (0.6 * sigma2).sqrt(), epsilon = 1e-12);
        assert_relative_eq!(estimate.standard_errors[1], (0.1 * sigma2).sqrt(), epsilon = 1e-12);
        assert_relative_eq!(estimate.covariance[(0, 1)], -0.2 * sigma2, epsilon = 1e-12);
    }

    #[test]
    fn test_strategies_agree() {
        let (jacobian, residuals) = line_fit();
        let qr = standard_errors(&jacobian, &residuals, CovarianceStrategy::Qr).unwrap();
        let pinv =
            standard_errors(&jacobian, &residuals, CovarianceStrategy::PseudoInverse).unwrap();
        assert_relative_eq!(qr, pinv, epsilon = 1e-10);
    }

    #[test]
    fn test_sparse_matches_dense() {
        let (jacobian, residuals) = line_fit();
        let mut sparse = SparseJacobian::new(5, 2);
        for i in 0..5 {
            sparse.push(i, 0, 1.0).unwrap();
            if i > 0 {
                // Split to exercise summing of repeated entries.
                sparse.push(i, 1, 0.5 * i as f64).unwrap();
                sparse.push(i, 1, 0.5 * i as f64).unwrap();
            }
        }
        assert_eq!(sparse.to_dense(), jacobian);
        let dense = estimate_covariance(&jacobian, &residuals, CovarianceStrategy::Qr).unwrap();
        let from_sparse =
            estimate_covariance_sparse(&sparse, &residuals, CovarianceStrategy::Qr).unwrap();
        assert_relative_eq!(dense.covariance, from_sparse.covariance, epsilon = 1e-14);
        assert!(matches!(
            sparse.push(5, 0, 1.0),
            Err(CovarianceError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_errors() {
        let (jacobian, residuals) = line_fit();
        let short = DVector::from_vec(vec![0.0; 4]);
        assert!(matches!(
            estimate_covariance(&jacobian, &short, CovarianceStrategy::Qr),
            Err(CovarianceError::ShapeMismatch { rows: 5, residuals: 4 })
        ));

        let square = DMatrix::identity(2, 2);
        assert!(matches!(
            estimate_covariance(&square, &DVector::zeros(2), CovarianceStrategy::Qr),
            Err(CovarianceError::NoDegreesOfFreedom { .. })
        ));

        let mut rank_deficient = jacobian.clone();
        rank_deficient.set_column(1, &(jacobian.column(0) * 2.0));
        assert!(matches!(
            estimate_covariance(&rank_deficient, &residuals, CovarianceStrategy::Qr),
            Err(CovarianceError::RankDeficient { rank: 1, parameters: 2 })
        ));
        let pinv =
            estimate_covariance(&rank_deficient, &residuals, CovarianceStrategy::PseudoInverse);
        assert!(pinv.is_ok());
    }
}
