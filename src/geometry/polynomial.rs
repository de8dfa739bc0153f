//! Polynomial helpers: evaluation, real root isolation and least-squares fits.
//!
//! Coefficients are always stored in ascending order, `c[0] + c[1] x + ...`.

use super::GeometryError;
use nalgebra::{DMatrix, DVector};

/// Relative size of an imaginary part still considered a real root.
const IMAGINARY_TOLERANCE: f64 = 1e-8;
const POLISH_ITERATIONS: usize = 3;

/// Evaluate a polynomial with Horner's scheme.
pub fn polyval(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}

fn polyval_derivative(coefficients: &[f64], x: f64) -> f64 {
    coefficients
        .iter()
        .enumerate()
        .skip(1)
        .rev()
        .fold(0.0, |acc, (i, &c)| acc * x + i as f64 * c)
}

fn trimmed(coefficients: &[f64]) -> &[f64] {
    let scale = coefficients.iter().fold(0.0_f64, |m, c| m.max(c.abs()));
    let mut end = coefficients.len();
    while end > 0 && coefficients[end - 1].abs() <= f64::EPSILON * scale {
        end -= 1;
    }
    &coefficients[..end]
}

fn polish(coefficients: &[f64], mut x: f64) -> f64 {
    for _ in 0..POLISH_ITERATIONS {
        let d = polyval_derivative(coefficients, x);
        if d == 0.0 || !d.is_finite() {
            break;
        }
        let step = polyval(coefficients, x) / d;
        if !step.is_finite() {
            break;
        }
        x -= step;
    }
    x
}

/// All real roots of a polynomial, sorted ascending.
///
/// Degrees one and two are solved in closed form, higher degrees through the
/// eigenvalues of the companion matrix followed by a short Newton polish.
/// Roots whose imaginary part is not negligible are discarded.
pub fn real_roots(coefficients: &[f64]) -> Vec<f64> {
    let c = trimmed(coefficients);
    let degree = c.len().saturating_sub(1);

    let mut roots = match degree {
        0 => Vec::new(),
        1 => vec![-c[0] / c[1]],
        2 => {
            let (a, b, k) = (c[2], c[1], c[0]);
            let disc = b * b - 4.0 * a * k;
            if disc < 0.0 {
                Vec::new()
            } else {
                // Numerically stable form avoiding cancellation.
                let q = -0.5 * (b + b.signum() * disc.sqrt());
                if q == 0.0 {
                    vec![0.0, 0.0]
                } else {
                    vec![q / a, k / q]
                }
            }
        }
        n => {
            let lead = c[n];
            let mut companion = DMatrix::<f64>::zeros(n, n);
            for i in 1..n {
                companion[(i, i - 1)] = 1.0;
            }
            for i in 0..n {
                companion[(i, n - 1)] = -c[i] / lead;
            }
            companion
                .complex_eigenvalues()
                .iter()
                .filter(|z| z.im.abs() <= IMAGINARY_TOLERANCE * z.re.abs().max(1.0))
                .map(|z| polish(c, z.re))
                .collect()
        }
    };

    roots.retain(|r| r.is_finite());
    roots.sort_by(f64::total_cmp);
    roots
}

/// Real roots strictly greater than zero, sorted ascending.
pub fn positive_real_roots(coefficients: &[f64]) -> Vec<f64> {
    real_roots(coefficients)
        .into_iter()
        .filter(|&r| r > 0.0)
        .collect()
}

/// A least-squares polynomial fitted on an affinely rescaled abscissa.
///
/// The abscissa is mapped to `[-1, 1]` before building the Vandermonde
/// matrix so that high degree fits stay well conditioned.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedPolynomial {
    pub coefficients: Vec<f64>,
    pub center: f64,
    pub scale: f64,
}

impl FittedPolynomial {
    /// Fit a polynomial of the given degree to `(x, y)` samples.
    ///
    /// # Errors
    ///
    /// * [`GeometryError::FitFailed`] if there are fewer samples than
    ///   coefficients or the least-squares solve fails.
    pub fn fit(x: &[f64], y: &[f64], degree: usize) -> Result<Self, GeometryError> {
        if x.len() != y.len() {
            return Err(GeometryError::FitFailed(format!(
                "{} abscissae for {} ordinates",
                x.len(),
                y.len()
            )));
        }
        if x.len() < degree + 1 {
            return Err(GeometryError::FitFailed(format!(
                "{} samples cannot determine a degree {} polynomial",
                x.len(),
                degree
            )));
        }

        let (lo, hi) = x
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let center = 0.5 * (lo + hi);
        let half_range = 0.5 * (hi - lo);
        let scale = if half_range > f64::EPSILON { half_range } else { 1.0 };

        let vandermonde = DMatrix::from_fn(x.len(), degree + 1, |i, j| {
            ((x[i] - center) / scale).powi(j as i32)
        });
        let rhs = DVector::from_column_slice(y);
        let solution = vandermonde
            .svd(true, true)
            .solve(&rhs, 1e-14)
            .map_err(|e| GeometryError::FitFailed(e.to_string()))?;

        Ok(FittedPolynomial {
            coefficients: solution.iter().copied().collect(),
            center,
            scale,
        })
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        polyval(&self.coefficients, (x - self.center) / self.scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_polyval() {
        // 1 + 2x + 3x^2 at x = 2
        assert_relative_eq!(polyval(&[1.0, 2.0, 3.0], 2.0), 17.0);
        assert_relative_eq!(polyval_derivative(&[1.0, 2.0, 3.0], 2.0), 14.0);
    }

    #[test]
    fn test_quartic_roots() {
        // (x - 1)(x - 2)(x + 3)(x - 0.5) = x^4 - 0.5x^3 - 7x^2 + 9.5x - 3
        let roots = real_roots(&[-3.0, 9.5, -7.0, -0.5, 1.0]);
        assert_eq!(roots.len(), 4);
        for (r, expected) in roots.iter().zip([-3.0, 0.5, 1.0, 2.0]) {
            assert_relative_eq!(*r, expected, epsilon = 1e-9);
        }
        let positive = positive_real_roots(&[-3.0, 9.5, -7.0, -0.5, 1.0]);
        assert_eq!(positive.len(), 3);
    }

    #[test]
    fn test_complex_roots_are_discarded() {
        assert!(real_roots(&[1.0, 0.0, 1.0]).is_empty());
        // (x^2 + 1)(x - 4)
        let roots = real_roots(&[-4.0, 1.0, -4.0, 1.0]);
        assert_eq!(roots.len(), 1);
        assert_relative_eq!(roots[0], 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_leading_coefficients() {
        // Trailing zero coefficients reduce the degree.
        let roots = real_roots(&[-2.0, 1.0, 0.0, 0.0]);
        assert_eq!(roots, vec![2.0]);
        assert!(real_roots(&[5.0]).is_empty());
        assert!(real_roots(&[]).is_empty());
    }

    #[test]
    fn test_fit_recovers_cubic() {
        let x: Vec<f64> = (0..50).map(|i| 0.1 + i as f64 * 0.05).collect();
        let y: Vec<f64> = x.iter().map(|&v| 2.0 - v + 0.5 * v.powi(3)).collect();
        let fit = FittedPolynomial::fit(&x, &y, 3).unwrap();
        assert_eq!(fit.degree(), 3);
        for (&xi, &yi) in x.iter().zip(y.iter()) {
            assert_relative_eq!(fit.evaluate(xi), yi, epsilon = 1e-9);
        }
        assert!(FittedPolynomial::fit(&x[..3], &y[..3], 5).is_err());
    }
}
