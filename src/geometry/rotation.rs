//! Axis-angle rotation algebra with analytic Jacobians.
//!
//! Jacobians with respect to a matrix are always taken with respect to its
//! column-major vectorisation, i.e. entry `(row, col)` of a 3x3 matrix maps
//! to index `row + 3 * col`.

use super::GeometryError;
use nalgebra::{DMatrix, Matrix3, SMatrix, Vector3};

/// Below this angle the trigonometric coefficients switch to their series.
const SMALL_ANGLE: f64 = 1e-4;
/// Distance to pi below which the axis is recovered from the symmetric part.
const NEAR_PI: f64 = 1e-3;
/// Tolerance used to accept a matrix as a proper rotation.
const ROTATION_TOLERANCE: f64 = 1e-6;

/// Derivative of a 3x3 matrix (column-major, 9 entries) w.r.t. a 3-vector.
pub type MatrixJacobian = SMatrix<f64, 9, 3>;
/// Derivative of a 3-vector w.r.t. a 3x3 matrix (column-major, 9 entries).
pub type VectorJacobian = SMatrix<f64, 3, 9>;

/// Cross-product matrix `[v]x` such that `[v]x * w == v.cross(&w)`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rodrigues exponential map.
///
/// Returns the rotation matrix `R = exp([r]x)` together with `dR/dr` (9x3).
/// The coefficients of `R = I + a [r]x + b [r]x^2` and their derivatives are
/// replaced by their Taylor series close to zero, so `r = 0` maps to the
/// identity with `dR/dr_i = [e_i]x`.
///
/// # Examples
///
/// ```rust
/// use camgeom::geometry::vector_to_matrix;
/// use nalgebra::{Matrix3, Vector3};
///
/// let (r, _) = vector_to_matrix(&Vector3::zeros());
/// assert_eq!(r, Matrix3::identity());
/// ```
pub fn vector_to_matrix(r: &Vector3<f64>) -> (Matrix3<f64>, MatrixJacobian) {
    let theta2 = r.norm_squared();
    let theta = theta2.sqrt();

    // a = sin/t, b = (1-cos)/t^2, c = a'/t, d = b'/t
    let (a, b, c, d) = if theta < SMALL_ANGLE {
        (
            1.0 - theta2 / 6.0,
            0.5 - theta2 / 24.0,
            -1.0 / 3.0 + theta2 / 30.0,
            -1.0 / 12.0 + theta2 / 180.0,
        )
    } else {
        let (s, co) = theta.sin_cos();
        (
            s / theta,
            (1.0 - co) / theta2,
            (theta * co - s) / (theta2 * theta),
            (theta * s - 2.0 * (1.0 - co)) / (theta2 * theta2),
        )
    };

    let k = skew(r);
    let k2 = k * k;
    let rotation = Matrix3::identity() + k * a + k2 * b;

    let mut jacobian = MatrixJacobian::zeros();
    for i in 0..3 {
        let e_i = skew(&Vector3::ith(i, 1.0));
        let d_r = k * (c * r[i]) + e_i * a + k2 * (d * r[i]) + (e_i * k + k * e_i) * b;
        for col in 0..3 {
            for row in 0..3 {
                jacobian[(row + 3 * col, i)] = d_r[(row, col)];
            }
        }
    }

    (rotation, jacobian)
}

fn check_rotation(rotation: &Matrix3<f64>) -> Result<(), GeometryError> {
    let det = rotation.determinant();
    let orthogonality = (rotation.transpose() * rotation - Matrix3::identity()).norm();
    if !det.is_finite()
        || (det - 1.0).abs() > ROTATION_TOLERANCE
        || orthogonality > ROTATION_TOLERANCE
    {
        return Err(GeometryError::NotARotation { det, orthogonality });
    }
    Ok(())
}

/// Logarithm map, the inverse of [`vector_to_matrix`].
///
/// Returns the rotation vector with angle in `[0, pi]` and `dr/dR` (3x9).
/// Near zero the vector is half the skew part of `R`; near pi the axis is
/// read from the symmetric part and the derivative is the left inverse of
/// `dR/dr` evaluated at the recovered vector.
///
/// # Errors
///
/// * [`GeometryError::NotARotation`] if `R` is not orthogonal with determinant +1.
pub fn matrix_to_vector(
    rotation: &Matrix3<f64>,
) -> Result<(Vector3<f64>, VectorJacobian), GeometryError> {
    check_rotation(rotation)?;

    let r = rotation;
    let cos_theta = ((r.trace() - 1.0) / 2.0).clamp(-1.0, 1.0);
    let w = Vector3::new(
        r[(2, 1)] - r[(1, 2)],
        r[(0, 2)] - r[(2, 0)],
        r[(1, 0)] - r[(0, 1)],
    );
    let sin_theta = (w.norm() / 2.0).min(1.0);
    let theta = sin_theta.atan2(cos_theta);

    if std::f64::consts::PI - theta < NEAR_PI {
        let symmetric = (r + r.transpose()) * 0.5;
        let outer = (symmetric - Matrix3::identity() * cos_theta) / (1.0 - cos_theta);
        let j = (0..3)
            .max_by(|&a, &b| outer[(a, a)].total_cmp(&outer[(b, b)]))
            .unwrap_or(0);
        let mut axis: Vector3<f64> = outer.column(j) / outer[(j, j)].max(f64::EPSILON).sqrt();
        axis.normalize_mut();
        if axis.dot(&w) < 0.0 {
            axis = -axis;
        }
        let vector = axis * theta;

        let (_, d_r) = vector_to_matrix(&vector);
        let normal = d_r.transpose() * d_r;
        let jacobian = match normal.try_inverse() {
            Some(inv) => inv * d_r.transpose(),
            None => VectorJacobian::repeat(f64::NAN),
        };
        return Ok((vector, jacobian));
    }

    // r = f * w with f = theta / (2 sin); g = f'(theta) * dtheta/dtrace
    let (f, g) = if theta < SMALL_ANGLE {
        (0.5 + theta * theta / 12.0, -1.0 / 12.0)
    } else {
        (
            theta / (2.0 * sin_theta),
            -(sin_theta - theta * cos_theta) / (4.0 * sin_theta.powi(3)),
        )
    };

    let mut d_w = VectorJacobian::zeros();
    d_w[(0, 5)] = 1.0;
    d_w[(0, 7)] = -1.0;
    d_w[(1, 6)] = 1.0;
    d_w[(1, 2)] = -1.0;
    d_w[(2, 1)] = 1.0;
    d_w[(2, 3)] = -1.0;

    let mut d_trace = SMatrix::<f64, 1, 9>::zeros();
    d_trace[(0, 0)] = 1.0;
    d_trace[(0, 4)] = 1.0;
    d_trace[(0, 8)] = 1.0;

    let jacobian = d_w * f + (w * d_trace) * g;
    Ok((w * f, jacobian))
}

/// Product `A * B` and its Jacobians with respect to both operands.
///
/// For `A` (p x n) and `B` (n x q) the result holds `d vec(AB) / d vec(A)`
/// (pq x pn) and `d vec(AB) / d vec(B)` (pq x nq), all column-major. The
/// Jacobians are dense Kronecker products, so this is meant for the small
/// matrices that appear in rigid motions.
///
/// # Errors
///
/// * [`GeometryError::DimensionMismatch`] if `A.ncols() != B.nrows()`.
pub fn matrix_product_derivative(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
) -> Result<(DMatrix<f64>, DMatrix<f64>, DMatrix<f64>), GeometryError> {
    if a.ncols() != b.nrows() {
        return Err(GeometryError::DimensionMismatch(format!(
            "cannot multiply {}x{} by {}x{}",
            a.nrows(),
            a.ncols(),
            b.nrows(),
            b.ncols()
        )));
    }
    let p = a.nrows();
    let q = b.ncols();

    let product = a * b;
    let d_a = b.transpose().kronecker(&DMatrix::<f64>::identity(p, p));
    let d_b = DMatrix::<f64>::identity(q, q).kronecker(a);
    Ok((product, d_a, d_b))
}

/// Result of [`compose_motion`]: the composed motion and every first partial.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedMotion {
    pub rotation_vector: Vector3<f64>,
    pub translation: Vector3<f64>,
    pub d_rotation_d_r1: Matrix3<f64>,
    pub d_rotation_d_t1: Matrix3<f64>,
    pub d_rotation_d_r2: Matrix3<f64>,
    pub d_rotation_d_t2: Matrix3<f64>,
    pub d_translation_d_r1: Matrix3<f64>,
    pub d_translation_d_t1: Matrix3<f64>,
    pub d_translation_d_r2: Matrix3<f64>,
    pub d_translation_d_t2: Matrix3<f64>,
}

fn to_dynamic<const R: usize, const C: usize>(m: &SMatrix<f64, R, C>) -> DMatrix<f64> {
    DMatrix::from_column_slice(R, C, m.as_slice())
}

fn to_matrix3(m: &DMatrix<f64>) -> Matrix3<f64> {
    m.fixed_view::<3, 3>(0, 0).into_owned()
}

/// Compose two rigid motions: `R3 = R2 * R1`, `T3 = R2 * T1 + T2`.
///
/// The partial derivatives are chained from [`vector_to_matrix`],
/// [`matrix_product_derivative`] and [`matrix_to_vector`].
///
/// # Errors
///
/// Propagates [`GeometryError`] from the underlying primitives.
pub fn compose_motion(
    r1: &Vector3<f64>,
    t1: &Vector3<f64>,
    r2: &Vector3<f64>,
    t2: &Vector3<f64>,
) -> Result<ComposedMotion, GeometryError> {
    let (rot1, d_rot1) = vector_to_matrix(r1);
    let (rot2, d_rot2) = vector_to_matrix(r2);

    let (rot3, d_rot3_d_rot2, d_rot3_d_rot1) =
        matrix_product_derivative(&to_dynamic(&rot2), &to_dynamic(&rot1))?;
    let (r3, d_r3_d_rot3) = matrix_to_vector(&to_matrix3(&rot3))?;

    let d_r3_d_rot3 = to_dynamic(&d_r3_d_rot3);
    let d_rotation_d_r1 = to_matrix3(&(&d_r3_d_rot3 * d_rot3_d_rot1 * to_dynamic(&d_rot1)));
    let d_rotation_d_r2 = to_matrix3(&(&d_r3_d_rot3 * d_rot3_d_rot2 * to_dynamic(&d_rot2)));

    let (rotated_t1, d_t_d_rot2, d_t_d_t1) =
        matrix_product_derivative(&to_dynamic(&rot2), &to_dynamic(t1))?;
    let translation = Vector3::new(rotated_t1[0], rotated_t1[1], rotated_t1[2]) + t2;
    let d_translation_d_r2 = to_matrix3(&(d_t_d_rot2 * to_dynamic(&d_rot2)));

    Ok(ComposedMotion {
        rotation_vector: r3,
        translation,
        d_rotation_d_r1,
        d_rotation_d_t1: Matrix3::zeros(),
        d_rotation_d_r2,
        d_rotation_d_t2: Matrix3::zeros(),
        d_translation_d_r1: Matrix3::zeros(),
        d_translation_d_t1: to_matrix3(&d_t_d_t1),
        d_translation_d_r2,
        d_translation_d_t2: Matrix3::identity(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn sample_vectors() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(0.1, -0.2, 0.3),
            Vector3::new(1e-7, 2e-7, -1e-7),
            Vector3::new(0.0, 0.0, 1.5),
            Vector3::new(-1.2, 0.4, 2.1).normalize() * 2.9,
            Vector3::new(0.3, 0.5, -0.8).normalize() * (PI - 1e-4),
        ]
    }

    #[test]
    fn test_zero_vector_is_identity() {
        let (r, d_r) = vector_to_matrix(&Vector3::zeros());
        assert_eq!(r, Matrix3::identity());
        for i in 0..3 {
            let e_i = skew(&Vector3::ith(i, 1.0));
            for col in 0..3 {
                for row in 0..3 {
                    assert_relative_eq!(d_r[(row + 3 * col, i)], e_i[(row, col)]);
                }
            }
        }
    }

    #[test]
    fn test_vector_to_matrix_is_proper_rotation() {
        for v in sample_vectors() {
            let (r, _) = vector_to_matrix(&v);
            assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(r.transpose() * r, Matrix3::identity(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_round_trip() {
        for v in sample_vectors() {
            let (r, _) = vector_to_matrix(&v);
            let (back, _) = matrix_to_vector(&r).unwrap();
            assert_relative_eq!(back, v, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_vector_to_matrix_jacobian_matches_finite_differences() {
        let h = 1e-6;
        for v in sample_vectors().into_iter().take(4) {
            let (_, d_r) = vector_to_matrix(&v);
            for i in 0..3 {
                let mut plus = v;
                let mut minus = v;
                plus[i] += h;
                minus[i] -= h;
                let numeric = (vector_to_matrix(&plus).0 - vector_to_matrix(&minus).0) / (2.0 * h);
                for col in 0..3 {
                    for row in 0..3 {
                        assert_relative_eq!(
                            d_r[(row + 3 * col, i)],
                            numeric[(row, col)],
                            epsilon = 1e-7
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_log_jacobian_inverts_exp_jacobian() {
        for v in sample_vectors() {
            let (r, d_r_d_v) = vector_to_matrix(&v);
            let (_, d_v_d_r) = matrix_to_vector(&r).unwrap();
            assert_relative_eq!(d_v_d_r * d_r_d_v, Matrix3::identity(), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_matrix_to_vector_rejects_reflection() {
        let reflection = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0));
        assert!(matches!(
            matrix_to_vector(&reflection),
            Err(GeometryError::NotARotation { .. })
        ));
    }

    #[test]
    fn test_matrix_product_derivative() {
        let a = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, -1.0, 0.5, 3.0, 4.0]);
        let b = DMatrix::from_row_slice(3, 2, &[2.0, -1.0, 0.0, 1.0, 1.5, 2.5]);
        let (ab, d_a, d_b) = matrix_product_derivative(&a, &b).unwrap();
        assert_relative_eq!(ab, &a * &b);
        assert_eq!(d_a.shape(), (4, 6));
        assert_eq!(d_b.shape(), (4, 6));

        // The product is linear in each operand, so the Jacobian is exact.
        let vec_ab = DMatrix::from_column_slice(4, 1, ab.as_slice());
        let vec_a = DMatrix::from_column_slice(6, 1, a.as_slice());
        let vec_b = DMatrix::from_column_slice(6, 1, b.as_slice());
        assert_relative_eq!(&d_a * vec_a, vec_ab, epsilon = 1e-12);
        assert_relative_eq!(
            &d_b * vec_b,
            DMatrix::from_column_slice(4, 1, ab.as_slice()),
            epsilon = 1e-12
        );

        let bad = DMatrix::<f64>::zeros(2, 2);
        assert!(matrix_product_derivative(&a, &bad).is_err());
    }

    #[test]
    fn test_compose_motion_values_and_jacobians() {
        let r1 = Vector3::new(0.2, -0.1, 0.4);
        let t1 = Vector3::new(1.0, 2.0, -0.5);
        let r2 = Vector3::new(-0.3, 0.25, 0.1);
        let t2 = Vector3::new(0.1, -0.4, 2.0);
        let motion = compose_motion(&r1, &t1, &r2, &t2).unwrap();

        let rot1 = vector_to_matrix(&r1).0;
        let rot2 = vector_to_matrix(&r2).0;
        assert_relative_eq!(
            vector_to_matrix(&motion.rotation_vector).0,
            rot2 * rot1,
            epsilon = 1e-12
        );
        assert_relative_eq!(motion.translation, rot2 * t1 + t2, epsilon = 1e-12);
        assert_relative_eq!(motion.d_translation_d_t1, rot2);
        assert_relative_eq!(motion.d_translation_d_t2, Matrix3::identity());

        let h = 1e-6;
        for i in 0..3 {
            let mut p = r1;
            let mut m = r1;
            p[i] += h;
            m[i] -= h;
            let fp = compose_motion(&p, &t1, &r2, &t2).unwrap();
            let fm = compose_motion(&m, &t1, &r2, &t2).unwrap();
            let numeric = (fp.rotation_vector - fm.rotation_vector) / (2.0 * h);
            assert_relative_eq!(
                motion.d_rotation_d_r1.column(i).into_owned(),
                numeric,
                epsilon = 1e-6
            );

            let mut p = r2;
            let mut m = r2;
            p[i] += h;
            m[i] -= h;
            let fp = compose_motion(&r1, &t1, &p, &t2).unwrap();
            let fm = compose_motion(&r1, &t1, &m, &t2).unwrap();
            let numeric_r = (fp.rotation_vector - fm.rotation_vector) / (2.0 * h);
            let numeric_t = (fp.translation - fm.translation) / (2.0 * h);
            assert_relative_eq!(
                motion.d_rotation_d_r2.column(i).into_owned(),
                numeric_r,
                epsilon = 1e-6
            );
            assert_relative_eq!(
                motion.d_translation_d_r2.column(i).into_owned(),
                numeric_t,
                epsilon = 1e-6
            );
        }
    }
}
