//! Perspective-3-point absolute pose.
//!
//! With bearing vectors `b1, b2, b3` and unknown distances `x, y = u x,
//! z = v x` to the world points `A, B, C`, the law of cosines gives
//!
//! ```text
//! y^2 + z^2 - 2 y z cos(alpha) = |BC|^2
//! x^2 + z^2 - 2 x z cos(beta)  = |AC|^2
//! x^2 + y^2 - 2 x y cos(gamma) = |AB|^2
//! ```
//!
//! Eliminating `v` leaves a quartic in `u`. Every positive real root with a
//! positive `v` yields one camera-frame triangle, aligned to the world
//! triangle with [`pose_from_points`].

use super::{pose_from_points, Pose, PoseError};
use crate::camera::Intrinsics;
use crate::geometry::real_roots;
use nalgebra::{Vector2, Vector3};

/// Triangle area relative to the squared longest side below which the
/// world points count as collinear.
const COLLINEAR_TOLERANCE: f64 = 1e-6;
/// Bearing triple product below which the camera center lies in the plane
/// of the points.
const COPLANAR_TOLERANCE: f64 = 1e-9;
const DENOMINATOR_TOLERANCE: f64 = 1e-12;

/// Shape of a three-point configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P3pCase {
    Regular,
    /// Two world points coincide.
    CoincidentPoints,
    /// The world points lie on a line.
    CollinearWorld,
    /// The camera center lies in the plane of the world points.
    CoplanarBearings,
}

/// Classifies a configuration before solving. Only [`P3pCase::Regular`]
/// has isolated solutions.
pub fn classify_configuration(world: &[Vector3<f64>; 3], bearings: &[Vector3<f64>; 3]) -> P3pCase {
    let ab = world[1] - world[0];
    let ac = world[2] - world[0];
    let bc = world[2] - world[1];
    let longest = ab.norm().max(ac.norm()).max(bc.norm());
    let shortest = ab.norm().min(ac.norm()).min(bc.norm());
    if shortest <= f64::EPSILON * longest.max(1.0) {
        return P3pCase::CoincidentPoints;
    }
    if ab.cross(&ac).norm() <= COLLINEAR_TOLERANCE * longest * longest {
        return P3pCase::CollinearWorld;
    }
    if bearings[0].dot(&bearings[1].cross(&bearings[2])).abs() <= COPLANAR_TOLERANCE {
        return P3pCase::CoplanarBearings;
    }
    P3pCase::Regular
}

fn mul(a: &[f64; 5], b: &[f64; 5]) -> [f64; 5] {
    let mut out = [0.0; 5];
    for i in 0..5 {
        for j in 0..5 - i {
            out[i + j] += a[i] * b[j];
        }
    }
    out
}

/// Solves for the poses seeing three world points at three pixels.
///
/// # Arguments
///
/// * `image_points` - Three undistorted pixels.
/// * `world_points` - The corresponding world points.
/// * `intrinsics` - Converts the pixels to bearing vectors.
///
/// # Returns
///
/// Up to four poses, ordered by the distance to the first point. A
/// degenerate configuration or a quartic without admissible roots gives no
/// pose.
///
/// # Errors
///
/// * [`PoseError::CorrespondenceCount`] unless both slices hold three points.
/// * [`PoseError::SingularIntrinsics`] if `K` cannot be inverted.
/// * [`PoseError::NonFinite`] for non-finite input.
pub fn solve_p3p(
    image_points: &[Vector2<f64>],
    world_points: &[Vector3<f64>],
    intrinsics: &Intrinsics,
) -> Result<Vec<Pose>, PoseError> {
    for got in [image_points.len(), world_points.len()] {
        if got != 3 {
            return Err(PoseError::CorrespondenceCount { expected: 3, got });
        }
    }
    if image_points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite())
        || world_points.iter().any(|p| p.iter().any(|v| !v.is_finite()))
    {
        return Err(PoseError::NonFinite);
    }
    let k_inv = intrinsics
        .matrix()
        .try_inverse()
        .ok_or(PoseError::SingularIntrinsics)?;

    let world = [world_points[0], world_points[1], world_points[2]];
    let bearings = [0, 1, 2].map(|i| {
        let p = image_points[i];
        (k_inv * Vector3::new(p.x, p.y, 1.0)).normalize()
    });

    let case = classify_configuration(&world, &bearings);
    if case != P3pCase::Regular {
        log::debug!("p3p configuration is {case:?}, no isolated solution");
        return Ok(Vec::new());
    }

    let a2 = (world[1] - world[2]).norm_squared();
    let b2 = (world[0] - world[2]).norm_squared();
    let c2 = (world[0] - world[1]).norm_squared();

    let cos_alpha = bearings[1].dot(&bearings[2]);
    let cos_beta = bearings[0].dot(&bearings[2]);
    let cos_gamma = bearings[0].dot(&bearings[1]);

    let d = (b2 - a2) / c2;
    let e = b2 / c2;

    // v = N(u) / D(u)
    let n = [1.0 - d, 2.0 * d * cos_gamma, -(1.0 + d), 0.0, 0.0];
    let den = [2.0 * cos_beta, -2.0 * cos_alpha, 0.0, 0.0, 0.0];
    // 1 - e (1 + u^2 - 2 u cos(gamma))
    let rest = [1.0 - e, 2.0 * e * cos_gamma, -e, 0.0, 0.0];

    let nn = mul(&n, &n);
    let nd = mul(&n, &den);
    let rdd = mul(&rest, &mul(&den, &den));
    let quartic: Vec<f64> = (0..5)
        .map(|i| nn[i] - 2.0 * cos_beta * nd[i] + rdd[i])
        .collect();

    let mut solutions: Vec<(f64, Pose)> = real_roots(&quartic)
        .into_iter()
        .filter(|&u| u > 0.0)
        .filter_map(|u| {
            let denominator = den[0] + den[1] * u;
            if denominator.abs() < DENOMINATOR_TOLERANCE {
                return None;
            }
            let v = (n[0] + n[1] * u + n[2] * u * u) / denominator;
            let k = 1.0 + u * u - 2.0 * u * cos_gamma;
            if v <= 0.0 || k <= DENOMINATOR_TOLERANCE {
                return None;
            }
            let x = (c2 / k).sqrt();
            let camera = [bearings[0] * x, bearings[1] * (u * x), bearings[2] * (v * x)];
            pose_from_points(&world, &camera).ok().map(|pose| (x, pose))
        })
        .collect();

    solutions.sort_by(|a, b| a.0.total_cmp(&b.0));
    log::debug!("p3p found {} admissible poses", solutions.len());
    Ok(solutions.into_iter().map(|(_, pose)| pose).collect())
}
