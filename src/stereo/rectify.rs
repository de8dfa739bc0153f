//! Row-aligning rectification of a calibrated stereo pair.
//!
//! Both cameras are first turned by half the relative rotation so that their
//! optical axes are parallel, then by a common rotation that carries the
//! baseline onto the x axis. A shared pinhole camera replaces both
//! intrinsic matrices, which makes every epipolar line a pixel row.

use super::StereoError;
use crate::camera::bounds::{raw_output_bounds, OutputBounds};
use crate::camera::{Intrinsics, OutputView, PinholeModel, Resolution};
use crate::geometry::{apply_homography, matrix_to_vector, vector_to_matrix};
use nalgebra::{Matrix3, Matrix4, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Disparity marking a pixel without a stereo match.
pub const INVALID_DISPARITY: f32 = -f32::MAX;

/// Everything computed by [`compute_rectification`] for one image size and
/// output view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectificationState {
    /// Maps undistorted pixels of camera 1 to rectified pixels.
    pub homography1: Matrix3<f64>,
    pub homography2: Matrix3<f64>,
    /// Rectified pixel plus disparity to homogeneous 3-D point in the
    /// rectified camera-1 frame.
    pub q: Matrix4<f64>,
    /// Rectified output rectangle, before shifting to the output origin.
    pub bounds: OutputBounds,
    pub original_size: Resolution,
    /// View the state was requested for.
    pub view: OutputView,
    /// View actually used, differs from `view` after the valid-to-full
    /// fallback.
    pub effective_view: OutputView,
    /// Shared intrinsics of the rectified pair, in the unshifted frame.
    pub intrinsics: Intrinsics,
    /// Rectified translation of camera 2, aligned with the x axis.
    pub translation: Vector3<f64>,
}

impl RectificationState {
    /// Whether this state was computed for `size` and `view`.
    pub fn matches(&self, size: &Resolution, view: OutputView) -> bool {
        self.original_size == *size && self.view == view
    }

    /// Size of the rectified images.
    pub fn rectified_size(&self) -> Resolution {
        self.bounds.size()
    }

    /// Shared intrinsics shifted into output-image coordinates.
    pub fn output_intrinsics(&self) -> Intrinsics {
        let origin = self.bounds.origin();
        let mut intrinsics = self.intrinsics;
        intrinsics.cx -= origin.x;
        intrinsics.cy -= origin.y;
        intrinsics
    }
}

/// Rotation turning `t` onto the x axis, keeping the sign of its x
/// component. Degenerate inputs give the identity.
pub fn row_alignment(t: &Vector3<f64>) -> Matrix3<f64> {
    let norm = t.norm();
    if norm < f64::EPSILON {
        return Matrix3::identity();
    }
    let mut x_axis = Vector3::x();
    if t.dot(&x_axis) < 0.0 {
        x_axis = -x_axis;
    }
    let axis = t.cross(&x_axis);
    let axis_norm = axis.norm();
    if axis_norm < f64::EPSILON * norm {
        return Matrix3::identity();
    }
    let angle = (t.dot(&x_axis).abs() / norm).clamp(-1.0, 1.0).acos();
    vector_to_matrix(&(axis / axis_norm * angle)).0
}

/// Rectifying rotations of both cameras and the rectified translation of
/// camera 2, for the pose `P2 = R * P1 + t`.
pub fn rectifying_rotations(
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
) -> Result<(Matrix3<f64>, Matrix3<f64>, Vector3<f64>), StereoError> {
    let (r, _) = matrix_to_vector(rotation)?;
    let (half1, _) = vector_to_matrix(&(r / 2.0));
    let (half2, _) = vector_to_matrix(&(-r / 2.0));
    let aligned = half2 * translation;
    let align = row_alignment(&aligned);
    Ok((align * half1, align * half2, align * aligned))
}

/// Shared intrinsics of the rectified pair: the smaller vertical focal
/// length, the mean principal point and zero skew.
pub fn rectified_intrinsics(k1: &Intrinsics, k2: &Intrinsics) -> Intrinsics {
    let f = k1.fy.min(k2.fy);
    Intrinsics::new(f, f, (k1.cx + k2.cx) / 2.0, (k1.cy + k2.cy) / 2.0)
}

/// Disparity-to-depth matrix for rectified pixel coordinates relative to
/// `origin`.
///
/// # Errors
///
/// * [`StereoError::ZeroBaseline`] if the rectified baseline has no x component.
pub fn disparity_to_depth(
    intrinsics: &Intrinsics,
    origin: &Vector2<f64>,
    baseline_x: f64,
) -> Result<Matrix4<f64>, StereoError> {
    if baseline_x.abs() < f64::EPSILON || !baseline_x.is_finite() {
        return Err(StereoError::ZeroBaseline);
    }
    let cx = intrinsics.cx - origin.x;
    let cy = intrinsics.cy - origin.y;
    Ok(Matrix4::new(
        1.0, 0.0, 0.0, -cx, //
        0.0, 1.0, 0.0, -cy, //
        0.0, 0.0, 0.0, intrinsics.fx, //
        0.0, 0.0, -1.0 / baseline_x, 0.0,
    ))
}

fn camera_bounds(
    camera: &PinholeModel,
    homography: &Matrix3<f64>,
    size: &Resolution,
    view: OutputView,
) -> Result<OutputBounds, StereoError> {
    let inverse = homography.try_inverse().ok_or(StereoError::SingularHomography)?;
    raw_output_bounds(
        size,
        view,
        camera.valid_view_tolerances(),
        |p| camera.undistort_pixel(p).map(|u| apply_homography(homography, &u)),
        |q| Some(camera.distort_pixel(&apply_homography(&inverse, q))),
    )
    .map_err(|_| StereoError::NoValidRectangle(view))
}

fn compute_for_view(
    camera1: &PinholeModel,
    camera2: &PinholeModel,
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    size: &Resolution,
    view: OutputView,
) -> Result<RectificationState, StereoError> {
    let (rect1, rect2, rect_translation) = rectifying_rotations(rotation, translation)?;
    let intrinsics = rectified_intrinsics(camera1.intrinsics(), camera2.intrinsics());
    let k_new = intrinsics.matrix();
    let k1_inv = camera1
        .intrinsic_matrix()
        .try_inverse()
        .ok_or(StereoError::SingularHomography)?;
    let k2_inv = camera2
        .intrinsic_matrix()
        .try_inverse()
        .ok_or(StereoError::SingularHomography)?;
    let homography1 = k_new * rect1 * k1_inv;
    let homography2 = k_new * rect2 * k2_inv;

    let bounds1 = camera_bounds(camera1, &homography1, size, view)?;
    let bounds2 = camera_bounds(camera2, &homography2, size, view)?;
    let combined = match view {
        OutputView::Valid => bounds1.intersection(&bounds2),
        OutputView::Full | OutputView::Same => bounds1.union(&bounds2),
    };
    let bounds = combined.rounded(view, camera1.valid_view_tolerances().rounding_tolerance);
    if bounds.is_empty() {
        return Err(StereoError::NoValidRectangle(view));
    }

    let q = disparity_to_depth(&intrinsics, &bounds.origin(), rect_translation.x)?;
    Ok(RectificationState {
        homography1,
        homography2,
        q,
        bounds,
        original_size: *size,
        view,
        effective_view: view,
        intrinsics,
        translation: rect_translation,
    })
}

/// Computes the rectification of a stereo pair for one image size.
///
/// # Arguments
///
/// * `camera1`, `camera2` - The calibrated cameras.
/// * `rotation`, `translation` - Pose of camera 2 relative to camera 1,
///   `P2 = R * P1 + t`.
/// * `size` - Size of the original images.
/// * `view` - Output extent. A `valid` request without a common rectangle
///   falls back to `full` once, with a warning.
///
/// # Errors
///
/// * [`StereoError::NoValidRectangle`] if neither view yields an output.
/// * [`StereoError::ZeroBaseline`] if the cameras share a center or only
///   move along the optical axis.
pub fn compute_rectification(
    camera1: &PinholeModel,
    camera2: &PinholeModel,
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    size: &Resolution,
    view: OutputView,
) -> Result<RectificationState, StereoError> {
    match compute_for_view(camera1, camera2, rotation, translation, size, view) {
        Err(StereoError::NoValidRectangle(OutputView::Valid)) => {
            log::warn!(
                "no common valid rectangle for the stereo pair, falling back to the full view"
            );
            let mut state =
                compute_for_view(camera1, camera2, rotation, translation, size, OutputView::Full)?;
            state.view = view;
            Ok(state)
        }
        other => other,
    }
}
