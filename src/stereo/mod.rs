//! Calibrated stereo pairs.
//!
//! [`StereoModel`] owns two [`PinholeModel`]s and the pose of camera 2
//! relative to camera 1 (`P2 = R * P1 + t`). Rectification is computed
//! lazily for an image size and output view, kept in a
//! [`RectificationState`], and recomputed only when either changes. Each
//! camera keeps its own [`DistortionMapCache`] for the rectifying remap.

pub mod rectify;

pub use rectify::{compute_rectification, RectificationState, INVALID_DISPARITY};

use crate::camera::{
    CameraModelError, Intrinsics, OutputBounds, OutputView, PinholeModel, PinholeRecord, Resolution,
    RECORD_VERSION,
};
use crate::geometry::{apply_homography, compose_motion, matrix_to_vector, skew, GeometryError};
use crate::remap::{
    DistortionMap, DistortionMapCache, Interpolation, MapSignature, RemapError, SampleType,
};
use image::{ImageBuffer, Luma, Pixel, Rgb};
use nalgebra::{Matrix3, Matrix4, Vector2, Vector3, Vector4};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum StereoError {
    #[error("Camera 1 has {left} patterns but camera 2 has {right}")]
    PatternCountMismatch { left: usize, right: usize },
    #[error("World units differ: {left:?} and {right:?}")]
    WorldUnitsMismatch { left: String, right: String },
    #[error("The cameras were calibrated with different world points")]
    WorldPointsMismatch,
    #[error("No valid rectangle for the {0:?} view")]
    NoValidRectangle(OutputView),
    #[error("Rectification has not been computed")]
    RectificationNotComputed,
    #[error("Expected a {expected:?} image, got {got:?}")]
    SizeMismatch { expected: Resolution, got: Resolution },
    #[error("Rectified baseline has no horizontal component")]
    ZeroBaseline,
    #[error("Rectifying homography is singular")]
    SingularHomography,
    #[error("Pattern {0} is not available for both cameras")]
    MissingPattern(usize),
    #[error("Camera error: {0}")]
    Camera(#[from] CameraModelError),
    #[error("Resampling failed: {0}")]
    Remap(#[from] RemapError),
    #[error("Invalid relative pose: {0}")]
    Geometry(#[from] GeometryError),
}

impl From<serde_json::Error> for StereoError {
    fn from(err: serde_json::Error) -> Self {
        StereoError::Camera(err.into())
    }
}

impl From<serde_yaml::Error> for StereoError {
    fn from(err: serde_yaml::Error) -> Self {
        StereoError::Camera(err.into())
    }
}

/// Plain snapshot of a [`RectificationState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectificationRecord {
    pub homography1: [[f64; 3]; 3],
    pub homography2: [[f64; 3]; 3],
    pub q: [[f64; 4]; 4],
    pub x_bounds: [f64; 2],
    pub y_bounds: [f64; 2],
    pub original_size: Resolution,
    pub view: OutputView,
    pub effective_view: OutputView,
    pub intrinsics: Intrinsics,
    pub translation: [f64; 3],
}

/// Plain snapshot of a [`StereoModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoRecord {
    pub version: u32,
    pub camera1: PinholeRecord,
    pub camera2: PinholeRecord,
    /// Row-major rotation of camera 2.
    pub rotation_of_camera2: [[f64; 3]; 3],
    pub translation_of_camera2: [f64; 3],
    /// `None` until rectification has been computed.
    pub rectification: Option<RectificationRecord>,
}

fn rows3(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    [0, 1, 2].map(|r| [m[(r, 0)], m[(r, 1)], m[(r, 2)]])
}

fn from_rows3(rows: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::from_fn(|r, c| rows[r][c])
}

impl RectificationRecord {
    fn from_state(state: &RectificationState) -> Self {
        RectificationRecord {
            homography1: rows3(&state.homography1),
            homography2: rows3(&state.homography2),
            q: [0, 1, 2, 3].map(|r| [0, 1, 2, 3].map(|c| state.q[(r, c)])),
            x_bounds: [state.bounds.x_min, state.bounds.x_max],
            y_bounds: [state.bounds.y_min, state.bounds.y_max],
            original_size: state.original_size,
            view: state.view,
            effective_view: state.effective_view,
            intrinsics: state.intrinsics,
            translation: [state.translation.x, state.translation.y, state.translation.z],
        }
    }

    fn to_state(&self) -> RectificationState {
        RectificationState {
            homography1: from_rows3(&self.homography1),
            homography2: from_rows3(&self.homography2),
            q: Matrix4::from_fn(|r, c| self.q[r][c]),
            bounds: OutputBounds {
                x_min: self.x_bounds[0],
                x_max: self.x_bounds[1],
                y_min: self.y_bounds[0],
                y_max: self.y_bounds[1],
            },
            original_size: self.original_size,
            view: self.view,
            effective_view: self.effective_view,
            intrinsics: self.intrinsics,
            translation: Vector3::from(self.translation),
        }
    }
}

/// A calibrated stereo pair.
///
/// # Examples
///
/// ```rust
/// use camgeom::camera::{DistortionCoefficients, Intrinsics, OutputView, PinholeModel, Resolution};
/// use camgeom::stereo::StereoModel;
/// use nalgebra::{Matrix3, Vector3};
///
/// let camera = PinholeModel::new(
///     Intrinsics::new(500.0, 500.0, 160.0, 120.0),
///     DistortionCoefficients::zero(),
///     Resolution::new(320, 240),
/// )
/// .unwrap();
/// let mut stereo = StereoModel::new(
///     camera.clone(),
///     camera,
///     Matrix3::identity(),
///     Vector3::new(-100.0, 0.0, 0.0),
/// )
/// .unwrap();
/// assert_eq!(stereo.baseline(), 100.0);
///
/// let state = stereo
///     .ensure_rectification(&Resolution::new(320, 240), OutputView::Full)
///     .unwrap();
/// assert_eq!(state.rectified_size(), Resolution::new(320, 240));
/// ```
#[derive(Debug, Clone)]
pub struct StereoModel {
    camera1: PinholeModel,
    camera2: PinholeModel,
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    rectification: Option<RectificationState>,
    map_cache1: DistortionMapCache,
    map_cache2: DistortionMapCache,
}

impl StereoModel {
    /// Pairs two cameras.
    ///
    /// # Arguments
    ///
    /// * `camera1`, `camera2` - Cameras calibrated on the same pattern.
    /// * `rotation_of_camera2`, `translation_of_camera2` - Pose of camera 2
    ///   in camera 1's frame, `P2 = R * P1 + t`.
    ///
    /// # Errors
    ///
    /// * [`StereoError::PatternCountMismatch`], [`StereoError::WorldUnitsMismatch`]
    ///   or [`StereoError::WorldPointsMismatch`] if the cameras disagree.
    /// * [`StereoError::Geometry`] if the rotation is not proper.
    pub fn new(
        camera1: PinholeModel,
        camera2: PinholeModel,
        rotation_of_camera2: Matrix3<f64>,
        translation_of_camera2: Vector3<f64>,
    ) -> Result<Self, StereoError> {
        if camera1.extrinsics().len() != camera2.extrinsics().len() {
            return Err(StereoError::PatternCountMismatch {
                left: camera1.extrinsics().len(),
                right: camera2.extrinsics().len(),
            });
        }
        if camera1.world_units() != camera2.world_units() {
            return Err(StereoError::WorldUnitsMismatch {
                left: camera1.world_units().to_string(),
                right: camera2.world_units().to_string(),
            });
        }
        if camera1.world_points() != camera2.world_points() {
            return Err(StereoError::WorldPointsMismatch);
        }
        matrix_to_vector(&rotation_of_camera2)?;
        if translation_of_camera2.iter().any(|v| !v.is_finite()) {
            return Err(
                CameraModelError::InvalidParams("translation must be finite".to_string()).into(),
            );
        }
        Ok(StereoModel {
            camera1,
            camera2,
            rotation: rotation_of_camera2,
            translation: translation_of_camera2,
            rectification: None,
            map_cache1: DistortionMapCache::new(),
            map_cache2: DistortionMapCache::new(),
        })
    }

    /// Pairs two cameras using the extrinsics both estimated for one pattern.
    ///
    /// The relative pose is camera 1's pattern pose inverted and composed
    /// with camera 2's.
    pub fn from_pattern_extrinsics(
        camera1: PinholeModel,
        camera2: PinholeModel,
        pattern: usize,
    ) -> Result<Self, StereoError> {
        let r1 = camera1.extrinsics().rotation_vectors().get(pattern).copied();
        let t1 = camera1.extrinsics().translation_vectors().get(pattern).copied();
        let r2 = camera2.extrinsics().rotation_vectors().get(pattern).copied();
        let t2 = camera2.extrinsics().translation_vectors().get(pattern).copied();
        let (r1, t1, r2, t2) = match (r1, t1, r2, t2) {
            (Some(r1), Some(t1), Some(r2), Some(t2)) => (r1, t1, r2, t2),
            _ => return Err(StereoError::MissingPattern(pattern)),
        };
        let (rot1, _) = crate::geometry::vector_to_matrix(&r1);
        let inverse_translation = -(rot1.transpose() * t1);
        let motion = compose_motion(&(-r1), &inverse_translation, &r2, &t2)?;
        let (rotation, _) = crate::geometry::vector_to_matrix(&motion.rotation_vector);
        StereoModel::new(camera1, camera2, rotation, motion.translation)
    }

    pub fn camera1(&self) -> &PinholeModel {
        &self.camera1
    }

    pub fn camera2(&self) -> &PinholeModel {
        &self.camera2
    }

    pub fn rotation_of_camera2(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    pub fn translation_of_camera2(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// The current rectification, if any has been computed.
    pub fn rectification(&self) -> Option<&RectificationState> {
        self.rectification.as_ref()
    }

    /// Distance between the camera centers, in world units.
    pub fn baseline(&self) -> f64 {
        self.translation.norm()
    }

    /// `[t]x R`
    pub fn essential_matrix(&self) -> Matrix3<f64> {
        skew(&self.translation) * self.rotation
    }

    /// `K2^-T [t]x R K1^-1`, mapping camera-1 pixels to epipolar lines in
    /// camera 2.
    pub fn fundamental_matrix(&self) -> Result<Matrix3<f64>, StereoError> {
        let k1_inv = self
            .camera1
            .intrinsic_matrix()
            .try_inverse()
            .ok_or(StereoError::SingularHomography)?;
        let k2_inv = self
            .camera2
            .intrinsic_matrix()
            .try_inverse()
            .ok_or(StereoError::SingularHomography)?;
        Ok(k2_inv.transpose() * self.essential_matrix() * k1_inv)
    }

    /// Returns the rectification for `size` and `view`, recomputing it if the
    /// stored one was made for something else.
    pub fn ensure_rectification(
        &mut self,
        size: &Resolution,
        view: OutputView,
    ) -> Result<&RectificationState, StereoError> {
        let stale = self
            .rectification
            .as_ref()
            .map_or(true, |state| !state.matches(size, view));
        if stale {
            self.rectification = None;
            let state = compute_rectification(
                &self.camera1,
                &self.camera2,
                &self.rotation,
                &self.translation,
                size,
                view,
            )?;
            log::info!(
                "rectification computed for {}x{} images, {:?} view, output {}x{}",
                size.width,
                size.height,
                state.effective_view,
                state.rectified_size().width,
                state.rectified_size().height
            );
            self.rectification = Some(state);
        }
        self.rectification.as_ref().ok_or(StereoError::RectificationNotComputed)
    }

    fn computed(&self) -> Result<&RectificationState, StereoError> {
        self.rectification.as_ref().ok_or(StereoError::RectificationNotComputed)
    }

    /// Rectifies an image pair.
    ///
    /// # Arguments
    ///
    /// * `image1`, `image2` - Images of camera 1 and camera 2, same size.
    /// * `interpolation` - Resampling kernel.
    /// * `view` - Output extent, see [`compute_rectification`].
    /// * `fill` - Value for output pixels without a source pixel.
    ///
    /// # Errors
    ///
    /// * [`StereoError::SizeMismatch`] if the images differ in size or from
    ///   the calibration size.
    /// * [`StereoError::NoValidRectangle`] if no output exists.
    pub fn rectify_images<P>(
        &mut self,
        image1: &ImageBuffer<P, Vec<P::Subpixel>>,
        image2: &ImageBuffer<P, Vec<P::Subpixel>>,
        interpolation: Interpolation,
        view: OutputView,
        fill: P,
    ) -> Result<(ImageBuffer<P, Vec<P::Subpixel>>, ImageBuffer<P, Vec<P::Subpixel>>), StereoError>
    where
        P: Pixel,
        P::Subpixel: SampleType,
    {
        let size = Resolution::new(image1.width(), image1.height());
        let size2 = Resolution::new(image2.width(), image2.height());
        if size != size2 {
            return Err(StereoError::SizeMismatch {
                expected: size,
                got: size2,
            });
        }
        for camera in [&self.camera1, &self.camera2] {
            let calibrated = camera.resolution();
            if !calibrated.is_empty() && calibrated != size {
                return Err(StereoError::SizeMismatch {
                    expected: calibrated,
                    got: size,
                });
            }
        }

        let state = self.ensure_rectification(&size, view)?.clone();
        let bounds = state.bounds;
        let mut parameters: Vec<f64> =
            state.homography1.iter().chain(state.homography2.iter()).copied().collect();
        parameters.extend([bounds.x_min, bounds.x_max, bounds.y_min, bounds.y_max]);

        let rectified1 = rectify_with_cache(
            &mut self.map_cache1,
            &self.camera1,
            &state.homography1,
            &state.bounds,
            image1,
            MapSignature::for_image(image1, view).with_parameters(&parameters),
            interpolation,
            fill,
        )?;
        let rectified2 = rectify_with_cache(
            &mut self.map_cache2,
            &self.camera2,
            &state.homography2,
            &state.bounds,
            image2,
            MapSignature::for_image(image2, view).with_parameters(&parameters),
            interpolation,
            fill,
        )?;
        Ok((rectified1, rectified2))
    }

    /// Back-projects a disparity map of the rectified pair.
    ///
    /// Each output pixel holds `[X, Y, Z]` in the rectified camera-1 frame.
    /// Pixels whose disparity is [`INVALID_DISPARITY`] or not finite are
    /// `NaN`; zero disparity lies at infinity.
    ///
    /// # Errors
    ///
    /// * [`StereoError::RectificationNotComputed`] before any rectification.
    /// * [`StereoError::SizeMismatch`] unless the disparity map has the
    ///   rectified size.
    pub fn reconstruct_scene(
        &self,
        disparity: &ImageBuffer<Luma<f32>, Vec<f32>>,
    ) -> Result<ImageBuffer<Rgb<f32>, Vec<f32>>, StereoError> {
        let state = self.computed()?;
        let expected = state.rectified_size();
        let got = Resolution::new(disparity.width(), disparity.height());
        if expected != got {
            return Err(StereoError::SizeMismatch { expected, got });
        }
        let q = state.q;
        Ok(ImageBuffer::from_fn(got.width, got.height, |x, y| {
            let d = disparity.get_pixel(x, y)[0];
            if d == INVALID_DISPARITY || !d.is_finite() {
                return Rgb([f32::NAN; 3]);
            }
            let p = q * Vector4::new(x as f64, y as f64, d as f64, 1.0);
            Rgb([(p.x / p.w) as f32, (p.y / p.w) as f32, (p.z / p.w) as f32])
        }))
    }

    fn rectify_with(
        &self,
        camera: &PinholeModel,
        homography: &Matrix3<f64>,
        points: &[Vector2<f64>],
    ) -> Result<Vec<Vector2<f64>>, StereoError> {
        let origin = self.computed()?.bounds.origin();
        Ok(points
            .iter()
            .map(|p| {
                camera
                    .undistort_pixel(p)
                    .map(|u| apply_homography(homography, &u) - origin)
                    .unwrap_or_else(|| Vector2::new(f64::NAN, f64::NAN))
            })
            .collect())
    }

    fn unrectify_with(
        &self,
        camera: &PinholeModel,
        homography: &Matrix3<f64>,
        points: &[Vector2<f64>],
    ) -> Result<Vec<Vector2<f64>>, StereoError> {
        let origin = self.computed()?.bounds.origin();
        let inverse = homography.try_inverse().ok_or(StereoError::SingularHomography)?;
        Ok(points
            .iter()
            .map(|p| camera.distort_pixel(&apply_homography(&inverse, &(p + origin))))
            .collect())
    }

    /// Maps camera-1 pixels into the rectified image.
    ///
    /// Points whose undistortion fails come back as `NaN`.
    pub fn rectify_points1(
        &self,
        points: &[Vector2<f64>],
    ) -> Result<Vec<Vector2<f64>>, StereoError> {
        self.rectify_with(&self.camera1, &self.computed()?.homography1, points)
    }

    pub fn rectify_points2(
        &self,
        points: &[Vector2<f64>],
    ) -> Result<Vec<Vector2<f64>>, StereoError> {
        self.rectify_with(&self.camera2, &self.computed()?.homography2, points)
    }

    /// Maps rectified camera-1 pixels back to the original image, lens
    /// distortion included.
    pub fn unrectify_points1(
        &self,
        points: &[Vector2<f64>],
    ) -> Result<Vec<Vector2<f64>>, StereoError> {
        self.unrectify_with(&self.camera1, &self.computed()?.homography1, points)
    }

    pub fn unrectify_points2(
        &self,
        points: &[Vector2<f64>],
    ) -> Result<Vec<Vector2<f64>>, StereoError> {
        self.unrectify_with(&self.camera2, &self.computed()?.homography2, points)
    }

    pub fn to_record(&self) -> StereoRecord {
        StereoRecord {
            version: RECORD_VERSION,
            camera1: self.camera1.to_record(),
            camera2: self.camera2.to_record(),
            rotation_of_camera2: rows3(&self.rotation),
            translation_of_camera2: [self.translation.x, self.translation.y, self.translation.z],
            rectification: self.rectification.as_ref().map(RectificationRecord::from_state),
        }
    }

    /// Rebuilds a stereo model, validating both cameras and the pair.
    pub fn from_record(record: &StereoRecord) -> Result<Self, StereoError> {
        if record.version != RECORD_VERSION {
            return Err(CameraModelError::UnsupportedVersion(record.version).into());
        }
        let mut model = StereoModel::new(
            PinholeModel::from_record(&record.camera1)?,
            PinholeModel::from_record(&record.camera2)?,
            from_rows3(&record.rotation_of_camera2),
            Vector3::from(record.translation_of_camera2),
        )?;
        model.rectification = record.rectification.as_ref().map(RectificationRecord::to_state);
        Ok(model)
    }

    pub fn to_json(&self) -> Result<String, StereoError> {
        Ok(serde_json::to_string_pretty(&self.to_record())?)
    }

    pub fn from_json(json: &str) -> Result<Self, StereoError> {
        let record: StereoRecord = serde_json::from_str(json)?;
        StereoModel::from_record(&record)
    }

    pub fn to_yaml(&self) -> Result<String, StereoError> {
        Ok(serde_yaml::to_string(&self.to_record())?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, StereoError> {
        let record: StereoRecord = serde_yaml::from_str(yaml)?;
        StereoModel::from_record(&record)
    }
}

#[allow(clippy::too_many_arguments)]
fn rectify_with_cache<P>(
    cache: &mut DistortionMapCache,
    camera: &PinholeModel,
    homography: &Matrix3<f64>,
    bounds: &OutputBounds,
    image: &ImageBuffer<P, Vec<P::Subpixel>>,
    signature: MapSignature,
    interpolation: Interpolation,
    fill: P,
) -> Result<ImageBuffer<P, Vec<P::Subpixel>>, StereoError>
where
    P: Pixel,
    P::Subpixel: SampleType,
{
    let inverse = homography.try_inverse().ok_or(StereoError::SingularHomography)?;
    let rebuilt = cache.ensure_up_to_date(signature, || {
        DistortionMap::build(bounds, camera.valid_view_tolerances().max_output_pixels, |q| {
            Some(camera.distort_pixel(&apply_homography(&inverse, q)))
        })
    })?;
    if rebuilt {
        log::debug!("rectification map rebuilt");
    }
    Ok(cache.transform_image(image, interpolation, fill)?)
}
