//! Implements the pinhole camera model with Brown-Conrady lens distortion.
//!
//! This module provides the [`PinholeModel`] struct: an intrinsic matrix,
//! radial and tangential distortion coefficients, the calibration image size,
//! and the per-pattern extrinsics, world points and reprojection errors a
//! calibration run produces. It adheres to the [`CameraModel`] trait defined
//! in the parent `camera` module ([`crate::camera`]).

use crate::camera::bounds::{compute_output_bounds, OutputBounds, ValidViewTolerances};
use crate::camera::{
    validation, CameraModel, CameraModelError, DistortionCoefficients, Intrinsics, OutputView,
    PatternExtrinsics, Resolution, UndistortOptions, RECORD_VERSION,
};
use crate::remap::{DistortionMap, DistortionMapCache, Interpolation, MapSignature, SampleType};
use crate::util::{self, ProjectionError, UtilError};
use image::{ImageBuffer, Pixel};
use nalgebra::{DMatrix, Matrix3, Matrix3x4, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use yaml_rust::YamlLoader;

/// A calibrated pinhole camera.
///
/// Intrinsics, distortion and image size are fixed at construction. The
/// extrinsics and reprojection errors can only be replaced together through
/// [`PinholeModel::set_extrinsics`], which validates the new set before
/// storing it.
///
/// # Examples
///
/// ```rust
/// use camgeom::camera::{DistortionCoefficients, Intrinsics, PinholeModel, Resolution};
/// use nalgebra::{Matrix3, Vector3};
///
/// let model = PinholeModel::new(
///     Intrinsics::new(1000.0, 1000.0, 320.0, 240.0),
///     DistortionCoefficients::zero(),
///     Resolution::new(640, 480),
/// )
/// .unwrap();
///
/// let image_points = model
///     .world_to_image(
///         &Matrix3::identity(),
///         &Vector3::new(0.0, 0.0, 1000.0),
///         &[Vector3::zeros()],
///         false,
///     )
///     .unwrap();
/// assert!((image_points[0].x - 320.0).abs() < 1e-12);
/// assert!((image_points[0].y - 240.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone)]
pub struct PinholeModel {
    intrinsics: Intrinsics,
    distortion: DistortionCoefficients,
    resolution: Resolution,
    extrinsics: PatternExtrinsics,
    world_points: Vec<Vector2<f64>>,
    world_units: String,
    reprojection_errors: Vec<Vec<Vector2<f64>>>,
    undistort_options: UndistortOptions,
    tolerances: ValidViewTolerances,
    map_cache: DistortionMapCache,
}

/// Plain snapshot of a [`PinholeModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinholeRecord {
    pub version: u32,
    /// Row-major `K`.
    pub intrinsic_matrix: [[f64; 3]; 3],
    pub radial_distortion: Vec<f64>,
    pub tangential_distortion: [f64; 2],
    pub image_size: Resolution,
    pub rotation_vectors: Vec<[f64; 3]>,
    pub translation_vectors: Vec<[f64; 3]>,
    pub world_points: Vec<[f64; 2]>,
    pub world_units: String,
    /// `patterns x points` residuals, `[dx, dy]` each.
    pub reprojection_errors: Vec<Vec<[f64; 2]>>,
}

impl PinholeModel {
    /// Creates a [`PinholeModel`] without any calibration patterns.
    ///
    /// # Arguments
    ///
    /// * `intrinsics` - Focal lengths, principal point and skew.
    /// * `distortion` - Radial and tangential coefficients.
    /// * `resolution` - Size of the calibration images.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    pub fn new(
        intrinsics: Intrinsics,
        distortion: DistortionCoefficients,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let model = PinholeModel {
            intrinsics,
            distortion,
            resolution,
            extrinsics: PatternExtrinsics::empty(),
            world_points: Vec::new(),
            world_units: "mm".to_string(),
            reprojection_errors: Vec::new(),
            undistort_options: UndistortOptions::default(),
            tolerances: ValidViewTolerances::default(),
            map_cache: DistortionMapCache::new(),
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Creates a model from a 3x3 intrinsic matrix and distortion vectors.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidIntrinsicMatrix`] for a malformed `K`.
    /// * [`CameraModelError::InvalidRadialDistortion`] unless `radial` has 2 or 3 entries.
    /// * [`CameraModelError::InvalidTangentialDistortion`] unless `tangential` has 2 entries.
    pub fn from_matrix(
        k: &DMatrix<f64>,
        radial: &[f64],
        tangential: &[f64],
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let intrinsics = Intrinsics::from_matrix(k)?;
        let distortion = DistortionCoefficients::from_slices(radial, tangential)?;
        PinholeModel::new(intrinsics, distortion, resolution)
    }

    /// Attaches the calibration pattern and per-pattern results.
    ///
    /// `world_points` holds one planar pattern point per row.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidWorldPoints`] unless `world_points` has 2 columns.
    /// * [`CameraModelError::ReprojectionErrorShape`] if `reprojection_errors`
    ///   is non-empty and not `patterns x points`.
    pub fn with_patterns(
        mut self,
        world_points: &DMatrix<f64>,
        world_units: &str,
        extrinsics: PatternExtrinsics,
        reprojection_errors: Vec<Vec<Vector2<f64>>>,
    ) -> Result<Self, CameraModelError> {
        let points = validation::validate_world_points(world_points)?;
        validation::validate_reprojection_errors(
            &reprojection_errors,
            extrinsics.len(),
            points.len(),
        )?;
        self.world_points = points;
        self.world_units = world_units.to_string();
        self.extrinsics = extrinsics;
        self.reprojection_errors = reprojection_errors;
        Ok(self)
    }

    pub fn with_undistort_options(mut self, options: UndistortOptions) -> Self {
        self.undistort_options = options;
        self.map_cache.invalidate();
        self
    }

    pub fn with_valid_view_tolerances(mut self, tolerances: ValidViewTolerances) -> Self {
        self.tolerances = tolerances;
        self.map_cache.invalidate();
        self
    }

    /// Replaces extrinsics and reprojection errors as one unit.
    ///
    /// Nothing is modified if validation fails.
    pub fn set_extrinsics(
        &mut self,
        extrinsics: PatternExtrinsics,
        reprojection_errors: Vec<Vec<Vector2<f64>>>,
    ) -> Result<(), CameraModelError> {
        validation::validate_reprojection_errors(
            &reprojection_errors,
            extrinsics.len(),
            self.world_points.len(),
        )?;
        self.extrinsics = extrinsics;
        self.reprojection_errors = reprojection_errors;
        Ok(())
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    pub fn intrinsic_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.matrix()
    }

    pub fn distortion(&self) -> &DistortionCoefficients {
        &self.distortion
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn extrinsics(&self) -> &PatternExtrinsics {
        &self.extrinsics
    }

    pub fn world_points(&self) -> &[Vector2<f64>] {
        &self.world_points
    }

    pub fn world_units(&self) -> &str {
        &self.world_units
    }

    pub fn reprojection_errors(&self) -> &[Vec<Vector2<f64>>] {
        &self.reprojection_errors
    }

    pub fn undistort_options(&self) -> &UndistortOptions {
        &self.undistort_options
    }

    pub fn valid_view_tolerances(&self) -> &ValidViewTolerances {
        &self.tolerances
    }

    /// Maps an undistorted pixel to where the lens images it.
    pub fn distort_pixel(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let normalized = self.intrinsics.normalize(pixel);
        self.intrinsics
            .denormalize(&self.distortion.distort_normalized(&normalized))
    }

    /// Inverse of [`Self::distort_pixel`], `None` where the inversion fails.
    pub fn undistort_pixel(&self, pixel: &Vector2<f64>) -> Option<Vector2<f64>> {
        let normalized = self.intrinsics.normalize(pixel);
        self.distortion
            .undistort_normalized(&normalized, &self.undistort_options)
            .map(|p| self.intrinsics.denormalize(&p))
    }

    /// Applies lens distortion to undistorted pixel coordinates.
    pub fn distort_points(&self, points: &[Vector2<f64>]) -> Vec<Vector2<f64>> {
        points.iter().map(|p| self.distort_pixel(p)).collect()
    }

    /// Removes lens distortion from pixel coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::NumericalError`] naming the first point whose
    ///   inversion did not converge.
    pub fn undistort_points(
        &self,
        points: &[Vector2<f64>],
    ) -> Result<Vec<Vector2<f64>>, CameraModelError> {
        points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                self.undistort_pixel(p).ok_or_else(|| {
                    CameraModelError::NumericalError(format!(
                        "undistortion of point {i} ({}, {}) did not converge",
                        p.x, p.y
                    ))
                })
            })
            .collect()
    }

    /// `K [R | t]`.
    pub fn camera_matrix(
        &self,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> Matrix3x4<f64> {
        let mut rt = Matrix3x4::zeros();
        rt.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
        rt.set_column(3, translation);
        self.intrinsics.matrix() * rt
    }

    /// Projects world points into the image.
    ///
    /// # Arguments
    ///
    /// * `rotation`, `translation` - Pose mapping world to camera, `R * P + t`.
    /// * `world_points` - Points in world coordinates.
    /// * `apply_distortion` - Whether to pass the result through the lens model.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`] if a point lies in the
    ///   camera's focal plane.
    pub fn world_to_image(
        &self,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        world_points: &[Vector3<f64>],
        apply_distortion: bool,
    ) -> Result<Vec<Vector2<f64>>, CameraModelError> {
        world_points
            .iter()
            .map(|p| {
                let c = rotation * p + translation;
                if c.z.abs() < f64::EPSILON {
                    return Err(CameraModelError::PointAtCameraCenter);
                }
                let normalized = Vector2::new(c.x / c.z, c.y / c.z);
                let normalized = if apply_distortion {
                    self.distortion.distort_normalized(&normalized)
                } else {
                    normalized
                };
                Ok(self.intrinsics.denormalize(&normalized))
            })
            .collect()
    }

    /// Maps undistorted image points onto the world `Z = 0` plane.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::SingularMapping`] if the plane-to-image
    ///   homography `K [r1 r2 t]` is singular, i.e. the camera sees the
    ///   world plane edge-on.
    pub fn points_to_world(
        &self,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        image_points: &[Vector2<f64>],
    ) -> Result<Vec<Vector2<f64>>, CameraModelError> {
        let plane = Matrix3::from_columns(&[
            rotation.column(0).into_owned(),
            rotation.column(1).into_owned(),
            *translation,
        ]);
        let h = self.intrinsics.matrix() * plane;
        let h_inv = invert_plane_homography(&h)?;
        Ok(image_points
            .iter()
            .map(|p| crate::geometry::apply_homography(&h_inv, p))
            .collect())
    }

    /// Projects the stored world points through every pattern's extrinsics
    /// and the lens model.
    pub fn reprojected_points(&self) -> Result<Vec<Vec<Vector2<f64>>>, CameraModelError> {
        let planar: Vec<Vector3<f64>> = self
            .world_points
            .iter()
            .map(|p| Vector3::new(p.x, p.y, 0.0))
            .collect();
        self.extrinsics
            .iter()
            .map(|(r, t)| self.world_to_image(&r, &t, &planar, true))
            .collect()
    }

    /// Recomputes the stored reprojection errors against detected points,
    /// one list per pattern.
    pub fn refresh_reprojection_errors(
        &mut self,
        observed: &[Vec<Vector2<f64>>],
    ) -> Result<(), CameraModelError> {
        validation::validate_reprojection_errors(
            observed,
            self.extrinsics.len(),
            self.world_points.len(),
        )?;
        let projected = self.reprojected_points()?;
        let errors = projected
            .iter()
            .zip(observed)
            .map(|(proj, obs)| proj.iter().zip(obs).map(|(p, o)| p - o).collect())
            .collect();
        self.reprojection_errors = errors;
        Ok(())
    }

    /// Mean of the per-image mean error magnitudes.
    pub fn mean_reprojection_error(&self) -> Option<f64> {
        self.compute_mean_error().map(|(mean, _)| mean)
    }

    /// Overall mean error and the mean error of every image.
    ///
    /// Returns `None` when no reprojection errors are stored.
    pub fn compute_mean_error(&self) -> Option<(f64, Vec<f64>)> {
        mean_errors(&self.reprojection_errors)
    }

    /// Summary statistics of every stored error magnitude.
    pub fn reprojection_statistics(&self) -> Result<ProjectionError, UtilError> {
        let magnitudes: Vec<f64> = self
            .reprojection_errors
            .iter()
            .flatten()
            .map(|e| e.norm())
            .collect();
        util::error_statistics(&magnitudes)
    }

    /// Writes the stored reprojection errors as CSV.
    pub fn export_reprojection_errors<P: AsRef<Path>>(&self, path: P) -> Result<(), UtilError> {
        util::export_reprojection_errors(path, &self.reprojection_errors)
    }

    fn image_resolution(&self, width: u32, height: u32) -> Result<Resolution, CameraModelError> {
        let requested = Resolution::new(width, height);
        if !self.resolution.is_empty() && self.resolution != requested {
            return Err(CameraModelError::InvalidParams(format!(
                "image is {}x{} but the camera was calibrated at {}x{}",
                width, height, self.resolution.width, self.resolution.height
            )));
        }
        Ok(requested)
    }

    /// Bounds of the undistorted image for `view`, in undistorted pixel
    /// coordinates of the same intrinsic matrix.
    pub fn output_bounds(
        &self,
        resolution: &Resolution,
        view: OutputView,
    ) -> Result<OutputBounds, CameraModelError> {
        compute_output_bounds(
            resolution,
            view,
            &self.tolerances,
            |p| self.undistort_pixel(p),
            |q| Some(self.distort_pixel(q)),
        )
    }

    /// Removes lens distortion from an image.
    ///
    /// The remap is cached and rebuilt only when the image size, sample type,
    /// channel count or `view` changes.
    ///
    /// # Arguments
    ///
    /// * `image` - Distorted input image, the calibration size.
    /// * `interpolation` - Resampling kernel.
    /// * `view` - Output extent.
    /// * `fill` - Value for output pixels without a source pixel.
    ///
    /// # Returns
    ///
    /// The undistorted image and the undistorted pixel coordinate of its
    /// top-left pixel.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if the image size differs from
    ///   the calibration size.
    /// * [`CameraModelError::EmptyOutputView`] if `view` has no extent.
    pub fn undistort_image<P>(
        &mut self,
        image: &ImageBuffer<P, Vec<P::Subpixel>>,
        interpolation: Interpolation,
        view: OutputView,
        fill: P,
    ) -> Result<(ImageBuffer<P, Vec<P::Subpixel>>, Vector2<f64>), CameraModelError>
    where
        P: Pixel,
        P::Subpixel: SampleType,
    {
        let resolution = self.image_resolution(image.width(), image.height())?;
        let signature = MapSignature::for_image(image, view);

        let mut cache = std::mem::take(&mut self.map_cache);
        let rebuilt = cache.ensure_up_to_date(signature, || {
            let bounds = self.output_bounds(&resolution, view)?;
            let max_pixels = self.tolerances.max_output_pixels;
            DistortionMap::build(&bounds, max_pixels, |q| Some(self.distort_pixel(q)))
                .map_err(CameraModelError::from)
        });
        self.map_cache = cache;
        if rebuilt? {
            log::debug!("undistortion map rebuilt for {view:?} view");
        }

        let origin = self
            .map_cache
            .map()
            .map(|m| m.origin())
            .unwrap_or_else(Vector2::zeros);
        let undistorted = self.map_cache.transform_image(image, interpolation, fill)?;
        Ok((undistorted, origin))
    }

    /// Snapshot of every parameter.
    pub fn to_record(&self) -> PinholeRecord {
        let k = self.intrinsics.matrix();
        PinholeRecord {
            version: RECORD_VERSION,
            intrinsic_matrix: [
                [k[(0, 0)], k[(0, 1)], k[(0, 2)]],
                [k[(1, 0)], k[(1, 1)], k[(1, 2)]],
                [k[(2, 0)], k[(2, 1)], k[(2, 2)]],
            ],
            radial_distortion: self.distortion.radial(),
            tangential_distortion: self.distortion.tangential(),
            image_size: self.resolution,
            rotation_vectors: self
                .extrinsics
                .rotation_vectors()
                .iter()
                .map(|r| [r.x, r.y, r.z])
                .collect(),
            translation_vectors: self
                .extrinsics
                .translation_vectors()
                .iter()
                .map(|t| [t.x, t.y, t.z])
                .collect(),
            world_points: self.world_points.iter().map(|p| [p.x, p.y]).collect(),
            world_units: self.world_units.clone(),
            reprojection_errors: self
                .reprojection_errors
                .iter()
                .map(|pattern| pattern.iter().map(|e| [e.x, e.y]).collect())
                .collect(),
        }
    }

    /// Rebuilds a model from a snapshot, re-running every validation.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::UnsupportedVersion`] for a foreign record version.
    /// * Any construction error of [`PinholeModel::from_matrix`] or
    ///   [`PinholeModel::with_patterns`].
    pub fn from_record(record: &PinholeRecord) -> Result<Self, CameraModelError> {
        if record.version != RECORD_VERSION {
            return Err(CameraModelError::UnsupportedVersion(record.version));
        }
        let k = DMatrix::from_fn(3, 3, |r, c| record.intrinsic_matrix[r][c]);
        let world_points =
            DMatrix::from_fn(record.world_points.len(), 2, |r, c| record.world_points[r][c]);
        let extrinsics = PatternExtrinsics::new(
            record.rotation_vectors.iter().map(|r| Vector3::from(*r)).collect(),
            record.translation_vectors.iter().map(|t| Vector3::from(*t)).collect(),
        )?;
        let errors = record
            .reprojection_errors
            .iter()
            .map(|pattern| pattern.iter().map(|e| Vector2::from(*e)).collect())
            .collect();

        PinholeModel::from_matrix(
            &k,
            &record.radial_distortion,
            &record.tangential_distortion,
            record.image_size,
        )?
        .with_patterns(&world_points, &record.world_units, extrinsics, errors)
    }

    pub fn to_json(&self) -> Result<String, CameraModelError> {
        Ok(serde_json::to_string_pretty(&self.to_record())?)
    }

    pub fn from_json(json: &str) -> Result<Self, CameraModelError> {
        let record: PinholeRecord = serde_json::from_str(json)?;
        PinholeModel::from_record(&record)
    }

    pub fn to_yaml(&self) -> Result<String, CameraModelError> {
        Ok(serde_yaml::to_string(&self.to_record())?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, CameraModelError> {
        let record: PinholeRecord = serde_yaml::from_str(yaml)?;
        PinholeModel::from_record(&record)
    }
}

/// Per-image mean error magnitudes and their mean.
pub(crate) fn mean_errors(errors: &[Vec<Vector2<f64>>]) -> Option<(f64, Vec<f64>)> {
    let per_image: Vec<f64> = errors
        .iter()
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| pattern.iter().map(|e| e.norm()).sum::<f64>() / pattern.len() as f64)
        .collect();
    if per_image.is_empty() {
        return None;
    }
    let mean = per_image.iter().sum::<f64>() / per_image.len() as f64;
    Some((mean, per_image))
}

/// Inverts a plane-to-image homography, rejecting near-singular ones.
pub(crate) fn invert_plane_homography(h: &Matrix3<f64>) -> Result<Matrix3<f64>, CameraModelError> {
    let scale = h.norm();
    if scale == 0.0 || !scale.is_finite() {
        return Err(CameraModelError::SingularMapping);
    }
    let normalized = h / scale;
    if normalized.determinant().abs() < 1e-12 {
        return Err(CameraModelError::SingularMapping);
    }
    normalized
        .try_inverse()
        .map(|inv| inv / scale)
        .ok_or(CameraModelError::SingularMapping)
}

fn yaml_f64(node: &yaml_rust::Yaml, name: &str) -> Result<f64, CameraModelError> {
    node.as_f64()
        .or_else(|| node.as_i64().map(|v| v as f64))
        .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}: not a number")))
}

impl CameraModel for PinholeModel {
    /// Projects a 3D point from camera coordinates to distorted pixel
    /// coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: If the point's Z-coordinate is too close to
    ///   zero.
    /// * [`CameraModelError::ProjectionOutSideImage`]: If the projection falls outside the image.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        let normalized = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        let pixel = self
            .intrinsics
            .denormalize(&self.distortion.distort_normalized(&normalized));

        if !self.resolution.is_empty()
            && (pixel.x < 0.0
                || pixel.x >= self.resolution.width as f64
                || pixel.y < 0.0
                || pixel.y >= self.resolution.height as f64)
        {
            return Err(CameraModelError::ProjectionOutSideImage);
        }
        Ok(pixel)
    }

    /// Unprojects a distorted pixel to a unit ray in camera coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointIsOutSideImage`]: If the pixel is outside the image.
    /// * [`CameraModelError::NumericalError`]: If the distortion cannot be inverted.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.resolution.is_empty()
            && (point_2d.x < 0.0
                || point_2d.x >= self.resolution.width as f64
                || point_2d.y < 0.0
                || point_2d.y >= self.resolution.height as f64)
        {
            return Err(CameraModelError::PointIsOutSideImage);
        }
        let distorted = self.intrinsics.normalize(point_2d);
        let point = self
            .distortion
            .undistort_normalized(&distorted, &self.undistort_options)
            .ok_or_else(|| {
                CameraModelError::NumericalError(
                    "distortion inversion did not converge".to_string(),
                )
            })?;
        Ok(Vector3::new(point.x, point.y, 1.0).normalize())
    }

    /// Loads intrinsics, distortion and resolution from a Kalibr-style YAML
    /// file with a `cam0` node holding `intrinsics: [fx, fy, cx, cy]`,
    /// `distortion: [k1, k2, p1, p2(, k3)]` and `resolution: [w, h]`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::IOError`]: If the file cannot be read.
    /// * [`CameraModelError::YamlError`]: If the YAML is malformed.
    /// * [`CameraModelError::InvalidParams`]: If a field is missing or mistyped.
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs
            .first()
            .ok_or_else(|| CameraModelError::InvalidParams("Empty YAML document".to_string()))?;

        let intrinsics_yaml = doc["cam0"]["intrinsics"]
            .as_vec()
            .filter(|v| v.len() == 4)
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid intrinsics".to_string()))?;
        let resolution_yaml = doc["cam0"]["resolution"]
            .as_vec()
            .filter(|v| v.len() == 2)
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid resolution".to_string()))?;
        let distortion_yaml = doc["cam0"]["distortion"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("Missing distortion parameters".to_string())
        })?;

        let intrinsics = Intrinsics::new(
            yaml_f64(&intrinsics_yaml[0], "fx")?,
            yaml_f64(&intrinsics_yaml[1], "fy")?,
            yaml_f64(&intrinsics_yaml[2], "cx")?,
            yaml_f64(&intrinsics_yaml[3], "cy")?,
        );

        let resolution = Resolution {
            width: validation::yaml_dimension(&resolution_yaml[0], "width")?,
            height: validation::yaml_dimension(&resolution_yaml[1], "height")?,
        };

        let coeffs = distortion_yaml
            .iter()
            .enumerate()
            .map(|(i, v)| yaml_f64(v, &format!("distortion[{i}]")))
            .collect::<Result<Vec<f64>, _>>()?;
        let distortion = match coeffs.as_slice() {
            [k1, k2, p1, p2] => DistortionCoefficients::from_slices(&[*k1, *k2], &[*p1, *p2])?,
            [k1, k2, p1, p2, k3] => {
                DistortionCoefficients::from_slices(&[*k1, *k2, *k3], &[*p1, *p2])?
            }
            other => {
                return Err(CameraModelError::InvalidParams(format!(
                    "Expected 4 or 5 distortion parameters in YAML, found {}",
                    other.len()
                )))
            }
        };

        PinholeModel::new(intrinsics, distortion, resolution)
    }

    /// Saves intrinsics, distortion and resolution in the layout read by
    /// [`PinholeModel::load_from_yaml`].
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let mut distortion = vec![
            self.distortion.k1,
            self.distortion.k2,
            self.distortion.p1,
            self.distortion.p2,
        ];
        if self.distortion.radial().len() == 3 {
            distortion.push(self.distortion.k3);
        }

        let yaml = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::String("cam0".to_string()),
            serde_yaml::to_value(serde_yaml::Mapping::from_iter([
                (
                    serde_yaml::Value::String("camera_model".to_string()),
                    serde_yaml::Value::String("pinhole".to_string()),
                ),
                (
                    serde_yaml::Value::String("intrinsics".to_string()),
                    serde_yaml::to_value(vec![
                        self.intrinsics.fx,
                        self.intrinsics.fy,
                        self.intrinsics.cx,
                        self.intrinsics.cy,
                    ])?,
                ),
                (
                    serde_yaml::Value::String("distortion".to_string()),
                    serde_yaml::to_value(distortion)?,
                ),
                (
                    serde_yaml::Value::String("resolution".to_string()),
                    serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])?,
                ),
            ]))?,
        )]))?;

        let yaml_string = serde_yaml::to_string(&yaml)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    /// `[k1, k2, p1, p2, k3]`
    fn get_distortion(&self) -> Vec<f64> {
        vec![
            self.distortion.k1,
            self.distortion.k2,
            self.distortion.p1,
            self.distortion.p2,
            self.distortion.k3,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{GrayImage, Luma};

    fn sample_model() -> PinholeModel {
        PinholeModel::new(
            Intrinsics::new(460.0, 455.0, 320.5, 241.0),
            DistortionCoefficients::from_slices(
                &[-0.28340811, 0.07395907],
                &[0.00019359, 1.76187114e-05],
            )
            .unwrap(),
            Resolution::new(640, 480),
        )
        .unwrap()
    }

    fn calibrated_model() -> PinholeModel {
        let grid: Vec<f64> = (0..4)
            .flat_map(|i| (0..3).flat_map(move |j| [i as f64 * 30.0, j as f64 * 30.0]))
            .collect();
        let world = DMatrix::from_row_slice(12, 2, &grid);
        let extrinsics = PatternExtrinsics::new(
            vec![Vector3::new(0.1, -0.05, 0.02), Vector3::new(-0.2, 0.1, 0.0)],
            vec![Vector3::new(-40.0, -30.0, 400.0), Vector3::new(-20.0, -40.0, 500.0)],
        )
        .unwrap();
        sample_model()
            .with_patterns(&world, "mm", extrinsics, Vec::new())
            .unwrap()
    }

    #[test]
    fn test_example_projection() {
        let model = PinholeModel::new(
            Intrinsics::new(1000.0, 1000.0, 320.0, 240.0),
            DistortionCoefficients::zero(),
            Resolution::new(640, 480),
        )
        .unwrap();
        let p = model
            .world_to_image(
                &Matrix3::identity(),
                &Vector3::new(0.0, 0.0, 1000.0),
                &[Vector3::zeros()],
                false,
            )
            .unwrap();
        assert_relative_eq!(p[0], Vector2::new(320.0, 240.0), epsilon = 1e-12);
        let projected = model.project(&Vector3::new(0.0, 0.0, 1000.0)).unwrap();
        assert_relative_eq!(projected, Vector2::new(320.0, 240.0), epsilon = 1e-12);
    }

    #[test]
    fn test_distort_undistort_round_trip() {
        let model = sample_model();
        let points: Vec<Vector2<f64>> = (0..20)
            .map(|i| Vector2::new(40.0 + 28.0 * i as f64, 30.0 + 21.0 * i as f64))
            .collect();
        let distorted = model.distort_points(&points);
        let back = model.undistort_points(&distorted).unwrap();
        for (p, b) in points.iter().zip(back.iter()) {
            assert_relative_eq!(*p, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_project_unproject() {
        let model = sample_model();
        let ray = model.unproject(&Vector2::new(100.0, 400.0)).unwrap();
        assert_relative_eq!(ray.norm(), 1.0, epsilon = 1e-12);
        let back = model.project(&ray).unwrap();
        assert_relative_eq!(back, Vector2::new(100.0, 400.0), epsilon = 1e-6);
        assert!(matches!(
            model.unproject(&Vector2::new(-1.0, 10.0)),
            Err(CameraModelError::PointIsOutSideImage)
        ));
        assert!(matches!(
            model.project(&Vector3::new(0.0, 0.0, 0.0)),
            Err(CameraModelError::PointAtCameraCenter)
        ));
    }

    #[test]
    fn test_points_to_world_inverts_world_to_image() {
        let model = calibrated_model();
        let (r, t) = model.extrinsics().pose(0).unwrap();
        let world: Vec<Vector3<f64>> = model
            .world_points()
            .iter()
            .map(|p| Vector3::new(p.x, p.y, 0.0))
            .collect();
        let image_points = model.world_to_image(&r, &t, &world, false).unwrap();
        let back = model.points_to_world(&r, &t, &image_points).unwrap();
        for (w, b) in model.world_points().iter().zip(back.iter()) {
            assert_relative_eq!(*w, *b, epsilon = 1e-8);
        }

        let camera_matrix = model.camera_matrix(&r, &t);
        let h = camera_matrix * nalgebra::Vector4::new(0.0, 60.0, 0.0, 1.0);
        assert_relative_eq!(h.xy() / h.z, image_points[2], epsilon = 1e-9);
    }

    #[test]
    fn test_points_to_world_rejects_edge_on_plane() {
        let model = sample_model();
        // Rotate 90 degrees about x: the world plane contains the optical axis.
        let quarter_turn = Vector3::new(std::f64::consts::FRAC_PI_2, 0.0, 0.0);
        let (r, _) = crate::geometry::vector_to_matrix(&quarter_turn);
        let result = model.points_to_world(&r, &Vector3::zeros(), &[Vector2::new(10.0, 10.0)]);
        assert!(matches!(result, Err(CameraModelError::SingularMapping)));
    }

    #[test]
    fn test_reprojection_errors_and_means() {
        let mut model = calibrated_model();
        let mut observed = model.reprojected_points().unwrap();
        observed[0][0].x += 3.0;
        observed[1][1].y -= 4.0;
        observed[1][2].x += 2.0;
        model.refresh_reprojection_errors(&observed).unwrap();

        let (mean, per_image) = model.compute_mean_error().unwrap();
        assert_relative_eq!(per_image[0], 3.0 / 12.0, epsilon = 1e-9);
        assert_relative_eq!(per_image[1], 6.0 / 12.0, epsilon = 1e-9);
        assert_relative_eq!(mean, 0.375, epsilon = 1e-9);
        assert_relative_eq!(model.mean_reprojection_error().unwrap(), 0.375, epsilon = 1e-9);

        let stats = model.reprojection_statistics().unwrap();
        assert_relative_eq!(stats.max, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_set_extrinsics_is_all_or_nothing() {
        let mut model = calibrated_model();
        let before = model.extrinsics().clone();
        let bad_errors = vec![vec![Vector2::zeros(); 12]];
        let result = model.set_extrinsics(PatternExtrinsics::empty(), bad_errors);
        assert!(matches!(result, Err(CameraModelError::ReprojectionErrorShape { .. })));
        assert_eq!(model.extrinsics(), &before);
    }

    #[test]
    fn test_world_points_must_be_planar() {
        let world = DMatrix::<f64>::zeros(4, 3);
        let result =
            sample_model().with_patterns(&world, "mm", PatternExtrinsics::empty(), Vec::new());
        assert!(matches!(result, Err(CameraModelError::InvalidWorldPoints(3))));
    }

    #[test]
    fn test_record_round_trip() {
        let mut model = calibrated_model();
        let observed = model.reprojected_points().unwrap();
        model.refresh_reprojection_errors(&observed).unwrap();

        let json = model.to_json().unwrap();
        let restored = PinholeModel::from_json(&json).unwrap();
        assert_eq!(restored.to_record(), model.to_record());

        let yaml = model.to_yaml().unwrap();
        let restored = PinholeModel::from_yaml(&yaml).unwrap();
        assert_eq!(restored.intrinsics(), model.intrinsics());
        assert_eq!(restored.distortion(), model.distortion());

        let mut record = model.to_record();
        record.version = 99;
        assert!(matches!(
            PinholeModel::from_record(&record),
            Err(CameraModelError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_yaml_file_round_trip() {
        let model = PinholeModel::new(
            Intrinsics::new(460.0, 455.0, 320.5, 241.0),
            DistortionCoefficients::from_slices(&[-0.28, 0.07, 0.001], &[0.0002, 0.00002]).unwrap(),
            Resolution::new(640, 480),
        )
        .unwrap();
        let path = std::env::temp_dir().join("camgeom_pinhole_round_trip.yaml");
        let path = path.to_string_lossy().to_string();
        model.save_to_yaml(&path).unwrap();
        let loaded = PinholeModel::load_from_yaml(&path).unwrap();
        assert_eq!(loaded.intrinsics(), model.intrinsics());
        assert_eq!(loaded.distortion(), model.distortion());
        assert_eq!(loaded.get_resolution(), Resolution::new(640, 480));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_undistort_image_same_view_keeps_size() {
        let mut model = PinholeModel::new(
            Intrinsics::new(60.0, 60.0, 31.5, 23.5),
            DistortionCoefficients::from_slices(&[-0.2, 0.0], &[0.0, 0.0]).unwrap(),
            Resolution::new(64, 48),
        )
        .unwrap();
        let image = GrayImage::from_fn(64, 48, |x, y| Luma([((x + y) % 256) as u8]));

        let (same, origin) = model
            .undistort_image(&image, Interpolation::Bilinear, OutputView::Same, Luma([0]))
            .unwrap();
        assert_eq!(same.dimensions(), (64, 48));
        assert_eq!(origin, Vector2::zeros());
        // The principal point is a fixed point of the distortion.
        let center = same.get_pixel(31, 23)[0] as i32;
        assert!((center - image.get_pixel(31, 23)[0] as i32).abs() <= 1);

        let (full, full_origin) = model
            .undistort_image(&image, Interpolation::Bilinear, OutputView::Full, Luma([0]))
            .unwrap();
        assert!(full.width() > 64 && full.height() > 48);
        assert!(full_origin.x < 0.0 && full_origin.y < 0.0);

        let (valid, _) = model
            .undistort_image(&image, Interpolation::Nearest, OutputView::Valid, Luma([0]))
            .unwrap();
        assert!(valid.width() <= full.width());

        let wrong = GrayImage::new(32, 32);
        assert!(model
            .undistort_image(&wrong, Interpolation::Nearest, OutputView::Same, Luma([0]))
            .is_err());
    }

    #[test]
    fn test_undistort_image_respects_pixel_limit() {
        let tolerances = ValidViewTolerances {
            max_output_pixels: 100,
            ..ValidViewTolerances::default()
        };
        let mut model = sample_model().with_valid_view_tolerances(tolerances);
        let image = GrayImage::new(640, 480);
        let result =
            model.undistort_image(&image, Interpolation::Nearest, OutputView::Same, Luma([0]));
        assert!(matches!(
            result,
            Err(CameraModelError::Remap(crate::remap::RemapError::OutputTooLarge {
                width: 640,
                height: 480,
                limit: 100,
            }))
        ));
    }

    #[test]
    fn test_yaml_rejects_out_of_range_resolution() {
        let path = std::env::temp_dir().join("camgeom_pinhole_bad_resolution.yaml");
        let path = path.to_string_lossy().to_string();
        for resolution in ["[-640, 480]", "[640, 4294967296]"] {
            let yaml = format!(
                "cam0:\n  camera_model: pinhole\n  intrinsics: [460.0, 455.0, 320.5, 241.0]\n  \
                 distortion_model: radtan\n  distortion: [-0.28, 0.07, 0.0002, 0.00002]\n  \
                 resolution: {resolution}\n"
            );
            fs::write(&path, yaml).unwrap();
            let result = PinholeModel::load_from_yaml(&path);
            assert!(matches!(result, Err(CameraModelError::InvalidParams(_))), "{resolution}");
        }
        let _ = fs::remove_file(&path);
    }
}
