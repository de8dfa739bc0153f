//! Implements the Scaramuzza omnidirectional camera model.
//!
//! A sensor point `(u', v')` at radius `rho` sees along the ray
//! `(u', v', f(rho))` with the mapping polynomial
//!
//! ```text
//! f(rho) = a0 + a2 rho^2 + a3 rho^3 + a4 rho^4
//! ```
//!
//! and relates to the pixel through the stretch matrix and distortion center,
//! `pixel = S (u', v') + c`.
//!
//! Projecting a camera-frame point requires inverting `f`. The exact path
//! solves one polynomial per distinct `z / rho`; the approximate path fits a
//! polynomial `rho(theta)` over the observed incidence angles and is the
//! better choice for large point sets such as image maps.

use crate::camera::bounds::{compute_output_bounds, OutputBounds, ValidViewTolerances};
use crate::camera::pinhole::{invert_plane_homography, mean_errors};
use crate::camera::{
    validation, CameraModel, CameraModelError, Intrinsics, OutputView, PatternExtrinsics,
    Resolution, RECORD_VERSION,
};
use crate::geometry::{positive_real_roots, FittedPolynomial};
use crate::remap::{
    output_size, DistortionMap, DistortionMapCache, Interpolation, MapSignature, SampleType,
};
use image::{ImageBuffer, Pixel};
use nalgebra::{DMatrix, Matrix2, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use yaml_rust::YamlLoader;

/// How camera-frame points are mapped to fisheye pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionMethod {
    /// One polynomial root solve per distinct `z / rho`.
    Exact,
    /// Refitted inverse polynomial over the observed angular range.
    Approximate,
    /// Approximate above [`ApproxProjectionOptions::auto_threshold`] points.
    #[default]
    Auto,
}

/// Settings for the approximate projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproxProjectionOptions {
    pub start_degree: usize,
    pub max_degree: usize,
    /// Largest accepted sensor-radius error in pixels.
    pub target_error: f64,
    /// Angles sampled over the observed range.
    pub sample_count: usize,
    /// Point count above which [`ProjectionMethod::Auto`] approximates.
    pub auto_threshold: usize,
}

impl Default for ApproxProjectionOptions {
    fn default() -> Self {
        ApproxProjectionOptions {
            start_degree: 2,
            max_degree: 20,
            target_error: 0.1,
            sample_count: 200,
            auto_threshold: 10_000,
        }
    }
}

/// Mapping polynomial and sensor alignment of a fisheye camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FisheyeIntrinsics {
    /// `[a0, a2, a3, a4]`
    pub mapping_coefficients: [f64; 4],
    pub stretch_matrix: Matrix2<f64>,
    pub distortion_center: Vector2<f64>,
    pub image_size: Resolution,
}

impl FisheyeIntrinsics {
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if a value is not finite, `a0`
    ///   is not positive, or the stretch matrix is singular.
    pub fn new(
        mapping_coefficients: [f64; 4],
        stretch_matrix: Matrix2<f64>,
        distortion_center: Vector2<f64>,
        image_size: Resolution,
    ) -> Result<Self, CameraModelError> {
        let intrinsics = FisheyeIntrinsics {
            mapping_coefficients,
            stretch_matrix,
            distortion_center,
            image_size,
        };
        intrinsics.validate()?;
        Ok(intrinsics)
    }

    fn validate(&self) -> Result<(), CameraModelError> {
        if self
            .mapping_coefficients
            .iter()
            .chain(self.stretch_matrix.iter())
            .chain(self.distortion_center.iter())
            .any(|v| !v.is_finite())
        {
            return Err(CameraModelError::InvalidParams(
                "fisheye intrinsics must be finite".to_string(),
            ));
        }
        if self.mapping_coefficients[0] <= 0.0 {
            return Err(CameraModelError::InvalidParams(
                "mapping coefficient a0 must be positive".to_string(),
            ));
        }
        if self.stretch_matrix.determinant().abs() < f64::EPSILON {
            return Err(CameraModelError::InvalidParams(
                "stretch matrix is singular".to_string(),
            ));
        }
        Ok(())
    }

    /// `f(rho)`
    pub fn mapping(&self, rho: f64) -> f64 {
        let [a0, a2, a3, a4] = self.mapping_coefficients;
        let rho2 = rho * rho;
        a0 + a2 * rho2 + a3 * rho2 * rho + a4 * rho2 * rho2
    }

    /// Smallest positive sensor radius seeing rays with `z / rho3 = m`.
    pub fn sensor_radius(&self, m: f64) -> Option<f64> {
        let [a0, a2, a3, a4] = self.mapping_coefficients;
        positive_real_roots(&[a0, -m, a2, a3, a4]).first().copied()
    }

    fn sensor_to_pixel(&self, sensor: &Vector2<f64>) -> Vector2<f64> {
        self.stretch_matrix * sensor + self.distortion_center
    }

    fn pixel_to_sensor(&self, pixel: &Vector2<f64>) -> Option<Vector2<f64>> {
        self.stretch_matrix
            .try_inverse()
            .map(|inv| inv * (pixel - self.distortion_center))
    }

    /// Ray through a pixel, not normalized.
    pub fn pixel_to_ray(&self, pixel: &Vector2<f64>) -> Option<Vector3<f64>> {
        let sensor = self.pixel_to_sensor(pixel)?;
        Some(Vector3::new(sensor.x, sensor.y, self.mapping(sensor.norm())))
    }
}

/// Radial distance of a camera-frame point from the optical axis, with an
/// exact zero replaced by machine epsilon.
fn axis_distance(point: &Vector3<f64>) -> f64 {
    let rho3 = (point.x * point.x + point.y * point.y).sqrt();
    if rho3 == 0.0 {
        f64::EPSILON
    } else {
        rho3
    }
}

fn place(
    intrinsics: &FisheyeIntrinsics,
    point: &Vector3<f64>,
    rho3: f64,
    rho: f64,
) -> Vector2<f64> {
    let sensor = Vector2::new(point.x, point.y) / rho3 * rho;
    intrinsics.sensor_to_pixel(&sensor)
}

/// Exact projection of camera-frame points.
///
/// Points sharing the same `z / rho` are solved once. Points without a
/// positive sensor radius map to `NaN`.
pub fn compute_image_projection(
    points: &[Vector3<f64>],
    intrinsics: &FisheyeIntrinsics,
) -> Vec<Vector2<f64>> {
    let mut radii: HashMap<u64, Option<f64>> = HashMap::new();
    points
        .iter()
        .map(|p| {
            let rho3 = axis_distance(p);
            let m = p.z / rho3;
            let rho = *radii
                .entry(m.to_bits())
                .or_insert_with(|| intrinsics.sensor_radius(m));
            match rho {
                Some(rho) => place(intrinsics, p, rho3, rho),
                None => Vector2::new(f64::NAN, f64::NAN),
            }
        })
        .collect()
}

/// Approximate projection through a refitted `rho(theta)` polynomial.
///
/// The degree starts at `options.start_degree` and grows until the largest
/// sampled radius error drops below `options.target_error` or
/// `options.max_degree` is reached.
///
/// # Returns
///
/// The projected points and the largest sampled radius error.
///
/// # Errors
///
/// * [`CameraModelError::NumericalError`] if no fit could be computed.
pub fn compute_approx_image_projection(
    points: &[Vector3<f64>],
    intrinsics: &FisheyeIntrinsics,
    options: &ApproxProjectionOptions,
) -> Result<(Vec<Vector2<f64>>, f64), CameraModelError> {
    let angles: Vec<f64> = points.iter().map(|p| axis_distance(p).atan2(p.z)).collect();
    let (lo, hi) = angles
        .iter()
        .filter(|a| a.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &a| (lo.min(a), hi.max(a)));
    if !(hi > lo) {
        return Ok((compute_image_projection(points, intrinsics), 0.0));
    }

    let n = options.sample_count.max(options.max_degree + 1);
    let (sample_angles, sample_radii): (Vec<f64>, Vec<f64>) = (0..n)
        .filter_map(|i| {
            let theta = lo + (hi - lo) * i as f64 / (n - 1) as f64;
            let m = theta.cos() / theta.sin().max(f64::EPSILON);
            intrinsics.sensor_radius(m).map(|rho| (theta, rho))
        })
        .unzip();

    let mut best: Option<(FittedPolynomial, f64)> = None;
    for degree in options.start_degree..=options.max_degree {
        if sample_angles.len() < degree + 1 {
            break;
        }
        let fit = match FittedPolynomial::fit(&sample_angles, &sample_radii, degree) {
            Ok(fit) => fit,
            Err(e) => {
                log::debug!("degree {degree} fit failed: {e}");
                continue;
            }
        };
        let max_error = sample_angles
            .iter()
            .zip(sample_radii.iter())
            .map(|(&theta, &rho)| (fit.evaluate(theta) - rho).abs())
            .fold(0.0_f64, f64::max);
        let done = max_error < options.target_error;
        if best.as_ref().map_or(true, |(_, e)| max_error < *e) {
            best = Some((fit, max_error));
        }
        if done {
            break;
        }
    }

    let (fit, max_error) = best.ok_or_else(|| {
        CameraModelError::NumericalError("no polynomial fit for approximate projection".to_string())
    })?;
    if max_error >= options.target_error {
        log::warn!(
            "approximate fisheye projection reached degree {} with error {max_error:.4} px",
            fit.degree()
        );
    } else {
        log::debug!(
            "approximate fisheye projection uses degree {} (error {max_error:.2e} px)",
            fit.degree()
        );
    }

    let projected = points
        .iter()
        .zip(angles.iter())
        .map(|(p, &theta)| place(intrinsics, p, axis_distance(p), fit.evaluate(theta)))
        .collect();
    Ok((projected, max_error))
}

/// A calibrated Scaramuzza fisheye camera.
#[derive(Debug, Clone)]
pub struct FisheyeModel {
    intrinsics: FisheyeIntrinsics,
    extrinsics: PatternExtrinsics,
    world_points: Vec<Vector2<f64>>,
    world_units: String,
    reprojection_errors: Vec<Vec<Vector2<f64>>>,
    estimate_alignment: bool,
    approx_options: ApproxProjectionOptions,
    tolerances: ValidViewTolerances,
    map_cache: DistortionMapCache,
}

/// Plain snapshot of a [`FisheyeModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FisheyeRecord {
    pub version: u32,
    pub mapping_coefficients: [f64; 4],
    /// Row-major stretch matrix.
    pub stretch_matrix: [[f64; 2]; 2],
    pub distortion_center: [f64; 2],
    pub image_size: Resolution,
    pub rotation_vectors: Vec<[f64; 3]>,
    pub translation_vectors: Vec<[f64; 3]>,
    pub world_points: Vec<[f64; 2]>,
    pub world_units: String,
    pub reprojection_errors: Vec<Vec<[f64; 2]>>,
    pub estimate_alignment: bool,
}

impl FisheyeModel {
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if `a0` is not positive, a
    ///   coefficient is not finite or the stretch matrix is singular.
    pub fn new(intrinsics: FisheyeIntrinsics) -> Result<Self, CameraModelError> {
        intrinsics.validate()?;
        Ok(FisheyeModel {
            intrinsics,
            extrinsics: PatternExtrinsics::empty(),
            world_points: Vec::new(),
            world_units: "mm".to_string(),
            reprojection_errors: Vec::new(),
            estimate_alignment: false,
            approx_options: ApproxProjectionOptions::default(),
            tolerances: ValidViewTolerances::default(),
            map_cache: DistortionMapCache::new(),
        })
    }

    /// Attaches the calibration pattern and per-pattern results.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidWorldPoints`] unless `world_points` has 2 columns.
    /// * [`CameraModelError::ReprojectionErrorShape`] for a malformed error set.
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

    pub fn with_estimate_alignment(mut self, estimate_alignment: bool) -> Self {
        self.estimate_alignment = estimate_alignment;
        self
    }

    pub fn with_approx_options(mut self, options: ApproxProjectionOptions) -> Self {
        self.approx_options = options;
        self.map_cache.invalidate();
        self
    }

    pub fn with_valid_view_tolerances(mut self, tolerances: ValidViewTolerances) -> Self {
        self.tolerances = tolerances;
        self.map_cache.invalidate();
        self
    }

    /// Replaces extrinsics and reprojection errors as one unit.
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

    pub fn intrinsics(&self) -> &FisheyeIntrinsics {
        &self.intrinsics
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

    pub fn estimate_alignment(&self) -> bool {
        self.estimate_alignment
    }

    fn resolve(&self, method: ProjectionMethod, count: usize) -> ProjectionMethod {
        match method {
            ProjectionMethod::Auto if count > self.approx_options.auto_threshold => {
                ProjectionMethod::Approximate
            }
            ProjectionMethod::Auto => ProjectionMethod::Exact,
            other => other,
        }
    }

    /// Projects camera-frame points with the chosen method.
    ///
    /// Unprojectable points come back as `NaN`.
    pub fn project_points(
        &self,
        points: &[Vector3<f64>],
        method: ProjectionMethod,
    ) -> Result<Vec<Vector2<f64>>, CameraModelError> {
        match self.resolve(method, points.len()) {
            ProjectionMethod::Approximate => {
                compute_approx_image_projection(points, &self.intrinsics, &self.approx_options)
                    .map(|(projected, _)| projected)
            }
            _ => Ok(compute_image_projection(points, &self.intrinsics)),
        }
    }

    /// Projects planar world points `(X, Y, 0)` of one pattern pose.
    ///
    /// Only the first two columns of `rotation` act on planar points.
    pub fn world_to_image(
        &self,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        world_points: &[Vector2<f64>],
        method: ProjectionMethod,
    ) -> Result<Vec<Vector2<f64>>, CameraModelError> {
        let plane = Matrix3::from_columns(&[
            rotation.column(0).into_owned(),
            rotation.column(1).into_owned(),
            *translation,
        ]);
        let camera: Vec<Vector3<f64>> = world_points
            .iter()
            .map(|p| plane * Vector3::new(p.x, p.y, 1.0))
            .collect();
        self.project_points(&camera, method)
    }

    /// Intersects the rays of fisheye pixels with the world `Z = 0` plane.
    ///
    /// Rays parallel to the plane give `NaN`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::SingularMapping`] if the plane passes through
    ///   the camera center.
    pub fn points_to_world(
        &self,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        image_points: &[Vector2<f64>],
    ) -> Result<Vec<Vector2<f64>>, CameraModelError> {
        let r1 = rotation.column(0).into_owned();
        let r2 = rotation.column(1).into_owned();
        let normal = r1.cross(&r2);
        if normal.dot(translation).abs() < f64::EPSILON * translation.norm().max(1.0) {
            return Err(CameraModelError::SingularMapping);
        }
        Ok(image_points
            .iter()
            .map(|p| {
                let ray = match self.intrinsics.pixel_to_ray(p) {
                    Some(ray) => ray,
                    None => return Vector2::new(f64::NAN, f64::NAN),
                };
                // X r1 + Y r2 - s d = -t
                let a = Matrix3::from_columns(&[r1, r2, -ray]);
                match invert_plane_homography(&a) {
                    Ok(inv) => {
                        let solution = inv * (-translation);
                        Vector2::new(solution.x, solution.y)
                    }
                    Err(_) => Vector2::new(f64::NAN, f64::NAN),
                }
            })
            .collect())
    }

    /// Projects the stored world points through every pattern's extrinsics.
    pub fn reprojected_points(
        &self,
        method: ProjectionMethod,
    ) -> Result<Vec<Vec<Vector2<f64>>>, CameraModelError> {
        self.extrinsics
            .iter()
            .map(|(r, t)| self.world_to_image(&r, &t, &self.world_points, method))
            .collect()
    }

    /// Recomputes the stored reprojection errors against detected points.
    pub fn refresh_reprojection_errors(
        &mut self,
        observed: &[Vec<Vector2<f64>>],
    ) -> Result<(), CameraModelError> {
        validation::validate_reprojection_errors(
            observed,
            self.extrinsics.len(),
            self.world_points.len(),
        )?;
        let projected = self.reprojected_points(ProjectionMethod::Exact)?;
        self.reprojection_errors = projected
            .iter()
            .zip(observed)
            .map(|(proj, obs)| proj.iter().zip(obs).map(|(p, o)| p - o).collect())
            .collect();
        Ok(())
    }

    pub fn mean_reprojection_error(&self) -> Option<f64> {
        self.compute_mean_error().map(|(mean, _)| mean)
    }

    pub fn compute_mean_error(&self) -> Option<(f64, Vec<f64>)> {
        mean_errors(&self.reprojection_errors)
    }

    /// Virtual pinhole camera for undistortion: focal length
    /// `scale_factor * min(width, height) / 2`, principal point at the
    /// image center.
    pub fn virtual_pinhole(&self, resolution: &Resolution, scale_factor: f64) -> Intrinsics {
        let f = scale_factor * resolution.width.min(resolution.height) as f64 / 2.0;
        Intrinsics::new(
            f,
            f,
            (resolution.width as f64 - 1.0) / 2.0,
            (resolution.height as f64 - 1.0) / 2.0,
        )
    }

    fn to_virtual(&self, camera: &Intrinsics, pixel: &Vector2<f64>) -> Option<Vector2<f64>> {
        let ray = self.intrinsics.pixel_to_ray(pixel)?;
        if ray.z <= f64::EPSILON * ray.norm() {
            return None;
        }
        Some(camera.denormalize(&Vector2::new(ray.x / ray.z, ray.y / ray.z)))
    }

    /// Maps fisheye pixels into the virtual pinhole camera of
    /// [`Self::virtual_pinhole`].
    ///
    /// Points whose ray leaves the front hemisphere come back as `NaN`.
    pub fn undistort_points(
        &self,
        points: &[Vector2<f64>],
        scale_factor: f64,
    ) -> Result<(Vec<Vector2<f64>>, Intrinsics), CameraModelError> {
        if !(scale_factor > 0.0) || !scale_factor.is_finite() {
            return Err(CameraModelError::InvalidParams(format!(
                "scale factor must be positive, got {scale_factor}"
            )));
        }
        let camera = self.virtual_pinhole(&self.intrinsics.image_size, scale_factor);
        let undistorted = points
            .iter()
            .map(|p| {
                self.to_virtual(&camera, p)
                    .unwrap_or_else(|| Vector2::new(f64::NAN, f64::NAN))
            })
            .collect();
        Ok((undistorted, camera))
    }

    /// Bounds of the undistorted image in the virtual camera's pixel frame.
    pub fn output_bounds(
        &self,
        camera: &Intrinsics,
        view: OutputView,
    ) -> Result<OutputBounds, CameraModelError> {
        let resolution = self.intrinsics.image_size;
        compute_output_bounds(
            &resolution,
            view,
            &self.tolerances,
            |p| self.to_virtual(camera, p),
            |q| {
                let n = camera.normalize(q);
                compute_image_projection(&[Vector3::new(n.x, n.y, 1.0)], &self.intrinsics)
                    .first()
                    .copied()
                    .filter(|p| p.x.is_finite() && p.y.is_finite())
            },
        )
    }

    /// Unwarps a fisheye image into a virtual pinhole camera.
    ///
    /// # Arguments
    ///
    /// * `image` - Fisheye image at the calibration size.
    /// * `interpolation` - Resampling kernel.
    /// * `view` - Output extent.
    /// * `scale_factor` - Multiplier of the virtual focal length.
    /// * `method` - Projection used to build the map.
    /// * `fill` - Value for output pixels without a source pixel.
    ///
    /// # Returns
    ///
    /// The undistorted image and the intrinsics of the virtual camera, with
    /// the principal point shifted into output-image coordinates.
    pub fn undistort_image<P>(
        &mut self,
        image: &ImageBuffer<P, Vec<P::Subpixel>>,
        interpolation: Interpolation,
        view: OutputView,
        scale_factor: f64,
        method: ProjectionMethod,
        fill: P,
    ) -> Result<(ImageBuffer<P, Vec<P::Subpixel>>, Intrinsics), CameraModelError>
    where
        P: Pixel,
        P::Subpixel: SampleType,
    {
        let size = self.intrinsics.image_size;
        if size != Resolution::new(image.width(), image.height()) {
            return Err(CameraModelError::InvalidParams(format!(
                "image is {}x{} but the camera was calibrated at {}x{}",
                image.width(),
                image.height(),
                size.width,
                size.height
            )));
        }
        if !(scale_factor > 0.0) || !scale_factor.is_finite() {
            return Err(CameraModelError::InvalidParams(format!(
                "scale factor must be positive, got {scale_factor}"
            )));
        }
        let camera = self.virtual_pinhole(&size, scale_factor);
        let signature = MapSignature::for_image(image, view)
            .with_focal_length(camera.fx)
            .with_method(method);

        let mut cache = std::mem::take(&mut self.map_cache);
        let rebuilt = cache.ensure_up_to_date(signature, || self.build_map(&camera, view, method));
        self.map_cache = cache;
        rebuilt?;

        let origin = self
            .map_cache
            .map()
            .map(|m| m.origin())
            .unwrap_or_else(Vector2::zeros);
        let undistorted = self.map_cache.transform_image(image, interpolation, fill)?;
        let mut output_camera = camera;
        output_camera.cx -= origin.x;
        output_camera.cy -= origin.y;
        Ok((undistorted, output_camera))
    }

    fn build_map(
        &self,
        camera: &Intrinsics,
        view: OutputView,
        method: ProjectionMethod,
    ) -> Result<DistortionMap, CameraModelError> {
        let bounds = self.output_bounds(camera, view)?;
        let size = output_size(&bounds, self.tolerances.max_output_pixels)?;
        let origin = bounds.origin();
        let (width, height) = (size.width as usize, size.height as usize);

        let rays: Vec<Vector3<f64>> = (0..height)
            .flat_map(|row| (0..width).map(move |col| (col, row)))
            .map(|(col, row)| {
                let pixel = Vector2::new(origin.x + col as f64, origin.y + row as f64);
                let n = camera.normalize(&pixel);
                Vector3::new(n.x, n.y, 1.0)
            })
            .collect();
        let sources = self.project_points(&rays, method)?;
        let (x, y): (Vec<f64>, Vec<f64>) = sources.iter().map(|p| (p.x, p.y)).unzip();
        Ok(DistortionMap::from_grids(width, height, x, y, origin)?)
    }

    pub fn to_record(&self) -> FisheyeRecord {
        let s = &self.intrinsics.stretch_matrix;
        FisheyeRecord {
            version: RECORD_VERSION,
            mapping_coefficients: self.intrinsics.mapping_coefficients,
            stretch_matrix: [[s[(0, 0)], s[(0, 1)]], [s[(1, 0)], s[(1, 1)]]],
            distortion_center: self.intrinsics.distortion_center.into(),
            image_size: self.intrinsics.image_size,
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
            estimate_alignment: self.estimate_alignment,
        }
    }

    pub fn from_record(record: &FisheyeRecord) -> Result<Self, CameraModelError> {
        if record.version != RECORD_VERSION {
            return Err(CameraModelError::UnsupportedVersion(record.version));
        }
        let s = &record.stretch_matrix;
        let intrinsics = FisheyeIntrinsics::new(
            record.mapping_coefficients,
            Matrix2::new(s[0][0], s[0][1], s[1][0], s[1][1]),
            Vector2::from(record.distortion_center),
            record.image_size,
        )?;
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
        Ok(FisheyeModel::new(intrinsics)?
            .with_patterns(&world_points, &record.world_units, extrinsics, errors)?
            .with_estimate_alignment(record.estimate_alignment))
    }

    pub fn to_json(&self) -> Result<String, CameraModelError> {
        Ok(serde_json::to_string_pretty(&self.to_record())?)
    }

    pub fn from_json(json: &str) -> Result<Self, CameraModelError> {
        let record: FisheyeRecord = serde_json::from_str(json)?;
        FisheyeModel::from_record(&record)
    }

    pub fn to_yaml(&self) -> Result<String, CameraModelError> {
        Ok(serde_yaml::to_string(&self.to_record())?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, CameraModelError> {
        let record: FisheyeRecord = serde_yaml::from_str(yaml)?;
        FisheyeModel::from_record(&record)
    }
}

fn yaml_numbers(
    node: &yaml_rust::Yaml,
    name: &str,
    len: usize,
) -> Result<Vec<f64>, CameraModelError> {
    let values = node
        .as_vec()
        .filter(|v| v.len() == len)
        .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}")))?;
    values
        .iter()
        .map(|v| {
            v.as_f64().or_else(|| v.as_i64().map(|i| i as f64)).ok_or_else(|| {
                CameraModelError::InvalidParams(format!("Invalid {name}: not a number"))
            })
        })
        .collect()
}

impl CameraModel for FisheyeModel {
    /// Exact projection of a camera-frame point.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::ProjectionOutSideImage`] if the mapping
    ///   polynomial has no positive root for the point's direction.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.norm() < f64::EPSILON {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        compute_image_projection(std::slice::from_ref(point_3d), &self.intrinsics)
            .first()
            .copied()
            .filter(|p| p.x.is_finite() && p.y.is_finite())
            .ok_or(CameraModelError::ProjectionOutSideImage)
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let size = self.intrinsics.image_size;
        if point_2d.x < 0.0
            || point_2d.x >= size.width as f64
            || point_2d.y < 0.0
            || point_2d.y >= size.height as f64
        {
            return Err(CameraModelError::PointIsOutSideImage);
        }
        self.intrinsics
            .pixel_to_ray(point_2d)
            .map(|ray| ray.normalize())
            .ok_or_else(|| {
                CameraModelError::NumericalError("stretch matrix is singular".to_string())
            })
    }

    /// Loads a `cam0` node with `mapping_coefficients: [a0, a2, a3, a4]`,
    /// `stretch_matrix: [c, d, e, f]` (row-major), `distortion_center: [cx, cy]`
    /// and `resolution: [w, h]`.
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs
            .first()
            .ok_or_else(|| CameraModelError::InvalidParams("Empty YAML document".to_string()))?;
        let cam = &doc["cam0"];

        let coeffs = yaml_numbers(&cam["mapping_coefficients"], "mapping_coefficients", 4)?;
        let stretch = yaml_numbers(&cam["stretch_matrix"], "stretch_matrix", 4)?;
        let center = yaml_numbers(&cam["distortion_center"], "distortion_center", 2)?;
        let resolution = cam["resolution"]
            .as_vec()
            .filter(|v| v.len() == 2)
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid resolution".to_string()))?;

        let intrinsics = FisheyeIntrinsics::new(
            [coeffs[0], coeffs[1], coeffs[2], coeffs[3]],
            Matrix2::new(stretch[0], stretch[1], stretch[2], stretch[3]),
            Vector2::new(center[0], center[1]),
            Resolution::new(
                validation::yaml_dimension(&resolution[0], "width")?,
                validation::yaml_dimension(&resolution[1], "height")?,
            ),
        )?;
        FisheyeModel::new(intrinsics)
    }

    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let s = &self.intrinsics.stretch_matrix;
        let yaml = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::String("cam0".to_string()),
            serde_yaml::to_value(serde_yaml::Mapping::from_iter([
                (
                    serde_yaml::Value::String("camera_model".to_string()),
                    serde_yaml::Value::String("scaramuzza".to_string()),
                ),
                (
                    serde_yaml::Value::String("mapping_coefficients".to_string()),
                    serde_yaml::to_value(self.intrinsics.mapping_coefficients.to_vec())?,
                ),
                (
                    serde_yaml::Value::String("stretch_matrix".to_string()),
                    serde_yaml::to_value(vec![s[(0, 0)], s[(0, 1)], s[(1, 0)], s[(1, 1)]])?,
                ),
                (
                    serde_yaml::Value::String("distortion_center".to_string()),
                    serde_yaml::to_value(vec![
                        self.intrinsics.distortion_center.x,
                        self.intrinsics.distortion_center.y,
                    ])?,
                ),
                (
                    serde_yaml::Value::String("resolution".to_string()),
                    serde_yaml::to_value(vec![
                        self.intrinsics.image_size.width,
                        self.intrinsics.image_size.height,
                    ])?,
                ),
            ]))?,
        )]))?;

        let yaml_string = serde_yaml::to_string(&yaml)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        self.intrinsics.validate()
    }

    fn get_resolution(&self) -> Resolution {
        self.intrinsics.image_size
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.intrinsics.mapping_coefficients.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{GrayImage, Luma};

    fn sample_intrinsics() -> FisheyeIntrinsics {
        FisheyeIntrinsics::new(
            [350.0, -1.2e-3, 1.0e-6, -1.5e-9],
            Matrix2::new(1.0, 0.0005, -0.0003, 1.0),
            Vector2::new(652.0, 478.0),
            Resolution::new(1280, 960),
        )
        .unwrap()
    }

    fn sample_model() -> FisheyeModel {
        let grid: Vec<f64> = (0..5)
            .flat_map(|i| (0..4).flat_map(move |j| [i as f64 * 40.0, j as f64 * 40.0]))
            .collect();
        let world = DMatrix::from_row_slice(20, 2, &grid);
        let extrinsics = PatternExtrinsics::new(
            vec![Vector3::new(0.2, -0.3, 0.05), Vector3::new(-0.4, 0.1, 0.3)],
            vec![Vector3::new(-80.0, -60.0, 300.0), Vector3::new(-50.0, -90.0, 250.0)],
        )
        .unwrap();
        FisheyeModel::new(sample_intrinsics())
            .unwrap()
            .with_patterns(&world, "mm", extrinsics, Vec::new())
            .unwrap()
            .with_estimate_alignment(true)
    }

    #[test]
    fn test_project_unproject_round_trip() {
        let model = sample_model();
        for pixel in [
            Vector2::new(652.0, 478.0),
            Vector2::new(100.0, 50.0),
            Vector2::new(1200.0, 900.0),
            Vector2::new(700.0, 300.0),
        ] {
            let ray = model.unproject(&pixel).unwrap();
            let back = model.project(&(ray * 3.7)).unwrap();
            assert_relative_eq!(back, pixel, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_on_axis_point_maps_to_center() {
        let model = sample_model();
        let p = model.project(&Vector3::new(0.0, 0.0, 5.0)).unwrap();
        assert_relative_eq!(p, Vector2::new(652.0, 478.0), epsilon = 1e-9);
    }

    #[test]
    fn test_identical_directions_share_one_solve() {
        let intrinsics = sample_intrinsics();
        let points = vec![
            Vector3::new(1.0, 2.0, 4.0),
            Vector3::new(2.0, 4.0, 8.0),
            Vector3::new(-1.0, 0.5, 3.0),
        ];
        let projected = compute_image_projection(&points, &intrinsics);
        assert_relative_eq!(projected[0], projected[1], epsilon = 1e-9);
        assert!((projected[0] - projected[2]).norm() > 1.0);
    }

    #[test]
    fn test_approximate_matches_exact() {
        let intrinsics = sample_intrinsics();
        let points: Vec<Vector3<f64>> = (0..500)
            .map(|i| {
                let a = i as f64 * 0.37;
                let r = 0.05 + (i as f64 / 500.0) * 1.5;
                Vector3::new(r * a.cos(), r * a.sin(), 1.0)
            })
            .collect();
        let exact = compute_image_projection(&points, &intrinsics);
        let options = ApproxProjectionOptions::default();
        let (approx, max_error) =
            compute_approx_image_projection(&points, &intrinsics, &options).unwrap();
        assert!(max_error < options.target_error);
        for (e, a) in exact.iter().zip(approx.iter()) {
            assert!((e - a).norm() < 0.2, "{e} vs {a}");
        }
    }

    #[test]
    fn test_world_round_trip() {
        let model = sample_model();
        let (r, t) = model.extrinsics().pose(1).unwrap();
        let image_points = model
            .world_to_image(&r, &t, model.world_points(), ProjectionMethod::Exact)
            .unwrap();
        let back = model.points_to_world(&r, &t, &image_points).unwrap();
        for (w, b) in model.world_points().iter().zip(back.iter()) {
            assert_relative_eq!(*w, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_reprojection_errors() {
        let mut model = sample_model();
        let mut observed = model.reprojected_points(ProjectionMethod::Exact).unwrap();
        observed[1][3].y += 2.0;
        model.refresh_reprojection_errors(&observed).unwrap();
        let (mean, per_image) = model.compute_mean_error().unwrap();
        assert_relative_eq!(per_image[0], 0.0, epsilon = 1e-9);
        assert_relative_eq!(per_image[1], 0.1, epsilon = 1e-9);
        assert_relative_eq!(mean, 0.05, epsilon = 1e-9);
    }

    #[test]
    fn test_undistort_points_center_and_scale() {
        let model = sample_model();
        let (points, camera) = model
            .undistort_points(&[Vector2::new(652.0, 478.0)], 1.0)
            .unwrap();
        assert_relative_eq!(camera.fx, 480.0);
        assert_relative_eq!(points[0], Vector2::new(camera.cx, camera.cy), epsilon = 1e-9);
        assert!(model.undistort_points(&[], 0.0).is_err());
    }

    #[test]
    fn test_invalid_intrinsics() {
        let bad = FisheyeIntrinsics::new(
            [-1.0, 0.0, 0.0, 0.0],
            Matrix2::identity(),
            Vector2::zeros(),
            Resolution::new(10, 10),
        );
        assert!(bad.is_err());
        let singular = FisheyeIntrinsics::new(
            [300.0, 0.0, 0.0, 0.0],
            Matrix2::zeros(),
            Vector2::zeros(),
            Resolution::new(10, 10),
        );
        assert!(singular.is_err());
    }

    #[test]
    fn test_record_round_trip() {
        let mut model = sample_model();
        let observed = model.reprojected_points(ProjectionMethod::Exact).unwrap();
        model.refresh_reprojection_errors(&observed).unwrap();
        let restored = FisheyeModel::from_json(&model.to_json().unwrap()).unwrap();
        assert_eq!(restored.to_record(), model.to_record());
        assert!(restored.estimate_alignment());

        let from_yaml = FisheyeModel::from_yaml(&model.to_yaml().unwrap()).unwrap();
        assert_eq!(from_yaml.to_record(), model.to_record());
        assert_eq!(from_yaml.reprojection_errors().len(), 2);

        let mut record = model.to_record();
        record.mapping_coefficients[0] = 0.0;
        let yaml = serde_yaml::to_string(&record).unwrap();
        assert!(FisheyeModel::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_model_validates_intrinsics() {
        let mut negative = sample_intrinsics();
        negative.mapping_coefficients[0] = -1.0;
        assert!(matches!(
            FisheyeModel::new(negative),
            Err(CameraModelError::InvalidParams(_))
        ));

        let mut singular = sample_intrinsics();
        singular.stretch_matrix = Matrix2::zeros();
        assert!(FisheyeModel::new(singular).is_err());

        let mut infinite = sample_intrinsics();
        infinite.distortion_center.x = f64::INFINITY;
        assert!(FisheyeModel::new(infinite).is_err());
    }

    #[test]
    fn test_yaml_rejects_out_of_range_resolution() {
        let path = std::env::temp_dir().join("camgeom_fisheye_bad_resolution.yaml");
        let path = path.to_string_lossy().to_string();
        for resolution in ["[1280, -960]", "[4294967296, 960]", "[1280.5, 960]"] {
            let yaml = format!(
                "cam0:\n  camera_model: scaramuzza\n  \
                 mapping_coefficients: [350.0, -1.2e-3, 1.0e-6, -1.5e-9]\n  \
                 stretch_matrix: [1.0, 0.0, 0.0, 1.0]\n  distortion_center: [652.0, 478.0]\n  \
                 resolution: {resolution}\n"
            );
            fs::write(&path, yaml).unwrap();
            let result = FisheyeModel::load_from_yaml(&path);
            assert!(matches!(result, Err(CameraModelError::InvalidParams(_))), "{resolution}");
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_yaml_file_round_trip() {
        let model = sample_model();
        let path = std::env::temp_dir().join("camgeom_fisheye_round_trip.yaml");
        let path = path.to_string_lossy().to_string();
        model.save_to_yaml(&path).unwrap();
        let loaded = FisheyeModel::load_from_yaml(&path).unwrap();
        assert_eq!(loaded.intrinsics(), model.intrinsics());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_undistort_image_cache_and_methods() {
        let intrinsics = FisheyeIntrinsics::new(
            [40.0, -6.0e-3, 0.0, 0.0],
            Matrix2::identity(),
            Vector2::new(31.5, 23.5),
            Resolution::new(64, 48),
        )
        .unwrap();
        let mut model = FisheyeModel::new(intrinsics).unwrap();
        let image = GrayImage::from_fn(64, 48, |x, y| Luma([(x * 3 + y) as u8]));

        let (same, camera) = model
            .undistort_image(
                &image,
                Interpolation::Bilinear,
                OutputView::Same,
                1.0,
                ProjectionMethod::Exact,
                Luma([0]),
            )
            .unwrap();
        assert_eq!(same.dimensions(), (64, 48));
        assert_relative_eq!(camera.fx, 24.0);
        let signature = model.map_cache.signature().cloned().unwrap();

        // Same request reuses the map.
        model
            .undistort_image(
                &image,
                Interpolation::Nearest,
                OutputView::Same,
                1.0,
                ProjectionMethod::Exact,
                Luma([0]),
            )
            .unwrap();
        assert_eq!(model.map_cache.signature(), Some(&signature));

        let (approx, _) = model
            .undistort_image(
                &image,
                Interpolation::Bilinear,
                OutputView::Same,
                1.0,
                ProjectionMethod::Approximate,
                Luma([0]),
            )
            .unwrap();
        assert_ne!(model.map_cache.signature(), Some(&signature));
        let diff = same
            .pixels()
            .zip(approx.pixels())
            .filter(|(a, b)| (a[0] as i32 - b[0] as i32).abs() > 2)
            .count();
        // Only pixels whose source lies on the image border may flip to fill.
        assert!(diff < 150, "{diff} pixels differ");

        let (full, _) = model
            .undistort_image(
                &image,
                Interpolation::Bilinear,
                OutputView::Full,
                0.5,
                ProjectionMethod::Exact,
                Luma([0]),
            )
            .unwrap();
        assert!(full.width() > 0 && full.height() > 0);
    }

    #[test]
    fn test_undistort_image_respects_pixel_limit() {
        let tolerances = ValidViewTolerances {
            max_output_pixels: 1000,
            ..ValidViewTolerances::default()
        };
        let mut model = FisheyeModel::new(sample_intrinsics())
            .unwrap()
            .with_valid_view_tolerances(tolerances);
        let image = GrayImage::new(1280, 960);
        let result = model.undistort_image(
            &image,
            Interpolation::Nearest,
            OutputView::Same,
            1.0,
            ProjectionMethod::Approximate,
            Luma([0]),
        );
        assert!(matches!(
            result,
            Err(CameraModelError::Remap(crate::remap::RemapError::OutputTooLarge {
                width: 1280,
                height: 960,
                limit: 1000,
            }))
        ));
        assert!(model.map_cache.signature().is_none());
    }
}
