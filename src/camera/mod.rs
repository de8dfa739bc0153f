//! Camera models and the types they share.
//!
//! * [`pinhole::PinholeModel`] - pinhole intrinsics with Brown-Conrady
//!   radial/tangential distortion and per-pattern extrinsics.
//! * [`fisheye::FisheyeModel`] - Scaramuzza omnidirectional model with a
//!   polynomial mapping function and stretch/center sensor alignment.
//!
//! Both implement [`CameraModel`], the projection interface used by the
//! output-bound computation in [`bounds`] and by the stereo rectifier.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod bounds;
pub mod distortion;
pub mod extrinsics;
pub mod fisheye;
pub mod pinhole;

pub use bounds::{OutputBounds, ValidViewTolerances};
pub use distortion::{DistortionCoefficients, UndistortOptions};
pub use extrinsics::PatternExtrinsics;
pub use fisheye::{
    ApproxProjectionOptions, FisheyeIntrinsics, FisheyeModel, FisheyeRecord, ProjectionMethod,
};
pub use pinhole::{PinholeModel, PinholeRecord};

/// Version tag written into every snapshot record.
pub const RECORD_VERSION: u32 = 1;

/// Upper-triangular intrinsic matrix `[fx skew cx; 0 fy cy; 0 0 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub skew: f64,
}

impl Intrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Intrinsics {
            fx,
            fy,
            cx,
            cy,
            skew: 0.0,
        }
    }

    /// The 3x3 intrinsic matrix `K`.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Builds intrinsics from a matrix of arbitrary shape, rejecting anything
    /// that is not a finite, upper-triangular 3x3 matrix with `K[2][2] == 1`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidIntrinsicMatrix`] for shape or structure problems.
    /// * [`CameraModelError::FocalLengthMustBePositive`] if `fx` or `fy` is not positive.
    pub fn from_matrix(k: &DMatrix<f64>) -> Result<Self, CameraModelError> {
        if k.nrows() != 3 || k.ncols() != 3 {
            return Err(CameraModelError::InvalidIntrinsicMatrix(format!(
                "expected a 3x3 matrix, got {}x{}",
                k.nrows(),
                k.ncols()
            )));
        }
        if k.iter().any(|v| !v.is_finite()) {
            return Err(CameraModelError::InvalidIntrinsicMatrix(
                "matrix contains non-finite values".to_string(),
            ));
        }
        if k[(1, 0)] != 0.0 || k[(2, 0)] != 0.0 || k[(2, 1)] != 0.0 || k[(2, 2)] != 1.0 {
            return Err(CameraModelError::InvalidIntrinsicMatrix(
                "matrix must be upper triangular with K[2][2] = 1".to_string(),
            ));
        }
        let intrinsics = Intrinsics {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
            skew: k[(0, 1)],
        };
        validation::validate_intrinsics(&intrinsics)?;
        Ok(intrinsics)
    }

    /// Pixel to normalized image coordinates (inverse of `K`).
    pub fn normalize(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let y = (pixel.y - self.cy) / self.fy;
        let x = (pixel.x - self.cx - self.skew * y) / self.fx;
        Vector2::new(x, y)
    }

    /// Normalized image coordinates to pixel (application of `K`).
    pub fn denormalize(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            self.fx * normalized.x + self.skew * normalized.y + self.cx,
            self.fy * normalized.y + self.cy,
        )
    }
}

/// Image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Extent of an undistorted or rectified output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputView {
    /// Same size as the input image.
    Same,
    /// Every input pixel is visible in the output.
    Full,
    /// Largest rectangle containing only valid input pixels.
    Valid,
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("Projection is outside the image")]
    ProjectionOutSideImage,
    #[error("Input point is outside the image")]
    PointIsOutSideImage,
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid intrinsic matrix: {0}")]
    InvalidIntrinsicMatrix(String),
    #[error("Radial distortion must have 2 or 3 coefficients, got {0}")]
    InvalidRadialDistortion(usize),
    #[error("Tangential distortion must have 2 coefficients, got {0}")]
    InvalidTangentialDistortion(usize),
    #[error("Got {rotations} rotation vectors but {translations} translation vectors")]
    ExtrinsicsCountMismatch { rotations: usize, translations: usize },
    #[error("World points must have exactly 2 columns, got {0}")]
    InvalidWorldPoints(usize),
    #[error("Expected reprojection errors for {expected} patterns and {points} points, got {got}")]
    ReprojectionErrorShape {
        expected: usize,
        points: usize,
        got: String,
    },
    #[error("Camera plane is parallel to the world plane, mapping is singular")]
    SingularMapping,
    #[error("No valid output region for the requested view")]
    EmptyOutputView,
    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u32),
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Image resampling failed: {0}")]
    Remap(#[from] crate::remap::RemapError),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("Failed to process JSON: {0}")]
    JsonError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CameraModelError {
    fn from(err: serde_yaml::Error) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

impl From<serde_json::Error> for CameraModelError {
    fn from(err: serde_json::Error) -> Self {
        CameraModelError::JsonError(err.to_string())
    }
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in camera coordinates to distorted pixel coordinates
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject distorted pixel coordinates to a unit ray in camera coordinates
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Load camera parameters from a YAML file
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError>
    where
        Self: Sized;

    /// Save camera parameters to a YAML file
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_resolution(&self) -> Resolution;

    /// Flat list of the model's distortion parameters
    fn get_distortion(&self) -> Vec<f64>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0)
            || !intrinsics.fx.is_finite()
            || !intrinsics.fy.is_finite()
        {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        if !intrinsics.skew.is_finite() {
            return Err(CameraModelError::InvalidIntrinsicMatrix(
                "skew must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads an image dimension from YAML, rejecting values that do not fit
    /// in `u32`.
    pub fn yaml_dimension(node: &yaml_rust::Yaml, name: &str) -> Result<u32, CameraModelError> {
        let value = node
            .as_i64()
            .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}")))?;
        u32::try_from(value).map_err(|_| {
            CameraModelError::InvalidParams(format!("Invalid {name}: {value} is out of range"))
        })
    }

    /// Checks a world point matrix (one point per row) and converts it to
    /// planar pattern points.
    pub fn validate_world_points(
        points: &DMatrix<f64>,
    ) -> Result<Vec<Vector2<f64>>, CameraModelError> {
        if points.ncols() != 2 {
            return Err(CameraModelError::InvalidWorldPoints(points.ncols()));
        }
        if points.iter().any(|v| !v.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "world points must be finite".to_string(),
            ));
        }
        Ok(points
            .row_iter()
            .map(|row| Vector2::new(row[0], row[1]))
            .collect())
    }

    /// Checks the `M x 2 x P` reprojection error layout against the pattern
    /// and point counts. An empty error set is always accepted.
    pub fn validate_reprojection_errors(
        errors: &[Vec<Vector2<f64>>],
        patterns: usize,
        points: usize,
    ) -> Result<(), CameraModelError> {
        if errors.is_empty() {
            return Ok(());
        }
        if errors.len() != patterns || errors.iter().any(|e| e.len() != points) {
            return Err(CameraModelError::ReprojectionErrorShape {
                expected: patterns,
                points,
                got: format!(
                    "{} patterns with point counts {:?}",
                    errors.len(),
                    errors.iter().map(Vec::len).collect::<Vec<_>>()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsics_from_matrix() {
        let k = DMatrix::from_row_slice(
            3,
            3,
            &[1000.0, 0.5, 320.0, 0.0, 990.0, 240.0, 0.0, 0.0, 1.0],
        );
        let intrinsics = Intrinsics::from_matrix(&k).unwrap();
        assert_eq!(intrinsics.fx, 1000.0);
        assert_eq!(intrinsics.skew, 0.5);
        assert_eq!(intrinsics.cy, 240.0);

        let p = Vector2::new(400.0, 100.0);
        let back = intrinsics.denormalize(&intrinsics.normalize(&p));
        assert!((back - p).norm() < 1e-12);
    }

    #[test]
    fn test_intrinsics_rejects_bad_matrices() {
        let non_square = DMatrix::<f64>::zeros(3, 4);
        assert!(matches!(
            Intrinsics::from_matrix(&non_square),
            Err(CameraModelError::InvalidIntrinsicMatrix(_))
        ));

        let mut k = DMatrix::<f64>::identity(3, 3);
        k[(0, 2)] = f64::NAN;
        assert!(Intrinsics::from_matrix(&k).is_err());

        let mut k = DMatrix::<f64>::identity(3, 3);
        k[(2, 0)] = 5.0;
        assert!(Intrinsics::from_matrix(&k).is_err());

        let mut k = DMatrix::<f64>::identity(3, 3);
        k[(0, 0)] = -1.0;
        assert!(matches!(
            Intrinsics::from_matrix(&k),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));
    }

    #[test]
    fn test_world_points_need_two_columns() {
        let points = DMatrix::<f64>::zeros(4, 3);
        assert!(matches!(
            validation::validate_world_points(&points),
            Err(CameraModelError::InvalidWorldPoints(3))
        ));
        let points = DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 10.0, 0.0]);
        let converted = validation::validate_world_points(&points).unwrap();
        assert_eq!(converted[1], Vector2::new(10.0, 0.0));
    }
}
