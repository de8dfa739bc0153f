use crate::camera::{CameraModel, CameraModelError};
use nalgebra::{Matrix2xX, Matrix3xX, Vector2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("CSV export failed: {0}")]
    CsvError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for UtilError {
    fn from(err: std::io::Error) -> Self {
        UtilError::IOError(err.to_string())
    }
}

impl From<csv::Error> for UtilError {
    fn from(err: csv::Error) -> Self {
        UtilError::CsvError(err.to_string())
    }
}

impl From<CameraModelError> for UtilError {
    fn from(err: CameraModelError) -> Self {
        UtilError::NumericalError(err.to_string())
    }
}

/// Summary statistics of a set of reprojection error magnitudes, in pixels.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Statistics of error magnitudes.
///
/// # Errors
///
/// * [`UtilError::ZeroProjectionPoints`] if `errors` is empty.
pub fn error_statistics(errors: &[f64]) -> Result<ProjectionError, UtilError> {
    if errors.is_empty() {
        return Err(UtilError::ZeroProjectionPoints);
    }

    let n = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / n;

    let variance: f64 = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();

    let sum_squared: f64 = errors.iter().map(|x| x.powi(2)).sum::<f64>();
    let rmse = (sum_squared / n).sqrt();

    let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    let mut sorted_errors = errors.to_vec();
    sorted_errors.sort_by(f64::total_cmp);
    let median = if sorted_errors.len() % 2 == 0 {
        let mid = sorted_errors.len() / 2;
        (sorted_errors[mid - 1] + sorted_errors[mid]) / 2.0
    } else {
        sorted_errors[sorted_errors.len() / 2]
    };

    Ok(ProjectionError {
        rmse,
        min,
        max,
        mean,
        stddev,
        median,
    })
}

/// Reprojection error of camera-frame points against their observations.
///
/// Points the model cannot project are skipped.
///
/// # Errors
///
/// * [`UtilError::InvalidParams`] if the point counts differ.
/// * [`UtilError::ZeroProjectionPoints`] if no point could be projected.
pub fn compute_reprojection_error<T>(
    camera_model: &T,
    points3d: &Matrix3xX<f64>,
    points2d: &Matrix2xX<f64>,
) -> Result<ProjectionError, UtilError>
where
    T: ?Sized + CameraModel,
{
    if points3d.ncols() != points2d.ncols() {
        return Err(UtilError::InvalidParams(format!(
            "{} 3D points for {} observations",
            points3d.ncols(),
            points2d.ncols()
        )));
    }
    let errors: Vec<f64> = points3d
        .column_iter()
        .zip(points2d.column_iter())
        .filter_map(|(p3, p2)| {
            camera_model
                .project(&p3.into_owned())
                .ok()
                .map(|projected| (projected - p2.into_owned()).norm())
        })
        .collect();
    error_statistics(&errors)
}

/// Evenly spread pixel samples over the image together with their unit rays.
///
/// Samples the model cannot unproject, or whose ray points backwards, are
/// dropped.
pub fn sample_points<T>(camera_model: &T, n: usize) -> (Matrix2xX<f64>, Matrix3xX<f64>)
where
    T: ?Sized + CameraModel,
{
    let resolution = camera_model.get_resolution();
    let width = resolution.width as f64;
    let height = resolution.height as f64;
    if resolution.is_empty() || n == 0 {
        return (Matrix2xX::zeros(0), Matrix3xX::zeros(0));
    }
    let num_cells_x = ((n as f64 * (width / height)).sqrt().round() as usize).max(1);
    let num_cells_y = ((n as f64 * (height / width)).sqrt().round() as usize).max(1);
    let cell_width = width / num_cells_x as f64;
    let cell_height = height / num_cells_y as f64;

    let mut valid_2d_points = Vec::new();
    let mut valid_3d_points = Vec::new();
    for i in 0..num_cells_y {
        for j in 0..num_cells_x {
            let p2d = Vector2::new(
                (j as f64 + 0.5) * cell_width,
                (i as f64 + 0.5) * cell_height,
            );
            if let Ok(p3d) = camera_model.unproject(&p2d) {
                if p3d.z > 0.0 {
                    valid_2d_points.push(p2d);
                    valid_3d_points.push(p3d);
                }
            }
        }
    }

    if valid_2d_points.is_empty() {
        return (Matrix2xX::zeros(0), Matrix3xX::zeros(0));
    }
    (
        Matrix2xX::from_columns(&valid_2d_points),
        Matrix3xX::from_columns(&valid_3d_points),
    )
}

#[derive(Debug, Serialize)]
struct ReprojectionErrorRow {
    pattern: usize,
    point: usize,
    dx: f64,
    dy: f64,
    magnitude: f64,
}

/// Writes per-pattern, per-point reprojection errors as CSV
/// (`pattern,point,dx,dy,magnitude`).
pub fn write_reprojection_errors<W: Write>(
    writer: W,
    errors: &[Vec<Vector2<f64>>],
) -> Result<(), UtilError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for (pattern, pattern_errors) in errors.iter().enumerate() {
        for (point, e) in pattern_errors.iter().enumerate() {
            csv_writer.serialize(ReprojectionErrorRow {
                pattern,
                point,
                dx: e.x,
                dy: e.y,
                magnitude: e.norm(),
            })?;
        }
    }
    csv_writer.flush()?;
    Ok(())
}

/// File variant of [`write_reprojection_errors`].
pub fn export_reprojection_errors<P: AsRef<Path>>(
    path: P,
    errors: &[Vec<Vector2<f64>>],
) -> Result<(), UtilError> {
    let file = std::fs::File::create(path)?;
    write_reprojection_errors(file, errors)?;
    log::info!("exported reprojection errors for {} patterns", errors.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{DistortionCoefficients, Intrinsics, PinholeModel, Resolution};
    use approx::assert_relative_eq;

    #[test]
    fn test_error_statistics() {
        let stats = error_statistics(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.max, 4.0);
        assert_relative_eq!(stats.rmse, 7.5_f64.sqrt());
        assert_relative_eq!(stats.stddev, 1.25_f64.sqrt());
        assert!(matches!(error_statistics(&[]), Err(UtilError::ZeroProjectionPoints)));
    }

    #[test]
    fn test_sample_points_and_self_consistency() {
        let model = PinholeModel::new(
            Intrinsics::new(500.0, 500.0, 320.0, 240.0),
            DistortionCoefficients::from_slices(&[-0.1, 0.01], &[0.0, 0.0]).unwrap(),
            Resolution::new(640, 480),
        )
        .unwrap();
        let (points_2d, points_3d) = sample_points(&model, 100);
        assert!(points_2d.ncols() > 50);
        assert_eq!(points_2d.ncols(), points_3d.ncols());
        assert!(points_3d.column_iter().all(|p| p.z > 0.0));

        let stats = compute_reprojection_error(&model, &points_3d, &points_2d).unwrap();
        assert!(stats.max < 1e-6, "{stats:?}");
    }

    #[test]
    fn test_csv_export() {
        let errors = vec![
            vec![Vector2::new(3.0, 4.0), Vector2::new(0.0, 0.0)],
            vec![Vector2::new(-1.0, 0.0), Vector2::new(0.5, 0.5)],
        ];
        let mut buffer = Vec::new();
        write_reprojection_errors(&mut buffer, &errors).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "pattern,point,dx,dy,magnitude");
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[1], "0,0,3.0,4.0,5.0");
    }
}
