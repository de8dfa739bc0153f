//! Synthetic Stereo Rectification
//!
//! Renders a checkerboard plane seen by two distorted pinhole cameras,
//! rectifies the pair, checks that matching points share a row, and
//! reconstructs the plane from its analytic disparity.
//!
//! Usage:
//! ```bash
//! cargo run --example rectify_synthetic -- --depth 1500 --baseline 120 --view valid
//! ```

use camgeom::camera::{DistortionCoefficients, Intrinsics, OutputView, PinholeModel, Resolution};
use camgeom::geometry::vector_to_matrix;
use camgeom::remap::Interpolation;
use camgeom::stereo::{StereoModel, INVALID_DISPARITY};
use clap::Parser;
use flexi_logger::{colored_detailed_format, Logger};
use image::{GrayImage, ImageBuffer, Luma};
use log::{info, warn};
use nalgebra::{Matrix3, Vector2, Vector3};
use std::path::PathBuf;

/// Synthetic stereo rectification demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Distance of the checkerboard plane from camera 1
    #[arg(short = 'd', long, default_value = "1500.0")]
    depth: f64,

    /// Distance between the camera centers
    #[arg(short = 'b', long, default_value = "120.0")]
    baseline: f64,

    /// Output view of the rectified images (full, valid)
    #[arg(short = 'v', long, default_value = "valid")]
    view: String,

    /// Checkerboard square size in world units
    #[arg(short = 's', long, default_value = "60.0")]
    square: f64,

    /// Directory to write the original and rectified images to
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn camera(fx: f64, cx: f64, k1: f64) -> Result<PinholeModel, Box<dyn std::error::Error>> {
    Ok(PinholeModel::new(
        Intrinsics::new(fx, fx, cx, 240.0),
        DistortionCoefficients::from_slices(&[k1, 0.02], &[0.0005, -0.0003])?,
        Resolution::new(WIDTH, HEIGHT),
    )?)
}

/// Renders the plane `Z = depth` of camera 1's frame as seen by a camera
/// with pose `P = R * P1 + t`.
fn render(
    camera: &PinholeModel,
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    depth: f64,
    square: f64,
) -> GrayImage {
    let center = -(rotation.transpose() * translation);
    GrayImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let Some(undistorted) = camera.undistort_pixel(&Vector2::new(x as f64, y as f64)) else {
            return Luma([0]);
        };
        let n = camera.intrinsics().normalize(&undistorted);
        let direction = rotation.transpose() * Vector3::new(n.x, n.y, 1.0);
        if direction.z.abs() < f64::EPSILON {
            return Luma([0]);
        }
        let s = (depth - center.z) / direction.z;
        let p = center + direction * s;
        let parity = ((p.x / square).floor() + (p.y / square).floor()) as i64 % 2 == 0;
        Luma([if parity { 220 } else { 35 }])
    })
}

fn parse_view(view: &str) -> Result<OutputView, Box<dyn std::error::Error>> {
    match view.to_lowercase().as_str() {
        "full" => Ok(OutputView::Full),
        "valid" => Ok(OutputView::Valid),
        other => {
            Err(format!("Unsupported output view: {other}. Supported views: full, valid").into())
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .format(colored_detailed_format)
        .start()?;

    let cli = Cli::parse();
    let view = parse_view(&cli.view)?;
    info!("Plane depth: {}, baseline: {}, view: {:?}", cli.depth, cli.baseline, view);

    let camera1 = camera(520.0, 318.0, -0.18)?;
    let camera2 = camera(512.0, 324.0, -0.16)?;
    let (rotation, _) = vector_to_matrix(&Vector3::new(0.01, -0.03, 0.004));
    let translation = Vector3::new(-cli.baseline, 2.0, -1.5);

    let image1 = render(&camera1, &Matrix3::identity(), &Vector3::zeros(), cli.depth, cli.square);
    let image2 = render(&camera2, &rotation, &translation, cli.depth, cli.square);

    let mut stereo = StereoModel::new(camera1, camera2, rotation, translation)?;
    let (rectified1, rectified2) =
        stereo.rectify_images(&image1, &image2, Interpolation::Bilinear, view, Luma([0]))?;
    info!("Rectified size: {}x{}", rectified1.width(), rectified1.height());

    let state = stereo
        .rectification()
        .ok_or("rectification was not stored")?
        .clone();
    if state.effective_view != view {
        warn!("Requested {:?} view, rectified with {:?}", view, state.effective_view);
    }
    info!("Q =\n{}", state.q);

    // Row agreement of matching points.
    let world: Vec<Vector3<f64>> = (0..25)
        .map(|i| {
            let (col, row) = ((i % 5) as f64, (i / 5) as f64);
            Vector3::new(col * 150.0 - 300.0, row * 110.0 - 220.0, cli.depth)
        })
        .collect();
    let pixels1 = stereo
        .camera1()
        .world_to_image(&Matrix3::identity(), &Vector3::zeros(), &world, true)?;
    let pixels2 = stereo.camera2().world_to_image(&rotation, &translation, &world, true)?;
    let rows1 = stereo.rectify_points1(&pixels1)?;
    let rows2 = stereo.rectify_points2(&pixels2)?;
    let worst = rows1
        .iter()
        .zip(rows2.iter())
        .map(|(a, b)| (a.y - b.y).abs())
        .fold(0.0_f64, f64::max);
    info!("Largest row difference of matching points: {worst:.2e} px");

    // Analytic disparity of the plane, in the rectified frame.
    let size = state.rectified_size();
    let mean_disparity =
        rows1.iter().zip(rows2.iter()).map(|(a, b)| a.x - b.x).sum::<f64>() / rows1.len() as f64;
    info!("Mean disparity of the plane: {mean_disparity:.2} px");
    // The left margin has no match in camera 2.
    let disparity = ImageBuffer::<Luma<f32>, Vec<f32>>::from_fn(size.width, size.height, |x, _| {
        if (x as f64) < mean_disparity {
            Luma([INVALID_DISPARITY])
        } else {
            Luma([mean_disparity as f32])
        }
    });
    let cloud = stereo.reconstruct_scene(&disparity)?;
    let depths: Vec<f32> = cloud.pixels().map(|p| p[2]).filter(|z| z.is_finite()).collect();
    let mean_depth = depths.iter().sum::<f32>() / depths.len().max(1) as f32;
    info!(
        "Reconstructed {} points, mean rectified depth {:.1} (plane at {})",
        depths.len(),
        mean_depth,
        cli.depth
    );

    if let Some(output) = cli.output {
        std::fs::create_dir_all(&output)?;
        image1.save(output.join("camera1.png"))?;
        image2.save(output.join("camera2.png"))?;
        rectified1.save(output.join("rectified1.png"))?;
        rectified2.save(output.join("rectified2.png"))?;
        std::fs::write(output.join("stereo.json"), stereo.to_json()?)?;
        info!("Images and stereo snapshot written to {:?}", output);
    }

    Ok(())
}
