use approx::assert_relative_eq;
use camgeom::camera::{
    CameraModel, DistortionCoefficients, Intrinsics, OutputView, PinholeModel, Resolution,
};
use camgeom::geometry::vector_to_matrix;
use camgeom::stereo::{StereoModel, INVALID_DISPARITY};
use image::{ImageBuffer, Luma};
use nalgebra::{Matrix3, Vector3};

fn camera(fx: f64, cx: f64, radial: [f64; 2]) -> PinholeModel {
    PinholeModel::new(
        Intrinsics::new(fx, fx, cx, 240.0),
        DistortionCoefficients::from_slices(&radial, &[0.0002, -0.0001]).unwrap(),
        Resolution::new(640, 480),
    )
    .unwrap()
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn grid(depth: f64) -> Vec<Vector3<f64>> {
    (0..35)
        .map(|i| {
            Vector3::new((i % 7) as f64 * 60.0 - 180.0, (i / 7) as f64 * 50.0 - 100.0, depth)
        })
        .collect()
}

#[test]
fn matching_points_share_a_row_after_rectification() {
    init_logging();
    let (rotation, _) = vector_to_matrix(&Vector3::new(0.02, -0.04, 0.01));
    let translation = Vector3::new(-100.0, 3.0, -2.0);
    let mut stereo = StereoModel::new(
        camera(520.0, 318.0, [-0.12, 0.03]),
        camera(505.0, 325.0, [-0.1, 0.02]),
        rotation,
        translation,
    )
    .unwrap();

    for view in [OutputView::Full, OutputView::Valid] {
        stereo.ensure_rectification(&Resolution::new(640, 480), view).unwrap();
        let world = grid(900.0);
        let pixels1 = stereo
            .camera1()
            .world_to_image(&Matrix3::identity(), &Vector3::zeros(), &world, true)
            .unwrap();
        let pixels2 = stereo
            .camera2()
            .world_to_image(&rotation, &translation, &world, true)
            .unwrap();
        let rows1 = stereo.rectify_points1(&pixels1).unwrap();
        let rows2 = stereo.rectify_points2(&pixels2).unwrap();
        for (a, b) in rows1.iter().zip(rows2.iter()) {
            assert_relative_eq!(a.y, b.y, epsilon = 1e-6);
            // Camera 2 sits to the right, so matches move left.
            assert!(a.x > b.x);
        }
    }
}

#[test]
fn rectification_falls_back_to_the_full_view() {
    init_logging();
    // Each camera turns 0.7 rad away from the other, so their fields of
    // view no longer overlap.
    let (rotation, _) = vector_to_matrix(&Vector3::new(0.0, -1.4, 0.0));
    let (half, _) = vector_to_matrix(&Vector3::new(0.0, -0.7, 0.0));
    let translation = -(half * Vector3::new(100.0, 0.0, 0.0));
    let flat = |fx| {
        PinholeModel::new(
            Intrinsics::new(fx, fx, 320.0, 240.0),
            DistortionCoefficients::zero(),
            Resolution::new(640, 480),
        )
        .unwrap()
    };
    let mut stereo = StereoModel::new(flat(500.0), flat(500.0), rotation, translation).unwrap();
    let state = stereo
        .ensure_rectification(&Resolution::new(640, 480), OutputView::Valid)
        .unwrap();
    assert_eq!(state.view, OutputView::Valid);
    assert_eq!(state.effective_view, OutputView::Full);
    assert_relative_eq!(state.translation.x, -100.0, epsilon = 1e-9);
}

#[test]
fn fronto_parallel_plane_is_reconstructed() {
    let baseline = 120.0;
    let depth = 1500.0;
    let intrinsics = Intrinsics::new(500.0, 500.0, 320.0, 240.0);
    let pinhole =
        PinholeModel::new(intrinsics, DistortionCoefficients::zero(), Resolution::new(640, 480))
            .unwrap();
    let mut stereo = StereoModel::new(
        pinhole.clone(),
        pinhole,
        Matrix3::identity(),
        Vector3::new(-baseline, 0.0, 0.0),
    )
    .unwrap();
    let state = stereo
        .ensure_rectification(&Resolution::new(640, 480), OutputView::Full)
        .unwrap()
        .clone();
    let size = state.rectified_size();
    let output = state.output_intrinsics();

    let disparity_value = (intrinsics.fx * baseline / depth) as f32;
    let disparity = ImageBuffer::<Luma<f32>, Vec<f32>>::from_fn(size.width, size.height, |x, y| {
        if x == 0 || y == 0 {
            Luma([INVALID_DISPARITY])
        } else if x == 1 {
            Luma([f32::NAN])
        } else {
            Luma([disparity_value])
        }
    });
    let cloud = stereo.reconstruct_scene(&disparity).unwrap();
    assert_eq!(cloud.dimensions(), (size.width, size.height));

    for (x, y, point) in cloud.enumerate_pixels() {
        if x <= 1 || y == 0 {
            assert!(point.0.iter().all(|v| v.is_nan()), "({x}, {y})");
            continue;
        }
        let z = point[2] as f64;
        assert_relative_eq!(z, depth, max_relative = 1e-5);
        let expected_x = (x as f64 - output.cx) * z / output.fx;
        let expected_y = (y as f64 - output.cy) * z / output.fy;
        assert_relative_eq!(point[0] as f64, expected_x, epsilon = 1e-2);
        assert_relative_eq!(point[1] as f64, expected_y, epsilon = 1e-2);
    }
}

#[test]
fn known_point_projects_to_the_principal_point() {
    let model = PinholeModel::new(
        Intrinsics::new(1000.0, 1000.0, 320.0, 240.0),
        DistortionCoefficients::zero(),
        Resolution::new(640, 480),
    )
    .unwrap();
    let pixels = model
        .world_to_image(
            &Matrix3::identity(),
            &Vector3::new(0.0, 0.0, 1000.0),
            &[Vector3::zeros(), Vector3::new(100.0, -50.0, 0.0)],
            true,
        )
        .unwrap();
    assert_relative_eq!(pixels[0].x, 320.0);
    assert_relative_eq!(pixels[0].y, 240.0);
    assert_relative_eq!(pixels[1].x, 420.0);
    assert_relative_eq!(pixels[1].y, 190.0);

    let projected = model.project(&Vector3::new(0.0, 0.0, 1000.0)).unwrap();
    assert_relative_eq!(projected.x, 320.0);
    assert_relative_eq!(projected.y, 240.0);
}
