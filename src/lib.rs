//! Camera Geometry Library
//!
//! Camera models, lens undistortion and stereo rectification, with the pose
//! primitives used to bootstrap calibrations:
//! - Pinhole camera model with Brown-Conrady distortion
//! - Scaramuzza omnidirectional (fisheye) model
//! - Cached per-pixel remaps for undistortion and rectification
//! - Stereo rectification and disparity reconstruction
//! - P3P and essential matrix decomposition
//! - Rotation algebra with analytic Jacobians and parameter covariances
//!
//! Poses map world points into the camera frame, `P_c = R * P_w + t`.

pub mod camera;
pub mod covariance;
pub mod geometry;
pub mod pose;
pub mod remap;
pub mod stereo;
pub mod util;

// Re-export commonly used types
pub use camera::{
    CameraModel, CameraModelError, DistortionCoefficients, FisheyeModel, Intrinsics, OutputView,
    PinholeModel, Resolution,
};
pub use covariance::{CovarianceError, CovarianceStrategy};
pub use pose::{Pose, PoseError};
pub use remap::{DistortionMapCache, Interpolation, RemapError};
pub use stereo::{StereoError, StereoModel};
