//! Scalar traits and per-pixel interpolation kernels.
//!
//! Kernels are generic over the map precision `T` ([`MapScalar`]). The
//! precision is picked by the image's sample type through [`SampleType::Map`]:
//! 8/16-bit and `f32` images are resampled with `f32` maps, `f64` images with
//! `f64` maps.

use super::{DistortionMap, MapGrid};
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Interpolation used when gathering source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
}

/// Floating-point precision of a source-coordinate grid.
pub trait MapScalar: Float + Send + Sync + 'static {
    fn from_f64(v: f64) -> Self;

    /// Integer part towards negative infinity.
    fn floor_index(self) -> isize;

    /// The grid of this precision held by a map.
    fn grid(map: &DistortionMap) -> &MapGrid<Self>;
}

impl MapScalar for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn floor_index(self) -> isize {
        self.floor() as isize
    }

    fn grid(map: &DistortionMap) -> &MapGrid<f32> {
        map.narrow()
    }
}

impl MapScalar for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }

    fn floor_index(self) -> isize {
        self.floor() as isize
    }

    fn grid(map: &DistortionMap) -> &MapGrid<f64> {
        map.wide()
    }
}

/// Numeric class of an image's samples, part of a map signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleKind {
    U8,
    U16,
    F32,
    F64,
}

/// Image sample types the resampler accepts.
pub trait SampleType: image::Primitive + Send + Sync + 'static {
    type Map: MapScalar;
    const KIND: SampleKind;

    fn to_map(self) -> Self::Map;

    /// Converts back, rounding and saturating for integer samples.
    fn from_map(value: Self::Map) -> Self;
}

impl SampleType for u8 {
    type Map = f32;
    const KIND: SampleKind = SampleKind::U8;

    fn to_map(self) -> f32 {
        self as f32
    }

    fn from_map(value: f32) -> Self {
        value.round().clamp(0.0, u8::MAX as f32) as u8
    }
}

impl SampleType for u16 {
    type Map = f32;
    const KIND: SampleKind = SampleKind::U16;

    fn to_map(self) -> f32 {
        self as f32
    }

    fn from_map(value: f32) -> Self {
        value.round().clamp(0.0, u16::MAX as f32) as u16
    }
}

impl SampleType for f32 {
    type Map = f32;
    const KIND: SampleKind = SampleKind::F32;

    fn to_map(self) -> f32 {
        self
    }

    fn from_map(value: f32) -> Self {
        value
    }
}

impl SampleType for f64 {
    type Map = f64;
    const KIND: SampleKind = SampleKind::F64;

    fn to_map(self) -> f64 {
        self
    }

    fn from_map(value: f64) -> Self {
        value
    }
}

/// Borrowed interleaved image data.
#[derive(Clone, Copy)]
pub struct SourceView<'a, S> {
    pub data: &'a [S],
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl<S: SampleType<Map = T>, T: MapScalar> SourceView<'_, S> {
    fn at(&self, col: isize, row: isize, c: usize) -> T {
        // Replicate the border.
        let col = col.clamp(0, self.width as isize - 1) as usize;
        let row = row.clamp(0, self.height as isize - 1) as usize;
        self.data[(row * self.width + col) * self.channels + c].to_map()
    }

    /// A coordinate is sampled when it lies within half a pixel of the image.
    fn contains(&self, u: T, v: T) -> bool {
        let half = <T as MapScalar>::from_f64(0.5);
        u.is_finite()
            && v.is_finite()
            && u >= -half
            && v >= -half
            && u <= <T as MapScalar>::from_f64(self.width as f64) - half
            && v <= <T as MapScalar>::from_f64(self.height as f64) - half
    }
}

/// Kernel for interpolating every channel of one pixel.
///
/// # Arguments
///
/// * `src` - The input image.
/// * `u` - The x coordinate to sample.
/// * `v` - The y coordinate to sample.
/// * `interpolation` - The interpolation mode to use.
/// * `out` - Receives one value per channel.
///
/// # Returns
///
/// `false` when the coordinate falls outside the image and `out` was left
/// untouched.
pub fn interpolate_pixel<S: SampleType<Map = T>, T: MapScalar>(
    src: &SourceView<'_, S>,
    u: T,
    v: T,
    interpolation: Interpolation,
    out: &mut [S],
) -> bool {
    if src.width == 0 || src.height == 0 || !src.contains(u, v) {
        return false;
    }
    match interpolation {
        Interpolation::Nearest => nearest(src, u, v, out),
        Interpolation::Bilinear => bilinear(src, u, v, out),
        Interpolation::Bicubic => bicubic(src, u, v, out),
    }
    true
}

fn nearest<S: SampleType<Map = T>, T: MapScalar>(
    src: &SourceView<'_, S>,
    u: T,
    v: T,
    out: &mut [S],
) {
    let iu = u.round().floor_index();
    let iv = v.round().floor_index();
    for (c, value) in out.iter_mut().enumerate() {
        *value = S::from_map(src.at(iu, iv, c));
    }
}

fn bilinear<S: SampleType<Map = T>, T: MapScalar>(
    src: &SourceView<'_, S>,
    u: T,
    v: T,
    out: &mut [S],
) {
    let iu = u.floor_index();
    let iv = v.floor_index();
    let fu = u - u.floor();
    let fv = v - v.floor();
    let one = T::one();

    let w00 = (one - fu) * (one - fv);
    let w01 = fu * (one - fv);
    let w10 = (one - fu) * fv;
    let w11 = fu * fv;

    for (c, value) in out.iter_mut().enumerate() {
        let p = src.at(iu, iv, c) * w00
            + src.at(iu + 1, iv, c) * w01
            + src.at(iu, iv + 1, c) * w10
            + src.at(iu + 1, iv + 1, c) * w11;
        *value = S::from_map(p);
    }
}

/// Keys cubic convolution weight with `a = -0.5`.
fn cubic_weight<T: MapScalar>(t: T) -> T {
    let a = <T as MapScalar>::from_f64(-0.5);
    let t = t.abs();
    let one = T::one();
    let [two, three, four, five, eight] = [2.0, 3.0, 4.0, 5.0, 8.0].map(<T as MapScalar>::from_f64);
    if t <= one {
        (a + two) * t * t * t - (a + three) * t * t + one
    } else if t < two {
        a * t * t * t - five * a * t * t + eight * a * t - four * a
    } else {
        T::zero()
    }
}

fn bicubic<S: SampleType<Map = T>, T: MapScalar>(
    src: &SourceView<'_, S>,
    u: T,
    v: T,
    out: &mut [S],
) {
    let iu = u.floor_index();
    let iv = v.floor_index();
    let fu = u - u.floor();
    let fv = v - v.floor();

    let mut wu = [T::zero(); 4];
    let mut wv = [T::zero(); 4];
    for k in 0..4 {
        let offset = <T as MapScalar>::from_f64(k as f64 - 1.0);
        wu[k] = cubic_weight(fu - offset);
        wv[k] = cubic_weight(fv - offset);
    }

    for (c, value) in out.iter_mut().enumerate() {
        let mut acc = T::zero();
        for (j, wy) in wv.iter().enumerate() {
            for (i, wx) in wu.iter().enumerate() {
                acc = acc + *wx * *wy * src.at(iu + i as isize - 1, iv + j as isize - 1, c);
            }
        }
        *value = S::from_map(acc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp() -> Vec<f32> {
        // 4x3 single channel image with value = x + 10 y
        (0..3)
            .flat_map(|y| (0..4).map(move |x| (x + 10 * y) as f32))
            .collect()
    }

    fn view(data: &[f32]) -> SourceView<'_, f32> {
        SourceView {
            data,
            width: 4,
            height: 3,
            channels: 1,
        }
    }

    #[test]
    fn test_nearest_and_bilinear() {
        let data = ramp();
        let src = view(&data);
        let mut out = [0.0_f32];

        assert!(interpolate_pixel(&src, 1.4, 1.6, Interpolation::Nearest, &mut out));
        assert_eq!(out[0], 21.0);

        assert!(interpolate_pixel(&src, 1.5, 0.5, Interpolation::Bilinear, &mut out));
        assert_relative_eq!(out[0], 6.5);
    }

    #[test]
    fn test_bicubic_reproduces_linear_ramp() {
        let data = ramp();
        let src = view(&data);
        let mut out = [0.0_f32];
        assert!(interpolate_pixel(&src, 1.25, 1.0, Interpolation::Bicubic, &mut out));
        assert_relative_eq!(out[0], 11.25, epsilon = 1e-5);
    }

    #[test]
    fn test_out_of_bounds_is_rejected() {
        let data = ramp();
        let src = view(&data);
        let mut out = [-1.0_f32];
        assert!(!interpolate_pixel(&src, -0.6, 1.0, Interpolation::Bilinear, &mut out));
        assert!(!interpolate_pixel(&src, 1.0, f32::NAN, Interpolation::Nearest, &mut out));
        assert_eq!(out[0], -1.0);
        // Half a pixel of slack is still sampled.
        assert!(interpolate_pixel(&src, 3.4, 2.4, Interpolation::Nearest, &mut out));
        assert_eq!(out[0], 23.0);
    }

    #[test]
    fn test_kernels_run_in_double_precision() {
        let data: Vec<f64> = ramp().into_iter().map(f64::from).collect();
        let src = SourceView {
            data: &data,
            width: 4,
            height: 3,
            channels: 1,
        };
        let mut out = [0.0_f64];
        assert!(interpolate_pixel(&src, 1.4, 1.6, Interpolation::Nearest, &mut out));
        assert_eq!(out[0], 21.0);
        assert!(interpolate_pixel(&src, 1.5, 0.5, Interpolation::Bilinear, &mut out));
        assert_relative_eq!(out[0], 6.5, epsilon = 1e-12);
        assert!(interpolate_pixel(&src, 1.25, 1.0, Interpolation::Bicubic, &mut out));
        assert_relative_eq!(out[0], 11.25, epsilon = 1e-12);

        let bytes: Vec<u8> = ramp().into_iter().map(|v| v as u8).collect();
        let src = SourceView {
            data: &bytes,
            width: 4,
            height: 3,
            channels: 1,
        };
        let mut out = [0_u8];
        assert!(interpolate_pixel(&src, 1.5, 0.5, Interpolation::Bilinear, &mut out));
        assert_eq!(out[0], 7);
    }

    #[test]
    fn test_integer_samples_round_and_saturate() {
        assert_eq!(u8::from_map(254.6), 255);
        assert_eq!(u8::from_map(300.0), 255);
        assert_eq!(u8::from_map(-3.0), 0);
        assert_eq!(u16::from_map(1000.4), 1000);
    }
}
