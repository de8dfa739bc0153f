//! Memoized per-pixel remaps for undistortion, fisheye unwarping and stereo
//! rectification.
//!
//! A [`DistortionMap`] stores, for every output pixel, the source pixel to
//! sample. It is built once for a [`MapSignature`] and reused until the
//! signature changes. The map keeps two copies of its grid, one in `f64` and
//! one narrowed to `f32`, so each image type is resampled at a matching
//! precision.

use crate::camera::{OutputBounds, OutputView, ProjectionMethod, Resolution};
use image::{ImageBuffer, Pixel};
use nalgebra::Vector2;
use thiserror::Error;

pub mod interpolate;
pub mod resampler;

pub use interpolate::{
    interpolate_pixel, Interpolation, MapScalar, SampleKind, SampleType, SourceView,
};
#[cfg(feature = "rayon")]
pub use resampler::ParallelResampler;
pub use resampler::{resample_with, PortableResampler, Resampler, ResamplerKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemapError {
    #[error("X and Y grids have {x} and {y} entries for a {width}x{height} map")]
    GridSizeMismatch {
        width: usize,
        height: usize,
        x: usize,
        y: usize,
    },
    #[error("Output view is empty")]
    EmptyOutputView,
    #[error("Output view of {width}x{height} exceeds the {limit} pixel limit")]
    OutputTooLarge { width: u32, height: u32, limit: u64 },
    #[error("Image has {image} channels but the fill value has {fill}")]
    ChannelMismatch { image: usize, fill: usize },
    #[error("Output buffer has {got} samples, expected {expected}")]
    BufferSize { expected: usize, got: usize },
    #[error("No map has been built for this image")]
    MapNotBuilt,
    #[error("Map was built for a {expected:?} image, got {got:?}")]
    SignatureMismatch {
        expected: Resolution,
        got: Resolution,
    },
}

/// Checked pixel size of the output image covering `bounds`.
///
/// # Errors
///
/// * [`RemapError::EmptyOutputView`] if `bounds` is empty.
/// * [`RemapError::OutputTooLarge`] if it holds more than `max_pixels` pixels.
pub fn output_size(bounds: &OutputBounds, max_pixels: u64) -> Result<Resolution, RemapError> {
    if bounds.is_empty() {
        return Err(RemapError::EmptyOutputView);
    }
    bounds.checked_size(max_pixels).ok_or_else(|| {
        let size = bounds.size();
        RemapError::OutputTooLarge {
            width: size.width,
            height: size.height,
            limit: max_pixels,
        }
    })
}

/// Row-major source coordinates for one output image.
#[derive(Debug, Clone, PartialEq)]
pub struct MapGrid<T> {
    pub width: usize,
    pub height: usize,
    pub x: Vec<T>,
    pub y: Vec<T>,
}

impl<T: MapScalar> MapGrid<T> {
    /// Source coordinate of output pixel `(col, row)`.
    pub fn get(&self, col: usize, row: usize) -> Option<(T, T)> {
        if col >= self.width || row >= self.height {
            return None;
        }
        let i = row * self.width + col;
        Some((self.x[i], self.y[i]))
    }
}

/// Source-coordinate grids in both precisions, plus the output-frame origin
/// of the first output pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionMap {
    wide: MapGrid<f64>,
    narrow: MapGrid<f32>,
    origin: Vector2<f64>,
}

impl DistortionMap {
    /// Builds a map covering `bounds` in the output frame.
    ///
    /// # Arguments
    ///
    /// * `bounds` - Output rectangle, one output pixel per integer coordinate.
    /// * `max_pixels` - Largest accepted output image.
    /// * `source_of` - Maps an output-frame coordinate to the source pixel,
    ///   `None` where no source pixel exists.
    ///
    /// # Errors
    ///
    /// * [`RemapError::EmptyOutputView`] if `bounds` is empty.
    /// * [`RemapError::OutputTooLarge`] if `bounds` holds more than
    ///   `max_pixels` pixels.
    pub fn build<F>(
        bounds: &OutputBounds,
        max_pixels: u64,
        source_of: F,
    ) -> Result<Self, RemapError>
    where
        F: Fn(&Vector2<f64>) -> Option<Vector2<f64>>,
    {
        let size = output_size(bounds, max_pixels)?;
        let (width, height) = (size.width as usize, size.height as usize);
        let origin = bounds.origin();

        let mut x = Vec::with_capacity(width * height);
        let mut y = Vec::with_capacity(width * height);
        for row in 0..height {
            for col in 0..width {
                let q = Vector2::new(origin.x + col as f64, origin.y + row as f64);
                match source_of(&q) {
                    Some(p) => {
                        x.push(p.x);
                        y.push(p.y);
                    }
                    None => {
                        x.push(f64::NAN);
                        y.push(f64::NAN);
                    }
                }
            }
        }
        log::debug!("built {width}x{height} distortion map at origin ({}, {})", origin.x, origin.y);
        Self::from_grids(width, height, x, y, origin)
    }

    /// Wraps externally computed grids.
    ///
    /// # Errors
    ///
    /// * [`RemapError::GridSizeMismatch`] if a grid does not hold
    ///   `width * height` entries.
    pub fn from_grids(
        width: usize,
        height: usize,
        x: Vec<f64>,
        y: Vec<f64>,
        origin: Vector2<f64>,
    ) -> Result<Self, RemapError> {
        if x.len() != width * height || y.len() != width * height {
            return Err(RemapError::GridSizeMismatch {
                width,
                height,
                x: x.len(),
                y: y.len(),
            });
        }
        let narrow = MapGrid {
            width,
            height,
            x: x.iter().map(|&v| v as f32).collect(),
            y: y.iter().map(|&v| v as f32).collect(),
        };
        Ok(DistortionMap {
            wide: MapGrid {
                width,
                height,
                x,
                y,
            },
            narrow,
            origin,
        })
    }

    pub fn wide(&self) -> &MapGrid<f64> {
        &self.wide
    }

    pub fn narrow(&self) -> &MapGrid<f32> {
        &self.narrow
    }

    pub fn size(&self) -> Resolution {
        Resolution::new(self.wide.width as u32, self.wide.height as u32)
    }

    /// Output-frame coordinate of the top-left output pixel.
    pub fn origin(&self) -> Vector2<f64> {
        self.origin
    }

    /// Resamples `image` through the grid matching its sample precision.
    ///
    /// # Errors
    ///
    /// * Buffer and fill checks of [`Resampler::resample`].
    pub fn apply<P>(
        &self,
        image: &ImageBuffer<P, Vec<P::Subpixel>>,
        interpolation: Interpolation,
        fill: P,
        backend: ResamplerKind,
    ) -> Result<ImageBuffer<P, Vec<P::Subpixel>>, RemapError>
    where
        P: Pixel,
        P::Subpixel: SampleType,
    {
        let channels = P::CHANNEL_COUNT as usize;
        let src = SourceView {
            data: image.as_raw().as_slice(),
            width: image.width() as usize,
            height: image.height() as usize,
            channels,
        };
        let grid = <<P::Subpixel as SampleType>::Map as MapScalar>::grid(self);
        let mut dst = vec![num_traits::Zero::zero(); grid.width * grid.height * channels];
        resample_with(backend, &src, grid, interpolation, fill.channels(), &mut dst)?;

        let expected = dst.len();
        ImageBuffer::from_raw(grid.width as u32, grid.height as u32, dst)
            .ok_or(RemapError::BufferSize { expected, got: 0 })
    }
}

/// Everything a cached map depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapSignature {
    pub input: Resolution,
    pub channels: u8,
    pub sample: SampleKind,
    pub view: OutputView,
    /// Virtual focal length bits, fisheye only.
    pub focal_length: Option<u64>,
    pub method: Option<ProjectionMethod>,
    pub backend: ResamplerKind,
    /// Bit patterns of any further parameters the map was built from.
    pub parameters: Vec<u64>,
}

impl MapSignature {
    pub fn for_image<P>(image: &ImageBuffer<P, Vec<P::Subpixel>>, view: OutputView) -> Self
    where
        P: Pixel,
        P::Subpixel: SampleType,
    {
        MapSignature {
            input: Resolution::new(image.width(), image.height()),
            channels: P::CHANNEL_COUNT,
            sample: <P::Subpixel as SampleType>::KIND,
            view,
            focal_length: None,
            method: None,
            backend: ResamplerKind::default(),
            parameters: Vec::new(),
        }
    }

    pub fn with_focal_length(mut self, focal_length: f64) -> Self {
        self.focal_length = Some(focal_length.to_bits());
        self
    }

    pub fn with_method(mut self, method: ProjectionMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_parameters(mut self, parameters: &[f64]) -> Self {
        self.parameters = parameters.iter().map(|v| v.to_bits()).collect();
        self
    }

    pub fn with_backend(mut self, backend: ResamplerKind) -> Self {
        self.backend = backend;
        self
    }
}

/// One remap per owning model, rebuilt only when its signature changes.
#[derive(Debug, Clone, Default)]
pub struct DistortionMapCache {
    signature: Option<MapSignature>,
    map: Option<DistortionMap>,
}

impl DistortionMapCache {
    pub fn new() -> Self {
        DistortionMapCache::default()
    }

    pub fn needs_update(&self, signature: &MapSignature) -> bool {
        self.map.is_none() || self.signature.as_ref() != Some(signature)
    }

    /// Replaces the cached map.
    pub fn update(&mut self, signature: MapSignature, map: DistortionMap) {
        self.signature = Some(signature);
        self.map = Some(map);
    }

    /// Rebuilds with `build` if the signature differs from the cached one.
    ///
    /// Returns `true` when a rebuild happened. On error the cache is cleared
    /// so a stale map is never reused.
    pub fn ensure_up_to_date<E, B>(&mut self, signature: MapSignature, build: B) -> Result<bool, E>
    where
        B: FnOnce() -> Result<DistortionMap, E>,
    {
        if !self.needs_update(&signature) {
            return Ok(false);
        }
        self.invalidate();
        let map = build()?;
        log::debug!(
            "distortion map rebuilt for {}x{} input, view {:?}",
            signature.input.width,
            signature.input.height,
            signature.view
        );
        self.update(signature, map);
        Ok(true)
    }

    pub fn invalidate(&mut self) {
        self.signature = None;
        self.map = None;
    }

    pub fn map(&self) -> Option<&DistortionMap> {
        self.map.as_ref()
    }

    pub fn signature(&self) -> Option<&MapSignature> {
        self.signature.as_ref()
    }

    /// Resamples `image` with the cached map.
    ///
    /// # Errors
    ///
    /// * [`RemapError::MapNotBuilt`] if nothing is cached.
    /// * [`RemapError::SignatureMismatch`] if the map was built for a
    ///   different input size.
    pub fn transform_image<P>(
        &self,
        image: &ImageBuffer<P, Vec<P::Subpixel>>,
        interpolation: Interpolation,
        fill: P,
    ) -> Result<ImageBuffer<P, Vec<P::Subpixel>>, RemapError>
    where
        P: Pixel,
        P::Subpixel: SampleType,
    {
        let (map, signature) = match (&self.map, &self.signature) {
            (Some(m), Some(s)) => (m, s),
            _ => return Err(RemapError::MapNotBuilt),
        };
        let got = Resolution::new(image.width(), image.height());
        if signature.input != got {
            return Err(RemapError::SignatureMismatch {
                expected: signature.input,
                got,
            });
        }
        map.apply(image, interpolation, fill, signature.backend)
    }
}
