//! Resampling backends.
//!
//! [`PortableResampler`] walks the output image on the calling thread. With
//! the `rayon` feature, [`ParallelResampler`] splits the output into rows on
//! the global thread pool. Both produce identical pixels.

use super::interpolate::{interpolate_pixel, Interpolation, SampleType, SourceView};
use super::{MapGrid, RemapError};
use serde::{Deserialize, Serialize};

/// Backend identifier, part of a map signature so that switching backends
/// invalidates cached maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResamplerKind {
    Portable,
    #[cfg(feature = "rayon")]
    Parallel,
}

impl Default for ResamplerKind {
    fn default() -> Self {
        #[cfg(feature = "rayon")]
        {
            ResamplerKind::Parallel
        }
        #[cfg(not(feature = "rayon"))]
        {
            ResamplerKind::Portable
        }
    }
}

/// Gathers source pixels through a coordinate grid.
pub trait Resampler {
    fn kind(&self) -> ResamplerKind;

    /// Fills `dst` (interleaved, `grid.width * grid.height * channels`)
    /// from `src`, writing `fill` where the grid points outside the source.
    fn resample<S: SampleType>(
        &self,
        src: &SourceView<'_, S>,
        grid: &MapGrid<S::Map>,
        interpolation: Interpolation,
        fill: &[S],
        dst: &mut [S],
    ) -> Result<(), RemapError>;
}

fn check_buffers<S: SampleType>(
    src: &SourceView<'_, S>,
    grid: &MapGrid<S::Map>,
    fill: &[S],
    dst: &[S],
) -> Result<(), RemapError> {
    if fill.len() != src.channels {
        return Err(RemapError::ChannelMismatch {
            image: src.channels,
            fill: fill.len(),
        });
    }
    let expected = grid.width * grid.height * src.channels;
    if dst.len() != expected {
        return Err(RemapError::BufferSize {
            expected,
            got: dst.len(),
        });
    }
    Ok(())
}

fn resample_row<S: SampleType>(
    src: &SourceView<'_, S>,
    xs: &[S::Map],
    ys: &[S::Map],
    interpolation: Interpolation,
    fill: &[S],
    dst_row: &mut [S],
) {
    dst_row
        .chunks_exact_mut(src.channels)
        .zip(xs.iter().zip(ys.iter()))
        .for_each(|(dst_pixel, (&x, &y))| {
            if !interpolate_pixel(src, x, y, interpolation, dst_pixel) {
                dst_pixel.copy_from_slice(fill);
            }
        });
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PortableResampler;

impl Resampler for PortableResampler {
    fn kind(&self) -> ResamplerKind {
        ResamplerKind::Portable
    }

    fn resample<S: SampleType>(
        &self,
        src: &SourceView<'_, S>,
        grid: &MapGrid<S::Map>,
        interpolation: Interpolation,
        fill: &[S],
        dst: &mut [S],
    ) -> Result<(), RemapError> {
        check_buffers(src, grid, fill, dst)?;
        if grid.width == 0 {
            return Ok(());
        }
        dst.chunks_exact_mut(grid.width * src.channels)
            .zip(grid.x.chunks_exact(grid.width))
            .zip(grid.y.chunks_exact(grid.width))
            .for_each(|((row, xs), ys)| resample_row(src, xs, ys, interpolation, fill, row));
        Ok(())
    }
}

#[cfg(feature = "rayon")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelResampler;

#[cfg(feature = "rayon")]
impl Resampler for ParallelResampler {
    fn kind(&self) -> ResamplerKind {
        ResamplerKind::Parallel
    }

    fn resample<S: SampleType>(
        &self,
        src: &SourceView<'_, S>,
        grid: &MapGrid<S::Map>,
        interpolation: Interpolation,
        fill: &[S],
        dst: &mut [S],
    ) -> Result<(), RemapError> {
        use rayon::prelude::*;

        check_buffers(src, grid, fill, dst)?;
        if grid.width == 0 {
            return Ok(());
        }
        dst.par_chunks_exact_mut(grid.width * src.channels)
            .zip(grid.x.par_chunks_exact(grid.width))
            .zip(grid.y.par_chunks_exact(grid.width))
            .for_each(|((row, xs), ys)| resample_row(src, xs, ys, interpolation, fill, row));
        Ok(())
    }
}

/// Runs the backend named by `kind`.
pub fn resample_with<S: SampleType>(
    kind: ResamplerKind,
    src: &SourceView<'_, S>,
    grid: &MapGrid<S::Map>,
    interpolation: Interpolation,
    fill: &[S],
    dst: &mut [S],
) -> Result<(), RemapError> {
    match kind {
        ResamplerKind::Portable => PortableResampler.resample(src, grid, interpolation, fill, dst),
        #[cfg(feature = "rayon")]
        ResamplerKind::Parallel => ParallelResampler.resample(src, grid, interpolation, fill, dst),
    }
}
