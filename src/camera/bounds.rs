//! Output-view bounds for undistorted and rectified images.
//!
//! The input image border is traced, each border sample is mapped into the
//! output frame, and the samples are reduced to a rectangle:
//!
//! * `full`  - bounding box of every valid mapped sample.
//! * `valid` - inner rectangle from the per-edge extremes, then shrunk until
//!   its own border maps back inside the input image.
//! * `same`  - the input frame itself.

use super::{CameraModelError, OutputView, Resolution};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Tunables for the boundary tracing used by the `valid` and `full` views.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidViewTolerances {
    /// Border samples per image edge, corners included.
    pub samples_per_edge: usize,
    /// Distance in output pixels within which a failing sample is attributed
    /// to a rectangle side.
    pub edge_tolerance: f64,
    /// Slack in input pixels allowed outside the image when verifying.
    pub inside_tolerance: f64,
    /// Smallest number of output pixels removed from a failing side per
    /// iteration.
    pub shrink_step: f64,
    /// Fraction of the current rectangle span removed from a failing side per
    /// iteration, when larger than `shrink_step`.
    pub shrink_fraction: f64,
    pub max_shrink_iterations: usize,
    /// Slack applied before snapping bounds to whole pixels.
    pub rounding_tolerance: f64,
    /// Largest output image, in pixels, a map may be built for.
    pub max_output_pixels: u64,
}

impl Default for ValidViewTolerances {
    fn default() -> Self {
        ValidViewTolerances {
            samples_per_edge: 128,
            edge_tolerance: 1e-6,
            inside_tolerance: 0.5,
            shrink_step: 0.5,
            shrink_fraction: 1e-3,
            max_shrink_iterations: 4000,
            rounding_tolerance: 1e-3,
            max_output_pixels: 1 << 28,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEdge {
    Top,
    Right,
    Bottom,
    Left,
}

/// Inclusive pixel-coordinate rectangle in the output frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputBounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl OutputBounds {
    /// The input frame, `[0, width - 1] x [0, height - 1]`.
    pub fn from_resolution(resolution: &Resolution) -> Self {
        OutputBounds {
            x_min: 0.0,
            x_max: resolution.width.saturating_sub(1) as f64,
            y_min: 0.0,
            y_max: resolution.height.saturating_sub(1) as f64,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.x_min <= self.x_max && self.y_min <= self.y_max)
    }

    /// Pixel size of the output image. Sides too long for `u32` saturate.
    pub fn size(&self) -> Resolution {
        if self.is_empty() {
            return Resolution::default();
        }
        Resolution {
            width: pixel_span(self.x_min, self.x_max),
            height: pixel_span(self.y_min, self.y_max),
        }
    }

    /// Pixel size of the output image, `None` when it holds more than
    /// `max_pixels` pixels.
    pub fn checked_size(&self, max_pixels: u64) -> Option<Resolution> {
        let size = self.size();
        let pixels = u64::from(size.width).checked_mul(u64::from(size.height))?;
        (pixels <= max_pixels).then_some(size)
    }

    /// Output-frame position of the output image's top-left pixel.
    pub fn origin(&self) -> Vector2<f64> {
        Vector2::new(self.x_min, self.y_min)
    }

    pub fn intersection(&self, other: &OutputBounds) -> OutputBounds {
        OutputBounds {
            x_min: self.x_min.max(other.x_min),
            x_max: self.x_max.min(other.x_max),
            y_min: self.y_min.max(other.y_min),
            y_max: self.y_max.min(other.y_max),
        }
    }

    pub fn union(&self, other: &OutputBounds) -> OutputBounds {
        OutputBounds {
            x_min: self.x_min.min(other.x_min),
            x_max: self.x_max.max(other.x_max),
            y_min: self.y_min.min(other.y_min),
            y_max: self.y_max.max(other.y_max),
        }
    }

    /// Snaps the bounds to whole pixels: inward for `valid`, outward otherwise.
    pub fn rounded(&self, view: OutputView, tolerance: f64) -> OutputBounds {
        match view {
            OutputView::Valid => OutputBounds {
                x_min: (self.x_min - tolerance).ceil(),
                x_max: (self.x_max + tolerance).floor(),
                y_min: (self.y_min - tolerance).ceil(),
                y_max: (self.y_max + tolerance).floor(),
            },
            OutputView::Full | OutputView::Same => OutputBounds {
                x_min: (self.x_min + tolerance).floor(),
                x_max: (self.x_max - tolerance).ceil(),
                y_min: (self.y_min + tolerance).floor(),
                y_max: (self.y_max - tolerance).ceil(),
            },
        }
    }

    fn contains(&self, p: &Vector2<f64>, slack: f64) -> bool {
        p.x >= self.x_min - slack
            && p.x <= self.x_max + slack
            && p.y >= self.y_min - slack
            && p.y <= self.y_max + slack
    }

    /// Samples the rectangle border clockwise from the top-left corner.
    fn trace(&self, samples_per_edge: usize) -> Vec<(Vector2<f64>, ImageEdge)> {
        trace_rectangle(self, samples_per_edge)
    }
}

fn pixel_span(min: f64, max: f64) -> u32 {
    let span = (max - min).round();
    if span.is_finite() && span < u32::MAX as f64 {
        span as u32 + 1
    } else {
        u32::MAX
    }
}

fn trace_rectangle(rect: &OutputBounds, samples_per_edge: usize) -> Vec<(Vector2<f64>, ImageEdge)> {
    let n = samples_per_edge.max(2);
    let lerp = |a: f64, b: f64, i: usize| a + (b - a) * i as f64 / (n - 1) as f64;
    let mut samples = Vec::with_capacity(4 * n);
    for i in 0..n {
        samples.push((
            Vector2::new(lerp(rect.x_min, rect.x_max, i), rect.y_min),
            ImageEdge::Top,
        ));
    }
    for i in 0..n {
        samples.push((
            Vector2::new(rect.x_max, lerp(rect.y_min, rect.y_max, i)),
            ImageEdge::Right,
        ));
    }
    for i in 0..n {
        samples.push((
            Vector2::new(lerp(rect.x_max, rect.x_min, i), rect.y_max),
            ImageEdge::Bottom,
        ));
    }
    for i in 0..n {
        samples.push((
            Vector2::new(rect.x_min, lerp(rect.y_max, rect.y_min, i)),
            ImageEdge::Left,
        ));
    }
    samples
}

/// Samples the border of an image clockwise; every edge includes both of its
/// corners.
pub fn trace_boundary(
    resolution: &Resolution,
    samples_per_edge: usize,
) -> Vec<(Vector2<f64>, ImageEdge)> {
    trace_rectangle(&OutputBounds::from_resolution(resolution), samples_per_edge)
}

fn is_finite(p: &Vector2<f64>) -> bool {
    p.x.is_finite() && p.y.is_finite()
}

/// Unrounded bounds of the mapped input border for the requested view.
///
/// `to_output` maps an input pixel into the output frame and `to_input` maps
/// back; either returns `None` where the mapping is undefined.
///
/// # Errors
///
/// * [`CameraModelError::EmptyOutputView`] if no rectangle satisfies the view.
pub fn raw_output_bounds<F, G>(
    resolution: &Resolution,
    view: OutputView,
    tolerances: &ValidViewTolerances,
    to_output: F,
    to_input: G,
) -> Result<OutputBounds, CameraModelError>
where
    F: Fn(&Vector2<f64>) -> Option<Vector2<f64>>,
    G: Fn(&Vector2<f64>) -> Option<Vector2<f64>>,
{
    if resolution.is_empty() {
        return Err(CameraModelError::EmptyOutputView);
    }
    let mapped: Vec<(Option<Vector2<f64>>, ImageEdge)> =
        trace_boundary(resolution, tolerances.samples_per_edge)
            .into_iter()
            .map(|(p, edge)| (to_output(&p).filter(is_finite), edge))
            .collect();

    match view {
        OutputView::Same => Ok(OutputBounds::from_resolution(resolution)),
        OutputView::Full => full_bounds(&mapped),
        OutputView::Valid => {
            let initial = inner_rectangle(&mapped)?;
            shrink_to_valid(initial, resolution, tolerances, to_input)
        }
    }
}

/// Rounded bounds, see [`raw_output_bounds`].
pub fn compute_output_bounds<F, G>(
    resolution: &Resolution,
    view: OutputView,
    tolerances: &ValidViewTolerances,
    to_output: F,
    to_input: G,
) -> Result<OutputBounds, CameraModelError>
where
    F: Fn(&Vector2<f64>) -> Option<Vector2<f64>>,
    G: Fn(&Vector2<f64>) -> Option<Vector2<f64>>,
{
    let raw = raw_output_bounds(resolution, view, tolerances, to_output, to_input)?;
    let rounded = raw.rounded(view, tolerances.rounding_tolerance);
    if rounded.is_empty() {
        return Err(CameraModelError::EmptyOutputView);
    }
    Ok(rounded)
}

fn full_bounds(
    mapped: &[(Option<Vector2<f64>>, ImageEdge)],
) -> Result<OutputBounds, CameraModelError> {
    let mut bounds: Option<OutputBounds> = None;
    for p in mapped.iter().filter_map(|(p, _)| p.as_ref()) {
        let point = OutputBounds {
            x_min: p.x,
            x_max: p.x,
            y_min: p.y,
            y_max: p.y,
        };
        bounds = Some(match bounds {
            Some(b) => b.union(&point),
            None => point,
        });
    }
    bounds.ok_or(CameraModelError::EmptyOutputView)
}

fn inner_rectangle(
    mapped: &[(Option<Vector2<f64>>, ImageEdge)],
) -> Result<OutputBounds, CameraModelError> {
    let extreme = |edge: ImageEdge, pick: fn(&Vector2<f64>) -> f64, take_max: bool| {
        let values = mapped
            .iter()
            .filter(|(_, e)| *e == edge)
            .filter_map(|(p, _)| p.as_ref().map(pick));
        if take_max {
            values.fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
        } else {
            values.fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))))
        }
    };

    let rect = OutputBounds {
        x_min: extreme(ImageEdge::Left, |p| p.x, true).ok_or(CameraModelError::EmptyOutputView)?,
        x_max: extreme(ImageEdge::Right, |p| p.x, false).ok_or(CameraModelError::EmptyOutputView)?,
        y_min: extreme(ImageEdge::Top, |p| p.y, true).ok_or(CameraModelError::EmptyOutputView)?,
        y_max: extreme(ImageEdge::Bottom, |p| p.y, false).ok_or(CameraModelError::EmptyOutputView)?,
    };
    if rect.is_empty() {
        return Err(CameraModelError::EmptyOutputView);
    }
    Ok(rect)
}

fn shrink_to_valid<G>(
    mut rect: OutputBounds,
    resolution: &Resolution,
    tolerances: &ValidViewTolerances,
    to_input: G,
) -> Result<OutputBounds, CameraModelError>
where
    G: Fn(&Vector2<f64>) -> Option<Vector2<f64>>,
{
    let image = OutputBounds::from_resolution(resolution);
    for iteration in 0..tolerances.max_shrink_iterations {
        let mut failing = [false; 4];
        for (q, _) in rect.trace(tolerances.samples_per_edge) {
            let inside = to_input(&q)
                .filter(is_finite)
                .is_some_and(|p| image.contains(&p, tolerances.inside_tolerance));
            if inside {
                continue;
            }
            // A corner sample fails both of its sides.
            failing[0] |= (q.y - rect.y_min).abs() <= tolerances.edge_tolerance;
            failing[1] |= (q.x - rect.x_max).abs() <= tolerances.edge_tolerance;
            failing[2] |= (q.y - rect.y_max).abs() <= tolerances.edge_tolerance;
            failing[3] |= (q.x - rect.x_min).abs() <= tolerances.edge_tolerance;
        }

        if !failing.iter().any(|&f| f) {
            if iteration > 0 {
                log::debug!("valid output bounds shrunk in {iteration} iterations");
            }
            return Ok(rect);
        }
        let step = |span: f64| tolerances.shrink_step.max(tolerances.shrink_fraction * span);
        let step_x = step(rect.x_max - rect.x_min);
        let step_y = step(rect.y_max - rect.y_min);
        if failing[0] {
            rect.y_min += step_y;
        }
        if failing[1] {
            rect.x_max -= step_x;
        }
        if failing[2] {
            rect.y_max -= step_y;
        }
        if failing[3] {
            rect.x_min += step_x;
        }
        if rect.is_empty() {
            return Err(CameraModelError::EmptyOutputView);
        }
    }
    Err(CameraModelError::EmptyOutputView)
}
