//! Border window geometry for Ambilight sampling
//!
//! Splits the border of the calibrated screen quadrilateral into a ring of
//! axis-aligned sampling windows. The quadrilateral may be a trapezoid (camera
//! looking at the TV off-axis), so each edge is interpolated on its own:
//! top and bottom between their two corners, left and right likewise.
//!
//! Corner coverage: the first and last windows of the top and bottom edges
//! cover the four corners, so the side edges skip their first and last
//! division. For `v` vertical segments each side yields `v - 2` windows.

use serde::{Deserialize, Serialize};

use crate::config::Point;

/// Corner indices, clockwise from top-left
const TL: usize = 0;
const TR: usize = 1;
const BR: usize = 2;
const BL: usize = 3;

/// Integer pixel rectangle. Not guaranteed to be ordered (`x1 <= x2`);
/// consumers clip before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl WindowRect {
    #[cfg(test)]
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    fn from_f64(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x1: x1.round() as i32,
            y1: y1.round() as i32,
            x2: x2.round() as i32,
            y2: y2.round() as i32,
        }
    }
}

/// Number of windows along each pair of opposite edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCounts {
    pub horizontal: u32,
    pub vertical: u32,
}

impl SegmentCounts {
    pub fn new(horizontal: u32, vertical: u32) -> Self {
        Self { horizontal, vertical }
    }

    /// Total windows produced by [`compute_windows`]
    pub fn total_windows(&self) -> usize {
        2 * self.horizontal as usize + 2 * self.vertical.saturating_sub(2) as usize
    }
}

/// How deep each window reaches into the screen
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DepthPolicy {
    /// Depth tapers across the edge between the window sizes of the two
    /// perpendicular edges, following a trapezoidal projection
    #[default]
    Interpolated,
    /// Every window has the same thickness, measured inward from the edge
    Fixed { pixels: f64 },
}

/// The four ordered window lists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeWindows {
    /// Left to right
    pub top: Vec<WindowRect>,
    /// Left to right
    pub bottom: Vec<WindowRect>,
    /// Top to bottom, corners excluded
    pub left: Vec<WindowRect>,
    /// Top to bottom, corners excluded
    pub right: Vec<WindowRect>,
}

#[cfg(test)]
impl EdgeWindows {
    pub fn len(&self) -> usize {
        self.top.len() + self.bottom.len() + self.left.len() + self.right.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fraction used to blend the two side depths for window `i` of `count`.
/// A single window has no neighbours to taper between and takes the mean.
#[inline]
fn taper_fraction(i: u32, count: u32) -> f64 {
    if count < 2 {
        0.5
    } else {
        i as f64 / (count - 1) as f64
    }
}

/// Compute the border sampling windows for a calibrated quadrilateral
///
/// `corners` are clockwise from top-left. Counts of zero produce no windows
/// on the affected edges.
pub fn compute_windows(corners: &[Point; 4], counts: SegmentCounts, depth: DepthPolicy) -> EdgeWindows {
    let h = counts.horizontal;
    let v = counts.vertical;

    let mut windows = EdgeWindows {
        top: Vec::with_capacity(h as usize),
        bottom: Vec::with_capacity(h as usize),
        left: Vec::with_capacity(v.saturating_sub(2) as usize),
        right: Vec::with_capacity(v.saturating_sub(2) as usize),
    };

    if h == 0 || v == 0 {
        return windows;
    }

    let (tl, tr, br, bl) = (&corners[TL], &corners[TR], &corners[BR], &corners[BL]);

    // Per-edge window sizes, used as the taper endpoints
    let top_width = (tr.x - tl.x) / h as f64;
    let bottom_width = (br.x - bl.x) / h as f64;
    let left_height = (bl.y - tl.y) / v as f64;
    let right_height = (br.y - tr.y) / v as f64;

    for i in 0..h {
        let start = i as f64 / h as f64;
        let end = (i + 1) as f64 / h as f64;

        let thickness = match depth {
            DepthPolicy::Interpolated => {
                let t = taper_fraction(i, h);
                (1.0 - t) * left_height + t * right_height
            }
            DepthPolicy::Fixed { pixels } => pixels,
        };

        let a = tl.lerp(tr, start);
        let b = tl.lerp(tr, end);
        windows.top.push(WindowRect::from_f64(a.x, a.y, b.x, a.y + thickness));

        let a = bl.lerp(br, start);
        let b = bl.lerp(br, end);
        windows.bottom.push(WindowRect::from_f64(a.x, a.y - thickness, b.x, a.y));
    }

    for i in 1..v.saturating_sub(1) {
        let start = i as f64 / v as f64;
        let end = (i + 1) as f64 / v as f64;

        let thickness = match depth {
            DepthPolicy::Interpolated => {
                let s = taper_fraction(i, v);
                (1.0 - s) * top_width + s * bottom_width
            }
            DepthPolicy::Fixed { pixels } => pixels,
        };

        let a = tl.lerp(bl, start);
        let b = tl.lerp(bl, end);
        windows.left.push(WindowRect::from_f64(a.x, a.y, a.x + thickness, b.y));

        let a = tr.lerp(br, start);
        let b = tr.lerp(br, end);
        windows.right.push(WindowRect::from_f64(a.x - thickness, a.y, a.x, b.y));
    }

    windows
}

/// Interior division points along each edge, for drawing the grid preview
///
/// Order: top (TL->TR), bottom (BR->BL), right (TR->BR), left (BL->TL),
/// `count - 1` points per edge.
pub fn grid_points(corners: &[Point; 4], counts: SegmentCounts) -> Vec<Point> {
    let h = counts.horizontal.max(1);
    let v = counts.vertical.max(1);
    let mut points = Vec::with_capacity(2 * (h + v) as usize);

    let mut intermediates = |from: &Point, to: &Point, count: u32| {
        for k in 1..count {
            points.push(from.lerp(to, k as f64 / count as f64));
        }
    };

    intermediates(&corners[TL], &corners[TR], h);
    intermediates(&corners[BR], &corners[BL], h);
    intermediates(&corners[TR], &corners[BR], v);
    intermediates(&corners[BL], &corners[TL], v);

    points
}
