//! Bounding-box geometry.
//!
//! ## Overview
//!
//! The canonical box is `[xmin, ymin, xmax, ymax]` normalized to `[0, 1]`
//! with `xmin <= xmax` and `ymin <= ymax`. Every box produced by
//! [`normalize_backend_bbox`] satisfies this regardless of input.
//!
//! Inference services emit boxes in several conventions:
//! - normalized 0..1 (canonical)
//! - normalized 0..1000 integers
//! - absolute pixels
//! - `[ymin, xmin, ymax, xmax]` ordering
//!
//! Axis order is never guessed. Callers must pass [`BBoxOrder::YxYx`]
//! explicitly; auto-detection misfires on wide images where x values are
//! naturally larger than y values.

// Clippy pedantic allows:
// - Short variable names in geometric formulas (x, y, w, h, etc.)
#![allow(clippy::many_single_char_names)]

use crate::error::{Result, VisionError};
use serde::{Deserialize, Serialize};

/// Epsilon for `IoU` degeneracy checks.
pub const IOU_EPSILON: f64 = 1e-8;

/// Tolerance when clipping remapped tile coordinates.
pub const TRANSFORM_TOLERANCE: f64 = 1e-6;

/// Center offset under which two boxes count as aligned on an axis.
pub const ALIGNMENT_THRESHOLD: f64 = 0.02;

/// Canonical normalized bounding box, serialized as `[xmin, ymin, xmax, ymax]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl From<[f64; 4]> for BBox {
    fn from(a: [f64; 4]) -> Self {
        Self::new(a[0], a[1], a[2], a[3])
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        b.to_array()
    }
}

impl BBox {
    #[inline]
    #[must_use = "creates a bounding box"]
    pub const fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    #[inline]
    #[must_use = "returns the box as an array"]
    pub const fn to_array(&self) -> [f64; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }

    #[inline]
    #[must_use = "returns box width"]
    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    #[inline]
    #[must_use = "returns box height"]
    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    /// Area, zero for inverted boxes.
    #[inline]
    #[must_use = "returns bounding box area"]
    pub fn area(&self) -> f64 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    #[inline]
    #[must_use = "returns box center"]
    pub fn center(&self) -> (f64, f64) {
        (
            (self.xmin + self.xmax) / 2.0,
            (self.ymin + self.ymax) / 2.0,
        )
    }

    #[inline]
    #[must_use = "returns whether every coordinate is finite"]
    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }

    /// Compute intersection over union with another bbox.
    #[inline]
    #[must_use = "computes intersection over union"]
    pub fn iou(&self, other: &Self) -> f64 {
        iou(self, other)
    }

    /// Clip to `[0, 1]`, map non-finite values to 0 and order each axis.
    #[must_use = "returns the canonicalized box"]
    pub fn canonicalize(&self) -> Self {
        let clip = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        let (x0, x1) = ordered(clip(self.xmin), clip(self.xmax));
        let (y0, y1) = ordered(clip(self.ymin), clip(self.ymax));
        Self::new(x0, y0, x1, y1)
    }

    /// Tight box around a flat `[x0, y0, x1, y1, ...]` polygon.
    #[must_use = "returns the polygon bounds"]
    pub fn from_polygon(points: &[f64]) -> Option<Self> {
        if points.len() < 6 {
            return None;
        }
        let xs = points.iter().step_by(2).copied();
        let ys = points.iter().skip(1).step_by(2).copied();
        let (xmin, xmax) = min_max(xs)?;
        let (ymin, ymax) = min_max(ys)?;
        Some(Self::new(xmin, ymin, xmax, ymax))
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    values
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Pixel dimensions of an image or display surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: f64,
    pub height: f64,
}

impl ImageSize {
    #[inline]
    #[must_use = "creates an image size"]
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Axis-aligned pixel rectangle on a display surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// Value space of a raw backend bbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
    /// Already normalized to 0..1
    Unit,
    /// Normalized to 0..1000
    Thousandths,
    /// Absolute pixels; requires an image size
    Pixels,
}

/// Axis order of a raw backend bbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BBoxOrder {
    /// `[xmin, ymin, xmax, ymax]`
    #[default]
    XyXy,
    /// `[ymin, xmin, ymax, xmax]`
    YxYx,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NormalizeOptions {
    /// Explicit value space; `None` infers it from magnitude
    pub space: Option<CoordinateSpace>,
    pub order: BBoxOrder,
    pub image_size: Option<ImageSize>,
}

/// Convert any 4-value backend box into a canonical [`BBox`].
///
/// Without an explicit space, values up to 1000 are treated as thousandths
/// and larger values as pixels (divided by the image size when known,
/// otherwise by the largest value). Fewer than four values yield the zero box.
#[must_use = "returns the canonical box"]
pub fn normalize_backend_bbox(raw: &[f64], opts: &NormalizeOptions) -> BBox {
    if raw.len() < 4 {
        return BBox::default();
    }
    let mut a = [raw[0], raw[1], raw[2], raw[3]].map(|v| if v.is_finite() { v } else { 0.0 });

    let max_val = a.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let space = opts.space.or(if max_val <= 1.0 {
        None
    } else if max_val <= 1000.0 {
        Some(CoordinateSpace::Thousandths)
    } else {
        Some(CoordinateSpace::Pixels)
    });

    match space {
        None | Some(CoordinateSpace::Unit) => {}
        Some(CoordinateSpace::Thousandths) => a = a.map(|v| v / 1000.0),
        Some(CoordinateSpace::Pixels) => match opts.image_size {
            Some(size) if size.width > 0.0 && size.height > 0.0 => {
                // Pixel boxes follow the requested axis order too
                let (wx, hy) = match opts.order {
                    BBoxOrder::XyXy => (size.width, size.height),
                    BBoxOrder::YxYx => (size.height, size.width),
                };
                a = [a[0] / wx, a[1] / hy, a[2] / wx, a[3] / hy];
            }
            _ if max_val > 0.0 => a = a.map(|v| v / max_val),
            _ => {}
        },
    }

    let b = match opts.order {
        BBoxOrder::XyXy => BBox::new(a[0], a[1], a[2], a[3]),
        BBoxOrder::YxYx => BBox::new(a[1], a[0], a[3], a[2]),
    };
    b.canonicalize()
}

/// Intersection over union in `[0, 1]`.
///
/// Returns 0 for disjoint, degenerate or non-finite inputs.
#[must_use = "computes intersection over union"]
pub fn iou(a: &BBox, b: &BBox) -> f64 {
    if !a.is_finite() || !b.is_finite() {
        return 0.0;
    }
    let ix = a.xmax.min(b.xmax) - a.xmin.max(b.xmin);
    let iy = a.ymax.min(b.ymax) - a.ymin.max(b.ymin);
    if ix <= IOU_EPSILON || iy <= IOU_EPSILON {
        return 0.0;
    }
    let area_a = a.area();
    let area_b = b.area();
    if area_a < IOU_EPSILON || area_b < IOU_EPSILON {
        return 0.0;
    }
    let intersection = ix * iy;
    let union = area_a + area_b - intersection;
    if union < IOU_EPSILON {
        return 0.0;
    }
    (intersection / union).clamp(0.0, 1.0)
}

/// Map a tile-local normalized box into global normalized coordinates.
///
/// `global = tile.offset + local * tile.extent`, clipped to `[0, 1]`.
///
/// # Errors
///
/// Returns [`VisionError::Geometry`] if either box is non-finite or the
/// result leaves the unit square by more than the transform tolerance.
pub fn local_to_global(local: &BBox, tile: &BBox) -> Result<BBox> {
    if !local.is_finite() || !tile.is_finite() {
        return Err(VisionError::Geometry(format!(
            "non-finite coordinates: local={:?} tile={:?}",
            local.to_array(),
            tile.to_array()
        )));
    }
    let tw = tile.width();
    let th = tile.height();
    let g = BBox::new(
        local.xmin.mul_add(tw, tile.xmin),
        local.ymin.mul_add(th, tile.ymin),
        local.xmax.mul_add(tw, tile.xmin),
        local.ymax.mul_add(th, tile.ymin),
    );
    let lo = -TRANSFORM_TOLERANCE;
    let hi = 1.0 + TRANSFORM_TOLERANCE;
    if g.to_array().iter().any(|v| *v < lo || *v > hi) {
        return Err(VisionError::Geometry(format!(
            "remapped box {:?} outside image",
            g.to_array()
        )));
    }
    Ok(g.canonicalize())
}

/// Bbox coordinate conventions for [`convert_format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateFormat {
    /// `[xmin, ymin, xmax, ymax]` normalized
    Canonical,
    /// `[ymin, xmin, ymax, xmax]` normalized
    YxYx,
    /// `[x1, y1, x2, y2]` in pixels
    Absolute,
}

/// Convert a box between coordinate conventions.
///
/// # Errors
///
/// Returns an error when converting to or from pixels without an image size.
pub fn convert_format(
    b: [f64; 4],
    from: CoordinateFormat,
    to: CoordinateFormat,
    image_size: Option<ImageSize>,
) -> Result<[f64; 4]> {
    let needs_size = from == CoordinateFormat::Absolute || to == CoordinateFormat::Absolute;
    let size = match image_size {
        Some(s) => s,
        None if needs_size => {
            return Err(VisionError::InvalidInput(
                "image size is required for absolute coordinates".to_string(),
            ))
        }
        None => ImageSize::new(1.0, 1.0),
    };

    let canonical = match from {
        CoordinateFormat::Canonical => b,
        CoordinateFormat::YxYx => [b[1], b[0], b[3], b[2]],
        CoordinateFormat::Absolute => [
            b[0] / size.width,
            b[1] / size.height,
            b[2] / size.width,
            b[3] / size.height,
        ],
    };

    Ok(match to {
        CoordinateFormat::Canonical => canonical,
        CoordinateFormat::YxYx => [canonical[1], canonical[0], canonical[3], canonical[2]],
        CoordinateFormat::Absolute => [
            canonical[0] * size.width,
            canonical[1] * size.height,
            canonical[2] * size.width,
            canonical[3] * size.height,
        ],
    })
}

/// Uniform scale and centering padding for an aspect-preserving fit.
fn fit(original: ImageSize, target: ImageSize) -> (f64, f64, f64) {
    let scale = (target.width / original.width).min(target.height / original.height);
    let pad_x = original.width.mul_add(-scale, target.width) / 2.0;
    let pad_y = original.height.mul_add(-scale, target.height) / 2.0;
    (scale, pad_x, pad_y)
}

/// Map a normalized box onto a display surface.
#[must_use = "returns the display rectangle"]
pub fn normalized_to_display(
    b: &BBox,
    original: ImageSize,
    display: ImageSize,
    maintain_aspect: bool,
) -> DisplayRect {
    let x1 = b.xmin * original.width;
    let y1 = b.ymin * original.height;
    let x2 = b.xmax * original.width;
    let y2 = b.ymax * original.height;

    if maintain_aspect {
        let (scale, pad_x, pad_y) = fit(original, display);
        DisplayRect {
            x: x1.mul_add(scale, pad_x),
            y: y1.mul_add(scale, pad_y),
            w: (x2 - x1) * scale,
            h: (y2 - y1) * scale,
        }
    } else {
        let sx = display.width / original.width;
        let sy = display.height / original.height;
        DisplayRect {
            x: x1 * sx,
            y: y1 * sy,
            w: (x2 - x1) * sx,
            h: (y2 - y1) * sy,
        }
    }
}

/// Inverse of a stretched [`normalized_to_display`].
#[must_use = "returns the normalized box"]
pub fn display_to_normalized(rect: &DisplayRect, display: ImageSize) -> BBox {
    BBox::new(
        rect.x / display.width,
        rect.y / display.height,
        (rect.x + rect.w) / display.width,
        (rect.y + rect.h) / display.height,
    )
}

/// Re-normalize a box after the image is resized.
#[must_use = "returns the transformed box"]
pub fn transform_for_resize(
    b: &BBox,
    original: ImageSize,
    resized: ImageSize,
    maintain_aspect: bool,
) -> BBox {
    let abs = [
        b.xmin * original.width,
        b.ymin * original.height,
        b.xmax * original.width,
        b.ymax * original.height,
    ];
    let (sx, sy, pad_x, pad_y) = if maintain_aspect {
        let (scale, pad_x, pad_y) = fit(original, resized);
        (scale, scale, pad_x, pad_y)
    } else {
        (
            resized.width / original.width,
            resized.height / original.height,
            0.0,
            0.0,
        )
    };
    BBox::new(
        abs[0].mul_add(sx, pad_x) / resized.width,
        abs[1].mul_add(sy, pad_y) / resized.height,
        abs[2].mul_add(sx, pad_x) / resized.width,
        abs[3].mul_add(sy, pad_y) / resized.height,
    )
}

/// Euclidean distance between box centers.
#[must_use = "returns the center distance"]
pub fn center_distance(a: &BBox, b: &BBox) -> f64 {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    (bx - ax).hypot(by - ay)
}

/// Shortest distance between box edges, zero when the boxes overlap.
#[must_use = "returns the edge distance"]
pub fn edge_distance(a: &BBox, b: &BBox) -> f64 {
    let dx = (a.xmin - b.xmax).max(b.xmin - a.xmax).max(0.0);
    let dy = (a.ymin - b.ymax).max(b.ymin - a.ymax).max(0.0);
    dx.hypot(dy)
}

/// Relative placement of two box centers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Alignment {
    pub horizontal: bool,
    pub vertical: bool,
    pub diagonal: bool,
}

impl Alignment {
    #[inline]
    #[must_use = "returns whether the boxes share a row or column"]
    pub const fn is_axis_aligned(&self) -> bool {
        self.horizontal || self.vertical
    }
}

#[must_use = "returns the center alignment"]
pub fn alignment(a: &BBox, b: &BBox) -> Alignment {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    let dx = (bx - ax).abs();
    let dy = (by - ay).abs();
    Alignment {
        horizontal: dy < ALIGNMENT_THRESHOLD && dx > ALIGNMENT_THRESHOLD,
        vertical: dx < ALIGNMENT_THRESHOLD && dy > ALIGNMENT_THRESHOLD,
        diagonal: dx > ALIGNMENT_THRESHOLD && dy > ALIGNMENT_THRESHOLD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_iou_identity_and_disjoint() {
        let a = BBox::new(0.1, 0.1, 0.3, 0.3);
        let b = BBox::new(0.5, 0.5, 0.7, 0.7);
        assert!(approx(iou(&a, &a), 1.0));
        assert!(approx(iou(&a, &b), 0.0));
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = BBox::new(0.0, 0.0, 0.2, 0.2);
        let b = BBox::new(0.1, 0.0, 0.3, 0.2);
        // intersection 0.02, union 0.06
        assert!(approx(iou(&a, &b), 1.0 / 3.0));
    }

    #[test]
    fn test_iou_degenerate() {
        let line = BBox::new(0.1, 0.1, 0.1, 0.5);
        assert!(approx(iou(&line, &line), 0.0));
        let nan = BBox::new(f64::NAN, 0.0, 1.0, 1.0);
        assert!(approx(iou(&nan, &BBox::new(0.0, 0.0, 1.0, 1.0)), 0.0));
    }

    #[test]
    fn test_normalize_thousandths() {
        let b = normalize_backend_bbox(&[100.0, 200.0, 300.0, 400.0], &NormalizeOptions::default());
        assert_eq!(b, BBox::new(0.1, 0.2, 0.3, 0.4));
    }

    #[test]
    fn test_normalize_pixels_with_size() {
        let opts = NormalizeOptions {
            image_size: Some(ImageSize::new(4000.0, 2000.0)),
            ..NormalizeOptions::default()
        };
        let b = normalize_backend_bbox(&[2000.0, 500.0, 4000.0, 1500.0], &opts);
        assert_eq!(b, BBox::new(0.5, 0.25, 1.0, 0.75));
    }

    #[test]
    fn test_normalize_pixels_without_size() {
        let b = normalize_backend_bbox(&[0.0, 0.0, 1000.0, 2000.0], &NormalizeOptions::default());
        assert_eq!(b, BBox::new(0.0, 0.0, 0.5, 1.0));
    }

    #[test]
    fn test_normalize_explicit_yxyx() {
        let opts = NormalizeOptions {
            order: BBoxOrder::YxYx,
            ..NormalizeOptions::default()
        };
        let b = normalize_backend_bbox(&[0.1, 0.2, 0.3, 0.4], &opts);
        assert_eq!(b, BBox::new(0.2, 0.1, 0.4, 0.3));
    }

    #[test]
    fn test_normalize_never_reorders_by_default() {
        // A wide-image box with x > y stays as given
        let b = normalize_backend_bbox(&[0.8, 0.1, 0.9, 0.2], &NormalizeOptions::default());
        assert_eq!(b, BBox::new(0.8, 0.1, 0.9, 0.2));
    }

    #[test]
    fn test_normalize_short_and_inverted() {
        assert_eq!(normalize_backend_bbox(&[0.5], &NormalizeOptions::default()), BBox::default());
        let b = normalize_backend_bbox(&[0.9, 0.8, 0.1, 0.2], &NormalizeOptions::default());
        assert_eq!(b, BBox::new(0.1, 0.2, 0.9, 0.8));
    }

    #[test]
    fn test_local_to_global() {
        let tile = BBox::new(0.45, 0.0, 1.0, 0.55);
        let g = local_to_global(&BBox::new(0.0, 0.0, 1.0, 1.0), &tile).unwrap();
        assert!(approx(g.xmin, 0.45) && approx(g.xmax, 1.0) && approx(g.ymax, 0.55));
        assert!(local_to_global(&BBox::new(f64::NAN, 0.0, 1.0, 1.0), &tile).is_err());
        assert!(local_to_global(&BBox::new(0.0, 0.0, 3.0, 1.0), &tile).is_err());
    }

    #[test]
    fn test_convert_format() {
        let yx = convert_format(
            [0.1, 0.2, 0.3, 0.4],
            CoordinateFormat::Canonical,
            CoordinateFormat::YxYx,
            None,
        )
        .unwrap();
        assert_eq!(yx, [0.2, 0.1, 0.4, 0.3]);
        let abs = convert_format(
            [0.1, 0.2, 0.3, 0.4],
            CoordinateFormat::Canonical,
            CoordinateFormat::Absolute,
            Some(ImageSize::new(100.0, 50.0)),
        )
        .unwrap();
        assert!(approx(abs[0], 10.0) && approx(abs[3], 20.0));
        assert!(convert_format(
            [0.0; 4],
            CoordinateFormat::Absolute,
            CoordinateFormat::Canonical,
            None
        )
        .is_err());
    }

    #[test]
    fn test_display_mapping_with_padding() {
        // 200x100 image in a 200x200 display: scale 1, vertical padding 50
        let r = normalized_to_display(
            &BBox::new(0.0, 0.0, 1.0, 1.0),
            ImageSize::new(200.0, 100.0),
            ImageSize::new(200.0, 200.0),
            true,
        );
        assert!(approx(r.x, 0.0) && approx(r.y, 50.0) && approx(r.w, 200.0) && approx(r.h, 100.0));

        let stretched = normalized_to_display(
            &BBox::new(0.25, 0.25, 0.75, 0.75),
            ImageSize::new(200.0, 100.0),
            ImageSize::new(400.0, 400.0),
            false,
        );
        let back = display_to_normalized(&stretched, ImageSize::new(400.0, 400.0));
        assert!(approx(back.xmin, 0.25) && approx(back.ymax, 0.75));
    }

    #[test]
    fn test_transform_for_resize() {
        let b = BBox::new(0.1, 0.2, 0.3, 0.4);
        let same = transform_for_resize(&b, ImageSize::new(100.0, 100.0), ImageSize::new(50.0, 50.0), true);
        assert!(approx(same.xmin, 0.1) && approx(same.ymax, 0.4));
        let padded = transform_for_resize(
            &BBox::new(0.0, 0.0, 1.0, 1.0),
            ImageSize::new(100.0, 100.0),
            ImageSize::new(200.0, 100.0),
            true,
        );
        assert!(approx(padded.xmin, 0.25) && approx(padded.xmax, 0.75));
    }

    #[test]
    fn test_distances_and_alignment() {
        let a = BBox::new(0.0, 0.0, 0.1, 0.1);
        let b = BBox::new(0.2, 0.0, 0.3, 0.1);
        assert!(approx(edge_distance(&a, &b), 0.1));
        assert!(approx(center_distance(&a, &b), 0.2));
        assert!(approx(edge_distance(&a, &BBox::new(0.05, 0.05, 0.2, 0.2)), 0.0));
        let al = alignment(&a, &b);
        assert!(al.horizontal && !al.vertical && !al.diagonal);
    }

    #[test]
    fn test_polygon_bounds() {
        let b = BBox::from_polygon(&[0.1, 0.5, 0.4, 0.2, 0.3, 0.9]).unwrap();
        assert_eq!(b, BBox::new(0.1, 0.2, 0.4, 0.9));
        assert!(BBox::from_polygon(&[0.1, 0.2, 0.3, 0.4]).is_none());
    }

    #[test]
    fn test_serde_as_array() {
        let b = BBox::new(0.1, 0.2, 0.3, 0.4);
        assert_eq!(serde_json::to_string(&b).unwrap(), "[0.1,0.2,0.3,0.4]");
        let back: BBox = serde_json::from_str("[0.1,0.2,0.3,0.4]").unwrap();
        assert_eq!(back, b);
    }
}
