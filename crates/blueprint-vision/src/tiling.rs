//! Overlapping 2×2 tiling of large drawings.
//!
//! ## Overview
//!
//! Small symbols on a large sheet are easier for a vision model to read at
//! higher effective resolution. [`tile_image`] cuts the sheet into four
//! quadrants that overlap by a percentage of the tile size, so a symbol on a
//! seam appears whole in at least one tile. Each tile records its placement
//! as a normalized global bbox, which [`crate::geometry::local_to_global`]
//! uses to map tile-local detections back onto the sheet.
//!
//! A downsampled copy of the whole sheet is kept alongside the tiles for the
//! refinement pass.

use crate::config::TilingConfig;
use crate::error::{Result, VisionError};
use crate::geometry::BBox;
use crate::model::DrawingImage;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use tracing::{debug, info};

/// Largest accepted overlap. Beyond 50% opposite tiles would cover each other.
const MAX_OVERLAP_PERCENT: f64 = 50.0;

/// Placement of a tile in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TilePosition {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Full,
}

impl TilePosition {
    /// The four quadrants, in dispatch order.
    pub const QUADRANTS: [Self; 4] = [Self::TopLeft, Self::TopRight, Self::BottomLeft, Self::BottomRight];

    #[inline]
    #[must_use = "returns the position name"]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TopLeft => "top-left",
            Self::TopRight => "top-right",
            Self::BottomLeft => "bottom-left",
            Self::BottomRight => "bottom-right",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for TilePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One encoded tile and its placement on the sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub position: TilePosition,
    pub image: DrawingImage,
    /// Normalized placement of the tile on the original sheet
    pub bbox: BBox,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileSetMetadata {
    pub original_width: u32,
    pub original_height: u32,
    pub tile_count: usize,
    pub overlap_percent: f64,
}

/// Output of [`tile_image`].
#[derive(Debug, Clone, PartialEq)]
pub struct TileSet {
    pub tiles: Vec<Tile>,
    /// Whole sheet, downsampled to the configured maximum dimension
    pub full_image: Tile,
    pub metadata: TileSetMetadata,
}

/// True when the base64 payload is above the configured threshold.
#[inline]
#[must_use = "returns whether the image should be tiled"]
pub fn should_tile(image: &DrawingImage, cfg: &TilingConfig) -> bool {
    image.payload_len() > cfg.byte_threshold
}

/// True when either side reaches the configured dimension threshold.
#[inline]
#[must_use = "returns whether the image should be tiled"]
pub const fn should_tile_dimensions(width: u32, height: u32, cfg: &TilingConfig) -> bool {
    width >= cfg.dimension_threshold || height >= cfg.dimension_threshold
}

fn decode(image: &DrawingImage) -> Result<DynamicImage> {
    let bytes = image.decode()?;
    Ok(image::load_from_memory(&bytes)?)
}

/// Pixel dimensions of an encoded image, read from the header only.
///
/// # Errors
///
/// Returns an error if the payload is not base64 or the format is not
/// recognized.
pub fn image_dimensions(image: &DrawingImage) -> Result<(u32, u32)> {
    let bytes = image.decode()?;
    Ok(ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()?)
}

fn encode_png(img: &DynamicImage) -> Result<DrawingImage> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(DrawingImage::from_bytes(buf.get_ref()))
}

fn normalized_bbox(x: u32, y: u32, w: u32, h: u32, width: u32, height: u32) -> BBox {
    let (fw, fh) = (f64::from(width), f64::from(height));
    BBox::new(
        f64::from(x) / fw,
        f64::from(y) / fh,
        f64::from(x + w) / fw,
        f64::from(y + h) / fh,
    )
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn overlap_px(tile_size: u32, overlap_percent: f64) -> u32 {
    (f64::from(tile_size) * overlap_percent / 100.0).floor() as u32
}

/// Split an image into an overlapping 2×2 grid plus a downsampled full copy.
///
/// # Errors
///
/// Returns [`VisionError::Image`] if the payload cannot be decoded or a
/// tile cannot be encoded, and [`VisionError::InvalidInput`] for an overlap
/// outside `[0, 50]` or an image smaller than 2×2 pixels.
pub fn tile_image(image: &DrawingImage, overlap_percent: f64, cfg: &TilingConfig) -> Result<TileSet> {
    if !(0.0..=MAX_OVERLAP_PERCENT).contains(&overlap_percent) {
        return Err(VisionError::InvalidInput(format!(
            "overlap must be within 0-{MAX_OVERLAP_PERCENT}%, got {overlap_percent}"
        )));
    }

    let img = decode(image)?;
    let (width, height) = img.dimensions();
    if width < 2 || height < 2 {
        return Err(VisionError::InvalidInput(format!(
            "image too small to tile: {width}x{height}"
        )));
    }

    let tile_w = width / 2;
    let tile_h = height / 2;
    let ox = overlap_px(tile_w, overlap_percent);
    let oy = overlap_px(tile_h, overlap_percent);

    let mut tiles = Vec::with_capacity(4);
    for position in TilePosition::QUADRANTS {
        let (sx, sy) = match position {
            TilePosition::TopLeft => (0, 0),
            TilePosition::TopRight => (tile_w - ox, 0),
            TilePosition::BottomLeft => (0, tile_h - oy),
            TilePosition::BottomRight | TilePosition::Full => (tile_w - ox, tile_h - oy),
        };
        // Right and bottom tiles run to the edge so odd sizes lose no pixels
        let w = match position {
            TilePosition::TopRight | TilePosition::BottomRight => width - sx,
            _ => (tile_w + ox).min(width),
        };
        let h = match position {
            TilePosition::BottomLeft | TilePosition::BottomRight => height - sy,
            _ => (tile_h + oy).min(height),
        };
        let cropped = img.crop_imm(sx, sy, w, h);
        debug!(%position, sx, sy, w, h, "Cut tile");
        tiles.push(Tile {
            position,
            image: encode_png(&cropped)?,
            bbox: normalized_bbox(sx, sy, w, h, width, height),
            width: w,
            height: h,
        });
    }

    let max_dim = cfg.full_image_max_dimension.max(1);
    let full_image = if width.max(height) > max_dim {
        let resized = img.resize(max_dim, max_dim, FilterType::Triangle);
        let (rw, rh) = resized.dimensions();
        Tile {
            position: TilePosition::Full,
            image: encode_png(&resized)?,
            bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
            width: rw,
            height: rh,
        }
    } else {
        Tile {
            position: TilePosition::Full,
            image: image.clone(),
            bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
            width,
            height,
        }
    };

    info!(
        width,
        height,
        overlap_percent,
        full_width = full_image.width,
        full_height = full_image.height,
        "Tiled image into 2x2 grid"
    );

    Ok(TileSet {
        metadata: TileSetMetadata {
            original_width: width,
            original_height: height,
            tile_count: tiles.len(),
            overlap_percent,
        },
        tiles,
        full_image,
    })
}
