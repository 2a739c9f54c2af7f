//! Scale-consistent crop and split of single images and low/high-res pairs.
//!
//! Everything here is pure: regions are computed from dimensions alone and
//! pixels are only copied when a tile is actually requested.

use anyhow::Result;

use crate::error::PairtileError;
use crate::types::{ImageTensor, TileRegion};

/// Largest accepted difference between the height and width ratios of a pair.
pub const DEFAULT_SCALE_TOLERANCE: f64 = 1e-5;

/// Slack allowed when checking that a scaled coordinate lands on an integer.
const INTEGER_EPSILON: f64 = 1e-6;

/// Which member of an `(x, y)` pair is the low-resolution image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowResSide {
    X,
    Y,
}

/// Per-axis ratio `high / low` of a validated pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleRatio {
    pub low_res: LowResSide,
    pub height: f64,
    pub width: f64,
}

impl ScaleRatio {
    /// Orient a pair by height (ties make `x` the low-res side) and check
    /// that both axes scale by the same factor within `tolerance`.
    pub fn between(
        x: (usize, usize),
        y: (usize, usize),
        tolerance: f64,
    ) -> Result<Self, PairtileError> {
        let (low_res, low, high) = if x.0 <= y.0 {
            (LowResSide::X, x, y)
        } else {
            (LowResSide::Y, y, x)
        };

        let mismatch = |ratio_h: f64, ratio_w: f64| PairtileError::ScaleMismatch {
            low_h: low.0,
            low_w: low.1,
            high_h: high.0,
            high_w: high.1,
            ratio_h,
            ratio_w,
        };

        if low.0 == 0 || low.1 == 0 {
            return Err(mismatch(f64::NAN, f64::NAN));
        }

        let height = high.0 as f64 / low.0 as f64;
        let width = high.1 as f64 / low.1 as f64;
        if !((width - height).abs() <= tolerance) {
            return Err(mismatch(height, width));
        }

        Ok(Self {
            low_res,
            height,
            width,
        })
    }

    /// Map a low-res region onto the high-res image, requiring every
    /// coordinate to be an exact multiple of the ratio.
    pub fn scale_region_exact(&self, region: TileRegion) -> Result<TileRegion, PairtileError> {
        let misaligned = || PairtileError::TileAlignment {
            row: region.row,
            col: region.col,
            height: region.height,
            width: region.width,
            scale: self.height,
        };

        let row = scale_exact(region.row, self.height).ok_or_else(misaligned)?;
        let col = scale_exact(region.col, self.width).ok_or_else(misaligned)?;
        let height = scale_exact(region.height, self.height).ok_or_else(misaligned)?;
        let width = scale_exact(region.width, self.width).ok_or_else(misaligned)?;

        Ok(TileRegion::new(row, col, height, width))
    }
}

/// `round(value * scale)` if it lands on an integer and divides back to `value`.
fn scale_exact(value: usize, scale: f64) -> Option<usize> {
    let exact = value as f64 * scale;
    let scaled = exact.round();
    if (scaled - exact).abs() > INTEGER_EPSILON {
        return None;
    }
    round_trips(value, scaled, scale).then_some(scaled as usize)
}

fn round_trips(value: usize, scaled: f64, scale: f64) -> bool {
    scaled >= 0.0 && (scaled / scale).round() as usize == value
}

fn limit(extent: usize, max_size: usize) -> usize {
    if max_size == 0 {
        extent
    } else {
        extent.min(max_size)
    }
}

/// Top-left crop to at most `max_size` on each side. A `max_size` of zero
/// disables the limit.
pub fn crop_max(image: ImageTensor, max_size: usize) -> ImageTensor {
    let height = limit(image.height(), max_size);
    let width = limit(image.width(), max_size);
    if height == image.height() && width == image.width() {
        return image;
    }
    image.crop(TileRegion::new(0, 0, height, width))
}

/// Crop both members of a pair from the origin so the low-res side is at most
/// `max_size` and the high-res side covers exactly the same scene.
///
/// Returns the pair in the order it was given.
pub fn pair_crop_max(
    x: ImageTensor,
    y: ImageTensor,
    max_size: usize,
    tolerance: f64,
) -> Result<(ImageTensor, ImageTensor)> {
    let ratio = ScaleRatio::between(
        (x.height(), x.width()),
        (y.height(), y.width()),
        tolerance,
    )?;
    let (low, high) = match ratio.low_res {
        LowResSide::X => (x, y),
        LowResSide::Y => (y, x),
    };

    let low_h = limit(low.height(), max_size);
    let low_w = limit(low.width(), max_size);
    let (low, high) = if low_h == low.height() && low_w == low.width() {
        (low, high)
    } else {
        let misaligned = || PairtileError::TileAlignment {
            row: 0,
            col: 0,
            height: low_h,
            width: low_w,
            scale: ratio.height,
        };
        let high_h = scale_exact(low_h, ratio.height).ok_or_else(misaligned)?;
        let high_w = scale_exact(low_w, ratio.width).ok_or_else(misaligned)?;
        if high_h > high.height() || high_w > high.width() {
            return Err(misaligned().into());
        }

        (
            low.crop(TileRegion::new(0, 0, low_h, low_w)),
            high.crop(TileRegion::new(0, 0, high_h, high_w)),
        )
    };

    Ok(match ratio.low_res {
        LowResSide::X => (low, high),
        LowResSide::Y => (high, low),
    })
}

/// Sliding-window layout over an image of fixed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub tile_height: usize,
    pub tile_width: usize,
    pub step_height: usize,
    pub step_width: usize,
    rows: usize,
    cols: usize,
}

impl TileGrid {
    /// Windows are `min(extent, max_size)` per axis with a stride of
    /// `floor(window * step_rate)`, never below one pixel. An image that fits
    /// in `max_size` (or a `max_size` of zero) yields one full-size window.
    pub fn new(height: usize, width: usize, max_size: usize, step_rate: f64) -> Self {
        if max_size == 0 || (height <= max_size && width <= max_size) {
            return Self {
                tile_height: height,
                tile_width: width,
                step_height: height.max(1),
                step_width: width.max(1),
                rows: 1,
                cols: 1,
            };
        }

        let tile_height = height.min(max_size);
        let tile_width = width.min(max_size);
        let step_height = stride(tile_height, step_rate);
        let step_width = stride(tile_width, step_rate);

        Self {
            tile_height,
            tile_width,
            step_height,
            step_width,
            rows: (height - tile_height) / step_height + 1,
            cols: (width - tile_width) / step_width + 1,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Region at row-major position `index`.
    pub fn region(&self, index: usize) -> Option<TileRegion> {
        if index >= self.len() {
            return None;
        }
        let (grid_row, grid_col) = (index / self.cols, index % self.cols);
        Some(TileRegion::new(
            grid_row * self.step_height,
            grid_col * self.step_width,
            self.tile_height,
            self.tile_width,
        ))
    }

    pub fn regions(&self) -> TileRegions {
        TileRegions {
            grid: *self,
            next: 0,
        }
    }
}

fn stride(window: usize, step_rate: f64) -> usize {
    ((window as f64 * step_rate).floor() as usize).max(1)
}

/// Row-major walk over a [`TileGrid`].
#[derive(Debug, Clone)]
pub struct TileRegions {
    grid: TileGrid,
    next: usize,
}

impl Iterator for TileRegions {
    type Item = TileRegion;

    fn next(&mut self) -> Option<TileRegion> {
        let region = self.grid.region(self.next)?;
        self.next += 1;
        Some(region)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileRegions {}

/// Lazy tile sequence produced by [`split_image`]. Clone it to restart.
#[derive(Debug, Clone)]
pub struct SplitTiles {
    image: ImageTensor,
    regions: TileRegions,
}

impl SplitTiles {
    pub fn grid(&self) -> TileGrid {
        self.regions.grid
    }

    pub fn regions(&self) -> TileRegions {
        self.regions.grid.regions()
    }
}

impl Iterator for SplitTiles {
    type Item = ImageTensor;

    fn next(&mut self) -> Option<ImageTensor> {
        let region = self.regions.next()?;
        Some(self.image.crop(region))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.regions.size_hint()
    }
}

impl ExactSizeIterator for SplitTiles {}

/// Tile `image` with a sliding window; see [`TileGrid::new`] for the layout.
pub fn split_image(image: &ImageTensor, max_size: usize, step_rate: f64) -> SplitTiles {
    let grid = TileGrid::new(image.height(), image.width(), max_size, step_rate);
    SplitTiles {
        image: image.clone(),
        regions: grid.regions(),
    }
}

/// Positionally matched tiles of an `(x, y)` pair.
#[derive(Debug, Clone)]
pub struct PairedTiles {
    x: ImageTensor,
    y: ImageTensor,
    x_regions: Vec<TileRegion>,
    y_regions: Vec<TileRegion>,
}

impl PairedTiles {
    pub fn len(&self) -> usize {
        self.x_regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x_regions.is_empty()
    }

    pub fn x_regions(&self) -> &[TileRegion] {
        &self.x_regions
    }

    pub fn y_regions(&self) -> &[TileRegion] {
        &self.y_regions
    }

    pub fn x_tiles(&self) -> impl Iterator<Item = ImageTensor> + '_ {
        self.x_regions.iter().map(|region| self.x.crop(*region))
    }

    pub fn y_tiles(&self) -> impl Iterator<Item = ImageTensor> + '_ {
        self.y_regions.iter().map(|region| self.y.crop(*region))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ImageTensor, ImageTensor)> + '_ {
        self.x_tiles().zip(self.y_tiles())
    }
}

/// Split the low-res member of a pair exactly as [`split_image`] would and
/// map every window onto the high-res member.
///
/// Fails before any pixels are copied if the pair is anisotropic or any
/// window does not land on whole high-res pixels.
pub fn pair_split_image(
    x: &ImageTensor,
    y: &ImageTensor,
    max_size: usize,
    step_rate: f64,
    tolerance: f64,
) -> Result<PairedTiles> {
    let ratio = ScaleRatio::between(
        (x.height(), x.width()),
        (y.height(), y.width()),
        tolerance,
    )?;
    let low = match ratio.low_res {
        LowResSide::X => x,
        LowResSide::Y => y,
    };

    let grid = TileGrid::new(low.height(), low.width(), max_size, step_rate);
    let mut low_regions = Vec::with_capacity(grid.len());
    let mut high_regions = Vec::with_capacity(grid.len());
    for region in grid.regions() {
        high_regions.push(ratio.scale_region_exact(region)?);
        low_regions.push(region);
    }

    let (x_regions, y_regions) = match ratio.low_res {
        LowResSide::X => (low_regions, high_regions),
        LowResSide::Y => (high_regions, low_regions),
    };

    Ok(PairedTiles {
        x: x.clone(),
        y: y.clone(),
        x_regions,
        y_regions,
    })
}
