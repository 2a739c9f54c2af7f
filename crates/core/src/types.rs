use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{s, Array3, ArcArray, ArrayView3, Ix3};

/// Channel-first (CHW) float image with samples in `[0, 1]`.
///
/// Pixel storage is reference counted, so clones and the identity results of
/// the tiler share memory with the original. Every transform produces a new
/// tensor; nothing mutates one in place.
#[derive(Debug, Clone)]
pub struct ImageTensor {
    data: ArcArray<f32, Ix3>,
}

impl ImageTensor {
    pub fn new(data: Array3<f32>) -> Self {
        Self {
            data: data.into_shared(),
        }
    }

    pub fn from_shape_vec(
        channels: usize,
        height: usize,
        width: usize,
        samples: Vec<f32>,
    ) -> Result<Self> {
        let data = Array3::from_shape_vec((channels, height, width), samples).with_context(
            || format!("sample count does not match shape {channels}x{height}x{width}"),
        )?;
        Ok(Self::new(data))
    }

    /// Solid image, mostly useful for tests and synthetic inputs.
    pub fn filled(channels: usize, height: usize, width: usize, value: f32) -> Self {
        Self::new(Array3::from_elem((channels, height, width), value))
    }

    pub fn channels(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn full_region(&self) -> TileRegion {
        TileRegion::new(0, 0, self.height(), self.width())
    }

    /// Cut `region` out of the image. A region covering the whole image
    /// returns a cheap clone sharing the same pixels.
    ///
    /// Panics if the region reaches outside the image.
    pub fn crop(&self, region: TileRegion) -> ImageTensor {
        if region == self.full_region() {
            return self.clone();
        }

        assert!(
            region.bottom() <= self.height() && region.right() <= self.width(),
            "crop region {region:?} exceeds image {}x{}",
            self.height(),
            self.width()
        );

        let cropped = self
            .data
            .slice(s![.., region.row..region.bottom(), region.col..region.right()])
            .to_owned();
        ImageTensor::new(cropped)
    }

    /// True when both tensors are views of the same pixel buffer.
    pub fn shares_pixels_with(&self, other: &ImageTensor) -> bool {
        self.data.as_ptr() == other.data.as_ptr() && self.data.dim() == other.data.dim()
    }
}

/// Per-image facts reported by the decoder alongside the pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub filename: PathBuf,
    pub has_alpha: bool,
}

impl Metadata {
    pub fn new(filename: impl AsRef<Path>, has_alpha: bool) -> Self {
        Self {
            filename: filename.as_ref().to_path_buf(),
            has_alpha,
        }
    }
}

/// Rectangle inside an image: origin at (`row`, `col`), extent `height` x `width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRegion {
    pub row: usize,
    pub col: usize,
    pub height: usize,
    pub width: usize,
}

impl TileRegion {
    pub fn new(row: usize, col: usize, height: usize, width: usize) -> Self {
        Self {
            row,
            col,
            height,
            width,
        }
    }

    pub fn bottom(&self) -> usize {
        self.row + self.height
    }

    pub fn right(&self) -> usize {
        self.col + self.width
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(height: usize, width: usize) -> ImageTensor {
        let data = Array3::from_shape_fn((3, height, width), |(c, y, x)| {
            (c * 10_000 + y * 100 + x) as f32
        });
        ImageTensor::new(data)
    }

    #[test]
    fn dimensions_are_channel_first() {
        let image = ImageTensor::filled(3, 4, 7, 0.5);
        assert_eq!(image.channels(), 3);
        assert_eq!(image.height(), 4);
        assert_eq!(image.width(), 7);
    }

    #[test]
    fn from_shape_vec_rejects_wrong_sample_count() {
        let error = ImageTensor::from_shape_vec(3, 2, 2, vec![0.0; 11])
            .expect_err("11 samples cannot fill 3x2x2");
        assert!(error.to_string().contains("3x2x2"));
    }

    #[test]
    fn crop_copies_the_requested_window() {
        let image = gradient(10, 10);
        let tile = image.crop(TileRegion::new(2, 3, 4, 5));

        assert_eq!((tile.height(), tile.width()), (4, 5));
        assert_eq!(tile.view()[[0, 0, 0]], 203.0);
        assert_eq!(tile.view()[[2, 3, 4]], 20_507.0);
        assert!(!tile.shares_pixels_with(&image));
    }

    #[test]
    fn full_region_crop_shares_pixels() {
        let image = gradient(6, 8);
        let tile = image.crop(image.full_region());
        assert!(tile.shares_pixels_with(&image));
    }

    #[test]
    #[should_panic(expected = "exceeds image")]
    fn crop_outside_image_panics() {
        let image = gradient(4, 4);
        let _ = image.crop(TileRegion::new(2, 2, 4, 4));
    }
}
