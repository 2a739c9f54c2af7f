//! Per-side padding and grayscale conversion applied before tiling.

use anyhow::{bail, Result};
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::PairtileError;
use crate::types::ImageTensor;

/// ITU-R BT.601 luma weights.
const LUMA_WEIGHTS: [f32; 3] = [0.2989, 0.587, 0.114];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadMode {
    /// Mirror the image around its edge pixels (the edge itself is not repeated).
    #[default]
    Reflect,
    /// Fill with zeros.
    Constant,
}

impl PadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reflect => "reflect",
            Self::Constant => "constant",
        }
    }
}

/// Transform options for one side (input or target) of a pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideTransform {
    /// Pixels added on every side; zero disables padding.
    pub padding: usize,
    /// Pad with zeros instead of reflecting.
    pub zero_pad: bool,
    pub grayscale: bool,
}

impl SideTransform {
    pub fn pad_mode(&self) -> PadMode {
        if self.zero_pad {
            PadMode::Constant
        } else {
            PadMode::Reflect
        }
    }

    pub fn is_identity(&self) -> bool {
        self.padding == 0 && !self.grayscale
    }

    /// Pad, then convert to grayscale.
    pub fn apply(&self, image: ImageTensor) -> Result<ImageTensor> {
        let image = if self.padding > 0 {
            pad(&image, self.padding, self.pad_mode())?
        } else {
            image
        };

        if self.grayscale {
            to_grayscale(&image)
        } else {
            Ok(image)
        }
    }
}

/// The transforms configured for both sides of a pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStage {
    pub input: SideTransform,
    pub target: SideTransform,
}

impl TransformStage {
    pub fn new(input: SideTransform, target: SideTransform) -> Self {
        Self { input, target }
    }

    pub fn apply_input(&self, image: ImageTensor) -> Result<ImageTensor> {
        self.input.apply(image)
    }

    pub fn apply_target(&self, image: ImageTensor) -> Result<ImageTensor> {
        self.target.apply(image)
    }
}

/// Grow the image by `padding` pixels on each of the four sides.
pub fn pad(image: &ImageTensor, padding: usize, mode: PadMode) -> Result<ImageTensor> {
    if padding == 0 {
        return Ok(image.clone());
    }

    let (channels, height, width) = (image.channels(), image.height(), image.width());
    if mode == PadMode::Reflect && (padding >= height || padding >= width) {
        return Err(PairtileError::InvalidPadding {
            padding,
            height,
            width,
            mode: mode.as_str(),
        }
        .into());
    }

    let out_height = height + 2 * padding;
    let out_width = width + 2 * padding;
    let source = image.view();

    let padded = match mode {
        PadMode::Constant => {
            let mut padded = Array3::<f32>::zeros((channels, out_height, out_width));
            padded
                .slice_mut(ndarray::s![
                    ..,
                    padding..padding + height,
                    padding..padding + width
                ])
                .assign(&source);
            padded
        }
        PadMode::Reflect => Array3::from_shape_fn((channels, out_height, out_width), |(c, y, x)| {
            let sy = reflect_index(y as isize - padding as isize, height);
            let sx = reflect_index(x as isize - padding as isize, width);
            source[[c, sy, sx]]
        }),
    };

    Ok(ImageTensor::new(padded))
}

fn reflect_index(index: isize, extent: usize) -> usize {
    let last = extent as isize - 1;
    if index < 0 {
        (-index) as usize
    } else if index > last {
        (2 * last - index) as usize
    } else {
        index as usize
    }
}

/// Collapse RGB to a single luma channel. Single-channel input is returned as is.
pub fn to_grayscale(image: &ImageTensor) -> Result<ImageTensor> {
    match image.channels() {
        1 => Ok(image.clone()),
        3 => {
            let source = image.view();
            let mut luma = Array3::<f32>::zeros((1, image.height(), image.width()));
            for (channel, weight) in LUMA_WEIGHTS.iter().enumerate() {
                luma.index_axis_mut(Axis(0), 0)
                    .scaled_add(*weight, &source.index_axis(Axis(0), channel));
            }
            luma.mapv_inplace(|value| value.clamp(0.0, 1.0));
            Ok(ImageTensor::new(luma))
        }
        channels => bail!("grayscale conversion expects 1 or 3 channels, got {channels}"),
    }
}
