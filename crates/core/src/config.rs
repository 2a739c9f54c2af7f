use std::fs;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PairtileError;
use crate::tiler::DEFAULT_SCALE_TOLERANCE;
use crate::transform::{SideTransform, TransformStage};

pub const DEFAULT_SPLIT_STEP_RATE: f64 = 0.5;
pub const DEFAULT_QUEUE_SIZE: usize = 32;
pub const DEFAULT_INPUT_DIR_NAME: &str = "x";
pub const DEFAULT_TARGET_DIR_NAME: &str = "y";

/// On-disk encoding of written tiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    #[default]
    Png,
    Tiff,
}

impl TileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Tiff => "tiff",
        }
    }
}

impl FromStr for TileFormat {
    type Err = PairtileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "tif" | "tiff" => Ok(Self::Tiff),
            other => Err(PairtileError::configuration(format!(
                "unsupported tile format '{other}' (expected png or tiff)"
            ))),
        }
    }
}

/// Everything a conversion run needs to know.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConvertConfig {
    /// Low-res collection: a directory or a `.txt`/`.csv` index. Optional.
    pub input: Option<PathBuf>,
    /// High-res collection: a directory or a `.txt`/`.csv` index.
    pub target: PathBuf,
    pub output_dir: PathBuf,
    /// Largest tile edge on the low-res side; zero disables cropping.
    pub max_tile_size: usize,
    pub split_enabled: bool,
    pub split_step_rate: f64,
    pub recursive: bool,
    pub key_includes_subdir: bool,
    pub tile_format: TileFormat,
    pub input_dir_name: String,
    pub target_dir_name: String,
    /// Decoded pairs buffered ahead of the tiler.
    pub queue_size: usize,
    /// Concurrent tile writes; zero means available parallelism.
    pub writer_threads: usize,
    pub scale_tolerance: f64,
    pub input_transform: SideTransform,
    pub target_transform: SideTransform,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            input: None,
            target: PathBuf::new(),
            output_dir: PathBuf::new(),
            max_tile_size: 0,
            split_enabled: false,
            split_step_rate: DEFAULT_SPLIT_STEP_RATE,
            recursive: false,
            key_includes_subdir: false,
            tile_format: TileFormat::default(),
            input_dir_name: DEFAULT_INPUT_DIR_NAME.to_string(),
            target_dir_name: DEFAULT_TARGET_DIR_NAME.to_string(),
            queue_size: DEFAULT_QUEUE_SIZE,
            writer_threads: 0,
            scale_tolerance: DEFAULT_SCALE_TOLERANCE,
            input_transform: SideTransform::default(),
            target_transform: SideTransform::default(),
        }
    }
}

/// How decoded images are reduced to tiles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TilingMode {
    /// Write each image whole.
    Whole,
    /// One top-left crop per image.
    Crop { max_size: usize },
    /// Sliding-window tiles per image.
    Split { max_size: usize, step_rate: f64 },
}

impl ConvertConfig {
    /// Read a TOML config file. A missing or empty file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    /// Reject option combinations that cannot run. Performs no I/O.
    pub fn validate(&self) -> Result<(), PairtileError> {
        let fail = |message: &str| Err(PairtileError::configuration(message));

        if self.target.as_os_str().is_empty() {
            return fail("a target collection is required");
        }
        if self.output_dir.as_os_str().is_empty() {
            return fail("an output directory is required");
        }
        if self.split_enabled && self.max_tile_size == 0 {
            return fail("max tile size is required for split output");
        }
        if (self.input_transform.padding > 0 || self.target_transform.padding > 0)
            && self.max_tile_size > 0
        {
            return fail("padding cannot be combined with a max tile size");
        }
        if self.input.is_none()
            && (self.input_transform.padding > 0
                || self.input_transform.zero_pad
                || self.input_transform.grayscale)
        {
            return fail("input-side transforms were given without an input collection");
        }
        if !self.split_step_rate.is_finite()
            || self.split_step_rate <= 0.0
            || self.split_step_rate > 1.0
        {
            return fail("split step rate must be in (0, 1]");
        }
        if self.queue_size == 0 {
            return fail("queue size must be at least 1");
        }
        if !self.scale_tolerance.is_finite() || self.scale_tolerance <= 0.0 {
            return fail("scale tolerance must be a positive number");
        }
        if self.input_dir_name.trim().is_empty()
            || self.target_dir_name.trim().is_empty()
            || self.input_dir_name == self.target_dir_name
        {
            return fail("input and target directory names must be distinct and non-empty");
        }

        Ok(())
    }

    pub fn tiling_mode(&self) -> TilingMode {
        match (self.max_tile_size, self.split_enabled) {
            (0, _) => TilingMode::Whole,
            (max_size, false) => TilingMode::Crop { max_size },
            (max_size, true) => TilingMode::Split {
                max_size,
                step_rate: self.split_step_rate,
            },
        }
    }

    pub fn transform_stage(&self) -> TransformStage {
        TransformStage::new(self.input_transform, self.target_transform)
    }

    pub fn input_output_dir(&self) -> PathBuf {
        self.output_dir.join(&self.input_dir_name)
    }

    pub fn target_output_dir(&self) -> PathBuf {
        self.output_dir.join(&self.target_dir_name)
    }

    pub fn resolved_writer_threads(&self) -> usize {
        if self.writer_threads > 0 {
            return self.writer_threads;
        }
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }
}
