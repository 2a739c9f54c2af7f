use std::path::PathBuf;

use thiserror::Error;

/// Failures with a meaning callers may need to tell apart.
///
/// Library functions return `anyhow::Result`; these values travel as the root
/// cause and can be recovered with `error.downcast_ref::<PairtileError>()`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PairtileError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("duplicate key '{key}': {first} and {second}")]
    DuplicateKey {
        key: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("{key} does not exist on the input side")]
    MissingPair { key: String },

    #[error("decode streams out of sync: input '{input_key}' paired with target '{target_key}'")]
    Alignment {
        input_key: String,
        target_key: String,
    },

    #[error(
        "unpredictable scale: low-res ({low_h},{low_w}), high-res ({high_h},{high_w}) \
         (ratio_h={ratio_h}, ratio_w={ratio_w})"
    )]
    ScaleMismatch {
        low_h: usize,
        low_w: usize,
        high_h: usize,
        high_w: usize,
        ratio_h: f64,
        ratio_w: f64,
    },

    #[error("tile at ({row},{col}) size {height}x{width} does not map exactly at scale {scale}")]
    TileAlignment {
        row: usize,
        col: usize,
        height: usize,
        width: usize,
        scale: f64,
    },

    #[error("padding {padding} is too large for a {height}x{width} image in {mode} mode")]
    InvalidPadding {
        padding: usize,
        height: usize,
        width: usize,
        mode: &'static str,
    },
}

impl PairtileError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
