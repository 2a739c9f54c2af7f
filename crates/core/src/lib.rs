//! Core crate for pairtile: pairs low-res and high-res images by key and
//! cuts them into aligned training tiles.

pub mod config;
pub mod decode;
pub mod error;
pub mod key_index;
pub mod logging;
pub mod pipeline;
pub mod tiler;
pub mod transform;
pub mod types;
pub mod writer;

pub use config::{ConvertConfig, TileFormat, TilingMode};
pub use error::PairtileError;
pub use pipeline::{ConvertPipeline, RunSummary};
