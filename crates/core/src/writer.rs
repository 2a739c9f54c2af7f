//! Tile persistence and the bounded pool that runs writes off the pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::config::TileFormat;
use crate::types::ImageTensor;

/// Persists one tile.
pub trait TileWriter: Send + Sync + 'static {
    fn write(&self, tile: &ImageTensor, path: &Path) -> Result<()>;
}

/// Writes 8-bit image files with the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFileWriter {
    format: TileFormat,
}

impl ImageFileWriter {
    pub fn new(format: TileFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> TileFormat {
        self.format
    }
}

impl TileWriter for ImageFileWriter {
    fn write(&self, tile: &ImageTensor, path: &Path) -> Result<()> {
        let image = tensor_to_dynamic(tile)?;
        let format = match self.format {
            TileFormat::Png => ImageFormat::Png,
            TileFormat::Tiff => ImageFormat::Tiff,
        };
        image
            .save_with_format(path, format)
            .with_context(|| format!("failed to write tile: {}", path.display()))
    }
}

fn quantize(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn tensor_to_dynamic(tile: &ImageTensor) -> Result<DynamicImage> {
    let view = tile.view();
    let (width, height) = (tile.width() as u32, tile.height() as u32);

    match tile.channels() {
        1 => Ok(DynamicImage::ImageLuma8(GrayImage::from_fn(
            width,
            height,
            |x, y| image::Luma([quantize(view[[0, y as usize, x as usize]])]),
        ))),
        3 => Ok(DynamicImage::ImageRgb8(RgbImage::from_fn(
            width,
            height,
            |x, y| {
                let (x, y) = (x as usize, y as usize);
                image::Rgb([
                    quantize(view[[0, y, x]]),
                    quantize(view[[1, y, x]]),
                    quantize(view[[2, y, x]]),
                ])
            },
        ))),
        channels => bail!("cannot encode a tile with {channels} channels"),
    }
}

/// Runs tile writes on blocking threads, at most `threads` at a time.
///
/// Callers must [`drain`](WriterPool::drain) the pool before reporting
/// success; dropping it detaches writes that are still running.
pub struct WriterPool {
    writer: Arc<dyn TileWriter>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<Result<()>>,
    submitted: u64,
    completed: u64,
}

impl WriterPool {
    pub fn new(writer: Arc<dyn TileWriter>, threads: usize) -> Self {
        Self {
            writer,
            permits: Arc::new(Semaphore::new(threads.max(1))),
            tasks: JoinSet::new(),
            submitted: 0,
            completed: 0,
        }
    }

    /// Queue a write, waiting while every worker is busy. Returns the error
    /// of any write that already failed.
    pub async fn submit(&mut self, tile: ImageTensor, path: PathBuf) -> Result<()> {
        self.reap_finished()?;

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("writer pool is closed")?;
        let writer = Arc::clone(&self.writer);
        self.tasks.spawn_blocking(move || {
            let _permit = permit;
            writer.write(&tile, &path)
        });
        self.submitted += 1;
        Ok(())
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    fn reap_finished(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined)?;
        }
        Ok(())
    }

    fn record(&mut self, joined: Result<Result<()>, JoinError>) -> Result<()> {
        joined.map_err(|join_error| anyhow!("tile writer task panicked: {join_error}"))??;
        self.completed += 1;
        Ok(())
    }

    /// Wait for every submitted write. Returns the number written, or the
    /// first failure once all writes have settled.
    pub async fn drain(mut self) -> Result<u64> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(error) = self.record(joined) {
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(self.completed),
        }
    }
}
