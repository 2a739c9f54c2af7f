//! Drives decoded pairs through validation, transforms and tiling, and hands
//! the resulting tiles to the writer pool.
//!
//! Every pair moves through [`PairStage`] in order. Desynchronized keys,
//! scale mismatches and misaligned tiles abort the whole run; an image with
//! an alpha channel only skips its pair. A run that aborts leaves the tiles
//! written so far in the output directories.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, trace, warn};

use crate::config::{ConvertConfig, TilingMode};
use crate::decode::{DecodeStream, DecodedPair, FileImageDecoder, ImageDecoder};
use crate::error::PairtileError;
use crate::key_index::{filename_to_key, IndexOptions, SampleIndex, SampleKey};
use crate::tiler::{crop_max, pair_crop_max, pair_split_image, split_image};
use crate::transform::TransformStage;
use crate::types::ImageTensor;
use crate::writer::{ImageFileWriter, TileWriter, WriterPool};

/// Called after each consumed pair with `(pairs_done, pairs_total)`.
pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairStage {
    Decoded,
    Validated,
    Transformed,
    Tiled,
    Dispatched,
}

impl fmt::Display for PairStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Decoded => "decoded",
            Self::Validated => "validated",
            Self::Transformed => "transformed",
            Self::Tiled => "tiled",
            Self::Dispatched => "dispatched",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pairs_total: usize,
    pub pairs_processed: u64,
    pub skipped_transparent: u64,
    pub tiles_written: u64,
}

/// Which output directory a tile belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileSide {
    Input,
    Target,
}

/// A tile ready for the writer, named relative to its side's directory.
#[derive(Debug, Clone)]
pub struct TileJob {
    pub side: TileSide,
    pub file_name: String,
    pub tile: ImageTensor,
}

#[derive(Debug, Clone)]
pub enum PairOutcome {
    Tiles(Vec<TileJob>),
    SkippedTransparent { filename: PathBuf },
}

/// `<key>.<ext>`, or `<key>.<NNN>.<ext>` for numbered split tiles.
pub fn make_output_name(key: &SampleKey, sequence: Option<usize>, extension: &str) -> String {
    match sequence {
        Some(number) => format!("{key}.{number:03}.{extension}"),
        None => format!("{key}.{extension}"),
    }
}

/// Validation, transforms and tiling for one pair. Stateless, so it can be
/// moved onto a blocking thread per pair.
#[derive(Debug, Clone, Copy)]
pub struct PairProcessor {
    pub transforms: TransformStage,
    pub tiling: TilingMode,
    pub scale_tolerance: f64,
    pub extension: &'static str,
}

impl PairProcessor {
    pub fn from_config(config: &ConvertConfig) -> Self {
        Self {
            transforms: config.transform_stage(),
            tiling: config.tiling_mode(),
            scale_tolerance: config.scale_tolerance,
            extension: config.tile_format.extension(),
        }
    }

    pub fn process(&self, pair: DecodedPair) -> Result<PairOutcome> {
        let key = pair.key.clone();
        let mut stage = PairStage::Decoded;
        self.advance(pair, &mut stage)
            .with_context(|| format!("pair '{key}' failed after stage '{stage}'"))
    }

    fn advance(&self, pair: DecodedPair, stage: &mut PairStage) -> Result<PairOutcome> {
        // Both sides of a record share a key, so their file stems must match.
        if let Some(x) = pair.x.as_ref() {
            let input_key = filename_to_key(&x.meta.filename, false);
            let target_key = filename_to_key(&pair.y.meta.filename, false);
            if input_key != target_key {
                return Err(PairtileError::Alignment {
                    input_key: input_key.to_string(),
                    target_key: target_key.to_string(),
                }
                .into());
            }
        }

        let transparent = std::iter::once(&pair.y)
            .chain(pair.x.as_ref())
            .find(|decoded| decoded.meta.has_alpha);
        if let Some(decoded) = transparent {
            return Ok(PairOutcome::SkippedTransparent {
                filename: decoded.meta.filename.clone(),
            });
        }
        *stage = PairStage::Validated;
        trace!(key = %pair.key, %stage);

        let key = pair.key;
        let y = self.transforms.apply_target(pair.y.image)?;
        let x = pair
            .x
            .map(|x| self.transforms.apply_input(x.image))
            .transpose()?;
        *stage = PairStage::Transformed;
        trace!(key = %key, %stage);

        let jobs = match x {
            Some(x) => self.tile_pair(&key, x, y)?,
            None => self.tile_single(&key, y),
        };
        *stage = PairStage::Tiled;
        trace!(key = %key, %stage, tiles = jobs.len());

        Ok(PairOutcome::Tiles(jobs))
    }

    fn tile_single(&self, key: &SampleKey, y: ImageTensor) -> Vec<TileJob> {
        match self.tiling {
            TilingMode::Whole => vec![self.job(TileSide::Target, key, None, y)],
            TilingMode::Crop { max_size } => {
                vec![self.job(TileSide::Target, key, None, crop_max(y, max_size))]
            }
            TilingMode::Split {
                max_size,
                step_rate,
            } => split_image(&y, max_size, step_rate)
                .enumerate()
                .map(|(number, tile)| self.job(TileSide::Target, key, Some(number), tile))
                .collect(),
        }
    }

    fn tile_pair(&self, key: &SampleKey, x: ImageTensor, y: ImageTensor) -> Result<Vec<TileJob>> {
        let jobs = match self.tiling {
            TilingMode::Whole => vec![
                self.job(TileSide::Input, key, None, x),
                self.job(TileSide::Target, key, None, y),
            ],
            TilingMode::Crop { max_size } => {
                let (x, y) = pair_crop_max(x, y, max_size, self.scale_tolerance)?;
                vec![
                    self.job(TileSide::Input, key, None, x),
                    self.job(TileSide::Target, key, None, y),
                ]
            }
            TilingMode::Split {
                max_size,
                step_rate,
            } => {
                let tiles = pair_split_image(&x, &y, max_size, step_rate, self.scale_tolerance)?;
                let mut jobs = Vec::with_capacity(tiles.len() * 2);
                for (number, (x_tile, y_tile)) in tiles.iter().enumerate() {
                    jobs.push(self.job(TileSide::Input, key, Some(number), x_tile));
                    jobs.push(self.job(TileSide::Target, key, Some(number), y_tile));
                }
                jobs
            }
        };
        Ok(jobs)
    }

    fn job(
        &self,
        side: TileSide,
        key: &SampleKey,
        sequence: Option<usize>,
        tile: ImageTensor,
    ) -> TileJob {
        TileJob {
            side,
            file_name: make_output_name(key, sequence, self.extension),
            tile,
        }
    }
}

/// Output directories of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDirs {
    pub input: Option<PathBuf>,
    pub target: PathBuf,
}

impl OutputDirs {
    pub fn path_for(&self, side: TileSide, file_name: &str) -> Result<PathBuf> {
        match side {
            TileSide::Target => Ok(self.target.join(file_name)),
            TileSide::Input => self
                .input
                .as_ref()
                .map(|dir| dir.join(file_name))
                .ok_or_else(|| anyhow!("input tile '{file_name}' produced without an input directory")),
        }
    }
}

/// Clear and recreate the tile directories. The input directory is removed
/// even without an input collection so stale tiles cannot mix with new ones.
pub fn prepare_output_dirs(config: &ConvertConfig, has_input: bool) -> Result<OutputDirs> {
    fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "failed to create output directory: {}",
            config.output_dir.display()
        )
    })?;

    let input_dir = config.input_output_dir();
    let target_dir = config.target_output_dir();
    for dir in [&input_dir, &target_dir] {
        remove_dir_if_exists(dir)?;
    }

    fs::create_dir_all(&target_dir)
        .with_context(|| format!("failed to create directory: {}", target_dir.display()))?;
    if has_input {
        fs::create_dir_all(&input_dir)
            .with_context(|| format!("failed to create directory: {}", input_dir.display()))?;
    }

    Ok(OutputDirs {
        input: has_input.then_some(input_dir),
        target: target_dir,
    })
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("failed to clear directory: {}", dir.display()))?;
    }
    Ok(())
}

/// A full conversion run: index, decode, tile, write.
pub struct ConvertPipeline<D: ImageDecoder> {
    config: ConvertConfig,
    decoder: Arc<D>,
    writer: Arc<dyn TileWriter>,
    progress: Option<ProgressCallback>,
}

impl ConvertPipeline<FileImageDecoder> {
    /// Decode with the `image` crate and write in the configured tile format.
    pub fn from_config(config: ConvertConfig) -> Self {
        let writer = ImageFileWriter::new(config.tile_format);
        Self::new(config, Arc::new(FileImageDecoder), Arc::new(writer))
    }
}

impl<D: ImageDecoder> ConvertPipeline<D> {
    pub fn new(config: ConvertConfig, decoder: Arc<D>, writer: Arc<dyn TileWriter>) -> Self {
        Self {
            config,
            decoder,
            writer,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    pub async fn run(self) -> Result<RunSummary> {
        let started = Instant::now();
        let config = self.config;
        config.validate()?;

        let index = SampleIndex::load(
            &config.target,
            config.input.as_deref(),
            IndexOptions {
                recursive: config.recursive,
                include_subdir: config.key_includes_subdir,
            },
        )?;
        info!(
            pairs = index.len(),
            paired = index.has_input(),
            tiling = ?config.tiling_mode(),
            "Indexed source collections"
        );

        let dirs = prepare_output_dirs(&config, index.has_input())?;
        let processor = PairProcessor::from_config(&config);
        let mut summary = RunSummary {
            pairs_total: index.len(),
            ..Default::default()
        };

        let mut stream = DecodeStream::spawn(self.decoder, index.into_records(), config.queue_size);
        let mut pool = WriterPool::new(self.writer, config.resolved_writer_threads());

        let consumed = consume_pairs(
            &mut stream,
            &mut pool,
            processor,
            &dirs,
            &mut summary,
            self.progress.as_deref(),
        )
        .await;
        let decoder_exit = stream.finish().await;
        let drained = pool.drain().await;

        consumed?;
        decoder_exit?;
        summary.tiles_written = drained?;

        info!(
            pairs = summary.pairs_processed,
            skipped_transparent = summary.skipped_transparent,
            tiles = summary.tiles_written,
            elapsed_s = format!("{:.1}", started.elapsed().as_secs_f64()),
            "Conversion finished"
        );
        Ok(summary)
    }
}

async fn consume_pairs(
    stream: &mut DecodeStream,
    pool: &mut WriterPool,
    processor: PairProcessor,
    dirs: &OutputDirs,
    summary: &mut RunSummary,
    progress: Option<&(dyn Fn(usize, usize) + Send)>,
) -> Result<()> {
    let total = stream.total();
    let mut done = 0_usize;

    while let Some(decoded) = stream.recv().await {
        let pair = decoded?;
        let key = pair.key.clone();

        let outcome = tokio::task::spawn_blocking(move || processor.process(pair))
            .await
            .map_err(|join_error| anyhow!("tiling task for '{key}' panicked: {join_error}"))??;

        match outcome {
            PairOutcome::SkippedTransparent { filename } => {
                warn!(key = %key, file = %filename.display(), "Skipping transparent image");
                summary.skipped_transparent += 1;
            }
            PairOutcome::Tiles(jobs) => {
                let tiles = jobs.len();
                for job in jobs {
                    let path = dirs.path_for(job.side, &job.file_name)?;
                    pool.submit(job.tile, path).await?;
                }
                summary.pairs_processed += 1;
                debug!(key = %key, tiles, stage = %PairStage::Dispatched, "Pair dispatched");
            }
        }

        done += 1;
        if let Some(progress) = progress {
            progress(done, total);
        }
    }

    Ok(())
}
