//! Image decoding and the producer that feeds matched pairs to the pipeline.
//!
//! A single blocking task decodes the input and target image of each record
//! and sends them together through one bounded channel. Two independently
//! bounded per-side queues consumed in lockstep can deadlock once their fill
//! levels diverge; one queue of already-matched pairs cannot.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::Array3;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::key_index::{SampleKey, SampleRecord};
use crate::types::{ImageTensor, Metadata};

/// Pixels plus metadata for one source file.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub image: ImageTensor,
    pub meta: Metadata,
}

/// Turns a source path into an [`ImageTensor`].
pub trait ImageDecoder: Send + Sync + 'static {
    fn decode(&self, path: &Path) -> Result<Decoded>;
}

/// Decodes files with the `image` crate into 3-channel float tensors.
///
/// Alpha is dropped from the pixels but reported in [`Metadata::has_alpha`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageDecoder;

impl ImageDecoder for FileImageDecoder {
    fn decode(&self, path: &Path) -> Result<Decoded> {
        let image = image::open(path)
            .with_context(|| format!("failed to decode image: {}", path.display()))?;
        let has_alpha = image.color().has_alpha();
        let tensor = dynamic_to_tensor(&image)
            .with_context(|| format!("failed to convert image: {}", path.display()))?;

        Ok(Decoded {
            image: tensor,
            meta: Metadata::new(path, has_alpha),
        })
    }
}

fn dynamic_to_tensor(image: &DynamicImage) -> Result<ImageTensor> {
    let (width, height) = image.dimensions();
    let rgb = image.to_rgb32f();
    let hwc = Array3::from_shape_vec((height as usize, width as usize, 3), rgb.into_raw())?;
    let chw = hwc.permuted_axes([2, 0, 1]).as_standard_layout().into_owned();
    Ok(ImageTensor::new(chw))
}

/// Decoded images of one record, in key order.
#[derive(Debug, Clone)]
pub struct DecodedPair {
    pub key: SampleKey,
    pub x: Option<Decoded>,
    pub y: Decoded,
}

/// Receiving end of a running paired decoder.
pub struct DecodeStream {
    receiver: mpsc::Receiver<Result<DecodedPair>>,
    handle: JoinHandle<()>,
    total: usize,
}

impl DecodeStream {
    /// Decode `records` in order on a blocking task, keeping at most
    /// `queue_size` pairs buffered ahead of the consumer.
    pub fn spawn<D: ImageDecoder>(
        decoder: Arc<D>,
        records: Vec<SampleRecord>,
        queue_size: usize,
    ) -> Self {
        let total = records.len();
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let handle = tokio::task::spawn_blocking(move || {
            run_decoder_loop(decoder.as_ref(), records, sender);
        });

        Self {
            receiver,
            handle,
            total,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Next decoded pair, or `None` once every record was delivered or the
    /// producer stopped after reporting an error.
    pub async fn recv(&mut self) -> Option<Result<DecodedPair>> {
        self.receiver.recv().await
    }

    /// Stop the producer (if still running) and wait for it to exit.
    pub async fn finish(self) -> Result<()> {
        drop(self.receiver);
        self.handle
            .await
            .map_err(|join_error| anyhow!("decoder task panicked: {join_error}"))
    }
}

fn run_decoder_loop<D: ImageDecoder + ?Sized>(
    decoder: &D,
    records: Vec<SampleRecord>,
    sender: mpsc::Sender<Result<DecodedPair>>,
) {
    let mut decoded_count = 0_u64;
    let mut total_decode_ms = 0.0_f64;
    let mut total_send_ms = 0.0_f64;

    for record in records {
        let t_decode = Instant::now();
        let pair = decode_record(decoder, record);
        total_decode_ms += t_decode.elapsed().as_secs_f64() * 1000.0;

        let failed = pair.is_err();
        let t_send = Instant::now();
        if sender.blocking_send(pair).is_err() || failed {
            break;
        }
        total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;
        decoded_count += 1;
    }

    if decoded_count > 0 {
        tracing::debug!(
            pairs = decoded_count,
            avg_decode_ms = format!("{:.1}", total_decode_ms / decoded_count as f64),
            avg_send_wait_ms = format!("{:.1}", total_send_ms / decoded_count as f64),
            "Decoder summary"
        );
    }
}

fn decode_record<D: ImageDecoder + ?Sized>(
    decoder: &D,
    record: SampleRecord,
) -> Result<DecodedPair> {
    let x = record
        .input
        .as_ref()
        .map(|entry| decoder.decode(&entry.path))
        .transpose()
        .with_context(|| format!("failed to decode input image for '{}'", record.key))?;
    let y = decoder
        .decode(&record.target.path)
        .with_context(|| format!("failed to decode target image for '{}'", record.key))?;

    Ok(DecodedPair {
        key: record.key,
        x,
        y,
    })
}
