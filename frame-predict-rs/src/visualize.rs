//! Sinks for `(input, prediction, ground truth)` triples.
//!
//! [`PngGridRenderer`] writes one grayscale image per sample with three
//! rows: observed frames, predicted frames, ground truth. Every frame is
//! min-max normalized on its own. Frames and rows are separated by a gray
//! gutter, which also fills the cells of rows shorter than the longest one.
//! The image carries no text; batch and sample indices are in the file name.

use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use image::GrayImage;
use tracing::info;

use crate::data::FrameSequence;
use crate::error::PredictResult;

/// One sample handed to a [`PredictionSink`].
#[derive(Debug, Clone)]
pub struct SampleTriple {
    /// Index of the batch within the run
    pub batch_index: usize,
    /// Index of the sample within its batch
    pub sample_index: usize,
    /// Observed frames
    pub input: FrameSequence,
    /// Predicted frames
    pub prediction: FrameSequence,
    /// Ground-truth frames
    pub target: FrameSequence,
}

impl SampleTriple {
    /// Mean squared error between prediction and ground truth.
    pub fn mse(&self) -> PredictResult<f32> {
        let diff = (self.prediction.frames() - self.target.frames())?;
        let mse = diff.sqr()?.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        Ok(mse)
    }
}

/// Receives prediction triples from the inference driver.
pub trait PredictionSink {
    /// Handle one sample.
    fn consume(&mut self, sample: &SampleTriple) -> PredictResult<()>;

    /// Called once after the last sample.
    fn finish(&mut self) -> PredictResult<()> {
        Ok(())
    }
}

impl PredictionSink for Vec<Box<dyn PredictionSink>> {
    fn consume(&mut self, sample: &SampleTriple) -> PredictResult<()> {
        self.iter_mut().try_for_each(|sink| sink.consume(sample))
    }

    fn finish(&mut self) -> PredictResult<()> {
        self.iter_mut().try_for_each(|sink| sink.finish())
    }
}

/// Map a `(C, H, W)` frame to 8-bit grayscale, row-major `H * W`.
///
/// Channels are averaged, then values are stretched so the frame minimum is
/// 0 and its maximum 255. Constant frames render black.
pub fn normalize_frame(frame: &Tensor) -> PredictResult<Vec<u8>> {
    let (_, h, w) = frame.dims3()?;
    let gray = frame.to_dtype(DType::F32)?.mean(0)?;
    let values: Vec<f32> = gray.flatten_all()?.to_vec1()?;
    debug_assert_eq!(values.len(), h * w);

    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;

    let pixels = if range > 0.0 && range.is_finite() {
        values
            .iter()
            .map(|&v| (((v - min) / range) * 255.0).round().clamp(0.0, 255.0) as u8)
            .collect()
    } else {
        vec![0u8; values.len()]
    };
    Ok(pixels)
}

/// Width of the gray band between frames and between rows, in pixels.
pub const GRID_GUTTER: u32 = 2;

/// Gray level of the gutter and of empty cells.
pub const GUTTER_SHADE: u8 = 128;

/// Writes `batch{b}_sample{s}.png` grids into a directory.
pub struct PngGridRenderer {
    output_dir: PathBuf,
    written: Vec<PathBuf>,
}

impl PngGridRenderer {
    /// Create the renderer, creating `output_dir` if needed.
    pub fn new<P: AsRef<Path>>(output_dir: P) -> PredictResult<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self {
            output_dir,
            written: Vec::new(),
        })
    }

    /// Files written so far.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// Grid image for one sample.
    pub fn render(sample: &SampleTriple) -> PredictResult<GrayImage> {
        let shape = sample.input.frame_shape();
        let (h, w) = (shape.height as u32, shape.width as u32);
        let rows = [&sample.input, &sample.prediction, &sample.target];
        let columns = rows.iter().map(|seq| seq.len()).max().unwrap_or(0) as u32;
        let (cell_w, cell_h) = (w + GRID_GUTTER, h + GRID_GUTTER);

        let mut image = GrayImage::from_pixel(
            (columns * cell_w).saturating_sub(GRID_GUTTER),
            3 * cell_h - GRID_GUTTER,
            image::Luma([GUTTER_SHADE]),
        );
        for (row, sequence) in rows.iter().enumerate() {
            for t in 0..sequence.len() {
                let pixels = normalize_frame(&sequence.frame(t)?)?;
                let (x0, y0) = (t as u32 * cell_w, row as u32 * cell_h);
                for (i, value) in pixels.into_iter().enumerate() {
                    let (x, y) = (i as u32 % w, i as u32 / w);
                    image.put_pixel(x0 + x, y0 + y, image::Luma([value]));
                }
            }
        }
        Ok(image)
    }
}

impl PredictionSink for PngGridRenderer {
    fn consume(&mut self, sample: &SampleTriple) -> PredictResult<()> {
        let path = self.output_dir.join(format!(
            "batch{}_sample{}.png",
            sample.batch_index, sample.sample_index
        ));
        Self::render(sample)?.save(&path)?;
        info!(path = %path.display(), "Wrote prediction grid");
        self.written.push(path);
        Ok(())
    }
}

/// Logs per-sample MSE and keeps a record of it.
#[derive(Debug, Default)]
pub struct MetricsSink {
    records: Vec<(usize, usize, f32)>,
}

impl MetricsSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(batch, sample, mse)` for every consumed sample.
    pub fn records(&self) -> &[(usize, usize, f32)] {
        &self.records
    }

    /// Mean of the recorded MSE values, `None` if nothing was recorded.
    pub fn mean_mse(&self) -> Option<f32> {
        if self.records.is_empty() {
            return None;
        }
        let total: f32 = self.records.iter().map(|(_, _, mse)| mse).sum();
        Some(total / self.records.len() as f32)
    }
}

impl PredictionSink for MetricsSink {
    fn consume(&mut self, sample: &SampleTriple) -> PredictResult<()> {
        let mse = sample.mse()?;
        info!(
            batch = sample.batch_index,
            sample = sample.sample_index,
            mse,
            "Prediction error"
        );
        self.records.push((sample.batch_index, sample.sample_index, mse));
        Ok(())
    }

    fn finish(&mut self) -> PredictResult<()> {
        if let Some(mean) = self.mean_mse() {
            info!(samples = self.records.len(), mean_mse = mean, "Run metrics");
        }
        Ok(())
    }
}
