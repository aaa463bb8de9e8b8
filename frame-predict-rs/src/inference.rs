//! Inference driver.
//!
//! Loads trained parameters, switches the model to inference mode, pulls
//! batches from a [`SequenceSource`] and hands `(input, prediction, ground
//! truth)` triples to a [`PredictionSink`]. Any error aborts the run.

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::data::{FrameSequence, SequenceSource};
use crate::error::PredictResult;
use crate::model::EncoderDecoder;
use crate::visualize::{PredictionSink, SampleTriple};

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSummary {
    /// Batches predicted
    pub batches: usize,
    /// Samples forwarded to the sink
    pub samples: usize,
    /// `(batch, sample, mse)` for every forwarded sample
    pub sample_mse: Vec<(usize, usize, f32)>,
    /// Wall-clock time of the prediction loop
    pub elapsed: Duration,
}

impl InferenceSummary {
    /// Mean MSE over forwarded samples.
    pub fn mean_mse(&self) -> Option<f32> {
        if self.sample_mse.is_empty() {
            return None;
        }
        let total: f32 = self.sample_mse.iter().map(|(_, _, mse)| mse).sum();
        Some(total / self.sample_mse.len() as f32)
    }
}

/// Runs a configured prediction job.
pub struct InferenceDriver {
    config: RunConfig,
    show_progress: bool,
}

impl InferenceDriver {
    /// Create a driver for a validated run configuration.
    pub fn new(config: RunConfig) -> PredictResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            show_progress: false,
        })
    }

    /// Show a progress bar over batches.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Build the model from the configured parameter file, open the data
    /// source and predict.
    pub fn run(&self, sink: &mut dyn PredictionSink) -> PredictResult<InferenceSummary> {
        let device = self.config.device.device()?;
        info!(device = %self.config.device, "Starting inference run");

        let params = self.config.load_parameters(&device)?;
        let mut model = EncoderDecoder::new(&self.config.model, &device)?;
        model.load_parameters(&params)?;
        let model = model.into_inference()?;
        info!(
            stages = model.num_stages(),
            parameters = model.parameter_count(),
            "Model ready"
        );

        let mut source = self
            .config
            .data
            .open(&self.config.model, self.config.batch_size, &device)?;
        self.run_with(&model, source.as_mut(), sink)
    }

    /// Predict with an already-built model and source.
    pub fn run_with(
        &self,
        model: &EncoderDecoder,
        source: &mut dyn SequenceSource,
        sink: &mut dyn PredictionSink,
    ) -> PredictResult<InferenceSummary> {
        let total = source
            .len_hint()
            .map_or(self.config.max_batches, |n| n.min(self.config.max_batches));
        let pb = self.progress_bar(total)?;

        let start = Instant::now();
        let mut summary = InferenceSummary {
            batches: 0,
            samples: 0,
            sample_mse: Vec::new(),
            elapsed: Duration::ZERO,
        };

        while summary.batches < self.config.max_batches {
            let Some(batch) = source.next_batch() else {
                break;
            };
            let batch = batch?;
            let batch_index = summary.batches;

            let prediction = model.predict(&batch.input)?;
            debug!(batch = batch_index, shape = ?prediction.dims(), "Predicted batch");

            let samples = self.config.samples_per_batch.min(batch.batch_size());
            for sample_index in 0..samples {
                let triple = SampleTriple {
                    batch_index,
                    sample_index,
                    input: FrameSequence::from_batch(&batch.input, sample_index)?,
                    prediction: FrameSequence::from_batch(&prediction, sample_index)?,
                    target: FrameSequence::from_batch(&batch.target, sample_index)?,
                };
                summary
                    .sample_mse
                    .push((batch_index, sample_index, triple.mse()?));
                sink.consume(&triple)?;
                summary.samples += 1;
            }

            summary.batches += 1;
            pb.inc(1);
        }

        sink.finish()?;
        pb.finish_with_message("done");
        summary.elapsed = start.elapsed();

        info!(
            batches = summary.batches,
            samples = summary.samples,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Inference run complete"
        );
        Ok(summary)
    }

    fn progress_bar(&self, total: usize) -> PredictResult<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(concat!(
                    "{spinner:.green} [{elapsed_precise}] ",
                    "[{wide_bar:.cyan/blue}] {pos}/{len} batches {msg}"
                ))?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }
}
