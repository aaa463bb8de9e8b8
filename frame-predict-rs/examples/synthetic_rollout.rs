//! Predict bouncing squares with a randomly initialized model.
//!
//! This example demonstrates:
//! - Building a model from a preset
//! - Writing and re-reading a parameter file
//! - Running the inference driver on synthetic clips
//! - Rendering input / prediction / ground truth grids
//!
//! Usage:
//!   cargo run --example synthetic_rollout --release

use std::path::PathBuf;

use candle_core::Device;
use tempfile::TempDir;

use frame_predict_rs::data::{DataSourceConfig, MovingShapesConfig};
use frame_predict_rs::prelude::*;

fn main() -> anyhow::Result<()> {
    println!("=== Synthetic Rollout ===\n");

    let workdir = TempDir::new()?;
    let params_path = workdir.path().join("convgru.safetensors");
    let output_dir = PathBuf::from("predictions/synthetic_rollout");

    // Untrained weights stand in for a checkpoint.
    let model_config = ModelConfig::test();
    let model = EncoderDecoder::new(&model_config, &Device::Cpu)?;
    model.var_map().save(&params_path)?;

    println!("Model:");
    println!("  Frame: {}", model_config.frame);
    println!("  Stages: {}", model.num_stages());
    println!("  Parameters: {}", model.parameter_count());

    let mut config = RunConfig::new(&params_path)
        .with_model(model_config)
        .with_batch_size(2)
        .with_output_dir(&output_dir)
        .with_data(DataSourceConfig::MovingShapes(MovingShapesConfig {
            num_objects: 2,
            sprite_size: 4,
            num_batches: 2,
            seed: 7,
        }));
    config.max_batches = 2;
    config.samples_per_batch = 2;

    let mut sinks: Vec<Box<dyn PredictionSink>> = vec![
        Box::new(MetricsSink::new()),
        Box::new(PngGridRenderer::new(&output_dir)?),
    ];
    let summary = InferenceDriver::new(config)?
        .with_progress(true)
        .run(&mut sinks)?;

    println!("\nResults:");
    for (batch, sample, mse) in &summary.sample_mse {
        println!("  batch {batch} sample {sample}: mse {mse:.5}");
    }
    println!("  Elapsed: {:.2?}", summary.elapsed);
    println!("  Grids in: {}", output_dir.display());

    Ok(())
}
