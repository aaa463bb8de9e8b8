//! CLI entry point for frame-predict-rs.

use std::path::PathBuf;

use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use frame_predict_rs::config::{DeviceSpec, ModelConfig, RunConfig};
use frame_predict_rs::error::PredictResult;
use frame_predict_rs::inference::InferenceDriver;
use frame_predict_rs::params::ParameterSet;
use frame_predict_rs::visualize::{MetricsSink, PngGridRenderer, PredictionSink};

#[derive(Parser)]
#[command(name = "frame-predict")]
#[command(about = "ConvGRU encoder-decoder video frame prediction")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Predict future frames and render input / prediction / ground truth grids
    Predict {
        /// Path to run configuration file
        config: PathBuf,
        /// Override the configured device (cpu, cuda:N, metal:N, auto)
        #[arg(long)]
        device: Option<DeviceSpec>,
        /// Override the output directory
        #[arg(long)]
        output: Option<PathBuf>,
        /// Only log metrics, do not write images
        #[arg(long)]
        no_render: bool,
        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },
    /// Validate a run configuration file
    Validate {
        /// Path to run configuration file
        config: PathBuf,
    },
    /// List the tensors of a parameter file, optionally checking them
    /// against a run configuration
    Inspect {
        /// Path to safetensors parameter file
        parameters: PathBuf,
        /// Run configuration whose model the file must satisfy
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Generate a sample run configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "predict.yaml")]
        output: PathBuf,
        /// Model preset (moving-mnist, test)
        #[arg(long, default_value = "moving-mnist")]
        preset: String,
        /// Parameter file referenced by the generated config
        #[arg(long, default_value = "convgru.safetensors")]
        parameters: PathBuf,
    },
}

fn main() -> PredictResult<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Predict {
            config,
            device,
            output,
            no_render,
            progress,
        } => {
            tracing::info!("Running prediction with config: {}", config.display());
            let mut config = RunConfig::from_file(&config)?;
            if let Some(device) = device {
                config.device = device;
            }
            if let Some(output) = output {
                config.output_dir = output;
            }

            let mut sinks: Vec<Box<dyn PredictionSink>> = vec![Box::new(MetricsSink::new())];
            if !no_render {
                sinks.push(Box::new(PngGridRenderer::new(&config.output_dir)?));
            }

            let output_dir = config.output_dir.clone();
            let driver = InferenceDriver::new(config)?.with_progress(progress);
            let summary = driver.run(&mut sinks)?;

            println!(
                "✓ Predicted {} batch(es), {} sample(s) in {:.2?}",
                summary.batches, summary.samples, summary.elapsed
            );
            if let Some(mse) = summary.mean_mse() {
                println!("  Mean MSE: {mse:.6}");
            }
            if !no_render {
                println!("  Grids written to: {}", output_dir.display());
            }
        }
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = RunConfig::from_file(&config)?;
            config.validate()?;
            let shapes = config.model.stage_shapes()?;
            println!("✓ Configuration is valid");
            println!("  Frame: {}", config.model.frame);
            println!(
                "  Frames: {} in, {} out",
                config.model.input_frames, config.model.output_frames
            );
            for (k, shape) in shapes.iter().enumerate() {
                println!("  Stage {k}: hidden state {shape}");
            }
            println!("  Parameters: {}", config.model.parameter_count());
            println!("  Decoder input: {:?}", config.model.decoder.input);
        }
        Commands::Inspect { parameters, config } => {
            let params = ParameterSet::from_safetensors(&parameters, &Device::Cpu)?;
            println!(
                "{} tensor(s), format version {}",
                params.len(),
                params.format_version().unwrap_or("unversioned")
            );
            for name in params.names() {
                if let Some(tensor) = params.get(name) {
                    println!("  {name}: {:?} {:?}", tensor.dims(), tensor.dtype());
                }
            }
            if let Some(config) = config {
                let mut config = RunConfig::from_file(&config)?;
                config.parameters = parameters;
                config.validate()?;
                config
                    .load_parameters(&Device::Cpu)?
                    .select(&config.model)?;
                println!("✓ Parameters match the model configuration");
            }
        }
        Commands::Init {
            output,
            preset,
            parameters,
        } => {
            tracing::info!("Generating config for preset: {}", preset);
            let model = ModelConfig::from_preset(&preset)?;
            let config = RunConfig::new(parameters).with_model(model);
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
    }

    Ok(())
}
