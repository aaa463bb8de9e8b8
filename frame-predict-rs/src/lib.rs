//! Video frame prediction with a ConvGRU encoder-decoder.
//!
//! This crate implements spatiotemporal frame prediction in pure Rust on
//! candle, providing:
//! - A convolutional GRU cell whose hidden state keeps its spatial layout
//! - A multi-resolution encoder that summarizes an observed clip
//! - An autoregressive decoder that rolls the summary forward into future frames
//! - Strict loading of trained parameters from safetensors files
//! - An inference driver with synthetic and file-backed clip sources and
//!   PNG grid rendering
//!
//! # Example
//!
//! ```no_run
//! use frame_predict_rs::{EncoderDecoder, ModelConfig};
//! use candle_core::{Device, Tensor};
//!
//! let config = ModelConfig::moving_mnist();
//! let device = Device::Cpu;
//! let model = EncoderDecoder::new(&config, &device).unwrap();
//!
//! let clip = Tensor::zeros((1, 10, 1, 64, 64), candle_core::DType::F32, &device).unwrap();
//! let future = model.predict(&clip).unwrap();
//! assert_eq!(future.dims(), &[1, 10, 1, 64, 64]);
//! ```
//!
//! # Inference runs
//!
//! A [`RunConfig`] names the model, the parameter file, the device and the
//! clip source. The [`InferenceDriver`] loads everything and hands each
//! `(input, prediction, ground truth)` triple to a [`PredictionSink`]:
//!
//! ```no_run
//! use frame_predict_rs::prelude::*;
//!
//! let config = RunConfig::new("convgru.safetensors");
//! let mut renderer = PngGridRenderer::new("predictions").unwrap();
//! let summary = InferenceDriver::new(config).unwrap().run(&mut renderer).unwrap();
//! println!("{} samples", summary.samples);
//! ```

pub mod cell;
pub mod config;
pub mod data;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod inference;
pub mod layers;
pub mod model;
pub mod params;
pub mod visualize;

pub use cell::{ConvGruCell, StageState};
pub use config::{
    Activation, CellConfig, DecoderConfig, DecoderInput, DecoderStageConfig, DeviceSpec,
    EncoderStageConfig, FrameShape, LayerKind, LayerSpec, ModelConfig, RunConfig,
};
pub use data::{
    ClipFileSource, DataSourceConfig, FrameBatch, FrameSequence, MovingShapes,
    MovingShapesConfig, SequenceSource,
};
pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::{PredictError, PredictResult};
pub use inference::{InferenceDriver, InferenceSummary};
pub use model::EncoderDecoder;
pub use params::{NameMap, ParameterNaming, ParameterSet};
pub use visualize::{MetricsSink, PngGridRenderer, PredictionSink, SampleTriple};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{DeviceSpec, FrameShape, ModelConfig, RunConfig};
    pub use crate::data::{DataSourceConfig, FrameBatch, FrameSequence, SequenceSource};
    pub use crate::error::{PredictError, PredictResult};
    pub use crate::inference::{InferenceDriver, InferenceSummary};
    pub use crate::model::EncoderDecoder;
    pub use crate::params::{ParameterNaming, ParameterSet};
    pub use crate::visualize::{MetricsSink, PngGridRenderer, PredictionSink, SampleTriple};
}
