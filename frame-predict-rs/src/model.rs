//! ConvGRU encoder-decoder.
//!
//! Implements the full model with:
//! - Multi-resolution recurrent encoder
//! - Autoregressive decoder seeded with the encoder states
//! - Strict parameter loading and a detached inference mode

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::data::FrameSequence;
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::{PredictError, PredictResult};
use crate::params::ParameterSet;

/// Encoder-decoder frame predictor.
pub struct EncoderDecoder {
    encoder: Encoder,
    decoder: Decoder,
    config: ModelConfig,
    device: Device,
    /// Trainable variables; empty once in inference mode
    var_map: VarMap,
    inference: bool,
}

impl EncoderDecoder {
    /// Create a new model with random initialization.
    ///
    /// # Errors
    /// [`PredictError::InvalidConfig`] if `config` does not validate.
    pub fn new(config: &ModelConfig, device: &Device) -> PredictResult<Self> {
        config.validate()?;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        Self::from_varbuilder(config, vb, device, var_map, false)
    }

    /// Create an inference-mode model directly from trained parameters.
    ///
    /// # Errors
    /// Configuration errors, [`PredictError::MissingParameter`] and
    /// [`PredictError::ShapeMismatch`].
    pub fn from_parameters(
        config: &ModelConfig,
        params: &ParameterSet,
        device: &Device,
    ) -> PredictResult<Self> {
        config.validate()?;
        let tensors = params
            .select(config)?
            .into_iter()
            .map(|(name, t)| Ok((name, t.to_device(device)?)))
            .collect::<PredictResult<HashMap<_, _>>>()?;
        Self::from_tensors(config, tensors, device)
    }

    fn from_tensors(
        config: &ModelConfig,
        tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> PredictResult<Self> {
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::from_varbuilder(config, vb, device, VarMap::new(), true)
    }

    fn from_varbuilder(
        config: &ModelConfig,
        vb: VarBuilder,
        device: &Device,
        var_map: VarMap,
        inference: bool,
    ) -> PredictResult<Self> {
        let encoder = Encoder::new(config, vb.pp("encoder"))?;
        let decoder = Decoder::new(config, vb.pp("decoder"))?;

        Ok(Self {
            encoder,
            decoder,
            config: config.clone(),
            device: device.clone(),
            var_map,
            inference,
        })
    }

    /// Overwrite every variable with the matching tensor of `params`.
    ///
    /// The whole set is checked before anything is written, so a failed
    /// load leaves the model unchanged.
    ///
    /// # Errors
    /// [`PredictError::MissingParameter`], [`PredictError::ShapeMismatch`],
    /// or [`PredictError::InvalidConfig`] when called in inference mode.
    pub fn load_parameters(&mut self, params: &ParameterSet) -> PredictResult<()> {
        if self.inference {
            return Err(PredictError::invalid_config(
                "parameters are frozen in inference mode; use from_parameters",
            ));
        }

        let tensors = params
            .select(&self.config)?
            .into_iter()
            .map(|(name, t)| Ok((name, t.to_device(&self.device)?)))
            .collect::<PredictResult<HashMap<_, _>>>()?;
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| PredictError::invalid_config("parameter store lock poisoned"))?;

        // Every tensor is on the device and paired with its variable before
        // the first write.
        let updates = data
            .iter()
            .map(|(name, var)| {
                tensors
                    .get(name)
                    .map(|tensor| (var, tensor))
                    .ok_or_else(|| PredictError::missing_parameter(name.as_str()))
            })
            .collect::<PredictResult<Vec<_>>>()?;
        for (var, tensor) in updates {
            var.set(tensor)?;
        }
        debug!(count = data.len(), "Loaded parameters into model");

        Ok(())
    }

    /// Rebuild the model from detached copies of its parameters.
    ///
    /// The result owns plain tensors instead of trainable variables.
    /// Calling this on a model already in inference mode returns it as is.
    pub fn into_inference(self) -> PredictResult<Self> {
        if self.inference {
            return Ok(self);
        }

        let tensors = {
            let data = self
                .var_map
                .data()
                .lock()
                .map_err(|_| PredictError::invalid_config("parameter store lock poisoned"))?;
            data.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
                .collect::<HashMap<_, _>>()
        };
        info!(tensors = tensors.len(), "Switching model to inference mode");

        Self::from_tensors(&self.config, tensors, &self.device)
    }

    /// Predict `T_out` frames for every sequence of a batch.
    ///
    /// Input: (batch, T_in, C, H, W) with T_in >= 1
    /// Output: (batch, T_out, C, H, W)
    ///
    /// # Errors
    /// [`PredictError::ShapeMismatch`] if the batch is not 5-D, the frame
    /// shape differs from the configured one or the batch holds no frames.
    pub fn predict(&self, xs: &Tensor) -> PredictResult<Tensor> {
        if xs.rank() != 5 {
            return Err(PredictError::shape_mismatch(
                "input batch",
                "(batch, T_in, C, H, W)",
                format!("{:?}", xs.dims()),
            ));
        }
        let (b, t, _, _, _) = xs.dims5()?;
        let frame = self.config.frame;
        if xs.dims()[2..] != frame.dims()[..] {
            return Err(PredictError::shape_mismatch(
                "input frames",
                frame.to_string(),
                format!("{:?}", &xs.dims()[2..]),
            ));
        }
        if b == 0 || t == 0 {
            return Err(PredictError::shape_mismatch(
                "input batch",
                "at least one sequence of one frame",
                format!("{:?}", xs.dims()),
            ));
        }

        let xs = xs.to_device(&self.device)?.to_dtype(DType::F32)?;
        let states = self.encoder.encode(&xs)?;
        let last_frame = xs.narrow(1, t - 1, 1)?.squeeze(1)?;
        let frames = self
            .decoder
            .decode(states, &last_frame, self.config.output_frames)?;
        Ok(frames)
    }

    /// Predict the continuation of a single sequence.
    pub fn predict_sequence(&self, sequence: &FrameSequence) -> PredictResult<FrameSequence> {
        let out = self.predict(&sequence.to_batch()?)?;
        FrameSequence::new(out.squeeze(0)?)
    }

    /// Expected parameter names and shapes.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        self.config.parameter_manifest()
    }

    /// Get total parameter count
    pub fn parameter_count(&self) -> usize {
        self.config.parameter_count()
    }

    /// Number of encoder (and decoder) stages.
    pub fn num_stages(&self) -> usize {
        self.encoder.num_stages()
    }

    /// Get model configuration
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Get device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// True once rebuilt by [`EncoderDecoder::into_inference`] or
    /// [`EncoderDecoder::from_parameters`].
    pub fn is_inference(&self) -> bool {
        self.inference
    }

    /// Get reference to the VarMap (empty in inference mode)
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }
}
