//! Multi-resolution recurrent encoder.
//!
//! Stage `k` applies its subnet to every frame of the incoming feature
//! sequence, then runs its ConvGRU cell over time from a zero state. The
//! per-step hidden states feed stage `k + 1`; the final hidden state of
//! every stage is handed to the decoder.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use tracing::trace;

use crate::cell::{ConvGruCell, StageState};
use crate::config::ModelConfig;
use crate::layers::Subnet;

/// Encoder stage: `subnet -> cell`.
pub struct EncoderStage {
    subnet: Subnet,
    cell: ConvGruCell,
}

impl EncoderStage {
    /// Run the stage over a `(batch, time, C, H, W)` sequence.
    ///
    /// Returns the hidden state of every step and the final state.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, StageState)> {
        let features = self.subnet.forward_sequence(xs)?;
        self.cell.run(&features)
    }
}

/// Ordered encoder stages, outer (full resolution) to inner.
pub struct Encoder {
    stages: Vec<EncoderStage>,
}

impl Encoder {
    /// Create the encoder; stage `k` lives under `stages.{k}.layers` and
    /// `stages.{k}.cell`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let stages = config
            .encoder
            .iter()
            .enumerate()
            .map(|(k, stage)| {
                let vb = vb.pp(format!("stages.{k}"));
                Ok(EncoderStage {
                    subnet: Subnet::new(&stage.layers, vb.pp("layers"))?,
                    cell: ConvGruCell::new(&stage.cell, vb.pp("cell"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { stages })
    }

    /// Number of stages.
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Consume `(batch, time, C, H, W)` frames and return the final hidden
    /// state of every stage, outer to inner.
    pub fn encode(&self, xs: &Tensor) -> Result<Vec<StageState>> {
        let mut states = Vec::with_capacity(self.stages.len());
        let mut sequence = xs.clone();

        for (k, stage) in self.stages.iter().enumerate() {
            let (outputs, last) = stage.forward(&sequence)?;
            trace!(stage = k, shape = ?last.hidden().dims(), "encoder stage done");
            states.push(last);
            sequence = outputs;
        }

        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameShape;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_encode_state_shapes() {
        let config = ModelConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let encoder = Encoder::new(&config, vb).unwrap();
        assert_eq!(encoder.num_stages(), 2);

        let xs = Tensor::randn(0.0f32, 1.0, (3, 4, 1, 16, 16), &device).unwrap();
        let states = encoder.encode(&xs).unwrap();

        let expected = config.stage_shapes().unwrap();
        assert_eq!(states.len(), expected.len());
        for (state, shape) in states.iter().zip(expected) {
            assert_eq!(state.shape(), shape);
            assert_eq!(state.batch_size(), 3);
        }
    }

    #[test]
    fn test_inner_stage_consumes_every_outer_step() {
        let config = ModelConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::new(&config, vb).unwrap();

        let xs = Tensor::randn(0.0f32, 1.0, (2, 4, 1, 16, 16), &device).unwrap();
        let states = encoder.encode(&xs).unwrap();

        // Stage 0 by hand, keeping its per-step outputs
        let outer = &encoder.stages[0];
        let features = outer.subnet.forward_sequence(&xs).unwrap();
        let (outputs, _) = outer.cell.run(&features).unwrap();

        // Stage 1 stepped over those outputs one time step at a time
        let inner = &encoder.stages[1];
        let features = inner.subnet.forward_sequence(&outputs).unwrap();
        let (_, t, _, _, _) = features.dims5().unwrap();
        let first = features.narrow(1, 0, 1).unwrap().squeeze(1).unwrap();
        let mut state = inner.cell.zero_state(&first).unwrap();
        for step in 0..t {
            let x = features.narrow(1, step, 1).unwrap().squeeze(1).unwrap();
            state = inner.cell.step(&x, &state).unwrap();
        }

        let diff = (states[1].hidden() - state.hidden())
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6, "inner state differs by {diff}");

        // Feeding stage 0's final state at every step gives another result
        let last = outputs.narrow(1, t - 1, 1).unwrap();
        let repeated = Tensor::cat(&vec![last; t], 1).unwrap();
        let (_, stale) = inner.forward(&repeated).unwrap();
        let gap = (states[1].hidden() - stale.hidden())
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(gap > 1e-4, "inner stage ignored the per-step outputs");
    }

    #[test]
    fn test_single_frame_sequence() {
        let config = ModelConfig::mirrored(FrameShape::new(2, 8, 8), 1, 1, &[4], &[2], 3).unwrap();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let encoder = Encoder::new(&config, vb).unwrap();
        let xs = Tensor::randn(0.0f32, 1.0, (1, 1, 2, 8, 8), &device).unwrap();
        let states = encoder.encode(&xs).unwrap();
        assert_eq!(states[0].hidden().dims(), &[1, 4, 4, 4]);
    }
}
