//! Autoregressive recurrent decoder.
//!
//! Decoder stage `k` starts from encoder stage `k`'s final state. Every
//! output step walks the stages inner to outer:
//! 1. the innermost cell is stepped with the strategy-selected input
//! 2. each stage's subnet output is the next shallower stage's input
//! 3. the shallowest subnet emits the predicted frame
//!
//! Hidden states persist across steps. No ground truth is ever fed back.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::cell::{ConvGruCell, StageState};
use crate::config::{DecoderInput, ModelConfig};
use crate::layers::Subnet;

/// Decoder stage: `cell -> subnet`.
pub struct DecoderStage {
    cell: ConvGruCell,
    subnet: Subnet,
}

impl DecoderStage {
    /// Advance the stage one step, returning its subnet output and new state.
    pub fn step(&self, x: &Tensor, state: &StageState) -> Result<(Tensor, StageState)> {
        let next = self.cell.step(x, state)?;
        let out = self.subnet.forward(next.hidden())?;
        Ok((out, next))
    }
}

/// Ordered decoder stages, outer (full resolution) to inner.
pub struct Decoder {
    stages: Vec<DecoderStage>,
    input: DecoderInput,
    feedback: Option<Subnet>,
}

impl Decoder {
    /// Create the decoder; stage `k` lives under `stages.{k}.cell` and
    /// `stages.{k}.layers`, the feedback subnet under `feedback`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let stages = config
            .decoder
            .stages
            .iter()
            .enumerate()
            .map(|(k, stage)| {
                let vb = vb.pp(format!("stages.{k}"));
                Ok(DecoderStage {
                    cell: ConvGruCell::new(&stage.cell, vb.pp("cell"))?,
                    subnet: Subnet::new(&stage.layers, vb.pp("layers"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let feedback = match config.decoder.input {
            DecoderInput::Zeros => None,
            DecoderInput::Feedback => Some(Subnet::new(
                &config.decoder.feedback_layers,
                vb.pp("feedback"),
            )?),
        };

        Ok(Self {
            stages,
            input: config.decoder.input,
            feedback,
        })
    }

    /// Number of stages.
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Innermost input strategy.
    pub fn input_strategy(&self) -> DecoderInput {
        self.input
    }

    /// Generate `steps` frames `(batch, steps, C, H, W)` from the encoder's
    /// final states.
    ///
    /// `last_frame` is the last observed frame `(batch, C, H, W)`; only the
    /// feedback strategy reads it.
    pub fn decode(
        &self,
        states: Vec<StageState>,
        last_frame: &Tensor,
        steps: usize,
    ) -> Result<Tensor> {
        self.rollout(states, last_frame, steps).map(|(frames, _)| frames)
    }

    /// Like [`Decoder::decode`], also returning the final state of every stage.
    pub fn rollout(
        &self,
        states: Vec<StageState>,
        last_frame: &Tensor,
        steps: usize,
    ) -> Result<(Tensor, Vec<StageState>)> {
        if self.stages.is_empty() {
            bail!("decoder has no stages");
        }
        if states.len() != self.stages.len() {
            bail!(
                "decoder has {} stages but received {} states",
                self.stages.len(),
                states.len()
            );
        }
        if steps == 0 {
            bail!("decoder needs at least one output step");
        }

        let mut states = states;
        let innermost = self.stages.len() - 1;
        let inner_shape = states[innermost].shape();
        let batch = states[innermost].batch_size();
        let device = last_frame.device();

        let zeros = match self.feedback {
            None => Some(Tensor::zeros(
                (
                    batch,
                    self.stages[innermost].cell.input_channels(),
                    inner_shape.height,
                    inner_shape.width,
                ),
                last_frame.dtype(),
                device,
            )?),
            Some(_) => None,
        };

        let mut frames = Vec::with_capacity(steps);
        let mut previous = last_frame.clone();

        for _ in 0..steps {
            let mut x = match (&zeros, &self.feedback) {
                (Some(zeros), _) => zeros.clone(),
                (None, Some(feedback)) => feedback.forward(&previous)?,
                (None, None) => bail!("decoder has neither zero input nor feedback subnet"),
            };

            for k in (0..=innermost).rev() {
                let (out, next) = self.stages[k].step(&x, &states[k])?;
                states[k] = next;
                x = out;
            }

            previous = x.clone();
            frames.push(x);
        }

        Ok((Tensor::stack(&frames, 1)?, states))
    }
}
