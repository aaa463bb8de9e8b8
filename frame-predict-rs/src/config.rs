//! Model configuration for the ConvGRU encoder-decoder.
//!
//! A [`ModelConfig`] fully describes the network: frame shape, sequence
//! lengths and the per-stage layer stacks. Shapes are propagated and checked
//! once by [`ModelConfig::validate`], so a configuration that passes
//! validation always builds a model whose encoder states can be handed to the
//! decoder without reshaping.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::data::DataSourceConfig;
use crate::error::{PredictError, PredictResult};
use crate::params::{ParameterNaming, ParameterSet};

/// Epsilon used by the optional group normalization inside ConvGRU cells.
pub const GROUP_NORM_EPS: f64 = 1e-5;

/// Shape of a single frame or feature map: `(channels, height, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameShape {
    /// Number of channels
    pub channels: usize,
    /// Height in pixels
    pub height: usize,
    /// Width in pixels
    pub width: usize,
}

impl FrameShape {
    /// Create a new frame shape.
    pub const fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Same spatial extent with a different channel count.
    pub const fn with_channels(self, channels: usize) -> Self {
        Self { channels, ..self }
    }

    /// Number of scalar elements.
    pub const fn elem_count(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Dimensions `[channels, height, width]`.
    pub fn dims(&self) -> Vec<usize> {
        vec![self.channels, self.height, self.width]
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.channels, self.height, self.width)
    }
}

/// Kind of a non-recurrent layer inside a stage subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// 2-D convolution (downsamples when `stride > 1`)
    Conv,
    /// 2-D transposed convolution (upsamples when `stride > 1`)
    Deconv,
    /// Max pooling, no parameters
    MaxPool,
}

/// Activation applied after a subnet layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Identity
    #[default]
    None,
    /// max(x, 0)
    Relu,
    /// max(x, slope * x), slope from [`LayerSpec::negative_slope`]
    LeakyRelu,
    /// Logistic sigmoid
    Sigmoid,
    /// Hyperbolic tangent
    Tanh,
}

/// One layer of a stage subnet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Layer kind
    pub kind: LayerKind,
    /// Input channels (must equal the incoming feature map)
    pub in_channels: usize,
    /// Output channels (equal to `in_channels` for pooling)
    pub out_channels: usize,
    /// Square kernel size
    pub kernel_size: usize,
    /// Stride (resolution change factor)
    #[serde(default = "default_one")]
    pub stride: usize,
    /// Zero padding on each side
    #[serde(default)]
    pub padding: usize,
    /// Extra rows/cols added to a transposed convolution's output
    #[serde(default)]
    pub output_padding: usize,
    /// Activation applied after the layer
    #[serde(default)]
    pub activation: Activation,
    /// Slope for [`Activation::LeakyRelu`]
    #[serde(default = "default_negative_slope")]
    pub negative_slope: f64,
}

fn default_one() -> usize {
    1
}

fn default_negative_slope() -> f64 {
    0.2
}

impl LayerSpec {
    /// Convolution followed by LeakyReLU(0.2).
    pub fn conv(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
    ) -> Self {
        Self {
            kind: LayerKind::Conv,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            output_padding: 0,
            activation: Activation::LeakyRelu,
            negative_slope: default_negative_slope(),
        }
    }

    /// Transposed convolution followed by LeakyReLU(0.2).
    pub fn deconv(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
    ) -> Self {
        Self {
            kind: LayerKind::Deconv,
            ..Self::conv(in_channels, out_channels, kernel_size, stride, padding)
        }
    }

    /// Max pooling over `kernel_size` windows.
    pub fn max_pool(channels: usize, kernel_size: usize, stride: usize) -> Self {
        Self {
            kind: LayerKind::MaxPool,
            activation: Activation::None,
            ..Self::conv(channels, channels, kernel_size, stride, 0)
        }
    }

    /// Replace the activation.
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Shape produced by this layer, or an error naming `scope`.
    pub fn output_shape(&self, input: FrameShape, scope: &str) -> PredictResult<FrameShape> {
        if self.in_channels != input.channels {
            return Err(PredictError::invalid_config(format!(
                "{scope}: expects {} input channels but receives {}",
                self.in_channels, input.channels
            )));
        }
        if self.kernel_size == 0 || self.stride == 0 || self.out_channels == 0 {
            return Err(PredictError::invalid_config(format!(
                "{scope}: kernel_size, stride and out_channels must be non-zero"
            )));
        }

        let spatial = |size: usize| -> Option<usize> {
            let k = self.kernel_size;
            let s = self.stride;
            let p = self.padding;
            match self.kind {
                LayerKind::Conv => (size + 2 * p).checked_sub(k).map(|v| v / s + 1),
                LayerKind::Deconv => (size.saturating_sub(1) * s + k + self.output_padding)
                    .checked_sub(2 * p),
                LayerKind::MaxPool => size.checked_sub(k).map(|v| v / s + 1),
            }
            .filter(|&v| v > 0)
        };

        match self.kind {
            LayerKind::MaxPool if self.out_channels != self.in_channels => {
                return Err(PredictError::invalid_config(format!(
                    "{scope}: max_pool cannot change channels ({} -> {})",
                    self.in_channels, self.out_channels
                )));
            }
            LayerKind::MaxPool if self.padding != 0 => {
                return Err(PredictError::invalid_config(format!(
                    "{scope}: max_pool does not support padding"
                )));
            }
            LayerKind::Deconv if self.output_padding >= self.stride => {
                return Err(PredictError::invalid_config(format!(
                    "{scope}: output_padding must be smaller than stride"
                )));
            }
            _ => {}
        }

        match (spatial(input.height), spatial(input.width)) {
            (Some(height), Some(width)) => Ok(FrameShape::new(self.out_channels, height, width)),
            _ => Err(PredictError::invalid_config(format!(
                "{scope}: {:?} with kernel {} stride {} padding {} cannot be applied to {}",
                self.kind, self.kernel_size, self.stride, self.padding, input
            ))),
        }
    }

    /// Named parameter shapes, relative to the layer's prefix.
    fn parameter_shapes(&self) -> Vec<(&'static str, Vec<usize>)> {
        let k = self.kernel_size;
        match self.kind {
            LayerKind::Conv => vec![
                ("weight", vec![self.out_channels, self.in_channels, k, k]),
                ("bias", vec![self.out_channels]),
            ],
            LayerKind::Deconv => vec![
                ("weight", vec![self.in_channels, self.out_channels, k, k]),
                ("bias", vec![self.out_channels]),
            ],
            LayerKind::MaxPool => Vec::new(),
        }
    }
}

/// Configuration of one ConvGRU cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellConfig {
    /// Channels of the per-step input `x_t`
    pub input_channels: usize,
    /// Channels of the hidden state `h_t`
    pub hidden_channels: usize,
    /// Square kernel size of the gate convolutions (odd)
    pub kernel_size: usize,
    /// Channels per group for group normalization after each gate
    /// convolution, `None` disables normalization
    #[serde(default)]
    pub norm_group_size: Option<usize>,
}

impl CellConfig {
    /// Cell without gate normalization.
    pub const fn new(input_channels: usize, hidden_channels: usize, kernel_size: usize) -> Self {
        Self {
            input_channels,
            hidden_channels,
            kernel_size,
            norm_group_size: None,
        }
    }

    /// Enable group normalization with `group_size` channels per group.
    pub const fn with_norm_group_size(mut self, group_size: usize) -> Self {
        self.norm_group_size = Some(group_size);
        self
    }

    /// "Same" padding used by the gate convolutions.
    pub const fn padding(&self) -> usize {
        (self.kernel_size - 1) / 2
    }

    /// Number of groups used to normalize `channels` gate channels.
    pub fn norm_groups(&self, channels: usize) -> Option<usize> {
        self.norm_group_size.map(|size| channels / size)
    }

    fn validate(&self, scope: &str) -> PredictResult<()> {
        if self.input_channels == 0 || self.hidden_channels == 0 {
            return Err(PredictError::invalid_config(format!(
                "{scope}: cell channels must be non-zero"
            )));
        }
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(PredictError::invalid_config(format!(
                "{scope}: cell kernel_size must be odd, got {}",
                self.kernel_size
            )));
        }
        if let Some(size) = self.norm_group_size {
            if size == 0 || self.hidden_channels % size != 0 {
                return Err(PredictError::invalid_config(format!(
                    "{scope}: hidden_channels {} not divisible by norm_group_size {}",
                    self.hidden_channels, size
                )));
            }
        }
        Ok(())
    }

    fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let f = self.hidden_channels;
        let k = self.kernel_size;
        let fan_in = self.input_channels + f;

        let mut shapes = vec![
            ("gates.weight".to_string(), vec![2 * f, fan_in, k, k]),
            ("gates.bias".to_string(), vec![2 * f]),
        ];
        if self.norm_group_size.is_some() {
            shapes.push(("gates_norm.weight".to_string(), vec![2 * f]));
            shapes.push(("gates_norm.bias".to_string(), vec![2 * f]));
        }
        shapes.push(("candidate.weight".to_string(), vec![f, fan_in, k, k]));
        shapes.push(("candidate.bias".to_string(), vec![f]));
        if self.norm_group_size.is_some() {
            shapes.push(("candidate_norm.weight".to_string(), vec![f]));
            shapes.push(("candidate_norm.bias".to_string(), vec![f]));
        }
        shapes
    }
}

/// Encoder stage: subnet (resolution change) followed by a ConvGRU cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderStageConfig {
    /// Layers applied to every time step before the cell
    pub layers: Vec<LayerSpec>,
    /// Recurrent cell
    pub cell: CellConfig,
}

/// Decoder stage: ConvGRU cell followed by a subnet (resolution change).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderStageConfig {
    /// Recurrent cell
    pub cell: CellConfig,
    /// Layers applied to the cell output of every time step
    pub layers: Vec<LayerSpec>,
}

/// What the innermost decoder stage receives as input at each step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderInput {
    /// All-zero placeholder; prediction is driven by propagated state only
    #[default]
    Zeros,
    /// The previously emitted frame, mapped by the feedback subnet
    Feedback,
}

/// Decoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Stages ordered outer (full resolution) to inner, index-matched with
    /// the encoder stages
    pub stages: Vec<DecoderStageConfig>,
    /// Innermost input strategy
    #[serde(default)]
    pub input: DecoderInput,
    /// Subnet mapping a frame to the innermost cell input
    /// (used by [`DecoderInput::Feedback`])
    #[serde(default)]
    pub feedback_layers: Vec<LayerSpec>,
}

/// Configuration of the encoder-decoder model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Shape of every input and output frame
    pub frame: FrameShape,
    /// Number of observed frames per sequence
    pub input_frames: usize,
    /// Number of predicted frames per sequence
    pub output_frames: usize,
    /// Encoder stages, outer to inner
    pub encoder: Vec<EncoderStageConfig>,
    /// Decoder stages and input strategy
    pub decoder: DecoderConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::moving_mnist()
    }
}

impl ModelConfig {
    /// Three-stage network for 64x64 single-channel Moving-MNIST clips.
    ///
    /// Hidden states live at 64x64x64, 32x32x96 and 16x16x96.
    pub fn moving_mnist() -> Self {
        let gru = |input, hidden| CellConfig::new(input, hidden, 5).with_norm_group_size(32);

        Self {
            frame: FrameShape::new(1, 64, 64),
            input_frames: 10,
            output_frames: 10,
            encoder: vec![
                EncoderStageConfig {
                    layers: vec![LayerSpec::conv(1, 16, 3, 1, 1)],
                    cell: gru(16, 64),
                },
                EncoderStageConfig {
                    layers: vec![LayerSpec::conv(64, 64, 3, 2, 1)],
                    cell: gru(64, 96),
                },
                EncoderStageConfig {
                    layers: vec![LayerSpec::conv(96, 96, 3, 2, 1)],
                    cell: gru(96, 96),
                },
            ],
            decoder: DecoderConfig {
                stages: vec![
                    DecoderStageConfig {
                        cell: gru(96, 64),
                        layers: vec![
                            LayerSpec::conv(64, 16, 3, 1, 1),
                            LayerSpec::conv(16, 1, 1, 1, 0),
                        ],
                    },
                    DecoderStageConfig {
                        cell: gru(96, 96),
                        layers: vec![LayerSpec::deconv(96, 96, 4, 2, 1)],
                    },
                    DecoderStageConfig {
                        cell: gru(96, 96),
                        layers: vec![LayerSpec::deconv(96, 96, 4, 2, 1)],
                    },
                ],
                input: DecoderInput::Zeros,
                feedback_layers: Vec::new(),
            },
        }
    }

    /// Test configuration (minimal for unit tests)
    pub fn test() -> Self {
        Self::mirrored_layout(FrameShape::new(1, 16, 16), 4, 3, &[4, 8], &[1, 2], 3)
    }

    /// Look up a named preset (`moving-mnist` or `test`).
    pub fn from_preset(name: &str) -> PredictResult<Self> {
        match name {
            "moving-mnist" | "moving_mnist" => Ok(Self::moving_mnist()),
            "test" => Ok(Self::test()),
            other => Err(PredictError::invalid_config(format!(
                "unknown preset: {other} (expected moving-mnist or test)"
            ))),
        }
    }

    /// Build a resolution-mirrored encoder/decoder.
    ///
    /// Encoder stage `k` downsamples by `factors[k]` into `channels[k]`
    /// feature maps; decoder stage `k` upsamples by the same factor on the
    /// way back, and stage 0 ends in a 1x1 projection to `frame.channels`.
    ///
    /// # Errors
    /// Returns [`PredictError::InvalidConfig`] when the lists are empty or of
    /// different length, or when the resulting shapes do not line up.
    pub fn mirrored(
        frame: FrameShape,
        input_frames: usize,
        output_frames: usize,
        channels: &[usize],
        factors: &[usize],
        cell_kernel: usize,
    ) -> PredictResult<Self> {
        if channels.is_empty() || channels.len() != factors.len() {
            return Err(PredictError::invalid_config(format!(
                "mirrored: need one factor per stage, got {} channels and {} factors",
                channels.len(),
                factors.len()
            )));
        }
        if factors.contains(&0) {
            return Err(PredictError::invalid_config("mirrored: factors must be non-zero"));
        }

        let config = Self::mirrored_layout(
            frame,
            input_frames,
            output_frames,
            channels,
            factors,
            cell_kernel,
        );
        config.validate()?;
        Ok(config)
    }

    /// Stage layout behind [`ModelConfig::mirrored`], without validation.
    /// `channels` must be non-empty and as long as `factors`.
    fn mirrored_layout(
        frame: FrameShape,
        input_frames: usize,
        output_frames: usize,
        channels: &[usize],
        factors: &[usize],
        cell_kernel: usize,
    ) -> Self {
        let down =
            |in_c: usize, out_c: usize, factor: usize| LayerSpec::conv(in_c, out_c, 3, factor, 1);
        let up = |in_c: usize, out_c: usize, factor: usize| match factor {
            1 => LayerSpec::conv(in_c, out_c, 3, 1, 1),
            2 => LayerSpec::deconv(in_c, out_c, 4, 2, 1),
            f => LayerSpec::deconv(in_c, out_c, f, f, 0),
        };

        let mut encoder = Vec::with_capacity(channels.len());
        let mut in_c = frame.channels;
        for (&c, &f) in channels.iter().zip(factors) {
            encoder.push(EncoderStageConfig {
                layers: vec![down(in_c, c, f)],
                cell: CellConfig::new(c, c, cell_kernel),
            });
            in_c = c;
        }

        let stages = (0..channels.len())
            .map(|k| {
                let c = channels[k];
                // Innermost stage sees its own width; others see the upsampled
                // output of the next inner stage, which carries `c` channels.
                let cell = CellConfig::new(c, c, cell_kernel);
                let layers = if k == 0 {
                    let mut layers = Vec::new();
                    if factors[0] != 1 {
                        layers.push(up(c, c, factors[0]));
                    }
                    layers.push(
                        LayerSpec::conv(c, frame.channels, 1, 1, 0)
                            .with_activation(Activation::None),
                    );
                    layers
                } else {
                    vec![up(c, channels[k - 1], factors[k])]
                };
                DecoderStageConfig { cell, layers }
            })
            .collect();

        Self {
            frame,
            input_frames,
            output_frames,
            encoder,
            decoder: DecoderConfig {
                stages,
                input: DecoderInput::Zeros,
                feedback_layers: Vec::new(),
            },
        }
    }

    /// Switch the decoder to frame feedback through the given subnet.
    pub fn with_feedback(mut self, layers: Vec<LayerSpec>) -> Self {
        self.decoder.input = DecoderInput::Feedback;
        self.decoder.feedback_layers = layers;
        self
    }

    /// Set the number of predicted frames.
    pub fn with_output_frames(mut self, output_frames: usize) -> Self {
        self.output_frames = output_frames;
        self
    }

    /// Number of encoder (and decoder) stages.
    pub fn num_stages(&self) -> usize {
        self.encoder.len()
    }

    /// Hidden-state shape of every stage, outer to inner.
    ///
    /// # Errors
    /// Returns [`PredictError::InvalidConfig`] if the encoder layers cannot be
    /// chained from the configured frame shape.
    pub fn stage_shapes(&self) -> PredictResult<Vec<FrameShape>> {
        let mut shapes = Vec::with_capacity(self.encoder.len());
        let mut current = self.frame;

        for (k, stage) in self.encoder.iter().enumerate() {
            let scope = format!("encoder.stages.{k}");
            current = propagate(&stage.layers, current, &format!("{scope}.layers"))?;
            stage.cell.validate(&format!("{scope}.cell"))?;
            if stage.cell.input_channels != current.channels {
                return Err(PredictError::invalid_config(format!(
                    "{scope}.cell: expects {} input channels but subnet produces {}",
                    stage.cell.input_channels, current.channels
                )));
            }
            current = current.with_channels(stage.cell.hidden_channels);
            shapes.push(current);
        }

        Ok(shapes)
    }

    /// Validate the configuration.
    ///
    /// Checks sequence lengths, stage counts, channel chaining, resolution
    /// hand-off between paired stages and that the decoder emits frames of
    /// the configured shape.
    pub fn validate(&self) -> PredictResult<()> {
        if self.frame.elem_count() == 0 {
            return Err(PredictError::invalid_config("frame dimensions must be non-zero"));
        }
        if self.input_frames == 0 || self.output_frames == 0 {
            return Err(PredictError::invalid_config(
                "input_frames and output_frames must be at least 1",
            ));
        }
        if self.encoder.is_empty() {
            return Err(PredictError::invalid_config("model needs at least one stage"));
        }
        if self.encoder.len() != self.decoder.stages.len() {
            return Err(PredictError::invalid_config(format!(
                "encoder has {} stages but decoder has {}",
                self.encoder.len(),
                self.decoder.stages.len()
            )));
        }

        let shapes = self.stage_shapes()?;
        let innermost = self.decoder.stages.len() - 1;

        if self.decoder.input == DecoderInput::Feedback {
            let cell = &self.decoder.stages[innermost].cell;
            let target = shapes[innermost].with_channels(cell.input_channels);
            let produced = propagate(
                &self.decoder.feedback_layers,
                self.frame,
                "decoder.feedback",
            )?;
            if produced != target {
                return Err(PredictError::invalid_config(format!(
                    "decoder.feedback produces {produced} but the innermost cell expects {target}"
                )));
            }
        }

        let mut incoming: Option<FrameShape> = None;
        for k in (0..=innermost).rev() {
            let scope = format!("decoder.stages.{k}");
            let stage = &self.decoder.stages[k];
            stage.cell.validate(&format!("{scope}.cell"))?;

            let hidden = shapes[k];
            if stage.cell.hidden_channels != hidden.channels {
                return Err(PredictError::invalid_config(format!(
                    "{scope}.cell: hidden state {} does not match encoder stage {k} state {}",
                    hidden.with_channels(stage.cell.hidden_channels),
                    hidden
                )));
            }

            if let Some(input) = incoming {
                let expected = hidden.with_channels(stage.cell.input_channels);
                if input != expected {
                    return Err(PredictError::invalid_config(format!(
                        "{scope}.cell: expects input {expected} but stage {} produces {input}",
                        k + 1
                    )));
                }
            }

            incoming = Some(propagate(&stage.layers, hidden, &format!("{scope}.layers"))?);
        }

        match incoming {
            Some(out) if out == self.frame => Ok(()),
            Some(out) => Err(PredictError::invalid_config(format!(
                "decoder emits frames of {out} but frames are {}",
                self.frame
            ))),
            None => Err(PredictError::invalid_config("decoder has no stages")),
        }
    }

    /// Every parameter the model expects, with its shape.
    ///
    /// Names match those produced by building the model on a `VarBuilder`
    /// and are the keys looked up in a parameter file.
    pub fn parameter_manifest(&self) -> Vec<(String, Vec<usize>)> {
        fn push_layers(prefix: &str, layers: &[LayerSpec], out: &mut Vec<(String, Vec<usize>)>) {
            for (i, layer) in layers.iter().enumerate() {
                for (name, shape) in layer.parameter_shapes() {
                    out.push((format!("{prefix}.{i}.{name}"), shape));
                }
            }
        }

        let mut manifest = Vec::new();

        for (k, stage) in self.encoder.iter().enumerate() {
            push_layers(&format!("encoder.stages.{k}.layers"), &stage.layers, &mut manifest);
            for (name, shape) in stage.cell.parameter_shapes() {
                manifest.push((format!("encoder.stages.{k}.cell.{name}"), shape));
            }
        }

        for (k, stage) in self.decoder.stages.iter().enumerate() {
            for (name, shape) in stage.cell.parameter_shapes() {
                manifest.push((format!("decoder.stages.{k}.cell.{name}"), shape));
            }
            push_layers(&format!("decoder.stages.{k}.layers"), &stage.layers, &mut manifest);
        }

        if self.decoder.input == DecoderInput::Feedback {
            push_layers("decoder.feedback", &self.decoder.feedback_layers, &mut manifest);
        }

        manifest
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.parameter_manifest()
            .iter()
            .map(|(_, shape)| shape.iter().product::<usize>())
            .sum()
    }

    /// Load a configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> PredictResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Save the configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> PredictResult<()> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// Chain `layers` starting from `input`, returning the final shape.
fn propagate(layers: &[LayerSpec], input: FrameShape, scope: &str) -> PredictResult<FrameShape> {
    layers
        .iter()
        .enumerate()
        .try_fold(input, |shape, (i, layer)| layer.output_shape(shape, &format!("{scope}.{i}")))
}

/// Configuration of an inference run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Network description
    #[serde(default)]
    pub model: ModelConfig,
    /// Safetensors file with trained parameters
    pub parameters: PathBuf,
    /// How tensor names in `parameters` map onto the model
    #[serde(default)]
    pub parameter_naming: ParameterNaming,
    /// Device to run on
    #[serde(default)]
    pub device: DeviceSpec,
    /// Where clips come from
    #[serde(default)]
    pub data: DataSourceConfig,
    /// Clips per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Stop after this many batches
    #[serde(default = "default_one")]
    pub max_batches: usize,
    /// Samples of each batch handed to the sinks
    #[serde(default = "default_one")]
    pub samples_per_batch: usize,
    /// Directory for rendered grids
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_batch_size() -> usize {
    4
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("predictions")
}

impl RunConfig {
    /// Moving-MNIST defaults reading parameters from `parameters`.
    pub fn new(parameters: impl Into<PathBuf>) -> Self {
        Self {
            model: ModelConfig::default(),
            parameters: parameters.into(),
            parameter_naming: ParameterNaming::default(),
            device: DeviceSpec::default(),
            data: DataSourceConfig::default(),
            batch_size: default_batch_size(),
            max_batches: 1,
            samples_per_batch: 1,
            output_dir: default_output_dir(),
        }
    }

    /// Replace the model configuration.
    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    /// Set the naming scheme of the parameter file.
    pub fn with_parameter_naming(mut self, naming: ParameterNaming) -> Self {
        self.parameter_naming = naming;
        self
    }

    /// Replace the data source.
    pub fn with_data(mut self, data: DataSourceConfig) -> Self {
        self.data = data;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the output directory.
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Validate the model, the parameter naming and the run limits.
    pub fn validate(&self) -> PredictResult<()> {
        self.model.validate()?;
        self.parameter_naming.name_map(&self.model)?;
        if self.batch_size == 0 {
            return Err(PredictError::invalid_config("batch_size must be at least 1"));
        }
        if self.samples_per_batch == 0 {
            return Err(PredictError::invalid_config(
                "samples_per_batch must be at least 1",
            ));
        }
        Ok(())
    }

    /// Read the configured parameter file and bring its names to the
    /// model's manifest names.
    pub fn load_parameters(&self, device: &Device) -> PredictResult<ParameterSet> {
        let params = ParameterSet::from_safetensors(&self.parameters, device)?;
        match self.parameter_naming.name_map(&self.model)? {
            Some(names) => params.renamed(&names),
            None => Ok(params),
        }
    }

    /// Load a run configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> PredictResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Save the run configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> PredictResult<()> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// Device selection, passed explicitly instead of probed globally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSpec {
    /// Host CPU
    #[default]
    Cpu,
    /// CUDA device by ordinal
    Cuda(usize),
    /// Metal device by ordinal
    Metal(usize),
    /// First CUDA device if available, CPU otherwise
    Auto,
}

impl DeviceSpec {
    /// Open the selected device.
    pub fn device(&self) -> PredictResult<Device> {
        let device = match *self {
            Self::Cpu => Device::Cpu,
            Self::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            Self::Metal(ordinal) => Device::new_metal(ordinal)?,
            Self::Auto => Device::cuda_if_available(0)?,
        };
        Ok(device)
    }
}

impl FromStr for DeviceSpec {
    type Err = PredictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_ordinal = |ordinal: &str| {
            ordinal
                .parse::<usize>()
                .map_err(|_| PredictError::invalid_config(format!("invalid device ordinal: {s}")))
        };

        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            "cuda" => Ok(Self::Cuda(0)),
            "metal" => Ok(Self::Metal(0)),
            other => match other.split_once(':') {
                Some(("cuda", ordinal)) => Ok(Self::Cuda(parse_ordinal(ordinal)?)),
                Some(("metal", ordinal)) => Ok(Self::Metal(parse_ordinal(ordinal)?)),
                _ => Err(PredictError::invalid_config(format!("unknown device: {s}"))),
            },
        }
    }
}

impl TryFrom<String> for DeviceSpec {
    type Error = PredictError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceSpec> for String {
    fn from(spec: DeviceSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal(ordinal) => write!(f, "metal:{ordinal}"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_mnist_preset_is_valid() {
        let config = ModelConfig::moving_mnist();
        config.validate().unwrap();

        let shapes = config.stage_shapes().unwrap();
        assert_eq!(
            shapes,
            vec![
                FrameShape::new(64, 64, 64),
                FrameShape::new(96, 32, 32),
                FrameShape::new(96, 16, 16),
            ]
        );
        assert_eq!(config.input_frames, 10);
        assert_eq!(config.output_frames, 10);
    }

    #[test]
    fn test_from_preset() {
        assert_eq!(ModelConfig::from_preset("moving-mnist").unwrap(), ModelConfig::moving_mnist());
        assert_eq!(ModelConfig::from_preset("test").unwrap(), ModelConfig::test());
        assert!(ModelConfig::from_preset("kth").is_err());
    }

    #[test]
    fn test_test_preset_shapes() {
        let config = ModelConfig::test();
        let shapes = config.stage_shapes().unwrap();
        assert_eq!(shapes, vec![FrameShape::new(4, 16, 16), FrameShape::new(8, 8, 8)]);
    }

    #[test]
    fn test_mirrored_triple_downsample() {
        let config =
            ModelConfig::mirrored(FrameShape::new(1, 64, 64), 10, 10, &[8, 16, 16], &[2, 2, 2], 3)
                .unwrap();
        let shapes = config.stage_shapes().unwrap();
        assert_eq!(shapes[0], FrameShape::new(8, 32, 32));
        assert_eq!(shapes[2], FrameShape::new(16, 8, 8));
    }

    #[test]
    fn test_mirrored_odd_factor() {
        let config =
            ModelConfig::mirrored(FrameShape::new(2, 27, 27), 3, 2, &[4, 4], &[3, 3], 3).unwrap();
        assert_eq!(config.stage_shapes().unwrap()[1], FrameShape::new(4, 3, 3));
    }

    #[test]
    fn test_mirrored_rejects_length_mismatch() {
        let err = ModelConfig::mirrored(FrameShape::new(1, 16, 16), 2, 2, &[4, 8], &[2], 3)
            .unwrap_err();
        assert!(matches!(err, PredictError::InvalidConfig(_)));
    }

    #[test]
    fn test_stage_count_mismatch_rejected() {
        let mut config = ModelConfig::test();
        config.decoder.stages.pop();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stages"));
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let mut config = ModelConfig::test();
        config.encoder[1].cell.input_channels = 5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("encoder.stages.1.cell"));
    }

    #[test]
    fn test_even_cell_kernel_rejected() {
        let mut config = ModelConfig::test();
        config.encoder[0].cell.kernel_size = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_decoder_resolution_mismatch_rejected() {
        let mut config = ModelConfig::test();
        // Innermost decoder stage no longer upsamples back to 16x16.
        config.decoder.stages[1].layers = vec![LayerSpec::conv(8, 4, 3, 1, 1)];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("decoder.stages.0.cell"));
    }

    #[test]
    fn test_decoder_hidden_mismatch_rejected() {
        let mut config = ModelConfig::test();
        config.decoder.stages[1].cell.hidden_channels = 6;
        config.decoder.stages[1].layers[0].in_channels = 6;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("does not match encoder stage 1"));
    }

    #[test]
    fn test_wrong_output_channels_rejected() {
        let mut config = ModelConfig::test();
        config.decoder.stages[0].layers[0].out_channels = 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("decoder emits frames"));
    }

    #[test]
    fn test_zero_output_frames_rejected() {
        let config = ModelConfig::test().with_output_frames(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_feedback_subnet_validation() {
        // Innermost stage of the test preset: 8 input channels at 8x8.
        let ok = ModelConfig::test().with_feedback(vec![LayerSpec::conv(1, 8, 3, 2, 1)]);
        ok.validate().unwrap();

        let bad = ModelConfig::test().with_feedback(vec![LayerSpec::conv(1, 8, 3, 1, 1)]);
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("decoder.feedback"));
    }

    #[test]
    fn test_norm_group_divisibility() {
        let mut config = ModelConfig::test();
        config.encoder[0].cell.norm_group_size = Some(3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layer_output_shapes() {
        let input = FrameShape::new(4, 32, 32);
        let conv = LayerSpec::conv(4, 8, 3, 2, 1);
        assert_eq!(conv.output_shape(input, "t").unwrap(), FrameShape::new(8, 16, 16));

        let deconv = LayerSpec::deconv(4, 2, 4, 2, 1);
        assert_eq!(deconv.output_shape(input, "t").unwrap(), FrameShape::new(2, 64, 64));

        let pool = LayerSpec::max_pool(4, 2, 2);
        assert_eq!(pool.output_shape(input, "t").unwrap(), FrameShape::new(4, 16, 16));

        let too_big = LayerSpec::conv(4, 4, 40, 1, 0);
        assert!(too_big.output_shape(input, "t").is_err());
    }

    #[test]
    fn test_parameter_manifest_names() {
        let config = ModelConfig::moving_mnist();
        let manifest = config.parameter_manifest();
        let names: Vec<&str> = manifest.iter().map(|(n, _)| n.as_str()).collect();

        assert!(names.contains(&"encoder.stages.0.layers.0.weight"));
        assert!(names.contains(&"encoder.stages.2.cell.gates_norm.bias"));
        assert!(names.contains(&"decoder.stages.0.layers.1.bias"));
        assert!(names.contains(&"decoder.stages.2.layers.0.weight"));

        let (_, gates) = manifest
            .iter()
            .find(|(n, _)| n == "encoder.stages.0.cell.gates.weight")
            .unwrap();
        assert_eq!(gates, &vec![128, 80, 5, 5]);

        let (_, deconv) = manifest
            .iter()
            .find(|(n, _)| n == "decoder.stages.1.layers.0.weight")
            .unwrap();
        assert_eq!(deconv, &vec![96, 96, 4, 4]);
    }

    #[test]
    fn test_parameter_count_positive() {
        let small = ModelConfig::test().parameter_count();
        let large = ModelConfig::moving_mnist().parameter_count();
        assert!(small > 0);
        assert!(small < large);
    }

    #[test]
    fn test_yaml_roundtrip_through_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.yaml");

        let config = ModelConfig::moving_mnist();
        config.to_file(&path).unwrap();
        let loaded = ModelConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_yaml_defaults() {
        let yaml = r#"
frame: { channels: 1, height: 8, width: 8 }
input_frames: 2
output_frames: 3
encoder:
  - layers:
      - { kind: conv, in_channels: 1, out_channels: 2, kernel_size: 3, padding: 1 }
    cell: { input_channels: 2, hidden_channels: 2, kernel_size: 3 }
decoder:
  stages:
    - cell: { input_channels: 2, hidden_channels: 2, kernel_size: 3 }
      layers:
        - { kind: conv, in_channels: 2, out_channels: 1, kernel_size: 1, activation: sigmoid }
"#;
        let config: ModelConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.encoder[0].layers[0].stride, 1);
        assert_eq!(config.encoder[0].layers[0].activation, Activation::None);
        assert_eq!(config.decoder.input, DecoderInput::Zeros);
        assert_eq!(config.decoder.stages[0].layers[0].activation, Activation::Sigmoid);
    }

    #[test]
    fn test_run_config_defaults() {
        let config: RunConfig = serde_yaml::from_str("parameters: convgru.safetensors\n").unwrap();
        config.validate().unwrap();
        assert_eq!(config.model, ModelConfig::moving_mnist());
        assert_eq!(config.device, DeviceSpec::Cpu);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.max_batches, 1);
        assert_eq!(config.samples_per_batch, 1);
        assert_eq!(config.output_dir, PathBuf::from("predictions"));
        assert_eq!(config, RunConfig::new("convgru.safetensors"));
    }

    #[test]
    fn test_run_config_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.yaml");

        let mut config = RunConfig::new("weights.safetensors")
            .with_model(ModelConfig::test())
            .with_batch_size(2);
        config.device = DeviceSpec::Auto;
        config.to_file(&path).unwrap();

        let loaded = RunConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("device: auto"));
    }

    #[test]
    fn test_run_config_rejects_zero_batch() {
        let config = RunConfig::new("p.safetensors").with_batch_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_spec_parsing() {
        assert_eq!("cpu".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
        assert_eq!("CUDA:1".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(1));
        assert_eq!("metal".parse::<DeviceSpec>().unwrap(), DeviceSpec::Metal(0));
        assert_eq!("auto".parse::<DeviceSpec>().unwrap(), DeviceSpec::Auto);
        assert!("tpu".parse::<DeviceSpec>().is_err());
        assert!("cuda:x".parse::<DeviceSpec>().is_err());
        assert_eq!(DeviceSpec::Cuda(2).to_string(), "cuda:2");
    }

    #[test]
    fn test_cpu_device_opens() {
        assert!(DeviceSpec::Cpu.device().unwrap().is_cpu());
    }
}
