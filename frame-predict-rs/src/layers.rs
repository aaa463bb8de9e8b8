//! Non-recurrent stage subnets.
//!
//! A subnet is the resolution-changing part of a stage:
//! - encoder stages run `subnet -> cell` (downsampling convolutions)
//! - decoder stages run `cell -> subnet` (transposed convolutions, final
//!   projection to image channels)
//!
//! Every layer works on `(batch, channels, height, width)` tensors.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, VarBuilder};

use crate::config::{Activation, LayerKind, LayerSpec};

/// Leaky ReLU: `x` for positive inputs, `slope * x` otherwise.
pub fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    let positive = x.relu()?;
    let negative = x.neg()?.relu()?;
    positive - (negative * slope)?
}

/// Apply a configured activation.
pub fn activate(x: &Tensor, activation: Activation, negative_slope: f64) -> Result<Tensor> {
    match activation {
        Activation::None => Ok(x.clone()),
        Activation::Relu => x.relu(),
        Activation::LeakyRelu => leaky_relu(x, negative_slope),
        Activation::Sigmoid => candle_nn::ops::sigmoid(x),
        Activation::Tanh => x.tanh(),
    }
}

enum LayerOp {
    Conv(Conv2d),
    Deconv(ConvTranspose2d),
    MaxPool { kernel: usize, stride: usize },
}

/// One subnet layer with its activation.
pub struct FeatureLayer {
    op: LayerOp,
    activation: Activation,
    negative_slope: f64,
}

impl FeatureLayer {
    /// Create a layer, registering `weight`/`bias` under `vb` when it has any.
    pub fn new(spec: &LayerSpec, vb: VarBuilder) -> Result<Self> {
        let op = match spec.kind {
            LayerKind::Conv => {
                let cfg = Conv2dConfig {
                    padding: spec.padding,
                    stride: spec.stride,
                    ..Default::default()
                };
                LayerOp::Conv(candle_nn::conv2d(
                    spec.in_channels,
                    spec.out_channels,
                    spec.kernel_size,
                    cfg,
                    vb,
                )?)
            }
            LayerKind::Deconv => {
                let cfg = ConvTranspose2dConfig {
                    padding: spec.padding,
                    output_padding: spec.output_padding,
                    stride: spec.stride,
                    ..Default::default()
                };
                LayerOp::Deconv(candle_nn::conv_transpose2d(
                    spec.in_channels,
                    spec.out_channels,
                    spec.kernel_size,
                    cfg,
                    vb,
                )?)
            }
            LayerKind::MaxPool => LayerOp::MaxPool {
                kernel: spec.kernel_size,
                stride: spec.stride,
            },
        };

        Ok(Self {
            op,
            activation: spec.activation,
            negative_slope: spec.negative_slope,
        })
    }
}

impl Module for FeatureLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = match &self.op {
            LayerOp::Conv(conv) => conv.forward(x)?,
            LayerOp::Deconv(deconv) => deconv.forward(x)?,
            LayerOp::MaxPool { kernel, stride } => {
                x.max_pool2d_with_stride((*kernel, *kernel), (*stride, *stride))?
            }
        };
        activate(&y, self.activation, self.negative_slope)
    }
}

/// Ordered stack of [`FeatureLayer`]s.
pub struct Subnet {
    layers: Vec<FeatureLayer>,
}

impl Subnet {
    /// Build the stack; layer `i` stores its parameters under `{vb}.{i}`.
    pub fn new(specs: &[LayerSpec], vb: VarBuilder) -> Result<Self> {
        let layers = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| FeatureLayer::new(spec, vb.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True for an identity subnet.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Apply the subnet to every frame of a `(batch, time, C, H, W)` sequence.
    pub fn forward_sequence(&self, xs: &Tensor) -> Result<Tensor> {
        if self.is_empty() {
            return Ok(xs.clone());
        }
        let (b, t, c, h, w) = xs.dims5()?;
        let flat = xs.reshape((b * t, c, h, w))?;
        let out = self.forward(&flat)?;
        let (_, c2, h2, w2) = out.dims4()?;
        out.reshape((b, t, c2, h2, w2))
    }
}

impl Module for Subnet {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.layers
            .iter()
            .try_fold(x.clone(), |acc, layer| layer.forward(&acc))
    }
}
