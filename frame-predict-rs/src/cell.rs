//! Convolutional GRU cell.
//!
//! Same gating as a GRU, with the matrix products replaced by 2-D
//! convolutions so the hidden state keeps its spatial layout:
//!
//! ```text
//! [z_t, r_t] = σ(Conv_zr([x_t, h_{t-1}]))
//! n_t        = tanh(Conv_n([x_t, r_t ⊙ h_{t-1}]))
//! h_t        = (1 - z_t) ⊙ h_{t-1} + z_t ⊙ n_t
//! ```
//!
//! The update and reset gates share one convolution with `2F` output
//! channels: the first `F` channels are `z`, the next `F` are `r`.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, VarBuilder};

use crate::config::{CellConfig, FrameShape, GROUP_NORM_EPS};

/// Hidden state of one stage for a batch of sequences: `(batch, F, H, W)`.
///
/// Created all-zero at the start of a sequence and replaced by every
/// [`ConvGruCell::step`]; never shared between sequences.
#[derive(Debug, Clone)]
pub struct StageState {
    hidden: Tensor,
}

impl StageState {
    /// All-zero state for `batch` sequences of the given hidden shape.
    pub fn zeros(batch: usize, shape: FrameShape, dtype: DType, device: &Device) -> Result<Self> {
        let hidden = Tensor::zeros(
            (batch, shape.channels, shape.height, shape.width),
            dtype,
            device,
        )?;
        Ok(Self { hidden })
    }

    /// Wrap an existing `(batch, F, H, W)` tensor.
    pub fn from_tensor(hidden: Tensor) -> Result<Self> {
        hidden.dims4()?;
        Ok(Self { hidden })
    }

    /// Hidden tensor.
    pub fn hidden(&self) -> &Tensor {
        &self.hidden
    }

    /// Batch size.
    pub fn batch_size(&self) -> usize {
        self.hidden.dims()[0]
    }

    /// Per-sequence shape `(F, H, W)`.
    pub fn shape(&self) -> FrameShape {
        let dims = self.hidden.dims();
        FrameShape::new(dims[1], dims[2], dims[3])
    }
}

/// One ConvGRU cell.
pub struct ConvGruCell {
    gates: Conv2d,
    gates_norm: Option<GroupNorm>,
    candidate: Conv2d,
    candidate_norm: Option<GroupNorm>,
    input_channels: usize,
    hidden_channels: usize,
}

impl ConvGruCell {
    /// Create a cell; parameters live under `gates`, `candidate` and, with
    /// normalization enabled, `gates_norm` / `candidate_norm`.
    pub fn new(config: &CellConfig, vb: VarBuilder) -> Result<Self> {
        let f = config.hidden_channels;
        let fan_in = config.input_channels + f;
        let conv_cfg = Conv2dConfig {
            padding: config.padding(),
            ..Default::default()
        };

        let gates = candle_nn::conv2d(fan_in, 2 * f, config.kernel_size, conv_cfg, vb.pp("gates"))?;
        let candidate =
            candle_nn::conv2d(fan_in, f, config.kernel_size, conv_cfg, vb.pp("candidate"))?;

        let gates_norm = match config.norm_groups(2 * f) {
            Some(groups) => Some(candle_nn::group_norm(
                groups,
                2 * f,
                GROUP_NORM_EPS,
                vb.pp("gates_norm"),
            )?),
            None => None,
        };
        let candidate_norm = match config.norm_groups(f) {
            Some(groups) => Some(candle_nn::group_norm(
                groups,
                f,
                GROUP_NORM_EPS,
                vb.pp("candidate_norm"),
            )?),
            None => None,
        };

        Ok(Self {
            gates,
            gates_norm,
            candidate,
            candidate_norm,
            input_channels: config.input_channels,
            hidden_channels: f,
        })
    }

    /// Channels expected on `x_t`.
    pub const fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Channels of the hidden state.
    pub const fn hidden_channels(&self) -> usize {
        self.hidden_channels
    }

    /// Zero state matching the batch size and resolution of `x`.
    pub fn zero_state(&self, x: &Tensor) -> Result<StageState> {
        let (b, _, h, w) = x.dims4()?;
        StageState::zeros(
            b,
            FrameShape::new(self.hidden_channels, h, w),
            x.dtype(),
            x.device(),
        )
    }

    /// Advance one time step.
    ///
    /// Input: `x` (batch, input_channels, H, W), state (batch, F, H, W)
    /// Output: new state of the same shape
    pub fn step(&self, x: &Tensor, state: &StageState) -> Result<StageState> {
        let h = state.hidden();
        let f = self.hidden_channels;

        let combined = Tensor::cat(&[x, h], 1)?;
        let gates = self.gates.forward(&combined)?;
        let gates = match &self.gates_norm {
            Some(norm) => norm.forward(&gates)?,
            None => gates,
        };
        let gates = candle_nn::ops::sigmoid(&gates)?;
        let z = gates.narrow(1, 0, f)?;
        let r = gates.narrow(1, f, f)?;

        let combined = Tensor::cat(&[x, &(&r * h)?], 1)?;
        let n = self.candidate.forward(&combined)?;
        let n = match &self.candidate_norm {
            Some(norm) => norm.forward(&n)?,
            None => n,
        };
        let n = n.tanh()?;

        // (1 - z) * h + z * n == h + z * (n - h)
        let hidden = (h + (&z * (&n - h)?)?)?;
        Ok(StageState { hidden })
    }

    /// Run over a whole `(batch, time, input_channels, H, W)` sequence from a
    /// zero state.
    ///
    /// Returns the per-step hidden states `(batch, time, F, H, W)` and the
    /// final state.
    pub fn run(&self, xs: &Tensor) -> Result<(Tensor, StageState)> {
        let (_, t, _, _, _) = xs.dims5()?;
        let first = xs.narrow(1, 0, 1)?.squeeze(1)?;
        let mut state = self.zero_state(&first)?;

        let mut outputs = Vec::with_capacity(t);
        for step in 0..t {
            let x = xs.narrow(1, step, 1)?.squeeze(1)?;
            state = self.step(&x, &state)?;
            outputs.push(state.hidden().clone());
        }

        Ok((Tensor::stack(&outputs, 1)?, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn build(config: &CellConfig) -> (VarMap, ConvGruCell) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cell = ConvGruCell::new(config, vb).unwrap();
        (varmap, cell)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_step_preserves_shape() {
        let (_varmap, cell) = build(&CellConfig::new(3, 8, 3));
        let x = Tensor::randn(0.0f32, 1.0, (2, 3, 10, 12), &Device::Cpu).unwrap();

        let state = cell.zero_state(&x).unwrap();
        assert_eq!(state.shape(), FrameShape::new(8, 10, 12));

        let next = cell.step(&x, &state).unwrap();
        assert_eq!(next.hidden().dims(), &[2, 8, 10, 12]);
        assert_eq!(next.batch_size(), 2);
    }

    #[test]
    fn test_zero_state_update() {
        let (_varmap, cell) = build(&CellConfig::new(2, 4, 3));
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 6, 6), &device).unwrap();
        let state = cell.zero_state(&x).unwrap();

        let next = cell.step(&x, &state).unwrap();

        // With h = 0: h_1 = z * tanh(Conv_n([x, 0]))
        let combined = Tensor::cat(&[&x, state.hidden()], 1).unwrap();
        let gates = candle_nn::ops::sigmoid(&cell.gates.forward(&combined).unwrap()).unwrap();
        let z = gates.narrow(1, 0, 4).unwrap();
        let n = cell.candidate.forward(&combined).unwrap().tanh().unwrap();
        let expected = (&z * &n).unwrap();

        assert!(max_abs_diff(next.hidden(), &expected) < 1e-6);
    }

    #[test]
    fn test_gate_order() {
        // Zero kernels: z = σ(b_z), r = σ(b_r), n = tanh(b_n).
        let device = Device::Cpu;
        let mut ws = std::collections::HashMap::new();
        ws.insert(
            "gates.weight".to_string(),
            Tensor::zeros((2, 2, 3, 3), DType::F32, &device).unwrap(),
        );
        ws.insert(
            "gates.bias".to_string(),
            Tensor::new(&[2.0f32, -50.0], &device).unwrap(),
        );
        ws.insert(
            "candidate.weight".to_string(),
            Tensor::zeros((1, 2, 3, 3), DType::F32, &device).unwrap(),
        );
        ws.insert(
            "candidate.bias".to_string(),
            Tensor::new(&[0.5f32], &device).unwrap(),
        );
        let vb = VarBuilder::from_tensors(ws, DType::F32, &device);
        let cell = ConvGruCell::new(&CellConfig::new(1, 1, 3), vb).unwrap();

        let x = Tensor::zeros((1, 1, 4, 4), DType::F32, &device).unwrap();
        let h0 = StageState::from_tensor(Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap())
            .unwrap();
        let h1 = cell.step(&x, &h0).unwrap();

        let z = 1.0 / (1.0 + (-2.0f64).exp());
        let n = 0.5f64.tanh();
        let expected = (1.0 - z) * 1.0 + z * n;
        let vals: Vec<f32> = h1.hidden().flatten_all().unwrap().to_vec1().unwrap();
        for v in vals {
            assert!((v as f64 - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_norm_parameters_registered() {
        let config = CellConfig::new(4, 8, 5).with_norm_group_size(4);
        let (varmap, cell) = build(&config);

        let x = Tensor::randn(0.0f32, 1.0, (1, 4, 8, 8), &Device::Cpu).unwrap();
        let state = cell.zero_state(&x).unwrap();
        assert_eq!(cell.step(&x, &state).unwrap().hidden().dims(), &[1, 8, 8, 8]);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data.get("gates.weight").unwrap().dims(), &[16, 12, 5, 5]);
        assert_eq!(data.get("gates_norm.weight").unwrap().dims(), &[16]);
        assert_eq!(data.get("candidate_norm.bias").unwrap().dims(), &[8]);
    }

    #[test]
    fn test_run_matches_manual_steps() {
        let (_varmap, cell) = build(&CellConfig::new(1, 2, 3));
        let xs = Tensor::randn(0.0f32, 1.0, (2, 3, 1, 5, 5), &Device::Cpu).unwrap();

        let (outputs, last) = cell.run(&xs).unwrap();
        assert_eq!(outputs.dims(), &[2, 3, 2, 5, 5]);

        let mut state = cell.zero_state(&xs.narrow(1, 0, 1).unwrap().squeeze(1).unwrap()).unwrap();
        for t in 0..3 {
            let x = xs.narrow(1, t, 1).unwrap().squeeze(1).unwrap();
            state = cell.step(&x, &state).unwrap();
        }
        assert!(max_abs_diff(last.hidden(), state.hidden()) < 1e-6);

        let tail = outputs.narrow(1, 2, 1).unwrap().squeeze(1).unwrap();
        assert!(max_abs_diff(&tail, last.hidden()) < 1e-6);
    }
}
