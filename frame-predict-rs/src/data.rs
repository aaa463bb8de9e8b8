//! Frame sequences and the sources that feed the inference driver.
//!
//! - [`FrameSequence`] - one clip `(time, C, H, W)`
//! - [`FrameBatch`] - observed frames and ground truth `(batch, time, C, H, W)`
//! - [`SequenceSource`] - anything yielding [`FrameBatch`]es
//! - [`MovingShapes`] - seeded synthetic bouncing-square clips
//! - [`ClipFileSource`] - clips stored in a safetensors file
//!
//! # Example
//!
//! ```no_run
//! use frame_predict_rs::config::FrameShape;
//! use frame_predict_rs::data::{MovingShapes, MovingShapesConfig, SequenceSource};
//! use candle_core::Device;
//!
//! let mut source = MovingShapes::new(
//!     MovingShapesConfig::default(),
//!     FrameShape::new(1, 64, 64),
//!     10,
//!     10,
//!     4,
//!     Device::Cpu,
//! )
//! .unwrap();
//!
//! while let Some(batch) = source.next_batch() {
//!     let batch = batch.unwrap();
//!     println!("input {:?}, target {:?}", batch.input.dims(), batch.target.dims());
//! }
//! ```

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{FrameShape, ModelConfig};
use crate::error::{PredictError, PredictResult};

/// Name of the clip tensor inside a clip file.
pub const CLIP_TENSOR_NAME: &str = "frames";

/// A single clip of frames, `(time, C, H, W)`.
#[derive(Debug, Clone)]
pub struct FrameSequence {
    frames: Tensor,
}

impl FrameSequence {
    /// Wrap a `(time, C, H, W)` tensor.
    pub fn new(frames: Tensor) -> PredictResult<Self> {
        let (t, _, _, _) = frames.dims4()?;
        if t == 0 {
            return Err(PredictError::shape_mismatch(
                "frame sequence",
                "at least one frame",
                "0 frames",
            ));
        }
        Ok(Self { frames })
    }

    /// Take sequence `index` out of a `(batch, time, C, H, W)` tensor.
    pub fn from_batch(batch: &Tensor, index: usize) -> PredictResult<Self> {
        let (b, _, _, _, _) = batch.dims5()?;
        if index >= b {
            return Err(PredictError::data(format!(
                "sequence index {index} out of range for batch of {b}"
            )));
        }
        Self::new(batch.get(index)?)
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.dims()[0]
    }

    /// Always false: a sequence holds at least one frame.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape of each frame.
    pub fn frame_shape(&self) -> FrameShape {
        let dims = self.frames.dims();
        FrameShape::new(dims[1], dims[2], dims[3])
    }

    /// Underlying tensor.
    pub fn frames(&self) -> &Tensor {
        &self.frames
    }

    /// Frame `t` as `(C, H, W)`.
    pub fn frame(&self, t: usize) -> PredictResult<Tensor> {
        Ok(self.frames.get(t)?)
    }

    /// View as a batch of one, `(1, time, C, H, W)`.
    pub fn to_batch(&self) -> PredictResult<Tensor> {
        Ok(self.frames.unsqueeze(0)?)
    }
}

/// Observed frames and ground truth for a batch of clips.
#[derive(Debug, Clone)]
pub struct FrameBatch {
    /// Observed frames `(batch, T_in, C, H, W)`
    pub input: Tensor,
    /// Ground-truth future frames `(batch, T_out, C, H, W)`
    pub target: Tensor,
}

impl FrameBatch {
    /// Pair input and target, checking batch size and frame shape agree.
    pub fn new(input: Tensor, target: Tensor) -> PredictResult<Self> {
        let (b, _, c, h, w) = input.dims5()?;
        let (tb, _, tc, th, tw) = target.dims5()?;
        if (b, c, h, w) != (tb, tc, th, tw) {
            return Err(PredictError::shape_mismatch(
                "target batch",
                format!("[{b}, _, {c}, {h}, {w}]"),
                format!("{:?}", target.dims()),
            ));
        }
        Ok(Self { input, target })
    }

    /// Number of clips.
    pub fn batch_size(&self) -> usize {
        self.input.dims()[0]
    }
}

/// Source of [`FrameBatch`]es.
pub trait SequenceSource {
    /// Next batch, or `None` once exhausted.
    fn next_batch(&mut self) -> Option<PredictResult<FrameBatch>>;

    /// Number of batches remaining, when known.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Settings for [`MovingShapes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovingShapesConfig {
    /// Squares per clip
    #[serde(default = "default_num_objects")]
    pub num_objects: usize,
    /// Side of each square in pixels
    #[serde(default = "default_sprite_size")]
    pub sprite_size: usize,
    /// Batches to generate
    #[serde(default = "default_num_batches")]
    pub num_batches: usize,
    /// RNG seed
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_num_objects() -> usize {
    3
}

fn default_sprite_size() -> usize {
    16
}

fn default_num_batches() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

impl Default for MovingShapesConfig {
    fn default() -> Self {
        Self {
            num_objects: default_num_objects(),
            sprite_size: default_sprite_size(),
            num_batches: default_num_batches(),
            seed: default_seed(),
        }
    }
}

/// Where the driver reads clips from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSourceConfig {
    /// Synthetic bouncing squares
    MovingShapes(MovingShapesConfig),
    /// Safetensors file with a `frames` tensor `(N, T_in + T_out, C, H, W)`
    ClipFile {
        /// Path to the clip file
        path: PathBuf,
    },
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self::MovingShapes(MovingShapesConfig::default())
    }
}

impl DataSourceConfig {
    /// Open the configured source for clips matching `model`.
    pub fn open(
        &self,
        model: &ModelConfig,
        batch_size: usize,
        device: &Device,
    ) -> PredictResult<Box<dyn SequenceSource>> {
        let source: Box<dyn SequenceSource> = match self {
            Self::MovingShapes(cfg) => Box::new(MovingShapes::new(
                cfg.clone(),
                model.frame,
                model.input_frames,
                model.output_frames,
                batch_size,
                device.clone(),
            )?),
            Self::ClipFile { path } => Box::new(ClipFileSource::open(
                path,
                model.frame,
                model.input_frames,
                model.output_frames,
                batch_size,
                device,
            )?),
        };
        Ok(source)
    }
}

/// Seeded generator of bouncing squares.
///
/// Each square starts at a random position with a random heading and moves
/// a tenth of the free canvas per frame, reflecting off the borders.
/// Overlapping squares combine with `max`, so pixel values stay in `[0, 1]`.
pub struct MovingShapes {
    config: MovingShapesConfig,
    frame: FrameShape,
    input_frames: usize,
    output_frames: usize,
    batch_size: usize,
    emitted: usize,
    rng: ChaCha8Rng,
    device: Device,
}

/// Fraction of the free canvas a square travels per frame.
const STEP_LENGTH: f64 = 0.1;

impl MovingShapes {
    /// Create a generator producing `config.num_batches` batches.
    pub fn new(
        config: MovingShapesConfig,
        frame: FrameShape,
        input_frames: usize,
        output_frames: usize,
        batch_size: usize,
        device: Device,
    ) -> PredictResult<Self> {
        if config.sprite_size == 0 || config.sprite_size > frame.height.min(frame.width) {
            return Err(PredictError::data(format!(
                "sprite_size {} does not fit frames of {}",
                config.sprite_size, frame
            )));
        }
        if batch_size == 0 {
            return Err(PredictError::data("batch_size must be at least 1"));
        }

        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            frame,
            input_frames,
            output_frames,
            batch_size,
            emitted: 0,
            rng,
            device,
        })
    }

    /// Top-left corner of one square for every frame.
    fn trajectory(&mut self, length: usize) -> Vec<(usize, usize)> {
        let free_y = (self.frame.height - self.config.sprite_size) as f64;
        let free_x = (self.frame.width - self.config.sprite_size) as f64;

        let mut y: f64 = self.rng.gen();
        let mut x: f64 = self.rng.gen();
        let theta = self.rng.gen::<f64>() * 2.0 * std::f64::consts::PI;
        let (mut vy, mut vx) = (theta.sin(), theta.cos());

        let mut positions = Vec::with_capacity(length);
        for _ in 0..length {
            y += vy * STEP_LENGTH;
            x += vx * STEP_LENGTH;
            if y <= 0.0 {
                y = 0.0;
                vy = -vy;
            }
            if y >= 1.0 {
                y = 1.0;
                vy = -vy;
            }
            if x <= 0.0 {
                x = 0.0;
                vx = -vx;
            }
            if x >= 1.0 {
                x = 1.0;
                vx = -vx;
            }
            positions.push(((y * free_y) as usize, (x * free_x) as usize));
        }
        positions
    }

    /// One clip, `(T_in + T_out) * C * H * W` values.
    fn clip(&mut self) -> Vec<f32> {
        let length = self.input_frames + self.output_frames;
        let FrameShape {
            channels,
            height,
            width,
        } = self.frame;
        let sprite = self.config.sprite_size;
        let mut data = vec![0f32; length * self.frame.elem_count()];

        for _ in 0..self.config.num_objects {
            for (t, (top, left)) in self.trajectory(length).into_iter().enumerate() {
                for c in 0..channels {
                    let plane = (t * channels + c) * height * width;
                    for row in top..top + sprite {
                        let start = plane + row * width + left;
                        data[start..start + sprite].fill(1.0);
                    }
                }
            }
        }
        data
    }
}

impl SequenceSource for MovingShapes {
    fn next_batch(&mut self) -> Option<PredictResult<FrameBatch>> {
        if self.emitted >= self.config.num_batches {
            return None;
        }
        self.emitted += 1;

        let length = self.input_frames + self.output_frames;
        let mut data = Vec::with_capacity(self.batch_size * length * self.frame.elem_count());
        for _ in 0..self.batch_size {
            data.extend(self.clip());
        }

        let FrameShape {
            channels,
            height,
            width,
        } = self.frame;
        let dims = (self.batch_size, length, channels, height, width);
        let result = Tensor::from_vec(data, dims, &self.device)
            .map_err(PredictError::from)
            .and_then(|clips| split_clips(&clips, self.input_frames, self.output_frames));
        Some(result)
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.config.num_batches - self.emitted)
    }
}

/// Clips read from a safetensors file.
pub struct ClipFileSource {
    clips: Tensor,
    input_frames: usize,
    output_frames: usize,
    batch_size: usize,
    cursor: usize,
}

impl ClipFileSource {
    /// Open `path`, expecting a [`CLIP_TENSOR_NAME`] tensor of shape
    /// `(N, T_in + T_out, C, H, W)` with `(C, H, W) == frame`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        frame: FrameShape,
        input_frames: usize,
        output_frames: usize,
        batch_size: usize,
        device: &Device,
    ) -> PredictResult<Self> {
        let path = path.as_ref();
        if batch_size == 0 {
            return Err(PredictError::data("batch_size must be at least 1"));
        }

        let mut tensors = candle_core::safetensors::load(path, device)?;
        let clips = tensors.remove(CLIP_TENSOR_NAME).ok_or_else(|| {
            PredictError::data(format!(
                "{} has no `{CLIP_TENSOR_NAME}` tensor",
                path.display()
            ))
        })?;

        let (n, t, c, h, w) = clips.dims5()?;
        let expected = (input_frames + output_frames, frame.channels, frame.height, frame.width);
        if (t, c, h, w) != expected {
            return Err(PredictError::shape_mismatch(
                "clip file",
                format!("[N, {}, {}, {}, {}]", expected.0, expected.1, expected.2, expected.3),
                format!("{:?}", clips.dims()),
            ));
        }
        debug!(path = %path.display(), clips = n, "Opened clip file");

        Ok(Self {
            clips: clips.to_dtype(DType::F32)?,
            input_frames,
            output_frames,
            batch_size,
            cursor: 0,
        })
    }

    /// Total clips in the file.
    pub fn num_clips(&self) -> usize {
        self.clips.dims()[0]
    }
}

impl SequenceSource for ClipFileSource {
    fn next_batch(&mut self) -> Option<PredictResult<FrameBatch>> {
        let remaining = self.num_clips().saturating_sub(self.cursor);
        if remaining == 0 {
            return None;
        }
        let take = remaining.min(self.batch_size);
        let start = self.cursor;
        self.cursor += take;

        let result = self
            .clips
            .narrow(0, start, take)
            .map_err(PredictError::from)
            .and_then(|clips| split_clips(&clips, self.input_frames, self.output_frames));
        Some(result)
    }

    fn len_hint(&self) -> Option<usize> {
        let remaining = self.num_clips().saturating_sub(self.cursor);
        Some(remaining.div_ceil(self.batch_size))
    }
}

/// Split `(batch, T_in + T_out, C, H, W)` clips into input and target.
fn split_clips(
    clips: &Tensor,
    input_frames: usize,
    output_frames: usize,
) -> PredictResult<FrameBatch> {
    let input = clips.narrow(1, 0, input_frames)?;
    let target = clips.narrow(1, input_frames, output_frames)?;
    FrameBatch::new(input, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn shapes(seed: u64) -> MovingShapes {
        let config = MovingShapesConfig {
            num_batches: 2,
            seed,
            sprite_size: 4,
            ..Default::default()
        };
        MovingShapes::new(config, FrameShape::new(1, 16, 16), 3, 2, 2, Device::Cpu).unwrap()
    }

    #[test]
    fn test_moving_shapes_batch_shapes() {
        let mut source = shapes(7);
        assert_eq!(source.len_hint(), Some(2));

        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(batch.input.dims(), &[2, 3, 1, 16, 16]);
        assert_eq!(batch.target.dims(), &[2, 2, 1, 16, 16]);
        assert_eq!(batch.batch_size(), 2);

        assert!(source.next_batch().is_some());
        assert!(source.next_batch().is_none());
        assert_eq!(source.len_hint(), Some(0));
    }

    #[test]
    fn test_moving_shapes_value_range() {
        let batch = shapes(1).next_batch().unwrap().unwrap();
        let vals: Vec<f32> = batch.input.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|&v| v == 0.0 || v == 1.0));

        // Every frame shows at least one full square.
        let per_frame: Vec<f32> = batch
            .input
            .sum_keepdim(2)
            .unwrap()
            .sum_keepdim(3)
            .unwrap()
            .sum_keepdim(4)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(per_frame.iter().all(|&s| s >= 16.0));
    }

    #[test]
    fn test_moving_shapes_seeded() {
        let a = shapes(3).next_batch().unwrap().unwrap();
        let b = shapes(3).next_batch().unwrap().unwrap();
        let c = shapes(4).next_batch().unwrap().unwrap();

        let a: Vec<f32> = a.input.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.input.flatten_all().unwrap().to_vec1().unwrap();
        let c: Vec<f32> = c.input.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_oversized_sprite_rejected() {
        let config = MovingShapesConfig {
            sprite_size: 20,
            ..Default::default()
        };
        let result = MovingShapes::new(config, FrameShape::new(1, 16, 16), 2, 2, 1, Device::Cpu);
        assert!(matches!(result, Err(PredictError::Data(_))));
    }

    #[test]
    fn test_clip_file_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("clips.safetensors");
        let device = Device::Cpu;

        let clips = Tensor::arange(0f32, (5 * 4 * 2 * 2) as f32, &device)
            .unwrap()
            .reshape((5, 4, 1, 2, 2))
            .unwrap();
        let mut tensors = HashMap::new();
        tensors.insert(CLIP_TENSOR_NAME.to_string(), clips);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let mut source =
            ClipFileSource::open(&path, FrameShape::new(1, 2, 2), 3, 1, 2, &device).unwrap();
        assert_eq!(source.num_clips(), 5);
        assert_eq!(source.len_hint(), Some(3));

        let first = source.next_batch().unwrap().unwrap();
        assert_eq!(first.input.dims(), &[2, 3, 1, 2, 2]);
        assert_eq!(first.target.dims(), &[2, 1, 1, 2, 2]);
        let target: Vec<f32> = first.target.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(&target[..4], &[12.0, 13.0, 14.0, 15.0]);

        source.next_batch().unwrap().unwrap();
        let last = source.next_batch().unwrap().unwrap();
        assert_eq!(last.batch_size(), 1);
        assert!(source.next_batch().is_none());
    }

    #[test]
    fn test_clip_file_shape_checked() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("clips.safetensors");
        let device = Device::Cpu;

        let mut tensors = HashMap::new();
        tensors.insert(
            CLIP_TENSOR_NAME.to_string(),
            Tensor::zeros((2, 4, 1, 2, 2), DType::F32, &device).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let err = ClipFileSource::open(&path, FrameShape::new(1, 2, 2), 3, 2, 1, &device)
            .err()
            .unwrap();
        assert!(matches!(err, PredictError::ShapeMismatch { .. }));

        let missing = ClipFileSource::open(
            dir.path().join("nope.safetensors"),
            FrameShape::new(1, 2, 2),
            3,
            1,
            1,
            &device,
        );
        assert!(missing.is_err());
    }

    #[test]
    fn test_frame_sequence_from_batch() {
        let device = Device::Cpu;
        let batch = Tensor::zeros((2, 3, 1, 4, 4), DType::F32, &device).unwrap();
        let seq = FrameSequence::from_batch(&batch, 1).unwrap();
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.frame_shape(), FrameShape::new(1, 4, 4));
        assert_eq!(seq.to_batch().unwrap().dims(), &[1, 3, 1, 4, 4]);
        assert!(FrameSequence::from_batch(&batch, 2).is_err());
    }

    #[test]
    fn test_frame_batch_rejects_mismatch() {
        let device = Device::Cpu;
        let input = Tensor::zeros((2, 3, 1, 4, 4), DType::F32, &device).unwrap();
        let target = Tensor::zeros((1, 3, 1, 4, 4), DType::F32, &device).unwrap();
        assert!(FrameBatch::new(input, target).is_err());
    }

    #[test]
    fn test_data_source_config_yaml() {
        let yaml = "kind: moving_shapes\nnum_objects: 2\n";
        let cfg: DataSourceConfig = serde_yaml::from_str(yaml).unwrap();
        match cfg {
            DataSourceConfig::MovingShapes(c) => {
                assert_eq!(c.num_objects, 2);
                assert_eq!(c.sprite_size, 16);
            }
            other => panic!("unexpected {other:?}"),
        }

        let yaml = "kind: clip_file\npath: clips.safetensors\n";
        let cfg: DataSourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            cfg,
            DataSourceConfig::ClipFile {
                path: PathBuf::from("clips.safetensors")
            }
        );
    }
}
