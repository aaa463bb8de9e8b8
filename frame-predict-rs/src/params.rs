//! Trained parameter sets.
//!
//! Parameters come from a safetensors file keyed by the names in
//! [`ModelConfig::parameter_manifest`]. The file header may carry a
//! `format_version` metadata entry; files without one are treated as the
//! current version. Files written under another naming scheme are brought to
//! manifest names with [`ParameterSet::renamed`] and a [`ParameterNaming`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{DecoderInput, LayerKind, LayerSpec, ModelConfig};
use crate::error::{PredictError, PredictResult};

/// Header metadata key holding the parameter format version.
pub const FORMAT_VERSION_KEY: &str = "format_version";

/// Parameter format version this crate reads.
pub const SUPPORTED_FORMAT_VERSION: &str = "1";

/// Named tensors loaded from a parameter source.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    tensors: HashMap<String, Tensor>,
    format_version: Option<String>,
}

impl ParameterSet {
    /// Wrap an in-memory tensor map.
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self {
            tensors,
            format_version: None,
        }
    }

    /// Read a safetensors file onto `device`.
    ///
    /// # Errors
    /// [`PredictError::UnsupportedFormat`] if the header declares a
    /// `format_version` other than [`SUPPORTED_FORMAT_VERSION`]; IO and
    /// safetensors errors are propagated.
    pub fn from_safetensors<P: AsRef<Path>>(path: P, device: &Device) -> PredictResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let set = Self::from_buffer(&bytes, device)?;
        info!(
            path = %path.display(),
            tensors = set.len(),
            version = set.format_version().unwrap_or("unversioned"),
            "Loaded parameter file"
        );
        Ok(set)
    }

    /// Parse a safetensors buffer.
    pub fn from_buffer(bytes: &[u8], device: &Device) -> PredictResult<Self> {
        let (_, metadata) = SafeTensors::read_metadata(bytes)?;
        let format_version = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(FORMAT_VERSION_KEY))
            .cloned();

        if let Some(version) = &format_version {
            if version != SUPPORTED_FORMAT_VERSION {
                return Err(PredictError::unsupported_format(format!(
                    "{FORMAT_VERSION_KEY} {version} (supported: {SUPPORTED_FORMAT_VERSION})"
                )));
            }
        }

        let tensors = candle_core::safetensors::load_buffer(bytes, device)?;
        Ok(Self {
            tensors,
            format_version,
        })
    }

    /// Declared format version, if any.
    pub fn format_version(&self) -> Option<&str> {
        self.format_version.as_deref()
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// True if the set holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Look up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Add or replace a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Tensor names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Rename tensors listed in `names`; others keep their name.
    ///
    /// # Errors
    /// [`PredictError::InvalidConfig`] if two tensors end up with one name.
    pub fn renamed(self, names: &NameMap) -> PredictResult<Self> {
        let mut tensors = HashMap::with_capacity(self.tensors.len());
        let mut mapped = 0usize;

        for (name, tensor) in self.tensors {
            let target = match names.get(&name) {
                Some(target) => {
                    mapped += 1;
                    target.clone()
                }
                None => name,
            };
            if tensors.contains_key(&target) {
                return Err(PredictError::invalid_config(format!(
                    "more than one parameter is named {target} after renaming"
                )));
            }
            tensors.insert(target, tensor);
        }
        debug!(mapped, "Renamed parameters");

        Ok(Self {
            tensors,
            format_version: self.format_version,
        })
    }

    /// Check the set against the model described by `config` and return
    /// exactly the tensors it needs, as f32.
    ///
    /// Names absent from the manifest are logged and ignored.
    ///
    /// # Errors
    /// [`PredictError::MissingParameter`] for the first absent name,
    /// [`PredictError::ShapeMismatch`] for the first tensor of wrong shape,
    /// [`PredictError::UnsupportedFormat`] for non-float tensors.
    pub fn select(&self, config: &ModelConfig) -> PredictResult<HashMap<String, Tensor>> {
        let manifest = config.parameter_manifest();
        let mut selected = HashMap::with_capacity(manifest.len());

        for (name, shape) in &manifest {
            let tensor = self
                .tensors
                .get(name)
                .ok_or_else(|| PredictError::missing_parameter(name.as_str()))?;

            if tensor.dims() != shape.as_slice() {
                return Err(PredictError::shape_mismatch(
                    name.as_str(),
                    format!("{shape:?}"),
                    format!("{:?}", tensor.dims()),
                ));
            }

            let tensor = match tensor.dtype() {
                DType::F32 => tensor.clone(),
                dtype if dtype.is_float() => {
                    debug!(name = %name, ?dtype, "Converting parameter to f32");
                    tensor.to_dtype(DType::F32)?
                }
                dtype => {
                    return Err(PredictError::unsupported_format(format!(
                        "{name} has non-float dtype {dtype:?}"
                    )));
                }
            };
            selected.insert(name.clone(), tensor);
        }

        let mut unknown: Vec<&String> = self
            .tensors
            .keys()
            .filter(|name| !selected.contains_key(*name))
            .collect();
        unknown.sort_unstable();
        for name in unknown {
            warn!(name = %name, "Ignoring parameter not used by the model");
        }

        Ok(selected)
    }
}

/// Parameter file name to model parameter name.
pub type NameMap = BTreeMap<String, String>;

/// Naming scheme of the tensors in a parameter file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterNaming {
    /// Names from [`ModelConfig::parameter_manifest`]
    #[default]
    Native,
    /// Checkpoints of the three-stage Moving-MNIST network:
    /// `{encoder,decoder}.stage{n}.{layer}` subnets and
    /// `{encoder,decoder}.rnn{n}.conv{1,2}.{0,1}` cells, `n` counting from
    /// the full-resolution stage
    StageRnn,
    /// Explicit table from file names to model names
    Map {
        /// Names not listed are kept as they are
        names: NameMap,
    },
}

/// Subnet layer labels of the stage/rnn layout, outer stage first.
const STAGE_RNN_ENCODER_LAYERS: [&[&str]; 3] =
    [&["conv1_leaky_1"], &["conv2_leaky_1"], &["conv3_leaky_1"]];
const STAGE_RNN_DECODER_LAYERS: [&[&str]; 3] = [
    &["conv3_leaky_1", "conv4_leaky_1"],
    &["deconv2_leaky_1"],
    &["deconv1_leaky_1"],
];

/// Cell sub-modules of the stage/rnn layout: gate conv, gate norm,
/// candidate conv, candidate norm.
const STAGE_RNN_CELL_PARTS: [(&str, &str, bool); 4] = [
    ("conv1.0", "gates", false),
    ("conv1.1", "gates_norm", true),
    ("conv2.0", "candidate", false),
    ("conv2.1", "candidate_norm", true),
];

impl ParameterNaming {
    /// Table translating file names to the names `config` expects, or
    /// `None` when the file already uses them.
    ///
    /// # Errors
    /// [`PredictError::InvalidConfig`] if the scheme cannot describe `config`.
    pub fn name_map(&self, config: &ModelConfig) -> PredictResult<Option<NameMap>> {
        match self {
            Self::Native => Ok(None),
            Self::Map { names } => Ok(Some(names.clone())),
            Self::StageRnn => stage_rnn_names(config).map(Some),
        }
    }
}

fn stage_rnn_names(config: &ModelConfig) -> PredictResult<NameMap> {
    let encoder_fits = config
        .encoder
        .iter()
        .map(|stage| stage.layers.len())
        .eq(STAGE_RNN_ENCODER_LAYERS.iter().map(|labels| labels.len()));
    let decoder_fits = config
        .decoder
        .stages
        .iter()
        .map(|stage| stage.layers.len())
        .eq(STAGE_RNN_DECODER_LAYERS.iter().map(|labels| labels.len()));
    if !encoder_fits || !decoder_fits || config.decoder.input == DecoderInput::Feedback {
        return Err(PredictError::invalid_config(
            "stage_rnn parameter naming needs the three-stage moving-mnist layout \
             without decoder feedback",
        ));
    }

    let mut names = NameMap::new();
    for (k, stage) in config.encoder.iter().enumerate() {
        let normalized = stage.cell.norm_group_size.is_some();
        let labels = STAGE_RNN_ENCODER_LAYERS[k];
        push_stage_rnn(&mut names, "encoder", k, labels, &stage.layers, normalized);
    }
    for (k, stage) in config.decoder.stages.iter().enumerate() {
        let normalized = stage.cell.norm_group_size.is_some();
        let labels = STAGE_RNN_DECODER_LAYERS[k];
        push_stage_rnn(&mut names, "decoder", k, labels, &stage.layers, normalized);
    }
    Ok(names)
}

/// Names of stage `k` (`stage{k+1}` / `rnn{k+1}` in the file).
fn push_stage_rnn(
    names: &mut NameMap,
    side: &str,
    k: usize,
    labels: &[&str],
    layers: &[LayerSpec],
    normalized: bool,
) {
    let n = k + 1;
    for (i, (label, layer)) in labels.iter().zip(layers).enumerate() {
        if layer.kind == LayerKind::MaxPool {
            continue;
        }
        for param in ["weight", "bias"] {
            names.insert(
                format!("{side}.stage{n}.{label}.{param}"),
                format!("{side}.stages.{k}.layers.{i}.{param}"),
            );
        }
    }
    for (from, to, is_norm) in STAGE_RNN_CELL_PARTS {
        if is_norm && !normalized {
            continue;
        }
        for param in ["weight", "bias"] {
            names.insert(
                format!("{side}.rnn{n}.{from}.{param}"),
                format!("{side}.stages.{k}.cell.{to}.{param}"),
            );
        }
    }
}
