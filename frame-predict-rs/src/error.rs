//! Error types for the frame prediction model.

use thiserror::Error;

/// Result type for frame prediction operations.
pub type PredictResult<T> = Result<T, PredictError>;

/// Errors that can occur while building, loading or running the model.
#[derive(Debug, Error)]
pub enum PredictError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Shape mismatch between a tensor and what the model expects
    #[error("Shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: String,
        expected: String,
        got: String,
    },

    /// A parameter required by the model configuration is absent
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Parameter blob carries a format this crate cannot read
    #[error("Unsupported parameter format: {0}")]
    UnsupportedFormat(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("Config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Safetensors header could not be parsed
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// Image encoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Data source error
    #[error("Data error: {0}")]
    Data(String),

    /// Progress bar template error
    #[error("Template error: {0}")]
    Template(String),
}

impl PredictError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(
        what: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a missing parameter error
    pub fn missing_parameter(name: impl Into<String>) -> Self {
        Self::MissingParameter(name.into())
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an unsupported format error
    pub fn unsupported_format(msg: impl Into<String>) -> Self {
        Self::UnsupportedFormat(msg.into())
    }

    /// Create a data loading error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}

impl From<indicatif::style::TemplateError> for PredictError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        Self::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_shape_mismatch_display() {
        let err = PredictError::shape_mismatch("input frame", "[1, 64, 64]", "[3, 64, 64]");
        assert_eq!(
            err.to_string(),
            "Shape mismatch for input frame: expected [1, 64, 64], got [3, 64, 64]"
        );
    }

    #[test]
    fn test_missing_parameter_display() {
        let err = PredictError::missing_parameter("encoder.stages.0.cell.gates.weight");
        assert!(err.to_string().contains("encoder.stages.0.cell.gates.weight"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "params.safetensors");
        let err: PredictError = io_error.into();
        assert!(matches!(err, PredictError::Io(_)));
        assert!(err.to_string().contains("params.safetensors"));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("a: b: :::").unwrap_err();
        let err: PredictError = yaml_error.into();
        assert!(err.to_string().starts_with("Config parse error"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let err: PredictError = a.broadcast_add(&b).unwrap_err().into();
        assert!(err.to_string().contains("Candle error"));
    }
}
