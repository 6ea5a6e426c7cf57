//! Error types for Gluco Flux

use thiserror::Error;

/// Errors that can occur while forecasting or computing dose advice
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No dose can be computed; `current_bg` is carried back unmodified
    #[error("Sensitivity must be positive, got {sensitivity}; BG {current_bg} mg/dL, no dose")]
    InvalidSensitivity { sensitivity: f64, current_bg: f64 },

    #[error("Invalid glucose sample: {0}")]
    InvalidSample(String),

    #[error("Invalid treatment: {0}")]
    InvalidTreatment(String),

    #[error("Failed to parse payload: {0}")]
    ParseError(String),

    #[error("Date parse error: {0}")]
    DateParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Malformed model artifact: {0}")]
    ModelFormat(String),

    #[error("Feature columns do not match the trained model (expected {expected}, found {found})")]
    FeatureMismatch { expected: String, found: String },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

impl ForecastError {
    /// Whether this error must reach the immediate caller rather than being
    /// absorbed into a fallback path.
    pub fn is_hard_failure(&self) -> bool {
        matches!(
            self,
            ForecastError::InvalidConfiguration(_) | ForecastError::InvalidSensitivity { .. }
        )
    }
}

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, ForecastError>;
