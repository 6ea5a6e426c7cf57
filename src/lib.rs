//! Gluco Flux - Glucose forecasting and insulin/carb decay engine
//!
//! Flux turns a CGM glucose series and treatment history into short-horizon
//! glucose forecasts and correction-dose advice through a deterministic
//! pipeline: boundary validation → grid alignment → feature derivation →
//! sequence-model inference with trend-extrapolation fallback.
//!
//! ## Modules
//!
//! - **Decay**: exponential insulin/carb decay (IOB, COB) and dose correction
//! - **Forecasting**: feature buffer, trained sequence models, trend extrapolation
//! - **Accuracy**: running comparison of both forecasting methods
//!
//! Dose outputs are advisory numbers, not a closed-loop controller.

pub mod accuracy;
pub mod adapters;
pub mod buffer;
pub mod config;
pub mod decay;
pub mod error;
pub mod features;
pub mod model;
pub mod normalizer;
pub mod pipeline;
pub mod trend;
pub mod types;

pub use accuracy::{AccuracyComparison, AccuracyLedger, AccuracyMetrics, PredictionRecord};
pub use adapters::{CgmPayloadAdapter, NightscoutAdapter};
pub use buffer::FeatureBuffer;
pub use config::ForecastConfig;
pub use decay::DecayEngine;
pub use error::{ForecastError, Result};
pub use features::{FeatureSequence, FeatureVector, FEATURE_COLUMNS, FEATURE_COUNT};
pub use model::{ModelPaths, ModelStatus, SequenceEstimator};
pub use pipeline::{GlucoseForecaster, PredictionRequest};
pub use trend::{LinearFit, TrendExtrapolator};
pub use types::{
    DoseCorrection, GlucoseRange, GlucoseSample, Horizons, PredictionMethod, PredictionResult,
    TreatmentEvent, TrendDirection,
};

/// Flux version
pub const FLUX_VERSION: &str = env!("CARGO_PKG_VERSION");
